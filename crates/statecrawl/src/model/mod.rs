//! Record types shared by the whole pipeline
//!
//! Four primary entities are persisted per batch: endpoints, interactions,
//! states and the per-peer-group clustering watermarks. Ids are opaque
//! store-assigned strings; every record carries a millisecond `created_at`
//! used for ordering and re-parenting.

mod endpoint;
mod interaction;
mod state;

pub use endpoint::{Endpoint, EndpointBuilder};
pub use interaction::Interaction;
pub use state::{State, StateReachability};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Sentinel for records seeded by the operator rather than extracted.
pub const USER_DEFINED: &str = "user-defined";
/// Sentinel parent id of the initial state.
pub const NO_PREVIOUS_STATE: &str = "no-previous-state";
/// Sentinel causing-interaction id of the initial state.
pub const NO_INTERACTION: &str = "no-interaction";

/// A named value extending an endpoint: a query parameter or form field.
///
/// The stored value is a default observed at extraction time; it is not part
/// of any identity comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Parameter {
    /// Field name
    pub name: String,
    /// Default value (empty when the source markup had none)
    #[serde(default)]
    pub value: String,
}

impl Parameter {
    /// Create a parameter.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Parse `a=1&b=2` query strings; parts without `=` are skipped.
    pub fn parse_query(query: &str) -> Vec<Self> {
        query
            .split('&')
            .filter_map(|part| {
                part.split_once('=')
                    .map(|(name, value)| Self::new(name, value))
            })
            .collect()
    }

    /// Concatenated JSON of a parameter list, used in hash payloads.
    pub(crate) fn list_as_json(parameters: &[Self]) -> String {
        parameters
            .iter()
            .map(|p| {
                serde_json::to_string(p).unwrap_or_else(|_| format!("{}={}", p.name, p.value))
            })
            .collect()
    }
}

/// The complete information sent to the target: an endpoint plus headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// The target endpoint
    pub endpoint: Endpoint,
    /// Extra request headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Request {
    /// A request to an endpoint with no extra headers.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            headers: BTreeMap::new(),
        }
    }
}

/// Raw data received for a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// HTTP status code
    pub code: u16,
    /// Response body, decoded as text
    pub data: String,
    /// Response headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Response {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True when the status code is in the redirect range.
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.code)
    }
}

/// Identity of a peer group: the fields endpoints/interactions are grouped by
/// when their cluster-count watermark is read or written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerGroupKey {
    /// URL scheme
    pub scheme: String,
    /// Host (including any explicit port)
    pub host: String,
    /// URL path
    pub path: String,
    /// HTTP method
    pub method: String,
    /// Owning state id
    pub state_id: String,
}

impl PeerGroupKey {
    /// Key of an endpoint's peer group.
    pub fn of_endpoint(endpoint: &Endpoint) -> Self {
        Self {
            scheme: endpoint.scheme.clone(),
            host: endpoint.host.clone(),
            path: endpoint.path.clone(),
            method: endpoint.method.clone(),
            state_id: endpoint.state_id.clone(),
        }
    }

    /// Key of an interaction's peer group: its request endpoint, grouped
    /// under the state the interaction was recorded in.
    pub fn of_interaction(interaction: &Interaction) -> Self {
        let endpoint = &interaction.request.endpoint;
        Self {
            scheme: endpoint.scheme.clone(),
            host: endpoint.host.clone(),
            path: endpoint.path.clone(),
            method: endpoint.method.clone(),
            state_id: interaction.state_id.clone(),
        }
    }
}

/// Current wall-clock time in milliseconds.
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
