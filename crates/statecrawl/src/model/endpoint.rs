//! Endpoints: potential request targets
//!
//! An endpoint stores everything needed to construct a request, plus the
//! pipeline flags that drive detection and visiting. Its fingerprint covers
//! method, scheme, path, the DOM locator it was found at and its parameter
//! shapes. The host is deliberately excluded: its port is not stable between
//! runs of a containerized target.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{now_ms, Parameter};
use crate::hashing::HashContext;

fn default_true() -> bool {
    true
}

/// A potential request target discovered in (or seeded into) some state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    /// Store-assigned id; empty until persisted
    #[serde(default)]
    pub id: String,
    /// URL scheme
    pub scheme: String,
    /// Host, including any explicit port
    pub host: String,
    /// URL path
    pub path: String,
    /// HTTP method
    pub method: String,
    /// Query parameters (names plus default values, in document order)
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    /// Body form fields (names plus default values, in document order)
    #[serde(default)]
    pub data: Vec<Parameter>,
    /// Root-first chain of ancestor element names of the source DOM node
    #[serde(default)]
    pub found_at: Vec<String>,
    /// State the endpoint was discovered in
    pub state_id: String,
    /// Interaction whose response produced this endpoint
    pub from_interaction_id: String,
    /// Locality-sensitive fingerprint
    pub hash: String,
    /// Creation time, ms since epoch
    pub created_at: i64,
    /// Whether the endpoint detector has looked at this record
    #[serde(default)]
    pub clustering_processed: bool,
    /// Distinct enough from its peers to be worth visiting
    #[serde(default)]
    pub clean: bool,
    /// Already visited by the crawler in its current state
    #[serde(default)]
    pub visited: bool,
    /// Already handed to an external scanner
    #[serde(default)]
    pub scanned: bool,
    /// This endpoint resets the target app to its initial state
    #[serde(default)]
    pub is_reset: bool,
    /// Eligible for visiting at all
    #[serde(default = "default_true")]
    pub allow_visit: bool,
}

impl Endpoint {
    /// Start building an endpoint.
    pub fn builder(
        host: impl Into<String>,
        path: impl Into<String>,
        state_id: impl Into<String>,
        from_interaction_id: impl Into<String>,
    ) -> EndpointBuilder {
        EndpointBuilder {
            host: host.into(),
            path: path.into(),
            state_id: state_id.into(),
            from_interaction_id: from_interaction_id.into(),
            scheme: "http".to_string(),
            method: "GET".to_string(),
            parameters: Vec::new(),
            data: Vec::new(),
            found_at: Vec::new(),
            clean: false,
            is_reset: false,
            clustering_processed: false,
            allow_visit: true,
        }
    }

    /// The endpoint as a URL without parameters.
    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.path)
    }

    /// The endpoint as a URL with its query parameters appended.
    pub fn url_with_params(&self) -> String {
        let mut url = self.url();
        for (idx, parameter) in self.parameters.iter().enumerate() {
            url.push(if idx == 0 { '?' } else { '&' });
            url.push_str(&parameter.name);
            url.push('=');
            url.push_str(&parameter.value);
        }
        url
    }

    /// Query and body parameters in the export serialization:
    /// `?a=1&b=2 [(c=3),(d=4)]`.
    pub fn parameters_as_string(&self) -> String {
        let query = if self.parameters.is_empty() {
            String::new()
        } else {
            let joined: Vec<String> = self
                .parameters
                .iter()
                .map(|p| format!("{}={}", p.name, p.value))
                .collect();
            format!("?{}", joined.join("&"))
        };
        let body = if self.data.is_empty() {
            String::new()
        } else {
            let joined: Vec<String> = self
                .data
                .iter()
                .map(|p| format!("({}={})", p.name, p.value))
                .collect();
            format!("[{}]", joined.join(","))
        };
        format!("{query} {body}")
    }

    fn hash_payload(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.method,
            self.scheme,
            self.path,
            self.found_at.concat(),
            Parameter::list_as_json(&self.parameters)
        )
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url_with_params())
    }
}

/// Builder for [`Endpoint`]; `build` stamps the fingerprint and timestamp.
#[derive(Debug)]
pub struct EndpointBuilder {
    host: String,
    path: String,
    state_id: String,
    from_interaction_id: String,
    scheme: String,
    method: String,
    parameters: Vec<Parameter>,
    data: Vec<Parameter>,
    found_at: Vec<String>,
    clean: bool,
    is_reset: bool,
    clustering_processed: bool,
    allow_visit: bool,
}

impl EndpointBuilder {
    /// URL scheme (default `http`).
    #[must_use]
    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// HTTP method (default `GET`).
    #[must_use]
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Query parameters.
    #[must_use]
    pub fn parameters(mut self, parameters: Vec<Parameter>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Body form fields.
    #[must_use]
    pub fn data(mut self, data: Vec<Parameter>) -> Self {
        self.data = data;
        self
    }

    /// DOM locator path.
    #[must_use]
    pub fn found_at(mut self, found_at: Vec<String>) -> Self {
        self.found_at = found_at;
        self
    }

    /// Mark the endpoint clean from the start (seeded endpoints).
    #[must_use]
    pub fn clean(mut self, clean: bool) -> Self {
        self.clean = clean;
        self
    }

    /// Flag as the app-resetting endpoint.
    #[must_use]
    pub fn is_reset(mut self, is_reset: bool) -> Self {
        self.is_reset = is_reset;
        self
    }

    /// Skip the endpoint detector for this record.
    #[must_use]
    pub fn clustering_processed(mut self, processed: bool) -> Self {
        self.clustering_processed = processed;
        self
    }

    /// Allow or forbid visiting.
    #[must_use]
    pub fn allow_visit(mut self, allow: bool) -> Self {
        self.allow_visit = allow;
        self
    }

    /// Finalize, computing the fingerprint under the run's padding.
    pub fn build(self, ctx: &HashContext) -> Endpoint {
        let mut endpoint = Endpoint {
            id: String::new(),
            scheme: self.scheme,
            host: self.host,
            path: self.path,
            method: self.method,
            parameters: self.parameters,
            data: self.data,
            found_at: self.found_at,
            state_id: self.state_id,
            from_interaction_id: self.from_interaction_id,
            hash: String::new(),
            created_at: now_ms(),
            clustering_processed: self.clustering_processed,
            clean: self.clean,
            visited: false,
            scanned: false,
            is_reset: self.is_reset,
            allow_visit: self.allow_visit,
        };
        endpoint.hash = ctx.hash(&endpoint.hash_payload());
        endpoint
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::USER_DEFINED;

    fn ctx() -> HashContext {
        HashContext::new(7)
    }

    fn sample() -> Endpoint {
        Endpoint::builder("app.local:8080", "/views/login", "state-1", USER_DEFINED)
            .method("POST")
            .parameters(vec![Parameter::new("next", "/home")])
            .data(vec![
                Parameter::new("user", ""),
                Parameter::new("pass", ""),
            ])
            .found_at(vec![
                "html".to_string(),
                "body".to_string(),
                "form".to_string(),
            ])
            .build(&ctx())
    }

    #[test]
    fn test_url_forms() {
        let endpoint = sample();
        assert_eq!(endpoint.url(), "http://app.local:8080/views/login");
        assert_eq!(
            endpoint.url_with_params(),
            "http://app.local:8080/views/login?next=/home"
        );
    }

    #[test]
    fn test_parameters_as_string() {
        let endpoint = sample();
        assert_eq!(
            endpoint.parameters_as_string(),
            "?next=/home [(user=),(pass=)]"
        );
    }

    #[test]
    fn test_display() {
        let endpoint = sample();
        assert_eq!(
            endpoint.to_string(),
            "POST http://app.local:8080/views/login?next=/home"
        );
    }

    #[test]
    fn test_defaults() {
        let endpoint = sample();
        assert!(endpoint.allow_visit);
        assert!(!endpoint.visited);
        assert!(!endpoint.clean);
        assert!(!endpoint.is_reset);
        assert!(endpoint.id.is_empty());
        assert!(endpoint.created_at > 0);
    }

    #[test]
    fn test_hash_is_deterministic_for_equal_seed() {
        let a = sample();
        let b = sample();
        assert_eq!(a.hash, b.hash);
        assert!(a.hash.starts_with("T1"));
    }

    #[test]
    fn test_hash_ignores_host() {
        let one = Endpoint::builder("host-a:1111", "/p", "s", USER_DEFINED).build(&ctx());
        let two = Endpoint::builder("host-b:2222", "/p", "s", USER_DEFINED).build(&ctx());
        assert_eq!(one.hash, two.hash);
    }

    #[test]
    fn test_hash_depends_on_locator() {
        let one = Endpoint::builder("h", "/p", "s", USER_DEFINED)
            .found_at(vec!["html".to_string(), "body".to_string()])
            .build(&ctx());
        let two = Endpoint::builder("h", "/p", "s", USER_DEFINED)
            .found_at(vec!["html".to_string(), "body".to_string(), "nav".to_string()])
            .build(&ctx());
        assert_ne!(one.hash, two.hash);
    }

    #[test]
    fn test_allow_visit_defaults_true_when_deserialized() {
        let endpoint: Endpoint = serde_json::from_value(serde_json::json!({
            "scheme": "http",
            "host": "h",
            "path": "/p",
            "method": "GET",
            "state_id": "s",
            "from_interaction_id": "i",
            "hash": "T1",
            "created_at": 1
        }))
        .unwrap();
        assert!(endpoint.allow_visit);
    }
}
