//! Interactions: recorded request/response pairs
//!
//! The interaction fingerprint is the pipeline's view of "what the app did":
//! two interactions hashing alike are evidence the app was in the same
//! latent state. The default projection keeps only the navigational skeleton
//! of the response (`<a>` and `<form>` elements) so that cosmetic content
//! changes do not read as state changes.

use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

use super::{now_ms, Parameter, Request, Response};
use crate::config::InteractionHashMethod;
use crate::hashing::HashContext;

/// A request/response pair recorded against the state it executed in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    /// Store-assigned id; empty until persisted
    #[serde(default)]
    pub id: String,
    /// The request that was sent
    pub request: Request,
    /// The response that came back
    pub response: Response,
    /// State the app was in when the request executed
    pub state_id: String,
    /// Whether the endpoint extractor has parsed this response
    #[serde(default)]
    pub endpoints_processed: bool,
    /// Whether the state-change detector has looked at this record
    #[serde(default)]
    pub clustering_processed: bool,
    /// Produced by an external fuzzer rather than the crawler
    #[serde(default)]
    pub made_by_fuzzer: bool,
    /// Locality-sensitive fingerprint of the pair
    pub hash: String,
    /// Creation time, ms since epoch
    pub created_at: i64,
}

impl Interaction {
    /// Record an interaction, fingerprinting it under the run's padding.
    pub fn new(
        request: Request,
        response: Response,
        state_id: impl Into<String>,
        made_by_fuzzer: bool,
        method: InteractionHashMethod,
        ctx: &HashContext,
    ) -> Self {
        let payload = Self::hash_payload(&request, &response, method);
        Self {
            id: String::new(),
            request,
            response,
            state_id: state_id.into(),
            endpoints_processed: false,
            clustering_processed: false,
            made_by_fuzzer,
            hash: ctx.hash(&payload),
            created_at: now_ms(),
        }
    }

    /// The projection of the pair that feeds the fingerprint.
    ///
    /// The host is excluded everywhere: a containerized target gets a fresh
    /// port per run. Parameter default values are excluded too, so fuzzing
    /// an endpoint with different values but identical output hashes alike.
    pub fn hash_payload(
        request: &Request,
        response: &Response,
        method: InteractionHashMethod,
    ) -> String {
        let endpoint = &request.endpoint;
        match method {
            InteractionHashMethod::LinksOnly => {
                let (anchors, forms) = navigation_elements(&response.data);
                format!(
                    "{}{}{}{}{anchors}{forms}",
                    endpoint.method, endpoint.scheme, endpoint.path, response.code
                )
            }
            InteractionHashMethod::LinksWithParams => {
                let (anchors, forms) = navigation_elements(&response.data);
                format!(
                    "{}{}{}{}{}{}{anchors}{forms}",
                    endpoint.method,
                    endpoint.scheme,
                    endpoint.path,
                    Parameter::list_as_json(&endpoint.parameters),
                    headers_json(request),
                    response.code
                )
            }
            InteractionHashMethod::WholeResponse => format!(
                "{}{}{}{}{}{}{}",
                endpoint.method,
                endpoint.scheme,
                endpoint.path,
                Parameter::list_as_json(&endpoint.parameters),
                headers_json(request),
                response.code,
                response.data
            ),
        }
    }
}

fn headers_json(request: &Request) -> String {
    serde_json::to_string(&request.headers).unwrap_or_default()
}

/// Concatenated outer HTML of all `<a>` elements, then all `<form>`
/// elements, in document order.
#[allow(clippy::unwrap_used)] // static selectors are always valid
fn navigation_elements(body: &str) -> (String, String) {
    let document = Html::parse_document(body);
    let anchor_selector = Selector::parse("a").unwrap();
    let form_selector = Selector::parse("form").unwrap();

    let anchors: String = document.select(&anchor_selector).map(|el| el.html()).collect();
    let forms: String = document.select(&form_selector).map(|el| el.html()).collect();
    (anchors, forms)
}
