//! Interaction handling
//!
//! One handler per batch owns the shared HTTP session; cookies and auth
//! state persist across every request of the run, which is what makes
//! logged-in states reachable at all. The handler is the only writer of
//! that session.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::{CrawlerConfig, InteractionHashMethod};
use crate::error::{Error, Result};
use crate::hashing::HashContext;
use crate::model::{Interaction, Request, Response};
use crate::store::Store;

/// Executes requests against the target and records the interactions.
pub struct InteractionHandler {
    store: Arc<dyn Store>,
    ctx: Arc<HashContext>,
    client: reqwest::Client,
    hash_method: InteractionHashMethod,
}

impl InteractionHandler {
    /// Build a handler with a fresh cookie-holding session.
    pub fn new(
        store: Arc<dyn Store>,
        ctx: Arc<HashContext>,
        config: &CrawlerConfig,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            store,
            ctx,
            client,
            hash_method: config.interaction_hash_method,
        })
    }

    /// A request to the first still-selectable endpoint of the current
    /// state, atomically marked visited; `None` when the state is exhausted.
    pub async fn generate(&self) -> Result<Option<Request>> {
        let current_state_id = self.current_state_id().await?;
        Ok(self
            .store
            .next_unvisited_endpoint(&current_state_id)
            .await?
            .map(Request::new))
    }

    /// Execute a request in the current state.
    ///
    /// With `save`, the interaction is persisted against the state id read
    /// at call time. A timeout fails this call only; the session survives.
    pub async fn execute(
        &self,
        request: &Request,
        save: bool,
        made_by_fuzzer: bool,
    ) -> Result<Response> {
        let current_state_id = self.current_state_id().await?;
        info!(endpoint = %request.endpoint, "executing request");

        let method = reqwest::Method::from_bytes(request.endpoint.method.as_bytes())
            .map_err(|_| {
                Error::invalid_record(format!("bad HTTP method '{}'", request.endpoint.method))
            })?;

        let mut builder = self.client.request(method, request.endpoint.url());
        if !request.endpoint.parameters.is_empty() {
            let query: Vec<(&str, &str)> = request
                .endpoint
                .parameters
                .iter()
                .map(|p| (p.name.as_str(), p.value.as_str()))
                .collect();
            builder = builder.query(&query);
        }
        if !request.endpoint.data.is_empty() {
            let form: Vec<(&str, &str)> = request
                .endpoint
                .data
                .iter()
                .map(|p| (p.name.as_str(), p.value.as_str()))
                .collect();
            builder = builder.form(&form);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let raw = builder.send().await?;
        let code = raw.status().as_u16();
        let mut headers = BTreeMap::new();
        for (name, value) in raw.headers() {
            headers.insert(
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            );
        }
        let data = raw.text().await?;

        let response = Response {
            code,
            data,
            headers,
        };

        if save {
            let interaction = Interaction::new(
                request.clone(),
                response.clone(),
                current_state_id,
                made_by_fuzzer,
                self.hash_method,
                &self.ctx,
            );
            self.store.add_interaction(interaction).await?;
        }

        Ok(response)
    }

    async fn current_state_id(&self) -> Result<String> {
        self.store
            .get_current_state_id()
            .await?
            .ok_or_else(|| Error::invariant("no state marked current"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{Endpoint, Parameter, State, USER_DEFINED};
    use crate::store::MemoryStore;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx() -> Arc<HashContext> {
        Arc::new(HashContext::new(42))
    }

    fn handler(store: Arc<MemoryStore>) -> InteractionHandler {
        InteractionHandler::new(store as Arc<dyn Store>, ctx(), &CrawlerConfig::default())
            .unwrap()
    }

    fn host_of(server: &MockServer) -> String {
        let uri = url::Url::parse(&server.uri()).unwrap();
        format!("{}:{}", uri.host_str().unwrap(), uri.port().unwrap())
    }

    #[tokio::test]
    async fn test_generate_returns_none_when_exhausted() {
        let store = Arc::new(MemoryStore::new());
        store.add_state(State::initial()).await.unwrap();
        let handler = handler(Arc::clone(&store));
        assert!(handler.generate().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_generate_fails_without_current_state() {
        let store = Arc::new(MemoryStore::new());
        let handler = handler(Arc::clone(&store));
        let err = handler.generate().await.unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }

    #[tokio::test]
    async fn test_generate_marks_endpoint_visited() {
        let store = Arc::new(MemoryStore::new());
        let state_id = store.add_state(State::initial()).await.unwrap();
        let endpoint = Endpoint::builder("h", "/a", state_id.as_str(), USER_DEFINED)
            .clean(true)
            .build(&ctx());
        let mut processed = endpoint;
        processed.clustering_processed = true;
        store.add_endpoint(processed).await.unwrap();

        let handler = handler(Arc::clone(&store));
        let request = handler.generate().await.unwrap().unwrap();
        assert_eq!(request.endpoint.path, "/a");
        assert!(handler.generate().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_execute_sends_query_and_form_and_saves() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .and(query_param("next", "/home"))
            .and(body_string_contains("user=alice"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("<html><a href='/in'>in</a></html>"),
            )
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let state_id = store.add_state(State::initial()).await.unwrap();
        let endpoint = Endpoint::builder(host_of(&server), "/login", state_id.as_str(), USER_DEFINED)
            .method("POST")
            .parameters(vec![Parameter::new("next", "/home")])
            .data(vec![Parameter::new("user", "alice")])
            .build(&ctx());

        let handler = handler(Arc::clone(&store));
        let response = handler
            .execute(&Request::new(endpoint), true, false)
            .await
            .unwrap();

        assert_eq!(response.code, 200);
        assert!(response.data.contains("/in"));

        let interactions = store.interactions_for_state(&state_id, true).await.unwrap();
        assert_eq!(interactions.len(), 1);
        assert_eq!(interactions[0].state_id, state_id);
        assert!(!interactions[0].made_by_fuzzer);
        assert!(interactions[0].hash.starts_with("T1"));
    }

    #[tokio::test]
    async fn test_execute_without_save_records_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let state_id = store.add_state(State::initial()).await.unwrap();
        let endpoint =
            Endpoint::builder(host_of(&server), "/reset", state_id.as_str(), USER_DEFINED).build(&ctx());

        let handler = handler(Arc::clone(&store));
        handler
            .execute(&Request::new(endpoint), false, false)
            .await
            .unwrap();

        assert_eq!(store.count_interactions().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fuzzer_flag_is_recorded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let state_id = store.add_state(State::initial()).await.unwrap();
        let endpoint =
            Endpoint::builder(host_of(&server), "/fuzz", state_id.as_str(), USER_DEFINED).build(&ctx());

        let handler = handler(Arc::clone(&store));
        handler
            .execute(&Request::new(endpoint), true, true)
            .await
            .unwrap();

        let interactions = store.interactions_for_state(&state_id, true).await.unwrap();
        assert!(interactions[0].made_by_fuzzer);
    }
}
