//! The crawl step loop

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{InteractionHandler, NavigationTarget, StateNavigator};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::hashing::HashContext;
use crate::model::Request;
use crate::store::Store;

/// What a single crawl step achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Navigated and visited one new endpoint
    Visited,
    /// The current state had nothing left to visit; it will flip to
    /// explored on the next navigator pass
    NoMoreEndpoints,
    /// Every live state is explored and fuzzed; the run is complete
    Converged,
}

/// One "take a step" unit: navigate to the next state, visit one endpoint.
pub struct Crawler {
    store: Arc<dyn Store>,
    handler: InteractionHandler,
    navigator: StateNavigator,
}

impl Crawler {
    /// Wire a crawler from the batch's store and configuration.
    pub async fn new(
        store: Arc<dyn Store>,
        ctx: Arc<HashContext>,
        config: &Config,
    ) -> Result<Self> {
        let handler = InteractionHandler::new(Arc::clone(&store), ctx, &config.crawler)?;
        let navigator =
            StateNavigator::new(Arc::clone(&store), &config.state_navigator).await?;
        Ok(Self {
            store,
            handler,
            navigator,
        })
    }

    /// Navigate to the next target state and visit one endpoint there.
    pub async fn step(&self) -> Result<StepOutcome> {
        let target = self.navigator.next_target().await?;
        let NavigationTarget::Stack(mut stack) = target else {
            info!("crawling converged");
            return Ok(StepOutcome::Converged);
        };

        debug!(requests = stack.len(), "executing navigation stack");
        while let Some(request) = stack.pop() {
            self.execute_lenient(&request, false).await?;
        }

        match self.handler.generate().await? {
            Some(request) => {
                self.execute_lenient(&request, true).await?;
                Ok(StepOutcome::Visited)
            }
            None => {
                let state_id = self.store.get_current_state_id().await?.unwrap_or_default();
                info!(state_id = %state_id, "no more endpoints to visit");
                Ok(StepOutcome::NoMoreEndpoints)
            }
        }
    }

    /// Execute a request; a timeout fails the call, not the run.
    async fn execute_lenient(&self, request: &Request, save: bool) -> Result<()> {
        match self.handler.execute(request, save, false).await {
            Ok(_) => Ok(()),
            Err(Error::Http(e)) if e.is_timeout() => {
                warn!(endpoint = %request.endpoint, "request timed out");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{Endpoint, State, USER_DEFINED};
    use crate::store::{MemoryStore, Store};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx() -> Arc<HashContext> {
        Arc::new(HashContext::new(42))
    }

    fn host_of(server: &MockServer) -> String {
        let uri = url::Url::parse(&server.uri()).unwrap();
        format!("{}:{}", uri.host_str().unwrap(), uri.port().unwrap())
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.random_seed = 42;
        config.state_navigator.max_revisits = 0;
        config
    }

    async fn seed(store: &Arc<MemoryStore>, host: &str) -> String {
        let state_id = store.add_state(State::initial()).await.unwrap();
        let reset = Endpoint::builder(host, "/reset", state_id.as_str(), USER_DEFINED)
            .clean(true)
            .is_reset(true)
            .allow_visit(false)
            .clustering_processed(true)
            .build(&ctx());
        store.add_endpoint(reset).await.unwrap();
        let home = Endpoint::builder(host, "/home", state_id.as_str(), USER_DEFINED)
            .clean(true)
            .clustering_processed(true)
            .build(&ctx());
        store.add_endpoint(home).await.unwrap();
        state_id
    }

    #[tokio::test]
    async fn test_step_executes_reset_then_visits_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reset"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/home"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let state_id = seed(&store, &host_of(&server)).await;
        let crawler = Crawler::new(
            Arc::clone(&store) as Arc<dyn Store>,
            ctx(),
            &test_config(),
        )
        .await
        .unwrap();

        let outcome = crawler.step().await.unwrap();
        assert_eq!(outcome, StepOutcome::Visited);

        // Only the visit was saved; the reset execution was not.
        let interactions = store.interactions_for_state(&state_id, true).await.unwrap();
        assert_eq!(interactions.len(), 1);
        assert_eq!(interactions[0].request.endpoint.path, "/home");
    }

    #[tokio::test]
    async fn test_step_reports_exhausted_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let state_id = seed(&store, &host_of(&server)).await;
        // Pre-visit the only endpoint.
        store.next_unvisited_endpoint(&state_id).await.unwrap();

        let crawler = Crawler::new(
            Arc::clone(&store) as Arc<dyn Store>,
            ctx(),
            &test_config(),
        )
        .await
        .unwrap();

        let outcome = crawler.step().await.unwrap();
        assert_eq!(outcome, StepOutcome::NoMoreEndpoints);
    }

    #[tokio::test]
    async fn test_step_converges_when_nothing_is_left() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        let state_id = seed(&store, &host_of(&server)).await;
        store.next_unvisited_endpoint(&state_id).await.unwrap();
        store.set_state_fuzzed(&state_id).await.unwrap();

        let crawler = Crawler::new(
            Arc::clone(&store) as Arc<dyn Store>,
            ctx(),
            &test_config(),
        )
        .await
        .unwrap();

        let outcome = crawler.step().await.unwrap();
        assert_eq!(outcome, StepOutcome::Converged);
    }
}
