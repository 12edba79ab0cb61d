//! Run bootstrap
//!
//! Seeds a batch (initial state, entry endpoint, reset endpoint, experiment
//! record), wires every pipeline component against the store, and spawns the
//! work manager. The returned handle cancels the run cooperatively: every
//! work observes the token at its next iteration boundary.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;
use url::Url;

use crate::config::Config;
use crate::crawl::Crawler;
use crate::detect::{EndpointDetector, StateChangeDetector, StateDetector};
use crate::error::{Error, Result};
use crate::extract::EndpointExtractor;
use crate::hashing::HashContext;
use crate::model::{Endpoint, State, USER_DEFINED};
use crate::store::Store;
use crate::work::{Canceller, WorkManager};

/// A running scan.
pub struct ScanHandle {
    canceller: Canceller,
    join: JoinHandle<Result<()>>,
}

impl ScanHandle {
    /// Request cooperative cancellation.
    pub fn stop(&self) {
        self.canceller.cancel();
    }

    /// Whether the run has finished (converged, errored or cancelled).
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run to end and surface its result.
    pub async fn wait(self) -> Result<()> {
        self.join
            .await
            .map_err(|e| Error::store(format!("scan task panicked: {e}")))?
    }
}

/// Seed the store for a new batch: the initial state plus the user-defined
/// entry and reset endpoints derived from the target URL.
pub async fn seed_batch(
    config: &Config,
    store: &Arc<dyn Store>,
    ctx: &HashContext,
    target_url: &str,
) -> Result<String> {
    let target = Url::parse(target_url)
        .map_err(|e| Error::config(format!("invalid target URL '{target_url}': {e}")))?;
    let host = match target.port() {
        Some(port) => format!("{}:{port}", target.host_str().unwrap_or_default()),
        None => target.host_str().unwrap_or_default().to_string(),
    };
    if host.is_empty() {
        return Err(Error::config(format!(
            "target URL '{target_url}' has no host"
        )));
    }
    let scheme = target.scheme().to_string();

    let mut experiment = serde_json::to_value(config)?;
    experiment["hash_padding"] = serde_json::Value::String(ctx.padding().to_string());
    store.record_experiment(experiment).await?;

    let initial_state_id = store.add_state(State::initial()).await?;

    let entry = Endpoint::builder(
        host.clone(),
        config.crawler.initial_path.as_str(),
        initial_state_id.as_str(),
        USER_DEFINED,
    )
    .scheme(scheme.as_str())
    .clean(true)
    .clustering_processed(true)
    .build(ctx);
    store.add_endpoint(entry).await?;

    // The reset endpoint is navigation infrastructure, not a crawl target.
    let reset = Endpoint::builder(
        host,
        config.crawler.reset_path.as_str(),
        initial_state_id.as_str(),
        USER_DEFINED,
    )
    .scheme(scheme.as_str())
    .method("GET")
    .clean(true)
    .is_reset(true)
    .allow_visit(false)
    .clustering_processed(true)
    .build(ctx);
    store.add_endpoint(reset).await?;

    Ok(initial_state_id)
}

/// Seed the batch, build the pipeline and spawn the work manager.
pub async fn start_scan(
    config: Arc<Config>,
    store: Arc<dyn Store>,
    target_url: &str,
) -> Result<ScanHandle> {
    let ctx = Arc::new(HashContext::new(config.random_seed));

    info!(target = target_url, "initializing scan");
    seed_batch(&config, &store, &ctx, target_url).await?;

    let crawler = Crawler::new(Arc::clone(&store), Arc::clone(&ctx), &config).await?;
    let extractor =
        EndpointExtractor::new(Arc::clone(&store), Arc::clone(&ctx), &config.crawler);
    let endpoint_detector =
        EndpointDetector::new(Arc::clone(&store), &config.endpoint_detector);
    let state_change_detector =
        StateChangeDetector::new(Arc::clone(&store), &config.state_change_detector);
    let state_detector = StateDetector::new(
        Arc::clone(&store),
        Arc::clone(&ctx),
        &config.state_detector,
    );

    let mut manager = WorkManager::new(config.workers.execution_type, config.workers.throttle_ms);
    manager.register(Box::new(crawler));
    manager.register(Box::new(extractor));
    manager.register(Box::new(endpoint_detector));
    manager.register(Box::new(state_change_detector));
    manager.register(Box::new(state_detector));

    let canceller = manager.canceller();
    let join = tokio::spawn(manager.run());

    Ok(ScanHandle { canceller, join })
}
