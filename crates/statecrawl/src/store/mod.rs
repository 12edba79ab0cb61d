//! Typed access to the document store
//!
//! Every record of a batch lives behind this trait: endpoints, interactions,
//! states and the clustering watermarks. Implementations provide per-
//! operation atomicity only; there are no multi-document transactions, and
//! the detectors are written to tolerate stale reads.

mod memory;

pub use memory::{MemoryStore, MemoryStoreFactory};

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Endpoint, Interaction, PeerGroupKey, State, StateReachability};

/// Creates stores for new batches (used by the control surface).
#[async_trait]
pub trait StoreFactory: Send + Sync {
    /// Open (creating if needed) the store for a batch.
    async fn open(&self, batch: &str) -> Result<std::sync::Arc<dyn Store>>;
}

/// The document store contract consumed by the pipeline.
#[async_trait]
pub trait Store: Send + Sync {
    // --- inserts ---

    /// Persist an endpoint, returning its new id.
    async fn add_endpoint(&self, endpoint: Endpoint) -> Result<String>;

    /// Persist a batch of endpoints.
    async fn insert_endpoints(&self, endpoints: Vec<Endpoint>) -> Result<Vec<String>>;

    /// Persist an interaction, returning its new id.
    async fn add_interaction(&self, interaction: Interaction) -> Result<String>;

    /// Persist a state, returning its new id.
    async fn add_state(&self, state: State) -> Result<String>;

    // --- point reads ---

    /// Fetch a state by id.
    async fn get_state(&self, id: &str) -> Result<Option<State>>;

    /// Fetch an interaction by id.
    async fn get_interaction(&self, id: &str) -> Result<Option<Interaction>>;

    // --- current state handling ---

    /// The state currently flagged `current`.
    async fn get_current_state(&self) -> Result<Option<State>>;

    /// Id of the state currently flagged `current`.
    async fn get_current_state_id(&self) -> Result<Option<String>>;

    /// Atomically move the `current` flag to the given state.
    async fn update_current_state(&self, state_id: &str) -> Result<()>;

    // --- state queries and flag updates ---

    /// The single state flagged `initial`.
    async fn get_initial_state_id(&self) -> Result<Option<String>>;

    /// Earliest state with `explored == false && collapsed == false`.
    async fn get_unexplored_state_id(&self) -> Result<Option<String>>;

    /// Earliest state with `fuzzed == false && collapsed == false`.
    async fn get_non_fuzzed_state_id(&self) -> Result<Option<String>>;

    /// States filtered by `explored` / `collapsed`, ordered by creation.
    async fn states_matching(
        &self,
        explored: Option<bool>,
        collapsed: Option<bool>,
    ) -> Result<Vec<State>>;

    /// Overwrite a state's revisit counter.
    async fn set_state_revisits(&self, state_id: &str, revisits: u32) -> Result<()>;

    /// Re-open a state for visiting: all its endpoints become unvisited and
    /// the state drops its `explored` flag.
    async fn mark_state_for_revisit(&self, state_id: &str) -> Result<()>;

    /// Overwrite a state's content hash.
    async fn set_state_hash(&self, state_id: &str, hash: &str) -> Result<()>;

    /// Flag a state as fully fuzzed.
    async fn set_state_fuzzed(&self, state_id: &str) -> Result<()>;

    /// Recompute `explored` for every live state:
    /// `explored ⇔ no selectable endpoints remain`.
    async fn update_states_explored_status(&self) -> Result<()>;

    /// Count endpoints still selectable in a state
    /// (`clean && allow_visit && !visited`).
    async fn get_unexplored_endpoints_count(&self, state_id: &str) -> Result<u64>;

    // --- endpoint selection and similarity ---

    /// The endpoint flagged `is_reset`, if any.
    async fn get_reset_endpoint(&self) -> Result<Option<Endpoint>>;

    /// Atomically fetch-and-mark-visited the first selectable endpoint of a
    /// state.
    async fn next_unvisited_endpoint(&self, state_id: &str) -> Result<Option<Endpoint>>;

    /// Endpoints matching on scheme, host, method, path, state and locator.
    /// Includes the probe endpoint itself when it is already persisted.
    async fn get_similar_endpoints(&self, endpoint: &Endpoint) -> Result<Vec<Endpoint>>;

    /// Interactions whose request endpoint matches on scheme, host, method
    /// and path within a state, optionally filtered by processing/fuzzer
    /// flags.
    async fn get_similar_interactions(
        &self,
        endpoint: &Endpoint,
        state_id: &str,
        processed: Option<bool>,
        fuzzed: Option<bool>,
    ) -> Result<Vec<Interaction>>;

    // --- pipeline queues ---

    /// Interactions not yet parsed by the endpoint extractor.
    async fn unprocessed_interactions(&self) -> Result<Vec<Interaction>>;

    /// Endpoints not yet examined by the endpoint detector.
    async fn unclustered_endpoints(&self) -> Result<Vec<Endpoint>>;

    /// Interactions of a state not yet examined by the state-change
    /// detector, filtered by origin.
    async fn unclustered_interactions(
        &self,
        state_id: &str,
        made_by_fuzzer: bool,
    ) -> Result<Vec<Interaction>>;

    /// Interactions recorded in a state; `include_fuzzer = false` keeps only
    /// crawler-made ones.
    async fn interactions_for_state(
        &self,
        state_id: &str,
        include_fuzzer: bool,
    ) -> Result<Vec<Interaction>>;

    // --- record flag updates ---

    /// Set an endpoint's `clean` flag.
    async fn set_endpoint_clean(&self, id: &str, clean: bool) -> Result<()>;

    /// Mark an endpoint as seen by the endpoint detector.
    async fn set_endpoint_clustering_processed(&self, id: &str) -> Result<()>;

    /// Mark an interaction as parsed by the endpoint extractor.
    async fn set_interaction_endpoints_processed(&self, id: &str) -> Result<()>;

    /// Mark an interaction as seen by the state-change detector.
    async fn set_interaction_clustering_processed(&self, id: &str) -> Result<()>;

    /// Remove a near-duplicate endpoint.
    async fn delete_endpoint(&self, id: &str) -> Result<()>;

    /// Reset `clustering_processed` on every interaction of the batch.
    async fn mark_all_interactions_for_reclustering(&self) -> Result<()>;

    // --- re-parenting ---

    /// Move endpoints of a state created after the timestamp to a new state;
    /// they become visitable and unclustered again. Returns how many moved.
    async fn reparent_endpoints(
        &self,
        after_ts: i64,
        from_state: &str,
        to_state: &str,
    ) -> Result<u64>;

    /// Move interactions of a state created after the timestamp to a new
    /// state. Returns how many moved.
    async fn reparent_interactions(
        &self,
        after_ts: i64,
        from_state: &str,
        to_state: &str,
    ) -> Result<u64>;

    // --- collapsing ---

    /// Mark a state and all its descendants collapsed.
    async fn mark_states_collapsed_recursively(&self, state_id: &str) -> Result<()>;

    /// Delete a state and all its descendants, along with their endpoints
    /// and interactions.
    async fn delete_states_recursively(&self, state_id: &str) -> Result<()>;

    /// Append reachability edges to a surviving state.
    async fn extend_state_reachability(
        &self,
        state_id: &str,
        edges: Vec<StateReachability>,
    ) -> Result<()>;

    // --- clustering watermarks ---

    /// Last observed cluster count for an endpoint peer group.
    async fn get_endpoint_cluster_count(&self, key: &PeerGroupKey) -> Result<Option<u64>>;

    /// Store the cluster count for an endpoint peer group.
    async fn put_endpoint_cluster_count(&self, key: &PeerGroupKey, count: u64) -> Result<()>;

    /// Last observed cluster count for an interaction peer group.
    async fn get_interaction_cluster_count(&self, key: &PeerGroupKey) -> Result<Option<u64>>;

    /// Store the cluster count for an interaction peer group.
    async fn put_interaction_cluster_count(&self, key: &PeerGroupKey, count: u64) -> Result<()>;

    // --- status counters and metadata ---

    /// Endpoints currently selectable for visiting (`clean && allow_visit`).
    async fn count_endpoints_available(&self) -> Result<u64>;

    /// Endpoints already visited.
    async fn count_endpoints_visited(&self) -> Result<u64>;

    /// All interactions of the batch.
    async fn count_interactions(&self) -> Result<u64>;

    /// Record the effective run configuration under the batch's experiments.
    async fn record_experiment(&self, doc: serde_json::Value) -> Result<()>;
}
