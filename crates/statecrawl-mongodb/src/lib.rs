//! # MongoDB store backend
//!
//! Persists a batch's endpoints, interactions, states, clustering watermarks
//! and experiment metadata in MongoDB. Each batch gets its own database
//! (`<prefix><batch>`) with one collection per record kind, so batches never
//! see each other's data and a finished run can be archived or dropped as a
//! unit.
//!
//! Operations are individually atomic; there are no multi-document
//! transactions. That matches the store contract the detectors are written
//! against: they tolerate stale reads, and re-parenting is a monotone flag
//! flip.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use statecrawl_mongodb::MongoStore;
//!
//! # async fn example() -> statecrawl::Result<()> {
//! let store = MongoStore::connect(
//!     "mongodb://localhost:27017",
//!     "statecrawl_",
//!     "batch-1700000000",
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::{Client, Collection, IndexModel};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use statecrawl::error::{Error, Result};
use statecrawl::model::{Endpoint, Interaction, PeerGroupKey, State, StateReachability};
use statecrawl::store::{Store, StoreFactory};

const ENDPOINTS: &str = "endpoints";
const INTERACTIONS: &str = "interactions";
const STATES: &str = "states";
const ENDPOINT_CLUSTERING: &str = "endpoint_clustering";
const INTERACTION_CLUSTERING: &str = "interaction_clustering";
const EXPERIMENTS: &str = "experiments";

/// Connection settings for the MongoDB backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MongoConfig {
    /// Connection string
    pub uri: String,
    /// Prefix prepended to the batch name to form the database name
    pub database_prefix: String,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017".to_string(),
            database_prefix: "statecrawl_".to_string(),
        }
    }
}

fn db_err(e: mongodb::error::Error) -> Error {
    Error::store(e.to_string())
}

fn ser_err(e: mongodb::bson::ser::Error) -> Error {
    Error::store(format!("bson encoding failed: {e}"))
}

fn peer_group_filter(key: &PeerGroupKey) -> Document {
    doc! {
        "scheme": &key.scheme,
        "host": &key.host,
        "path": &key.path,
        "method": &key.method,
        "state_id": &key.state_id,
    }
}

/// MongoDB-backed [`Store`] implementation.
pub struct MongoStore {
    endpoints: Collection<Endpoint>,
    interactions: Collection<Interaction>,
    states: Collection<State>,
    endpoint_clustering: Collection<Document>,
    interaction_clustering: Collection<Document>,
    experiments: Collection<Document>,
}

impl MongoStore {
    /// Connect and open the collections for a batch, creating the id
    /// indexes the pipeline queries rely on.
    pub async fn connect(uri: &str, database_prefix: &str, batch: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).await.map_err(db_err)?;
        let db = client.database(&format!("{database_prefix}{batch}"));

        let store = Self {
            endpoints: db.collection(ENDPOINTS),
            interactions: db.collection(INTERACTIONS),
            states: db.collection(STATES),
            endpoint_clustering: db.collection(ENDPOINT_CLUSTERING),
            interaction_clustering: db.collection(INTERACTION_CLUSTERING),
            experiments: db.collection(EXPERIMENTS),
        };

        let id_index = IndexModel::builder().keys(doc! { "id": 1 }).build();
        store
            .endpoints
            .create_index(id_index.clone())
            .await
            .map_err(db_err)?;
        store
            .interactions
            .create_index(id_index.clone())
            .await
            .map_err(db_err)?;
        store
            .states
            .create_index(id_index)
            .await
            .map_err(db_err)?;

        debug!(batch, "mongo store ready");
        Ok(store)
    }

    fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    async fn collect_endpoints(&self, filter: Document) -> Result<Vec<Endpoint>> {
        self.endpoints
            .find(filter)
            .sort(doc! { "created_at": 1 })
            .await
            .map_err(db_err)?
            .try_collect()
            .await
            .map_err(db_err)
    }

    async fn collect_interactions(&self, filter: Document) -> Result<Vec<Interaction>> {
        self.interactions
            .find(filter)
            .sort(doc! { "created_at": 1 })
            .await
            .map_err(db_err)?
            .try_collect()
            .await
            .map_err(db_err)
    }

    async fn collect_states(&self, filter: Document) -> Result<Vec<State>> {
        self.states
            .find(filter)
            .sort(doc! { "created_at": 1 })
            .await
            .map_err(db_err)?
            .try_collect()
            .await
            .map_err(db_err)
    }

    async fn first_state_id(&self, filter: Document) -> Result<Option<String>> {
        Ok(self
            .states
            .find_one(filter)
            .sort(doc! { "created_at": 1 })
            .await
            .map_err(db_err)?
            .map(|s| s.id))
    }

    /// A state id plus every descendant reachable over `previous_state_id`.
    async fn descendant_ids(&self, root: &str) -> Result<Vec<String>> {
        let mut collected = vec![root.to_string()];
        let mut frontier = vec![root.to_string()];
        while let Some(parent) = frontier.pop() {
            let children = self
                .collect_states(doc! { "previous_state_id": &parent })
                .await?;
            for child in children {
                frontier.push(child.id.clone());
                collected.push(child.id);
            }
        }
        Ok(collected)
    }

    async fn cluster_count(
        collection: &Collection<Document>,
        key: &PeerGroupKey,
    ) -> Result<Option<u64>> {
        let found = collection
            .find_one(peer_group_filter(key))
            .await
            .map_err(db_err)?;
        Ok(found.and_then(|d| d.get_i64("cluster_count").ok().map(|c| c as u64)))
    }

    async fn put_cluster_count(
        collection: &Collection<Document>,
        key: &PeerGroupKey,
        count: u64,
    ) -> Result<()> {
        collection
            .update_one(
                peer_group_filter(key),
                doc! { "$set": { "cluster_count": count as i64 } },
            )
            .upsert(true)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl Store for MongoStore {
    async fn add_endpoint(&self, mut endpoint: Endpoint) -> Result<String> {
        endpoint.id = Self::new_id();
        let id = endpoint.id.clone();
        self.endpoints.insert_one(endpoint).await.map_err(db_err)?;
        Ok(id)
    }

    async fn insert_endpoints(&self, mut endpoints: Vec<Endpoint>) -> Result<Vec<String>> {
        if endpoints.is_empty() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::with_capacity(endpoints.len());
        for endpoint in &mut endpoints {
            endpoint.id = Self::new_id();
            ids.push(endpoint.id.clone());
        }
        self.endpoints
            .insert_many(endpoints)
            .await
            .map_err(db_err)?;
        Ok(ids)
    }

    async fn add_interaction(&self, mut interaction: Interaction) -> Result<String> {
        interaction.id = Self::new_id();
        let id = interaction.id.clone();
        self.interactions
            .insert_one(interaction)
            .await
            .map_err(db_err)?;
        Ok(id)
    }

    async fn add_state(&self, mut state: State) -> Result<String> {
        state.id = Self::new_id();
        let id = state.id.clone();
        self.states.insert_one(state).await.map_err(db_err)?;
        Ok(id)
    }

    async fn get_state(&self, id: &str) -> Result<Option<State>> {
        self.states
            .find_one(doc! { "id": id })
            .await
            .map_err(db_err)
    }

    async fn get_interaction(&self, id: &str) -> Result<Option<Interaction>> {
        self.interactions
            .find_one(doc! { "id": id })
            .await
            .map_err(db_err)
    }

    async fn get_current_state(&self) -> Result<Option<State>> {
        self.states
            .find_one(doc! { "current": true })
            .await
            .map_err(db_err)
    }

    async fn get_current_state_id(&self) -> Result<Option<String>> {
        Ok(self.get_current_state().await?.map(|s| s.id))
    }

    async fn update_current_state(&self, state_id: &str) -> Result<()> {
        self.states
            .update_many(
                doc! { "current": true },
                doc! { "$set": { "current": false } },
            )
            .await
            .map_err(db_err)?;
        self.states
            .update_one(doc! { "id": state_id }, doc! { "$set": { "current": true } })
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_initial_state_id(&self) -> Result<Option<String>> {
        self.first_state_id(doc! { "initial": true }).await
    }

    async fn get_unexplored_state_id(&self) -> Result<Option<String>> {
        self.first_state_id(doc! { "explored": false, "collapsed": false })
            .await
    }

    async fn get_non_fuzzed_state_id(&self) -> Result<Option<String>> {
        self.first_state_id(doc! { "fuzzed": false, "collapsed": false })
            .await
    }

    async fn states_matching(
        &self,
        explored: Option<bool>,
        collapsed: Option<bool>,
    ) -> Result<Vec<State>> {
        let mut filter = Document::new();
        if let Some(explored) = explored {
            filter.insert("explored", explored);
        }
        if let Some(collapsed) = collapsed {
            filter.insert("collapsed", collapsed);
        }
        self.collect_states(filter).await
    }

    async fn set_state_revisits(&self, state_id: &str, revisits: u32) -> Result<()> {
        self.states
            .update_one(
                doc! { "id": state_id },
                doc! { "$set": { "revisits": revisits } },
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn mark_state_for_revisit(&self, state_id: &str) -> Result<()> {
        self.endpoints
            .update_many(
                doc! { "state_id": state_id },
                doc! { "$set": { "visited": false } },
            )
            .await
            .map_err(db_err)?;
        self.states
            .update_one(
                doc! { "id": state_id },
                doc! { "$set": { "explored": false } },
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_state_hash(&self, state_id: &str, hash: &str) -> Result<()> {
        self.states
            .update_one(doc! { "id": state_id }, doc! { "$set": { "hash": hash } })
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_state_fuzzed(&self, state_id: &str) -> Result<()> {
        self.states
            .update_one(doc! { "id": state_id }, doc! { "$set": { "fuzzed": true } })
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn update_states_explored_status(&self) -> Result<()> {
        for state in self.collect_states(doc! { "collapsed": false }).await? {
            let unexplored = self.get_unexplored_endpoints_count(&state.id).await?;
            self.states
                .update_one(
                    doc! { "id": &state.id },
                    doc! { "$set": { "explored": unexplored == 0 } },
                )
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn get_unexplored_endpoints_count(&self, state_id: &str) -> Result<u64> {
        self.endpoints
            .count_documents(doc! {
                "state_id": state_id,
                "clean": true,
                "allow_visit": true,
                "visited": false,
            })
            .await
            .map_err(db_err)
    }

    async fn get_reset_endpoint(&self) -> Result<Option<Endpoint>> {
        self.endpoints
            .find_one(doc! { "is_reset": true })
            .await
            .map_err(db_err)
    }

    async fn next_unvisited_endpoint(&self, state_id: &str) -> Result<Option<Endpoint>> {
        self.endpoints
            .find_one_and_update(
                doc! {
                    "state_id": state_id,
                    "clean": true,
                    "allow_visit": true,
                    "visited": false,
                },
                doc! { "$set": { "visited": true } },
            )
            .sort(doc! { "created_at": 1 })
            .await
            .map_err(db_err)
    }

    async fn get_similar_endpoints(&self, endpoint: &Endpoint) -> Result<Vec<Endpoint>> {
        self.collect_endpoints(doc! {
            "scheme": &endpoint.scheme,
            "host": &endpoint.host,
            "method": &endpoint.method,
            "path": &endpoint.path,
            "state_id": &endpoint.state_id,
            "found_at": endpoint.found_at.clone(),
        })
        .await
    }

    async fn get_similar_interactions(
        &self,
        endpoint: &Endpoint,
        state_id: &str,
        processed: Option<bool>,
        fuzzed: Option<bool>,
    ) -> Result<Vec<Interaction>> {
        let mut filter = doc! {
            "request.endpoint.scheme": &endpoint.scheme,
            "request.endpoint.host": &endpoint.host,
            "request.endpoint.method": &endpoint.method,
            "request.endpoint.path": &endpoint.path,
            "state_id": state_id,
        };
        if let Some(processed) = processed {
            filter.insert("clustering_processed", processed);
        }
        if let Some(fuzzed) = fuzzed {
            filter.insert("made_by_fuzzer", fuzzed);
        }
        self.collect_interactions(filter).await
    }

    async fn unprocessed_interactions(&self) -> Result<Vec<Interaction>> {
        self.collect_interactions(doc! { "endpoints_processed": false })
            .await
    }

    async fn unclustered_endpoints(&self) -> Result<Vec<Endpoint>> {
        self.collect_endpoints(doc! { "clustering_processed": false })
            .await
    }

    async fn unclustered_interactions(
        &self,
        state_id: &str,
        made_by_fuzzer: bool,
    ) -> Result<Vec<Interaction>> {
        self.collect_interactions(doc! {
            "state_id": state_id,
            "clustering_processed": false,
            "made_by_fuzzer": made_by_fuzzer,
        })
        .await
    }

    async fn interactions_for_state(
        &self,
        state_id: &str,
        include_fuzzer: bool,
    ) -> Result<Vec<Interaction>> {
        let mut filter = doc! { "state_id": state_id };
        if !include_fuzzer {
            filter.insert("made_by_fuzzer", false);
        }
        self.collect_interactions(filter).await
    }

    async fn set_endpoint_clean(&self, id: &str, clean: bool) -> Result<()> {
        self.endpoints
            .update_one(doc! { "id": id }, doc! { "$set": { "clean": clean } })
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_endpoint_clustering_processed(&self, id: &str) -> Result<()> {
        self.endpoints
            .update_one(
                doc! { "id": id },
                doc! { "$set": { "clustering_processed": true } },
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_interaction_endpoints_processed(&self, id: &str) -> Result<()> {
        self.interactions
            .update_one(
                doc! { "id": id },
                doc! { "$set": { "endpoints_processed": true } },
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_interaction_clustering_processed(&self, id: &str) -> Result<()> {
        self.interactions
            .update_one(
                doc! { "id": id },
                doc! { "$set": { "clustering_processed": true } },
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_endpoint(&self, id: &str) -> Result<()> {
        self.endpoints
            .delete_one(doc! { "id": id })
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn mark_all_interactions_for_reclustering(&self) -> Result<()> {
        self.interactions
            .update_many(
                Document::new(),
                doc! { "$set": { "clustering_processed": false } },
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn reparent_endpoints(
        &self,
        after_ts: i64,
        from_state: &str,
        to_state: &str,
    ) -> Result<u64> {
        let result = self
            .endpoints
            .update_many(
                doc! {
                    "state_id": from_state,
                    "created_at": { "$gt": after_ts },
                },
                doc! { "$set": {
                    "state_id": to_state,
                    "allow_visit": true,
                    "clustering_processed": false,
                } },
            )
            .await
            .map_err(db_err)?;
        Ok(result.modified_count)
    }

    async fn reparent_interactions(
        &self,
        after_ts: i64,
        from_state: &str,
        to_state: &str,
    ) -> Result<u64> {
        let result = self
            .interactions
            .update_many(
                doc! {
                    "state_id": from_state,
                    "created_at": { "$gt": after_ts },
                },
                doc! { "$set": { "state_id": to_state } },
            )
            .await
            .map_err(db_err)?;
        Ok(result.modified_count)
    }

    async fn mark_states_collapsed_recursively(&self, state_id: &str) -> Result<()> {
        let doomed = self.descendant_ids(state_id).await?;
        self.states
            .update_many(
                doc! { "id": { "$in": doomed } },
                doc! { "$set": { "collapsed": true } },
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn delete_states_recursively(&self, state_id: &str) -> Result<()> {
        let doomed = self.descendant_ids(state_id).await?;
        self.interactions
            .delete_many(doc! { "state_id": { "$in": doomed.clone() } })
            .await
            .map_err(db_err)?;
        self.endpoints
            .delete_many(doc! { "state_id": { "$in": doomed.clone() } })
            .await
            .map_err(db_err)?;
        self.states
            .delete_many(doc! { "id": { "$in": doomed } })
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn extend_state_reachability(
        &self,
        state_id: &str,
        edges: Vec<StateReachability>,
    ) -> Result<()> {
        if edges.is_empty() {
            return Ok(());
        }
        let encoded: Vec<Bson> = edges
            .iter()
            .map(mongodb::bson::to_bson)
            .collect::<std::result::Result<_, _>>()
            .map_err(ser_err)?;
        self.states
            .update_one(
                doc! { "id": state_id },
                doc! { "$push": { "reachable_from": { "$each": encoded } } },
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_endpoint_cluster_count(&self, key: &PeerGroupKey) -> Result<Option<u64>> {
        Self::cluster_count(&self.endpoint_clustering, key).await
    }

    async fn put_endpoint_cluster_count(&self, key: &PeerGroupKey, count: u64) -> Result<()> {
        Self::put_cluster_count(&self.endpoint_clustering, key, count).await
    }

    async fn get_interaction_cluster_count(&self, key: &PeerGroupKey) -> Result<Option<u64>> {
        Self::cluster_count(&self.interaction_clustering, key).await
    }

    async fn put_interaction_cluster_count(&self, key: &PeerGroupKey, count: u64) -> Result<()> {
        Self::put_cluster_count(&self.interaction_clustering, key, count).await
    }

    async fn count_endpoints_available(&self) -> Result<u64> {
        self.endpoints
            .count_documents(doc! { "clean": true, "allow_visit": true })
            .await
            .map_err(db_err)
    }

    async fn count_endpoints_visited(&self) -> Result<u64> {
        self.endpoints
            .count_documents(doc! { "visited": true })
            .await
            .map_err(db_err)
    }

    async fn count_interactions(&self) -> Result<u64> {
        self.interactions
            .count_documents(Document::new())
            .await
            .map_err(db_err)
    }

    async fn record_experiment(&self, document: serde_json::Value) -> Result<()> {
        let encoded = mongodb::bson::to_document(&document)
            .map_err(|e| Error::store(format!("experiment encoding failed: {e}")))?;
        self.experiments.insert_one(encoded).await.map_err(db_err)?;
        Ok(())
    }
}

/// Opens a [`MongoStore`] per batch.
pub struct MongoStoreFactory {
    config: MongoConfig,
}

impl MongoStoreFactory {
    /// Create a factory from connection settings.
    pub fn new(config: MongoConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StoreFactory for MongoStoreFactory {
    async fn open(&self, batch: &str) -> Result<Arc<dyn Store>> {
        let store =
            MongoStore::connect(&self.config.uri, &self.config.database_prefix, batch).await?;
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use statecrawl::hashing::HashContext;
    use statecrawl::model::USER_DEFINED;

    fn ctx() -> HashContext {
        HashContext::new(1)
    }

    #[test]
    fn test_peer_group_filter_shape() {
        let key = PeerGroupKey {
            scheme: "http".into(),
            host: "app.local:8080".into(),
            path: "/login".into(),
            method: "POST".into(),
            state_id: "state-1".into(),
        };
        let filter = peer_group_filter(&key);
        assert_eq!(filter.get_str("scheme").unwrap(), "http");
        assert_eq!(filter.get_str("host").unwrap(), "app.local:8080");
        assert_eq!(filter.get_str("path").unwrap(), "/login");
        assert_eq!(filter.get_str("method").unwrap(), "POST");
        assert_eq!(filter.get_str("state_id").unwrap(), "state-1");
        assert!(!filter.contains_key("cluster_count"));
    }

    #[test]
    fn test_endpoint_round_trips_through_bson() {
        let endpoint = Endpoint::builder("h:1", "/p", "s", USER_DEFINED)
            .method("POST")
            .found_at(vec!["html".into(), "form".into()])
            .build(&ctx());
        let document = mongodb::bson::to_document(&endpoint).unwrap();
        let decoded: Endpoint = mongodb::bson::from_document(document).unwrap();
        assert_eq!(decoded.hash, endpoint.hash);
        assert_eq!(decoded.found_at, endpoint.found_at);
        assert_eq!(decoded.created_at, endpoint.created_at);
        assert!(decoded.allow_visit);
    }

    #[test]
    fn test_default_config() {
        let config = MongoConfig::default();
        assert_eq!(config.uri, "mongodb://localhost:27017");
        assert_eq!(config.database_prefix, "statecrawl_");
    }

    async fn test_store(batch: &str) -> MongoStore {
        MongoStore::connect("mongodb://localhost:27017", "statecrawl_test_", batch)
            .await
            .expect("MongoDB must be running on localhost for ignored tests")
    }

    #[tokio::test]
    #[ignore = "requires MongoDB running on localhost"]
    async fn test_state_lifecycle_round_trip() {
        let store = test_store("lifecycle").await;
        let initial = store.add_state(State::initial()).await.unwrap();
        let child = store.add_state(State::new(initial.as_str(), "cause")).await.unwrap();

        assert_eq!(store.get_current_state_id().await.unwrap(), Some(initial.clone()));
        store.update_current_state(&child).await.unwrap();
        assert_eq!(store.get_current_state_id().await.unwrap(), Some(child.clone()));

        store.delete_states_recursively(&initial).await.unwrap();
        assert!(store.get_state(&initial).await.unwrap().is_none());
        assert!(store.get_state(&child).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires MongoDB running on localhost"]
    async fn test_endpoint_selection_and_reparenting() {
        let store = test_store("endpoints").await;
        let state = store.add_state(State::initial()).await.unwrap();
        let other = store.add_state(State::new(state.as_str(), "cause")).await.unwrap();

        let mut endpoint = Endpoint::builder("h", "/a", state.as_str(), USER_DEFINED)
            .clean(true)
            .clustering_processed(true)
            .build(&ctx());
        endpoint.created_at = 100;
        store.add_endpoint(endpoint).await.unwrap();

        let picked = store.next_unvisited_endpoint(&state).await.unwrap();
        assert!(picked.is_some());
        assert!(store.next_unvisited_endpoint(&state).await.unwrap().is_none());

        let moved = store.reparent_endpoints(50, &state, &other).await.unwrap();
        assert_eq!(moved, 1);
        assert_eq!(store.get_unexplored_endpoints_count(&state).await.unwrap(), 0);

        store.delete_states_recursively(&state).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires MongoDB running on localhost"]
    async fn test_cluster_watermark_upsert() {
        let store = test_store("watermarks").await;
        let key = PeerGroupKey {
            scheme: "http".into(),
            host: "h".into(),
            path: "/p".into(),
            method: "GET".into(),
            state_id: "s".into(),
        };
        assert!(store.get_endpoint_cluster_count(&key).await.unwrap().is_none());
        store.put_endpoint_cluster_count(&key, 1).await.unwrap();
        store.put_endpoint_cluster_count(&key, 3).await.unwrap();
        assert_eq!(store.get_endpoint_cluster_count(&key).await.unwrap(), Some(3));
    }
}
