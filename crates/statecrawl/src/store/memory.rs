//! In-memory store
//!
//! A fully in-memory implementation of [`Store`], used by the test suite and
//! by runs that do not need persistence. All data is lost when the store is
//! dropped. Locks are never held across await points.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{Store, StoreFactory};
use crate::error::Result;
use crate::model::{Endpoint, Interaction, PeerGroupKey, State, StateReachability};

/// In-memory [`Store`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    endpoints: RwLock<Vec<Endpoint>>,
    interactions: RwLock<Vec<Interaction>>,
    states: RwLock<Vec<State>>,
    endpoint_clusters: DashMap<PeerGroupKey, u64>,
    interaction_clusters: DashMap<PeerGroupKey, u64>,
    experiments: RwLock<Vec<serde_json::Value>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    fn descendant_ids(states: &[State], root: &str) -> Vec<String> {
        let mut collected = vec![root.to_string()];
        let mut frontier = vec![root.to_string()];
        while let Some(parent) = frontier.pop() {
            for state in states {
                if state.previous_state_id == parent {
                    collected.push(state.id.clone());
                    frontier.push(state.id.clone());
                }
            }
        }
        collected
    }

    fn selectable(endpoint: &Endpoint, state_id: &str) -> bool {
        endpoint.state_id == state_id
            && endpoint.clean
            && endpoint.allow_visit
            && !endpoint.visited
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn add_endpoint(&self, mut endpoint: Endpoint) -> Result<String> {
        let id = Self::new_id();
        endpoint.id = id.clone();
        self.endpoints.write().push(endpoint);
        Ok(id)
    }

    async fn insert_endpoints(&self, endpoints: Vec<Endpoint>) -> Result<Vec<String>> {
        let mut guard = self.endpoints.write();
        let mut ids = Vec::with_capacity(endpoints.len());
        for mut endpoint in endpoints {
            let id = Self::new_id();
            endpoint.id = id.clone();
            ids.push(id);
            guard.push(endpoint);
        }
        Ok(ids)
    }

    async fn add_interaction(&self, mut interaction: Interaction) -> Result<String> {
        let id = Self::new_id();
        interaction.id = id.clone();
        self.interactions.write().push(interaction);
        Ok(id)
    }

    async fn add_state(&self, mut state: State) -> Result<String> {
        let id = Self::new_id();
        state.id = id.clone();
        self.states.write().push(state);
        Ok(id)
    }

    async fn get_state(&self, id: &str) -> Result<Option<State>> {
        Ok(self.states.read().iter().find(|s| s.id == id).cloned())
    }

    async fn get_interaction(&self, id: &str) -> Result<Option<Interaction>> {
        Ok(self
            .interactions
            .read()
            .iter()
            .find(|i| i.id == id)
            .cloned())
    }

    async fn get_current_state(&self) -> Result<Option<State>> {
        Ok(self.states.read().iter().find(|s| s.current).cloned())
    }

    async fn get_current_state_id(&self) -> Result<Option<String>> {
        Ok(self
            .states
            .read()
            .iter()
            .find(|s| s.current)
            .map(|s| s.id.clone()))
    }

    async fn update_current_state(&self, state_id: &str) -> Result<()> {
        let mut states = self.states.write();
        for state in states.iter_mut() {
            state.current = state.id == state_id;
        }
        Ok(())
    }

    async fn get_initial_state_id(&self) -> Result<Option<String>> {
        Ok(self
            .states
            .read()
            .iter()
            .find(|s| s.initial)
            .map(|s| s.id.clone()))
    }

    async fn get_unexplored_state_id(&self) -> Result<Option<String>> {
        Ok(self
            .states
            .read()
            .iter()
            .filter(|s| !s.explored && !s.collapsed)
            .min_by_key(|s| s.created_at)
            .map(|s| s.id.clone()))
    }

    async fn get_non_fuzzed_state_id(&self) -> Result<Option<String>> {
        Ok(self
            .states
            .read()
            .iter()
            .filter(|s| !s.fuzzed && !s.collapsed)
            .min_by_key(|s| s.created_at)
            .map(|s| s.id.clone()))
    }

    async fn states_matching(
        &self,
        explored: Option<bool>,
        collapsed: Option<bool>,
    ) -> Result<Vec<State>> {
        let mut matching: Vec<State> = self
            .states
            .read()
            .iter()
            .filter(|s| explored.map_or(true, |e| s.explored == e))
            .filter(|s| collapsed.map_or(true, |c| s.collapsed == c))
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.created_at);
        Ok(matching)
    }

    async fn set_state_revisits(&self, state_id: &str, revisits: u32) -> Result<()> {
        let mut states = self.states.write();
        if let Some(state) = states.iter_mut().find(|s| s.id == state_id) {
            state.revisits = revisits;
        }
        Ok(())
    }

    async fn mark_state_for_revisit(&self, state_id: &str) -> Result<()> {
        {
            let mut endpoints = self.endpoints.write();
            for endpoint in endpoints.iter_mut().filter(|e| e.state_id == state_id) {
                endpoint.visited = false;
            }
        }
        let mut states = self.states.write();
        if let Some(state) = states.iter_mut().find(|s| s.id == state_id) {
            state.explored = false;
        }
        Ok(())
    }

    async fn set_state_hash(&self, state_id: &str, hash: &str) -> Result<()> {
        let mut states = self.states.write();
        if let Some(state) = states.iter_mut().find(|s| s.id == state_id) {
            state.hash = hash.to_string();
        }
        Ok(())
    }

    async fn set_state_fuzzed(&self, state_id: &str) -> Result<()> {
        let mut states = self.states.write();
        if let Some(state) = states.iter_mut().find(|s| s.id == state_id) {
            state.fuzzed = true;
        }
        Ok(())
    }

    async fn update_states_explored_status(&self) -> Result<()> {
        let endpoints = self.endpoints.read();
        let mut states = self.states.write();
        for state in states.iter_mut().filter(|s| !s.collapsed) {
            let unexplored = endpoints
                .iter()
                .filter(|e| Self::selectable(e, &state.id))
                .count();
            state.explored = unexplored == 0;
        }
        Ok(())
    }

    async fn get_unexplored_endpoints_count(&self, state_id: &str) -> Result<u64> {
        Ok(self
            .endpoints
            .read()
            .iter()
            .filter(|e| Self::selectable(e, state_id))
            .count() as u64)
    }

    async fn get_reset_endpoint(&self) -> Result<Option<Endpoint>> {
        Ok(self.endpoints.read().iter().find(|e| e.is_reset).cloned())
    }

    async fn next_unvisited_endpoint(&self, state_id: &str) -> Result<Option<Endpoint>> {
        let mut endpoints = self.endpoints.write();
        if let Some(endpoint) = endpoints
            .iter_mut()
            .find(|e| Self::selectable(e, state_id))
        {
            endpoint.visited = true;
            return Ok(Some(endpoint.clone()));
        }
        Ok(None)
    }

    async fn get_similar_endpoints(&self, endpoint: &Endpoint) -> Result<Vec<Endpoint>> {
        Ok(self
            .endpoints
            .read()
            .iter()
            .filter(|e| {
                e.scheme == endpoint.scheme
                    && e.host == endpoint.host
                    && e.method == endpoint.method
                    && e.path == endpoint.path
                    && e.state_id == endpoint.state_id
                    && e.found_at == endpoint.found_at
            })
            .cloned()
            .collect())
    }

    async fn get_similar_interactions(
        &self,
        endpoint: &Endpoint,
        state_id: &str,
        processed: Option<bool>,
        fuzzed: Option<bool>,
    ) -> Result<Vec<Interaction>> {
        Ok(self
            .interactions
            .read()
            .iter()
            .filter(|i| {
                let e = &i.request.endpoint;
                e.scheme == endpoint.scheme
                    && e.host == endpoint.host
                    && e.method == endpoint.method
                    && e.path == endpoint.path
                    && i.state_id == state_id
            })
            .filter(|i| processed.map_or(true, |p| i.clustering_processed == p))
            .filter(|i| fuzzed.map_or(true, |f| i.made_by_fuzzer == f))
            .cloned()
            .collect())
    }

    async fn unprocessed_interactions(&self) -> Result<Vec<Interaction>> {
        Ok(self
            .interactions
            .read()
            .iter()
            .filter(|i| !i.endpoints_processed)
            .cloned()
            .collect())
    }

    async fn unclustered_endpoints(&self) -> Result<Vec<Endpoint>> {
        Ok(self
            .endpoints
            .read()
            .iter()
            .filter(|e| !e.clustering_processed)
            .cloned()
            .collect())
    }

    async fn unclustered_interactions(
        &self,
        state_id: &str,
        made_by_fuzzer: bool,
    ) -> Result<Vec<Interaction>> {
        Ok(self
            .interactions
            .read()
            .iter()
            .filter(|i| {
                i.state_id == state_id
                    && !i.clustering_processed
                    && i.made_by_fuzzer == made_by_fuzzer
            })
            .cloned()
            .collect())
    }

    async fn interactions_for_state(
        &self,
        state_id: &str,
        include_fuzzer: bool,
    ) -> Result<Vec<Interaction>> {
        Ok(self
            .interactions
            .read()
            .iter()
            .filter(|i| i.state_id == state_id && (include_fuzzer || !i.made_by_fuzzer))
            .cloned()
            .collect())
    }

    async fn set_endpoint_clean(&self, id: &str, clean: bool) -> Result<()> {
        let mut endpoints = self.endpoints.write();
        if let Some(endpoint) = endpoints.iter_mut().find(|e| e.id == id) {
            endpoint.clean = clean;
        }
        Ok(())
    }

    async fn set_endpoint_clustering_processed(&self, id: &str) -> Result<()> {
        let mut endpoints = self.endpoints.write();
        if let Some(endpoint) = endpoints.iter_mut().find(|e| e.id == id) {
            endpoint.clustering_processed = true;
        }
        Ok(())
    }

    async fn set_interaction_endpoints_processed(&self, id: &str) -> Result<()> {
        let mut interactions = self.interactions.write();
        if let Some(interaction) = interactions.iter_mut().find(|i| i.id == id) {
            interaction.endpoints_processed = true;
        }
        Ok(())
    }

    async fn set_interaction_clustering_processed(&self, id: &str) -> Result<()> {
        let mut interactions = self.interactions.write();
        if let Some(interaction) = interactions.iter_mut().find(|i| i.id == id) {
            interaction.clustering_processed = true;
        }
        Ok(())
    }

    async fn delete_endpoint(&self, id: &str) -> Result<()> {
        self.endpoints.write().retain(|e| e.id != id);
        Ok(())
    }

    async fn mark_all_interactions_for_reclustering(&self) -> Result<()> {
        let mut interactions = self.interactions.write();
        for interaction in interactions.iter_mut() {
            interaction.clustering_processed = false;
        }
        Ok(())
    }

    async fn reparent_endpoints(
        &self,
        after_ts: i64,
        from_state: &str,
        to_state: &str,
    ) -> Result<u64> {
        let mut endpoints = self.endpoints.write();
        let mut moved = 0;
        for endpoint in endpoints
            .iter_mut()
            .filter(|e| e.state_id == from_state && e.created_at > after_ts)
        {
            endpoint.state_id = to_state.to_string();
            endpoint.allow_visit = true;
            endpoint.clustering_processed = false;
            moved += 1;
        }
        Ok(moved)
    }

    async fn reparent_interactions(
        &self,
        after_ts: i64,
        from_state: &str,
        to_state: &str,
    ) -> Result<u64> {
        let mut interactions = self.interactions.write();
        let mut moved = 0;
        for interaction in interactions
            .iter_mut()
            .filter(|i| i.state_id == from_state && i.created_at > after_ts)
        {
            interaction.state_id = to_state.to_string();
            moved += 1;
        }
        Ok(moved)
    }

    async fn mark_states_collapsed_recursively(&self, state_id: &str) -> Result<()> {
        let mut states = self.states.write();
        let doomed = Self::descendant_ids(&states, state_id);
        for state in states.iter_mut() {
            if doomed.contains(&state.id) {
                state.collapsed = true;
            }
        }
        Ok(())
    }

    async fn delete_states_recursively(&self, state_id: &str) -> Result<()> {
        let doomed = {
            let states = self.states.read();
            Self::descendant_ids(&states, state_id)
        };
        self.interactions
            .write()
            .retain(|i| !doomed.contains(&i.state_id));
        self.endpoints
            .write()
            .retain(|e| !doomed.contains(&e.state_id));
        self.states.write().retain(|s| !doomed.contains(&s.id));
        Ok(())
    }

    async fn extend_state_reachability(
        &self,
        state_id: &str,
        edges: Vec<StateReachability>,
    ) -> Result<()> {
        let mut states = self.states.write();
        if let Some(state) = states.iter_mut().find(|s| s.id == state_id) {
            state.reachable_from.extend(edges);
        }
        Ok(())
    }

    async fn get_endpoint_cluster_count(&self, key: &PeerGroupKey) -> Result<Option<u64>> {
        Ok(self.endpoint_clusters.get(key).map(|entry| *entry))
    }

    async fn put_endpoint_cluster_count(&self, key: &PeerGroupKey, count: u64) -> Result<()> {
        self.endpoint_clusters.insert(key.clone(), count);
        Ok(())
    }

    async fn get_interaction_cluster_count(&self, key: &PeerGroupKey) -> Result<Option<u64>> {
        Ok(self.interaction_clusters.get(key).map(|entry| *entry))
    }

    async fn put_interaction_cluster_count(&self, key: &PeerGroupKey, count: u64) -> Result<()> {
        self.interaction_clusters.insert(key.clone(), count);
        Ok(())
    }

    async fn count_endpoints_available(&self) -> Result<u64> {
        Ok(self
            .endpoints
            .read()
            .iter()
            .filter(|e| e.clean && e.allow_visit)
            .count() as u64)
    }

    async fn count_endpoints_visited(&self) -> Result<u64> {
        Ok(self.endpoints.read().iter().filter(|e| e.visited).count() as u64)
    }

    async fn count_interactions(&self) -> Result<u64> {
        Ok(self.interactions.read().len() as u64)
    }

    async fn record_experiment(&self, doc: serde_json::Value) -> Result<()> {
        self.experiments.write().push(doc);
        Ok(())
    }
}

/// Factory handing out a fresh [`MemoryStore`] per batch.
#[derive(Default)]
pub struct MemoryStoreFactory;

#[async_trait]
impl StoreFactory for MemoryStoreFactory {
    async fn open(&self, _batch: &str) -> Result<Arc<dyn Store>> {
        Ok(Arc::new(MemoryStore::new()))
    }
}
