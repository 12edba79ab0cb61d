//! State-change detection
//!
//! The latent state is the cluster of local observations: when an
//! interaction opens a new cluster among the interactions of its peer group,
//! that is empirical evidence the app moved to a state nobody has seen
//! before. Everything recorded after the state-changing interaction belongs
//! to the successor state and is re-parented onto it.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::project_field;
use crate::cluster::{self, ClusteringOptions};
use crate::config::{FieldSelector, StateChangeDetectorConfig};
use crate::error::Result;
use crate::model::{Interaction, PeerGroupKey, State};
use crate::store::Store;

/// Default watermark when a peer group has never been clustered.
const DEFAULT_CLUSTER_COUNT: u64 = 1;

/// Detects state transitions from interaction clusters.
pub struct StateChangeDetector {
    store: Arc<dyn Store>,
    field: FieldSelector,
    clustering: ClusteringOptions,
    only_interactions_from_fuzzer: bool,
}

impl StateChangeDetector {
    /// Build the detector from its config section.
    pub fn new(store: Arc<dyn Store>, config: &StateChangeDetectorConfig) -> Self {
        Self {
            store,
            field: config.field_for_distance.clone(),
            clustering: ClusteringOptions::new(config.distance_type, config.eps_selection),
            only_interactions_from_fuzzer: config.only_interactions_from_fuzzer,
        }
    }

    /// Check every unprocessed interaction of every explored live state.
    pub async fn detect(&self) -> Result<()> {
        let states = self.store.states_matching(Some(true), Some(false)).await?;
        for state in states {
            let pending = self
                .store
                .unclustered_interactions(&state.id, self.only_interactions_from_fuzzer)
                .await?;
            if pending.is_empty() {
                debug!(state_id = %state.id, "no interactions match the search criterion");
                continue;
            }
            for interaction in pending {
                self.check_interaction(&state.id, &interaction).await?;
            }
        }
        Ok(())
    }

    async fn check_interaction(&self, state_id: &str, interaction: &Interaction) -> Result<()> {
        debug!(interaction_id = %interaction.id, "checking interaction");

        let mut peers = self
            .store
            .get_similar_interactions(&interaction.request.endpoint, state_id, None, None)
            .await?;
        peers.push(interaction.clone());

        let values = project_field(&peers, &self.field)?;
        let (cluster_count, _labels) = cluster::cluster_values(&values, &self.clustering)?;
        let cluster_count = cluster_count as u64;

        let key = PeerGroupKey::of_interaction(interaction);
        let previous = self
            .store
            .get_interaction_cluster_count(&key)
            .await?
            .unwrap_or(DEFAULT_CLUSTER_COUNT);

        debug!(
            interaction_id = %interaction.id,
            delta = cluster_count as i64 - previous as i64,
            "cluster delta"
        );

        if cluster_count > previous {
            self.add_new_state(state_id, interaction).await?;
            self.store
                .put_interaction_cluster_count(&key, cluster_count)
                .await?;
        }

        self.store
            .set_interaction_clustering_processed(&interaction.id)
            .await?;
        Ok(())
    }

    /// Create the successor state and re-parent the suffix of records that
    /// happened after the state-changing interaction.
    async fn add_new_state(&self, old_state_id: &str, interaction: &Interaction) -> Result<()> {
        // The collapser may have merged the old state away since we read it;
        // re-parenting into a collapsed lineage would resurrect dead records.
        let old_state = self.store.get_state(old_state_id).await?;
        match old_state {
            Some(state) if !state.collapsed => {}
            _ => {
                warn!(state_id = %old_state_id, "state vanished before re-parenting; skipping");
                return Ok(());
            }
        }

        let new_state = State::new(old_state_id, interaction.id.as_str());
        let new_state_id = self.store.add_state(new_state).await?;
        info!(state_id = %new_state_id, caused_by = %interaction.id, "new state detected");

        let moved_endpoints = self
            .store
            .reparent_endpoints(interaction.created_at, old_state_id, &new_state_id)
            .await?;
        let moved_interactions = self
            .store
            .reparent_interactions(interaction.created_at, old_state_id, &new_state_id)
            .await?;
        debug!(
            endpoints = moved_endpoints,
            interactions = moved_interactions,
            "re-parented records onto the new state"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{DistanceType, EpsSelection, InteractionHashMethod};
    use crate::hashing::HashContext;
    use crate::model::{Endpoint, Request, Response, USER_DEFINED};
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;

    fn ctx() -> HashContext {
        HashContext::new(42)
    }

    fn config() -> StateChangeDetectorConfig {
        StateChangeDetectorConfig {
            distance_type: DistanceType::Tlsh,
            field_for_distance: FieldSelector::default(),
            only_interactions_from_fuzzer: false,
            eps_selection: EpsSelection::Silhouette,
        }
    }

    fn login_interaction(state_id: &str, body: &str, created_at: i64) -> Interaction {
        let endpoint =
            Endpoint::builder("app.local", "/login", state_id, USER_DEFINED)
                .method("POST")
                .build(&ctx());
        let mut interaction = Interaction::new(
            Request::new(endpoint),
            Response {
                code: 200,
                data: body.to_string(),
                headers: BTreeMap::new(),
            },
            state_id,
            false,
            InteractionHashMethod::LinksOnly,
            &ctx(),
        );
        interaction.created_at = created_at;
        interaction
    }

    const GUEST_PAGE: &str = r#"<html><body><a href="/home">home</a>
        <a href="/about">about</a></body></html>"#;
    const USER_PAGE: &str = r#"<html><body><a href="/dashboard">dash</a>
        <a href="/profile">profile</a><a href="/logout">out</a>
        <form action="/post" method="post"><input name="text"/></form></body></html>"#;

    async fn explored_initial_state(store: &MemoryStore) -> String {
        let mut state = State::initial();
        state.explored = true;
        store.add_state(state).await.unwrap()
    }

    #[tokio::test]
    async fn test_same_response_shape_is_not_a_state_change() {
        let store = Arc::new(MemoryStore::new());
        let state_id = explored_initial_state(&store).await;

        for ts in [100, 200, 300] {
            store
                .add_interaction(login_interaction(&state_id, GUEST_PAGE, ts))
                .await
                .unwrap();
        }

        let detector =
            StateChangeDetector::new(Arc::clone(&store) as Arc<dyn Store>, &config());
        detector.detect().await.unwrap();

        let states = store.states_matching(None, None).await.unwrap();
        assert_eq!(states.len(), 1);
        // Every interaction got its processed flag regardless.
        assert!(store
            .unclustered_interactions(&state_id, false)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_new_cluster_creates_state_and_reparents_suffix() {
        let store = Arc::new(MemoryStore::new());
        let state_id = explored_initial_state(&store).await;
        let detector =
            StateChangeDetector::new(Arc::clone(&store) as Arc<dyn Store>, &config());

        // Two guest-shaped responses establish the baseline cluster.
        store
            .add_interaction(login_interaction(&state_id, GUEST_PAGE, 100))
            .await
            .unwrap();
        store
            .add_interaction(login_interaction(&state_id, GUEST_PAGE, 200))
            .await
            .unwrap();
        detector.detect().await.unwrap();
        assert_eq!(store.states_matching(None, None).await.unwrap().len(), 1);

        // A later login answers with a completely different link set.
        let changing_id = store
            .add_interaction(login_interaction(&state_id, USER_PAGE, 300))
            .await
            .unwrap();

        // Records that arrived after the state change.
        let mut late_endpoint =
            Endpoint::builder("app.local", "/dashboard", state_id.as_str(), changing_id.as_str())
                .build(&ctx());
        late_endpoint.created_at = 400;
        late_endpoint.allow_visit = false;
        store.add_endpoint(late_endpoint).await.unwrap();
        store
            .add_interaction(login_interaction(&state_id, USER_PAGE, 500))
            .await
            .unwrap();

        detector.detect().await.unwrap();

        let states = store.states_matching(None, None).await.unwrap();
        assert_eq!(states.len(), 2, "one new state expected");
        let new_state = states.iter().find(|s| !s.initial).unwrap();
        assert_eq!(new_state.previous_state_id, state_id);
        assert_eq!(new_state.caused_by_interaction_id, changing_id);

        // The late endpoint moved over and is visitable again.
        let moved = store
            .get_similar_endpoints(
                &Endpoint::builder("app.local", "/dashboard", new_state.id.as_str(), "x")
                    .build(&ctx()),
            )
            .await
            .unwrap();
        assert_eq!(moved.len(), 1);
        assert!(moved[0].allow_visit);
        assert!(!moved[0].clustering_processed);

        // The late interaction moved over; earlier ones stayed.
        let moved_interactions = store
            .interactions_for_state(&new_state.id, true)
            .await
            .unwrap();
        assert_eq!(moved_interactions.len(), 1);
        assert_eq!(moved_interactions[0].created_at, 500);
        assert_eq!(
            store
                .interactions_for_state(&state_id, true)
                .await
                .unwrap()
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn test_counts_preserved_across_reparenting() {
        let store = Arc::new(MemoryStore::new());
        let state_id = explored_initial_state(&store).await;

        store
            .add_interaction(login_interaction(&state_id, GUEST_PAGE, 100))
            .await
            .unwrap();
        store
            .add_interaction(login_interaction(&state_id, USER_PAGE, 200))
            .await
            .unwrap();
        store
            .add_interaction(login_interaction(&state_id, USER_PAGE, 300))
            .await
            .unwrap();
        let before = store.count_interactions().await.unwrap();

        let detector =
            StateChangeDetector::new(Arc::clone(&store) as Arc<dyn Store>, &config());
        detector.detect().await.unwrap();

        assert_eq!(store.count_interactions().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_fuzzer_filter_skips_crawler_interactions() {
        let store = Arc::new(MemoryStore::new());
        let state_id = explored_initial_state(&store).await;
        store
            .add_interaction(login_interaction(&state_id, GUEST_PAGE, 100))
            .await
            .unwrap();

        let mut fuzzer_config = config();
        fuzzer_config.only_interactions_from_fuzzer = true;
        let detector =
            StateChangeDetector::new(Arc::clone(&store) as Arc<dyn Store>, &fuzzer_config);
        detector.detect().await.unwrap();

        // The crawler-made interaction is out of scope for this detector.
        let untouched = store
            .unclustered_interactions(&state_id, false)
            .await
            .unwrap();
        assert_eq!(untouched.len(), 1);
    }

    #[tokio::test]
    async fn test_unexplored_states_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let state_id = store.add_state(State::initial()).await.unwrap();
        store
            .add_interaction(login_interaction(&state_id, GUEST_PAGE, 100))
            .await
            .unwrap();

        let detector =
            StateChangeDetector::new(Arc::clone(&store) as Arc<dyn Store>, &config());
        detector.detect().await.unwrap();

        assert_eq!(
            store
                .unclustered_interactions(&state_id, false)
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
