//! State collapsing
//!
//! Independent exploration paths can land in the same application state
//! under different ids. Phase A gives every explored state a content hash
//! derived from its distinct interaction fingerprints; phase B clusters the
//! live states by that hash and merges each group into its earliest member,
//! recording where the collapsed duplicates had been reachable from.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use super::project_field;
use crate::cluster::{self, ClusteringOptions};
use crate::config::{FieldSelector, StateDetectorConfig};
use crate::error::{Error, Result};
use crate::hashing::{self, HashContext};
use crate::model::StateReachability;
use crate::store::Store;

/// Recomputes state hashes and collapses indistinguishable states.
pub struct StateDetector {
    store: Arc<dyn Store>,
    ctx: Arc<HashContext>,
    field: FieldSelector,
    clustering: ClusteringOptions,
    delete_collapsed: bool,
}

impl StateDetector {
    /// Build the detector from its config section.
    pub fn new(
        store: Arc<dyn Store>,
        ctx: Arc<HashContext>,
        config: &StateDetectorConfig,
    ) -> Self {
        Self {
            store,
            ctx,
            field: config.field_for_distance.clone(),
            clustering: ClusteringOptions::new(config.distance_type, config.eps_selection),
            delete_collapsed: config.delete_collapsed,
        }
    }

    /// Run both phases.
    pub async fn detect(&self) -> Result<()> {
        self.recalculate_state_hashes().await?;
        self.collapse_identical_states().await
    }

    /// Phase A: hash each explored state from the distinct fingerprints of
    /// its non-fuzzer interactions.
    async fn recalculate_state_hashes(&self) -> Result<()> {
        for state in self.store.states_matching(Some(true), None).await? {
            let interactions = self.store.interactions_for_state(&state.id, false).await?;

            let mut seen = HashSet::new();
            let mut combined = String::new();
            for interaction in &interactions {
                if seen.insert(interaction.hash.clone()) {
                    combined.push_str(&interaction.hash);
                }
            }

            // A state without interaction data keeps a throwaway hash;
            // under-explored states must never compare as equal.
            let hash = if combined.is_empty() {
                hashing::random_state_hash()
            } else {
                let hashed = self.ctx.hash(&combined);
                if hashed == hashing::TNULL {
                    hashing::random_state_hash()
                } else {
                    hashed
                }
            };
            self.store.set_state_hash(&state.id, &hash).await?;
        }
        Ok(())
    }

    /// Phase B: repeatedly cluster the live explored states and merge any
    /// group around its earliest member. Each merge removes at least one
    /// state from the live set, so the loop is bounded by the state count.
    async fn collapse_identical_states(&self) -> Result<()> {
        let mut checked: HashSet<String> = HashSet::new();

        loop {
            let states = self.store.states_matching(Some(true), Some(false)).await?;
            let Some(position) = states.iter().position(|s| !checked.contains(&s.id)) else {
                break;
            };
            checked.insert(states[position].id.clone());

            let values = project_field(&states, &self.field)?;
            let (_count, labels) = cluster::cluster_values(&values, &self.clustering)?;
            let label = labels[position];
            if label < 0 {
                continue;
            }

            let members: Vec<_> = states
                .iter()
                .zip(labels.iter())
                .filter(|(_, l)| **l == label)
                .map(|(s, _)| s)
                .collect();
            if members.len() < 2 {
                continue;
            }

            let earliest = members
                .iter()
                .min_by_key(|s| s.created_at)
                .ok_or_else(|| Error::invariant("cluster with no members"))?;
            debug!(state_id = %earliest.id, duplicates = members.len() - 1, "collapsing cluster");

            // The crawler was in fact already in the earliest state.
            self.store.update_current_state(&earliest.id).await?;

            let mut edges = Vec::new();
            for member in members.iter().filter(|s| s.id != earliest.id) {
                edges.push(StateReachability {
                    from_state_id: member.previous_state_id.clone(),
                    caused_by_interaction_id: member.caused_by_interaction_id.clone(),
                });
                if self.delete_collapsed {
                    self.store.delete_states_recursively(&member.id).await?;
                } else {
                    self.store
                        .mark_states_collapsed_recursively(&member.id)
                        .await?;
                }
                info!(state_id = %member.id, into = %earliest.id, "collapsed state");
            }
            self.store
                .extend_state_reachability(&earliest.id, edges)
                .await?;
        }
        Ok(())
    }
}
