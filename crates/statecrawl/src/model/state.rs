//! Latent application states
//!
//! States are inferred, not observed: a state exists because some interaction
//! opened a new cluster among its peers. The `previous_state_id` links form a
//! forest rooted at the single initial state; collapsing adds cross edges in
//! `reachable_from` without ever introducing cycles.

use serde::{Deserialize, Serialize};

use super::{now_ms, NO_INTERACTION, NO_PREVIOUS_STATE};
use crate::hashing;

/// A cross edge recorded when an equivalent state is collapsed into this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateReachability {
    /// State the collapsed duplicate was reached from
    pub from_state_id: String,
    /// Interaction that caused the transition
    pub caused_by_interaction_id: String,
}

/// A latent application state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    /// Store-assigned id; empty until persisted
    #[serde(default)]
    pub id: String,
    /// Parent state in the exploration forest
    pub previous_state_id: String,
    /// Interaction that transitioned the app into this state
    pub caused_by_interaction_id: String,
    /// How many times the fully-visited state has been re-walked
    #[serde(default)]
    pub revisits: u32,
    /// Cross edges from collapsed duplicates
    #[serde(default)]
    pub reachable_from: Vec<StateReachability>,
    /// The crawler is currently in this state (exactly one per batch)
    #[serde(default)]
    pub current: bool,
    /// No selectable endpoints remain
    #[serde(default)]
    pub explored: bool,
    /// Merged into an earlier equivalent state; inert from then on
    #[serde(default)]
    pub collapsed: bool,
    /// An external fuzzer has finished with this state
    #[serde(default)]
    pub fuzzed: bool,
    /// The root state seeded at startup (exactly one per batch)
    #[serde(default)]
    pub initial: bool,
    /// Content hash, recomputed by the collapser from interaction data
    pub hash: String,
    /// Creation time, ms since epoch
    pub created_at: i64,
}

impl State {
    /// A state discovered via a state-changing interaction.
    ///
    /// Starts with a random hash: until the collapser has real interaction
    /// data, two under-explored states must never compare as equal.
    pub fn new(
        previous_state_id: impl Into<String>,
        caused_by_interaction_id: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            previous_state_id: previous_state_id.into(),
            caused_by_interaction_id: caused_by_interaction_id.into(),
            revisits: 0,
            reachable_from: Vec::new(),
            current: false,
            explored: false,
            collapsed: false,
            fuzzed: false,
            initial: false,
            hash: hashing::random_state_hash(),
            created_at: now_ms(),
        }
    }

    /// The root state seeded at startup: initial and current.
    pub fn initial() -> Self {
        let mut state = Self::new(NO_PREVIOUS_STATE, NO_INTERACTION);
        state.initial = true;
        state.current = true;
        state
    }
}
