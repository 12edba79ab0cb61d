//! State navigation
//!
//! Picks the next state worth exploring and reconstructs the request
//! sequence that puts the target app into it: the reset request first, then
//! the chain of state-changing requests from the root down to the target.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::NavigatorConfig;
use crate::error::{Error, Result};
use crate::model::{Endpoint, Request};
use crate::store::Store;

/// Outcome of a navigation decision.
#[derive(Debug)]
pub enum NavigationTarget {
    /// Requests to execute, in LIFO order: pop from the back.
    Stack(Vec<Request>),
    /// Every live state is explored and fuzzed; the run is complete.
    Converged,
}

/// Chooses the next state and builds the navigation stack to it.
pub struct StateNavigator {
    store: Arc<dyn Store>,
    reset_endpoint: Endpoint,
    max_revisits: u32,
}

impl std::fmt::Debug for StateNavigator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateNavigator")
            .field("reset_endpoint", &self.reset_endpoint)
            .field("max_revisits", &self.max_revisits)
            .finish()
    }
}

impl StateNavigator {
    /// Build a navigator.
    ///
    /// Fails when the batch has no endpoint flagged `is_reset`: without a
    /// reset the app cannot be driven back to a known state, which makes
    /// every navigation stack meaningless.
    pub async fn new(store: Arc<dyn Store>, config: &NavigatorConfig) -> Result<Self> {
        let reset_endpoint = store.get_reset_endpoint().await?.ok_or_else(|| {
            Error::config(
                "no endpoint flagged is_reset in the store; \
                 one is required to reset the app between navigations",
            )
        })?;
        Ok(Self {
            store,
            reset_endpoint,
            max_revisits: config.max_revisits,
        })
    }

    /// Decide the next target state, update `current` in the store, and
    /// return the LIFO request stack that navigates there.
    pub async fn next_target(&self) -> Result<NavigationTarget> {
        self.store.update_states_explored_status().await?;

        let current = self
            .store
            .get_current_state()
            .await?
            .ok_or_else(|| Error::invariant("no state marked current"))?;
        let unexplored = self
            .store
            .get_unexplored_endpoints_count(&current.id)
            .await?;

        let next_id = if unexplored > 0 {
            current.id.clone()
        } else if current.revisits < self.max_revisits {
            debug!(state_id = %current.id, revisits = current.revisits, "revisiting state");
            self.store.mark_state_for_revisit(&current.id).await?;
            self.store
                .set_state_revisits(&current.id, current.revisits + 1)
                .await?;
            current.id.clone()
        } else if let Some(id) = self.store.get_unexplored_state_id().await? {
            info!(state_id = %id, "moving to unexplored state");
            id
        } else if let Some(id) = self.store.get_non_fuzzed_state_id().await? {
            info!(state_id = %id, "moving to non-fuzzed state");
            id
        } else {
            return Ok(NavigationTarget::Converged);
        };

        self.store.update_current_state(&next_id).await?;
        let stack = self.navigation_stack(&next_id).await?;
        Ok(NavigationTarget::Stack(stack))
    }

    /// The LIFO stack of requests that reaches a goal state: popping yields
    /// the reset request, then the state-changing chain root-first.
    async fn navigation_stack(&self, goal_state_id: &str) -> Result<Vec<Request>> {
        let mut stack = Vec::new();

        let goal = self
            .store
            .get_state(goal_state_id)
            .await?
            .ok_or_else(|| Error::invalid_record(format!("unknown state '{goal_state_id}'")))?;

        if !goal.initial {
            let mut state = goal;
            loop {
                let interaction = self
                    .store
                    .get_interaction(&state.caused_by_interaction_id)
                    .await?
                    .ok_or_else(|| {
                        Error::invalid_record(format!(
                            "state '{}' references missing interaction '{}'",
                            state.id, state.caused_by_interaction_id
                        ))
                    })?;
                stack.push(interaction.request);

                let previous = self
                    .store
                    .get_state(&state.previous_state_id)
                    .await?
                    .ok_or_else(|| {
                        Error::invalid_record(format!(
                            "state '{}' references missing parent '{}'",
                            state.id, state.previous_state_id
                        ))
                    })?;
                if previous.initial {
                    break;
                }
                state = previous;
            }
        }

        stack.push(Request::new(self.reset_endpoint.clone()));
        Ok(stack)
    }
}
