//! Crawling: navigation, request execution and the step loop
//!
//! The navigator decides which state to explore next and how to get there;
//! the interaction handler owns the shared HTTP session and persists what it
//! observes; the crawler ties the two into a single "take a step" loop.

mod crawler;
mod handler;
mod navigator;

pub use crawler::{Crawler, StepOutcome};
pub use handler::InteractionHandler;
pub use navigator::{NavigationTarget, StateNavigator};
