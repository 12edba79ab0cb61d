//! # statecrawl
//!
//! A state-aware web-application crawler. Instead of treating the target as
//! a flat set of URLs, statecrawl infers the application's latent state
//! machine from the outside: every interaction is fingerprinted with a
//! locality-sensitive hash, fingerprints are clustered per peer group, and a
//! new cluster is read as empirical evidence of a new application state.
//! Navigation then replays the state-changing request chain so that
//! endpoints visible only after a login or a transaction get crawled too.
//!
//! ## Pipeline
//!
//! - [`crawl::Crawler`] takes one step: navigate to the next target state,
//!   visit one endpoint, record the interaction.
//! - [`extract::EndpointExtractor`] parses recorded responses into candidate
//!   endpoints.
//! - [`detect::EndpointDetector`] keeps only endpoints that add a new
//!   cluster to their peer group.
//! - [`detect::StateChangeDetector`] turns new interaction clusters into new
//!   states and re-parents everything recorded after the transition.
//! - [`detect::StateDetector`] re-hashes states from their interaction
//!   content and collapses indistinguishable ones.
//! - [`work::WorkManager`] schedules all of the above sequentially (the
//!   normative mode) or in parallel tasks or named queues.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use statecrawl::config::Config;
//! use statecrawl::scan::start_scan;
//! use statecrawl::store::{MemoryStore, Store};
//!
//! # async fn example() -> statecrawl::Result<()> {
//! let config = Config::from_yaml("random_seed: 42")?;
//! let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
//! let handle = start_scan(config, store, "http://target.local:8080").await?;
//! handle.wait().await?;
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod config;
pub mod crawl;
pub mod detect;
pub mod distance;
pub mod error;
pub mod extract;
pub mod hashing;
pub mod model;
pub mod scan;
pub mod store;
pub mod work;

pub use error::{Error, Result};
