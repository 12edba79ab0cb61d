//! Detection pipeline
//!
//! Three monotone processors over `{processed: false}` records:
//! the endpoint detector decides which extracted endpoints are worth
//! visiting, the state-change detector decides which interactions moved the
//! app into a new latent state, and the state detector merges states that
//! turned out to be the same one.

mod collapse;
mod endpoint;
mod state_change;

pub use collapse::StateDetector;
pub use endpoint::EndpointDetector;
pub use state_change::StateChangeDetector;

use serde::Serialize;

use crate::config::FieldSelector;
use crate::error::Result;

/// Project the configured distance field out of each record.
pub(crate) fn project_field<T: Serialize>(
    records: &[T],
    field: &FieldSelector,
) -> Result<Vec<String>> {
    records
        .iter()
        .map(|record| {
            let doc = serde_json::to_value(record)?;
            field.project(&doc)
        })
        .collect()
}
