//! Endpoint detection: which extracted endpoints deserve a visit
//!
//! Extraction happily records the same link every time a page is fetched.
//! This detector walks endpoints with `clustering_processed == false` and
//! marks an endpoint `clean` only when it adds something new to its peer
//! group, either by being the first of its locator group (basic variant) or
//! by opening a new cluster against the group's stored watermark
//! (clustering variant).

use std::sync::Arc;

use tracing::{debug, info};

use super::project_field;
use crate::cluster::{self, ClusteringOptions};
use crate::config::{DetectorVariant, EndpointDetectorConfig, FieldSelector};
use crate::error::Result;
use crate::model::{Endpoint, PeerGroupKey};
use crate::store::Store;

/// Marks endpoints clean or dirty.
pub struct EndpointDetector {
    store: Arc<dyn Store>,
    variant: DetectorVariant,
    field: FieldSelector,
    clustering: ClusteringOptions,
    delete_dirty: bool,
}

impl EndpointDetector {
    /// Build the detector from its config section.
    pub fn new(store: Arc<dyn Store>, config: &EndpointDetectorConfig) -> Self {
        Self {
            store,
            variant: config.variant,
            field: config.field_for_distance.clone(),
            clustering: ClusteringOptions::new(config.distance_type, config.eps_selection),
            delete_dirty: config.delete_dirty,
        }
    }

    /// Process every endpoint not yet examined.
    pub async fn detect(&self) -> Result<()> {
        for endpoint in self.store.unclustered_endpoints().await? {
            match self.variant {
                DetectorVariant::Basic => self.detect_basic(&endpoint).await?,
                DetectorVariant::Clustering => self.detect_clustering(&endpoint).await?,
            }
        }
        Ok(())
    }

    /// Basic rule: clean iff the endpoint has no locator-group siblings.
    async fn detect_basic(&self, endpoint: &Endpoint) -> Result<()> {
        let similar = self.store.get_similar_endpoints(endpoint).await?;
        let siblings = similar.iter().filter(|e| e.id != endpoint.id).count();

        self.store
            .set_endpoint_clustering_processed(&endpoint.id)
            .await?;

        if siblings == 0 {
            self.store.set_endpoint_clean(&endpoint.id, true).await?;
        } else if self.delete_dirty {
            info!(endpoint_id = %endpoint.id, "deleting duplicate endpoint");
            self.store.delete_endpoint(&endpoint.id).await?;
        } else {
            debug!(endpoint_id = %endpoint.id, "endpoint marked dirty");
        }
        Ok(())
    }

    /// Clustering rule: clean iff the peer group's cluster count grew.
    async fn detect_clustering(&self, endpoint: &Endpoint) -> Result<()> {
        let similar = self.store.get_similar_endpoints(endpoint).await?;
        let values = project_field(&similar, &self.field)?;
        let (cluster_count, _labels) = cluster::cluster_values(&values, &self.clustering)?;
        let cluster_count = cluster_count as u64;

        let key = PeerGroupKey::of_endpoint(endpoint);
        let watermark = self.store.get_endpoint_cluster_count(&key).await?;

        self.store
            .set_endpoint_clustering_processed(&endpoint.id)
            .await?;

        let grew = match watermark {
            // First sighting of this peer group: it is clean by definition.
            // The watermark is floored at one so the next identical sighting
            // does not read as a new cluster.
            None => {
                self.store
                    .put_endpoint_cluster_count(&key, cluster_count.max(1))
                    .await?;
                true
            }
            Some(previous) if cluster_count > previous => {
                self.store
                    .put_endpoint_cluster_count(&key, cluster_count)
                    .await?;
                true
            }
            Some(_) => false,
        };

        if !grew && similar.len() as u64 > cluster_count {
            info!(endpoint_id = %endpoint.id, "endpoint marked dirty");
            if self.delete_dirty {
                self.store.delete_endpoint(&endpoint.id).await?;
                info!(endpoint_id = %endpoint.id, "endpoint deleted");
            }
        } else {
            self.store.set_endpoint_clean(&endpoint.id, true).await?;
        }
        Ok(())
    }
}
