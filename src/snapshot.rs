//! Per-site snapshot assembly.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::config::LeaseConfig;
use crate::docs::types::LeaseRecord;
use crate::docs::ExtractionStore;
use crate::error::Result;

/// Everything known about one site under one field configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteSnapshot {
    pub site_id: String,
    pub lease_config_hash: String,
    /// Filled by a separate pipeline; always present, possibly empty.
    pub leases_from_structured_data: Vec<Value>,
    pub leases_from_unstructured_data: Vec<LeaseRecord>,
}

impl SiteSnapshot {
    pub fn empty(site_id: &str, lease_config_hash: &str) -> Self {
        Self {
            site_id: site_id.to_string(),
            lease_config_hash: lease_config_hash.to_string(),
            leases_from_structured_data: Vec::new(),
            leases_from_unstructured_data: Vec::new(),
        }
    }
}

pub struct SnapshotBuilder {
    store: Arc<dyn ExtractionStore>,
    config: Arc<LeaseConfig>,
}

impl SnapshotBuilder {
    pub fn new(store: Arc<dyn ExtractionStore>, config: Arc<LeaseConfig>) -> Self {
        Self { store, config }
    }

    /// Assemble the snapshot for `site_id`.
    ///
    /// A configuration without lease-agreement rows requests no unstructured
    /// data, so the store is not consulted at all.
    pub async fn build(&self, site_id: &str) -> Result<SiteSnapshot> {
        let mut snapshot = SiteSnapshot::empty(site_id, &self.config.lease_config_hash);

        if self.config.lease_agreement_rows().next().is_none() {
            debug!(
                site_id,
                config = %self.config.config_id(),
                "No lease agreement rows configured"
            );
            return Ok(snapshot);
        }

        snapshot.leases_from_unstructured_data = self
            .store
            .get_all_extracted_fields_from_site_doc(site_id, &self.config)
            .await?;

        info!(
            site_id,
            leases = snapshot.leases_from_unstructured_data.len(),
            "Site snapshot built"
        );
        Ok(snapshot)
    }
}
