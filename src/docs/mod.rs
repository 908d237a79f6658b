pub mod types;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::config::LeaseConfig;
use crate::error::{Error, Result};
use types::{ExtractedSiteCollection, FieldNode, LeaseFields, LeaseRecord};

/// Document id of a site's extraction result: `<SITE_ID>-<lease_config_hash>`.
pub fn site_document_id(site_id: &str, lease_config_hash: &str) -> String {
    format!("{}-{}", site_id.to_uppercase(), lease_config_hash)
}

/// Source of extracted lease fields.
#[async_trait]
pub trait ExtractionStore: Send + Sync {
    /// Every lease extracted for the site under `config`, in stored order.
    ///
    /// Fails with [`Error::SiteDataNotFound`] when the site was never ingested
    /// under this configuration.
    async fn get_all_extracted_fields_from_site_doc(
        &self,
        site_id: &str,
        config: &LeaseConfig,
    ) -> Result<Vec<LeaseRecord>>;
}

/// Convert a stored site document into validated lease records.
///
/// A lease id seen twice keeps its first occurrence.
pub fn lease_records(collection: ExtractedSiteCollection) -> Result<Vec<LeaseRecord>> {
    let mut seen = HashSet::new();
    let mut records = Vec::new();

    for lease in collection.information.leases {
        if let Some(lease_id) = &lease.lease_id {
            if !seen.insert(lease_id.clone()) {
                error!(
                    site_id = %collection.site_id,
                    lease_id = %lease_id,
                    "Lease has already been processed - skipping"
                );
                continue;
            }
        }

        let mut fields = LeaseFields::new();
        for (name, values) in lease.fields {
            let nodes = values
                .into_iter()
                .map(FieldNode::try_from)
                .collect::<Result<Vec<_>>>()
                .map_err(|e| Error::InvalidField(format!("{}: {}", name, e)))?;
            fields.insert(name, nodes);
        }
        records.push(LeaseRecord {
            lease_id: lease.lease_id,
            fields,
        });
    }

    Ok(records)
}

/// Reads site documents from `<dir>/<SITE_ID>-<lease_config_hash>.json`.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::Store(format!(
                "extraction store directory not found: {}",
                dir.display()
            )));
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }
}

#[async_trait]
impl ExtractionStore for JsonFileStore {
    async fn get_all_extracted_fields_from_site_doc(
        &self,
        site_id: &str,
        config: &LeaseConfig,
    ) -> Result<Vec<LeaseRecord>> {
        let document_id = site_document_id(site_id, &config.lease_config_hash);
        let path = self.dir.join(format!("{}.json", document_id));
        info!(
            site_id,
            lease_config_hash = %config.lease_config_hash,
            "Reading extracted site document"
        );

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::SiteDataNotFound {
                    site_id: site_id.to_string(),
                    lease_config_hash: config.lease_config_hash.clone(),
                });
            }
            Err(e) => return Err(Error::Store(format!("{}: {}", path.display(), e))),
        };

        let collection: ExtractedSiteCollection = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Store(format!("{}: {}", path.display(), e)))?;
        let records = lease_records(collection)?;
        debug!(document_id = %document_id, leases = records.len(), "Site document loaded");
        Ok(records)
    }
}

/// In-memory store keyed by (site id, lease config hash).
#[derive(Default)]
pub struct MemoryStore {
    sites: HashMap<(String, String), Vec<LeaseRecord>>,
    fetches: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, site_id: &str, lease_config_hash: &str, leases: Vec<LeaseRecord>) {
        self.sites.insert(
            (site_id.to_uppercase(), lease_config_hash.to_string()),
            leases,
        );
    }

    /// Number of reads served so far, including failed ones.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtractionStore for MemoryStore {
    async fn get_all_extracted_fields_from_site_doc(
        &self,
        site_id: &str,
        config: &LeaseConfig,
    ) -> Result<Vec<LeaseRecord>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let key = (site_id.to_uppercase(), config.lease_config_hash.clone());
        self.sites
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::SiteDataNotFound {
                site_id: site_id.to_string(),
                lease_config_hash: config.lease_config_hash.clone(),
            })
    }
}
