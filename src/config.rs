//! Configuration: field-collection configs and runtime settings.
//!
//! A [`LeaseConfig`] describes which fields are collected from which kind of
//! source document, plus the system prompt used to answer questions. Its
//! `lease_config_hash` fingerprints the field layout so that cached snapshots
//! built under one layout are never served under another.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const DEFAULT_CACHE_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_CACHE_CAPACITY: usize = 100;
pub const DEFAULT_MAX_TOOL_ROUNDS: u32 = 5;
pub const DEFAULT_USER_MESSAGE_LIMIT: usize = 20;

/// Kind of source a collection row extracts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    LeaseAgreement,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldMappingType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    Datetime,
    Time,
    Object,
    Array,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldMappingMethod {
    #[default]
    Extract,
    Generate,
}

/// Schema of one collected field. Array fields list their item schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldMappingType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub method: FieldMappingMethod,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<FieldSchema>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub classifier_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRow {
    pub data_type: DataType,
    #[serde(default)]
    pub analyzer_id: String,
    #[serde(default)]
    pub field_schema: Vec<FieldSchema>,
    #[serde(default)]
    pub classifier: Option<ClassifierConfig>,
}

/// A field-collection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(rename = "_id", default)]
    pub id: String,
    pub name: String,
    pub version: String,
    pub prompt: String,
    #[serde(default)]
    pub lease_config_hash: String,
    #[serde(default)]
    pub collection_rows: Vec<CollectionRow>,
}

impl LeaseConfig {
    /// Load a config from a JSON file, filling in its fingerprint if absent.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config: LeaseConfig = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.ensure_hash()?;
        Ok(config)
    }

    pub fn config_id(&self) -> String {
        config_id(&self.name, &self.version)
    }

    /// Rows that collect from lease agreements.
    pub fn lease_agreement_rows(&self) -> impl Iterator<Item = &CollectionRow> {
        self.collection_rows
            .iter()
            .filter(|row| row.data_type == DataType::LeaseAgreement)
    }

    pub fn ensure_hash(&mut self) -> Result<()> {
        if self.lease_config_hash.is_empty() {
            self.lease_config_hash = compute_lease_config_hash(&self.collection_rows)?;
            debug!(
                config = %self.config_id(),
                hash = %self.lease_config_hash,
                "Computed lease config hash"
            );
        }
        Ok(())
    }
}

pub fn config_id(name: &str, version: &str) -> String {
    format!("{}-{}", name, version)
}

/// Fingerprint the lease-agreement field layout.
///
/// Field schemas are sorted by name and rows by classifier id, so reordering
/// either leaves the hash unchanged. Prompt, name and version do not count.
pub fn compute_lease_config_hash(rows: &[CollectionRow]) -> Result<String> {
    let mut canonical: Vec<(String, serde_json::Value)> = rows
        .iter()
        .filter(|row| row.data_type == DataType::LeaseAgreement)
        .map(|row| {
            let mut schema = row.field_schema.clone();
            schema.sort_by(|a, b| a.name.cmp(&b.name));
            let classifier_id = row
                .classifier
                .as_ref()
                .map(|c| c.classifier_id.clone())
                .unwrap_or_default();
            let value = json!({
                "field_schema": schema,
                "classifier": row.classifier,
            });
            (classifier_id, value)
        })
        .collect();
    canonical.sort_by(|a, b| a.0.cmp(&b.0));

    let rows: Vec<serde_json::Value> = canonical.into_iter().map(|(_, v)| v).collect();
    let bytes = serde_json::to_vec(&rows)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Loads configs stored as `<dir>/<name>-<version>.json`.
pub struct ConfigStore {
    dir: PathBuf,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns `None` when no config with that id exists.
    pub async fn load_config(&self, config_id: &str) -> Result<Option<LeaseConfig>> {
        let path = self.dir.join(format!("{}.json", config_id));
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let config = tokio::task::spawn_blocking(move || LeaseConfig::from_file(&path))
            .await
            .map_err(|e| Error::Other(format!("config loader panicked: {}", e)))??;
        Ok(Some(config))
    }
}

/// Runtime knobs, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub max_tool_rounds: u32,
    pub user_message_limit: usize,
    /// Hide earlier tool calls and results when replaying history.
    pub remove_tool_calls: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            user_message_limit: DEFAULT_USER_MESSAGE_LIMIT,
            remove_tool_calls: false,
        }
    }
}

impl RuntimeSettings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            cache_ttl: Duration::from_secs(env_or(
                "SNAPSHOT_CACHE_TTL_SECS",
                DEFAULT_CACHE_TTL_SECS,
            )),
            cache_capacity: env_or("SNAPSHOT_CACHE_CAPACITY", defaults.cache_capacity).max(1),
            max_tool_rounds: env_or("MAX_TOOL_ROUNDS", defaults.max_tool_rounds).max(1),
            user_message_limit: env_or("USER_MESSAGE_LIMIT", defaults.user_message_limit),
            remove_tool_calls: env_or("REMOVE_TOOL_CALLS", defaults.remove_tool_calls),
        }
    }
}

fn env_or<T: std::str::FromStr + std::fmt::Display>(key: &str, default: T) -> T {
    match dotenv::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Invalid setting, using default {}", default);
            default
        }),
        Err(_) => default,
    }
}
