use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use lease_qa::cache::SnapshotCache;
use lease_qa::config::{ConfigStore, RuntimeSettings};
use lease_qa::docs::JsonFileStore;
use lease_qa::history::HistoryStore;
use lease_qa::inference::InferenceEngine;
use lease_qa::llm::LlmClient;

/// Long-lived services shared by every query in the process.
pub struct AppState {
    pub engine: InferenceEngine,
    pub histories: HistoryStore,
}

impl AppState {
    pub fn new(config_dir: &Path, store_dir: &Path, session_dir: &Path) -> Result<Self> {
        let settings = RuntimeSettings::from_env();
        info!(
            max_tool_rounds = settings.max_tool_rounds,
            user_message_limit = settings.user_message_limit,
            "Runtime settings loaded"
        );

        let store = Arc::new(
            JsonFileStore::new(store_dir)
                .with_context(|| format!("Opening extraction store at {}", store_dir.display()))?,
        );
        info!("Extraction store initialized at {:?}", store_dir);

        let llm = Arc::new(LlmClient::from_env().context("Failed to create LLM client")?);
        info!(model = llm.model(), endpoint = %llm.endpoint(), "LLM client initialized");

        let cache = Arc::new(SnapshotCache::from_settings(&settings));
        info!(
            ttl_secs = settings.cache_ttl.as_secs(),
            capacity = settings.cache_capacity,
            "Snapshot cache initialized"
        );
        let histories = HistoryStore::new(session_dir, settings.user_message_limit)
            .remove_tool_calls(settings.remove_tool_calls);
        let engine = InferenceEngine::new(
            llm,
            store,
            cache,
            ConfigStore::new(config_dir),
            settings,
        );

        Ok(Self { engine, histories })
    }
}
