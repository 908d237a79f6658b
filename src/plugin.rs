//! The query plugin: the model's one tool for reading site data.
//!
//! A plugin is bound to one lease configuration and shares the process-wide
//! snapshot cache. It remembers the last site it fetched so the structured
//! data for that site can be attached to the final answer.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheKey, SnapshotCache};
use crate::citations::{CitationMapper, CitationToken};
use crate::config::LeaseConfig;
use crate::docs::ExtractionStore;
use crate::error::{Error, Result};
use crate::llm::ToolDefinition;
use crate::prompts::GET_SITE_DATA_DESCRIPTION;
use crate::reconcile::ResolvedCitation;
use crate::snapshot::SnapshotBuilder;

pub const GET_SITE_DATA: &str = "get_site_data";

#[derive(Debug, Deserialize)]
struct GetSiteDataArgs {
    site_id: String,
}

#[derive(Debug, Default)]
struct SiteContext {
    /// Most recently fetched site.
    active: Option<String>,
    fetched: BTreeSet<String>,
}

pub struct SitePlugin {
    config: Arc<LeaseConfig>,
    builder: SnapshotBuilder,
    mapper: CitationMapper,
    cache: Arc<SnapshotCache>,
    context: RwLock<SiteContext>,
}

impl SitePlugin {
    pub fn new(
        config: Arc<LeaseConfig>,
        store: Arc<dyn ExtractionStore>,
        cache: Arc<SnapshotCache>,
    ) -> Self {
        Self {
            builder: SnapshotBuilder::new(store, config.clone()),
            config,
            mapper: CitationMapper::new(),
            cache,
            context: RwLock::new(SiteContext::default()),
        }
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Cache key for `site_id` under this plugin's configuration.
    pub fn composite_key(&self, site_id: &str) -> CacheKey {
        CacheKey::new(site_id, &self.config.lease_config_hash)
    }

    /// The site most recently fetched through this plugin.
    pub async fn active_site(&self) -> Option<String> {
        self.context.read().await.active.clone()
    }

    /// Rewritten, citation-tokenized snapshot text for `site_id`.
    ///
    /// Served from the cache when present; otherwise the snapshot is built,
    /// rewritten and stored. Fetch failures propagate and leave the site
    /// context untouched. Site ids that tokens cannot carry are rejected
    /// before the store is read.
    pub async fn fetch_site_data(&self, site_id: &str) -> Result<String> {
        CitationToken::check_site_id(site_id)?;
        info!(site_id, config = %self.config.config_id(), "Fetching site data");
        let entry = self.entry_for(site_id).await?;

        let mut context = self.context.write().await;
        context.active = Some(site_id.to_string());
        context.fetched.insert(site_id.to_string());
        Ok(entry.rewritten_document_text.clone())
    }

    async fn entry_for(&self, site_id: &str) -> Result<Arc<CacheEntry>> {
        self.cache
            .get_or_try_build(self.composite_key(site_id), || async {
                let snapshot = self.builder.build(site_id).await?;
                let (document, citation_mappings) = self.mapper.process(&snapshot);
                debug!(site_id, citations = citation_mappings.len(), "Snapshot rewritten");
                Ok::<_, Error>(CacheEntry {
                    rewritten_document_text: serde_json::to_string(&document)?,
                    citation_mappings,
                })
            })
            .await
    }

    /// Structured-data leases of the active site.
    pub async fn restore_structured_data(&self) -> Result<Vec<Value>> {
        let site_id = self.active_site().await.ok_or(Error::NoSiteContext)?;
        let entry = self.entry_for(&site_id).await?;
        let document: Value = serde_json::from_str(&entry.rewritten_document_text)?;
        Ok(document["leases_from_structured_data"]
            .as_array()
            .cloned()
            .unwrap_or_default())
    }

    /// Resolve one citation token to its provenance.
    ///
    /// Malformed tokens are an error. A well-formed token that matches nothing
    /// (unknown site, unknown alias) resolves to `None`. Tokens are looked up
    /// under the site id they carry, so a token only ever resolves against the
    /// table of the snapshot that minted it.
    pub async fn resolve_citation(&self, raw: &str) -> Result<Option<ResolvedCitation>> {
        let token = CitationToken::parse(raw)?;
        let key = self.composite_key(token.site_id());

        let cached = self.cache.get(&key).await;
        let fetched = self.context.read().await.fetched.contains(token.site_id());
        let entry = match cached {
            Some(entry) => entry,
            // evicted since it was fetched; rebuilding yields the same tokens
            None if fetched => self.entry_for(token.site_id()).await?,
            None => {
                debug!(token = %token, "Citation for a site never fetched");
                return Ok(None);
            }
        };

        let resolved = entry
            .citation_mappings
            .get(&token)
            .map(ResolvedCitation::from);
        if resolved.is_none() {
            debug!(token = %token, "Citation token not found");
        }
        Ok(resolved)
    }

    /// Resolve every citation entry the model produced, in order.
    ///
    /// Entries may be token strings or arrays of token strings. Anything that
    /// fails to resolve is logged and skipped.
    pub async fn restore_citations(&self, entries: &[Value]) -> Vec<ResolvedCitation> {
        let mut tokens = Vec::new();
        for entry in entries {
            match entry {
                Value::String(s) => tokens.push(s.as_str()),
                Value::Array(items) => {
                    for item in items {
                        match item.as_str() {
                            Some(s) => tokens.push(s),
                            None => warn!(entry = %item, "Skipping non-string citation"),
                        }
                    }
                }
                other => warn!(entry = %other, "Skipping non-string citation"),
            }
        }

        let results = join_all(tokens.iter().map(|token| self.resolve_citation(token))).await;
        let mut resolved = Vec::new();
        for (token, result) in tokens.into_iter().zip(results) {
            match result {
                Ok(Some(citation)) => resolved.push(citation),
                Ok(None) => {}
                Err(e) => warn!(token, error = %e, "Skipping citation"),
            }
        }
        resolved
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition::function(
            GET_SITE_DATA,
            GET_SITE_DATA_DESCRIPTION,
            json!({
                "type": "object",
                "properties": {
                    "site_id": {
                        "type": "string",
                        "description": "Identifier of the site to fetch"
                    }
                },
                "required": ["site_id"]
            }),
        )]
    }

    /// Dispatch a tool call by name with its JSON-encoded arguments.
    pub async fn call_tool(&self, name: &str, arguments: &str) -> Result<String> {
        match name {
            GET_SITE_DATA => {
                let args: GetSiteDataArgs = serde_json::from_str(arguments)?;
                self.fetch_site_data(&args.site_id).await
            }
            other => Err(Error::UnknownTool(other.to_string())),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{CollectionRow, DataType};
    use crate::docs::types::{FieldNode, FieldValue, LeaseRecord};
    use crate::docs::MemoryStore;
    use std::time::Duration;

    pub(crate) fn lease_config(hash: &str) -> Arc<LeaseConfig> {
        Arc::new(LeaseConfig {
            id: String::new(),
            name: "leases".to_string(),
            version: "v1".to_string(),
            prompt: "Answer questions about leases.".to_string(),
            lease_config_hash: hash.to_string(),
            collection_rows: vec![CollectionRow {
                data_type: DataType::LeaseAgreement,
                analyzer_id: "analyzer".to_string(),
                field_schema: vec![],
                classifier: None,
            }],
        })
    }

    pub(crate) fn rent_lease(document: &str, rent: f64) -> LeaseRecord {
        LeaseRecord {
            lease_id: Some("68313".to_string()),
            fields: [(
                "Current_Rent_Amount".to_string(),
                vec![FieldNode::leaf(
                    FieldValue::Number(rent),
                    Some(document),
                    Some("D(1,1,1,1,1,1,1,1)"),
                )],
            )]
            .into_iter()
            .collect(),
        }
    }

    pub(crate) fn store() -> Arc<MemoryStore> {
        let mut store = MemoryStore::new();
        store.insert("SITE1", "h1", vec![rent_lease("/docs/site1_LSE.pdf", 100.0)]);
        store.insert("SITE2", "h1", vec![rent_lease("/docs/site2_LSE.pdf", 200.0)]);
        store.insert("SITE1", "h2", vec![rent_lease("/docs/site1_v2_LSE.pdf", 300.0)]);
        Arc::new(store)
    }

    fn cache() -> Arc<SnapshotCache> {
        Arc::new(SnapshotCache::new(Duration::from_secs(3600), 10))
    }

    #[tokio::test]
    async fn test_fetch_is_idempotent_and_cached() {
        let store = store();
        let plugin = SitePlugin::new(lease_config("h1"), store.clone(), cache());

        let first = plugin.fetch_site_data("SITE1").await.unwrap();
        let second = plugin.fetch_site_data("SITE1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.fetch_count(), 1);
        assert!(first.contains("CITESITE1-A"));
        assert!(!first.contains("site1_LSE.pdf"));
        assert_eq!(plugin.active_site().await.as_deref(), Some("SITE1"));
    }

    #[tokio::test]
    async fn test_configs_do_not_share_entries() {
        let store = store();
        let shared = cache();
        let v1 = SitePlugin::new(lease_config("h1"), store.clone(), shared.clone());
        let v2 = SitePlugin::new(lease_config("h2"), store.clone(), shared.clone());

        v1.fetch_site_data("SITE1").await.unwrap();
        v2.fetch_site_data("SITE1").await.unwrap();
        assert_eq!(store.fetch_count(), 2);
        assert_eq!(shared.len().await, 2);

        let c1 = v1.resolve_citation("CITESITE1-A").await.unwrap().unwrap();
        let c2 = v2.resolve_citation("CITESITE1-A").await.unwrap().unwrap();
        assert_eq!(c1.source_document, "/docs/site1_LSE.pdf");
        assert_eq!(c2.source_document, "/docs/site1_v2_LSE.pdf");
    }

    #[tokio::test]
    async fn test_tokens_scoped_to_their_site() {
        let plugin = SitePlugin::new(lease_config("h1"), store(), cache());
        plugin.fetch_site_data("SITE1").await.unwrap();
        plugin.fetch_site_data("SITE2").await.unwrap();

        let one = plugin.resolve_citation("CITESITE1-A").await.unwrap().unwrap();
        let two = plugin.resolve_citation("CITESITE2-A").await.unwrap().unwrap();
        assert_eq!(one.source_document, "/docs/site1_LSE.pdf");
        assert_eq!(two.source_document, "/docs/site2_LSE.pdf");
        assert_eq!(plugin.active_site().await.as_deref(), Some("SITE2"));
    }

    #[tokio::test]
    async fn test_unknown_tokens_resolve_to_none() {
        let store = store();
        let plugin = SitePlugin::new(lease_config("h1"), store.clone(), cache());
        plugin.fetch_site_data("SITE1").await.unwrap();

        assert!(plugin.resolve_citation("CITESITE1-ZZ").await.unwrap().is_none());
        assert!(plugin.resolve_citation("CITE1-999").await.unwrap().is_none());
        assert_eq!(store.fetch_count(), 1);
        assert!(matches!(
            plugin.resolve_citation("not-a-token").await,
            Err(Error::InvalidCitation(_))
        ));
    }

    #[tokio::test]
    async fn test_restore_requires_a_fetch() {
        let plugin = SitePlugin::new(lease_config("h1"), store(), cache());
        assert!(matches!(
            plugin.restore_structured_data().await,
            Err(Error::NoSiteContext)
        ));

        plugin.fetch_site_data("SITE1").await.unwrap();
        assert!(plugin.restore_structured_data().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_context() {
        let plugin = SitePlugin::new(lease_config("h1"), store(), cache());
        let err = plugin.fetch_site_data("SITE404").await.unwrap_err();
        assert!(err.is_fetch_failure());
        assert!(plugin.active_site().await.is_none());
    }

    #[tokio::test]
    async fn test_restore_citations_skips_bad_entries() {
        let plugin = SitePlugin::new(lease_config("h1"), store(), cache());
        plugin.fetch_site_data("SITE1").await.unwrap();

        let resolved = plugin
            .restore_citations(&[
                json!("not-a-token"),
                json!("CITESITE1-A"),
                json!(["CITESITE1-A", 7]),
                json!(3),
            ])
            .await;
        assert_eq!(resolved.len(), 2);
    }

    #[tokio::test]
    async fn test_call_tool_dispatch() {
        let plugin = SitePlugin::new(lease_config("h1"), store(), cache());
        let defs = plugin.tool_definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].function.name, GET_SITE_DATA);

        let text = plugin
            .call_tool(GET_SITE_DATA, r#"{"site_id": "SITE2"}"#)
            .await
            .unwrap();
        let document: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(document["_id"], "SITE2");

        assert!(matches!(
            plugin.call_tool("delete_site", "{}").await,
            Err(Error::UnknownTool(_))
        ));
        assert!(matches!(
            plugin.call_tool(GET_SITE_DATA, "{}").await,
            Err(Error::Json(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_rejects_site_ids_tokens_cannot_carry() {
        let cache = cache();
        let plugin = SitePlugin::new(lease_config("h1"), store(), cache.clone());

        for site_id in ["SITE-1", ""] {
            let err = plugin.fetch_site_data(site_id).await.unwrap_err();
            assert!(matches!(err, Error::InvalidSiteId(ref id) if id == site_id));
            assert!(!err.is_fetch_failure());
        }
        assert!(plugin.active_site().await.is_none());
        assert!(cache.is_empty().await);

        plugin.fetch_site_data("SITE1").await.unwrap();
        assert!(plugin.resolve_citation("CITESITE1-A").await.unwrap().is_some());
    }
}
