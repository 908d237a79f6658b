//! Error types for lease-qa

use thiserror::Error;

/// Main error type for lease-qa operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Extraction store error: {0}")]
    Store(String),

    #[error("No extracted data for site {site_id} with lease config hash {lease_config_hash}")]
    SiteDataNotFound {
        site_id: String,
        lease_config_hash: String,
    },

    #[error("Site ID is not set. Cannot restore structured data.")]
    NoSiteContext,

    #[error("Invalid citation format: {0:?}. Expected format: 'CITE{{siteid}}-{{alias}}'")]
    InvalidCitation(String),

    #[error("Invalid site id {0:?}: site ids must be non-empty and must not contain '-'")]
    InvalidSiteId(String),

    #[error("Invalid extracted field: {0}")]
    InvalidField(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("User message limit exceeded")]
    MessageLimitExceeded,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this failure came from reading extracted site data.
    ///
    /// These abort the whole query; other tool failures are reported back to
    /// the model instead.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(self, Error::Store(_) | Error::SiteDataNotFound { .. } | Error::Io(_))
    }
}

/// Result type alias for lease-qa
pub type Result<T> = std::result::Result<T, Error>;
