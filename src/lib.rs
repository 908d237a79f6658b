//! Question answering over extracted lease data, with citations.
//!
//! A site's extracted lease fields are rewritten so that every value carries
//! an opaque citation token instead of its source document. The model reads
//! that rewritten snapshot through the `get_site_data` tool and cites tokens
//! in its answer; the tokens are then resolved back to source documents and
//! bounding boxes.

pub mod cache;
pub mod citations;
pub mod config;
pub mod docs;
pub mod error;
pub mod history;
pub mod inference;
pub mod llm;
pub mod plugin;
pub mod prompts;
pub mod reconcile;
pub mod snapshot;

pub use error::{Error, Result};
