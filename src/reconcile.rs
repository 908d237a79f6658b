//! Turning the model's final message into a [`QueryResponse`].
//!
//! The model is asked for `{"response": ..., "citations": [...]}` but may wrap
//! it in prose, emit several objects, or answer in plain text. None of that is
//! an error: the first usable object wins, and plain text becomes a response
//! with no citations.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::citations::CitationMapping;
use crate::error::Result;
use crate::plugin::SitePlugin;

/// A citation resolved back to its source: `[source_document, source_bounding_boxes]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    into = "(String, Option<String>)",
    from = "(String, Option<String>)"
)]
pub struct ResolvedCitation {
    pub source_document: String,
    pub source_bounding_boxes: Option<String>,
}

impl From<&CitationMapping> for ResolvedCitation {
    fn from(mapping: &CitationMapping) -> Self {
        Self {
            source_document: mapping.source_document.clone(),
            source_bounding_boxes: mapping.source_bounding_boxes.clone(),
        }
    }
}

impl From<ResolvedCitation> for (String, Option<String>) {
    fn from(citation: ResolvedCitation) -> Self {
        (citation.source_document, citation.source_bounding_boxes)
    }
}

impl From<(String, Option<String>)> for ResolvedCitation {
    fn from((source_document, source_bounding_boxes): (String, Option<String>)) -> Self {
        Self {
            source_document,
            source_bounding_boxes,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryMetrics {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub total_latency_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub response: String,
    pub citations: Vec<ResolvedCitation>,
    #[serde(default)]
    pub metrics: Option<QueryMetrics>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// The answer as the model wrote it, before token resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedResponse {
    pub response: String,
    /// Raw citation entries: token strings, or arrays of them.
    pub citations: Vec<Value>,
}

/// Every well-formed JSON object embedded in `text`, in order.
///
/// Each `{` is tried as a start. One that does not open a complete object,
/// such as a stray brace in prose, is skipped and the scan moves on. Objects
/// nested inside a reported one are not reported separately.
pub fn extract_json_objects(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut from = 0;

    while let Some(offset) = text[from..].find('{') {
        let start = from + offset;
        let mut values = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match values.next() {
            Some(Ok(Value::Object(_))) => {
                let end = start + values.byte_offset();
                spans.push(&text[start..end]);
                from = end;
            }
            _ => from = start + 1,
        }
    }
    spans
}

/// Pick the answer out of the model's raw text.
///
/// The first span that parses as a JSON object with a `response` member is
/// used. `citations` may be an array or a single entry. Without such a span
/// the trimmed text is the response.
pub fn parse_answer(raw: &str) -> GeneratedResponse {
    let mut answers = extract_json_objects(raw)
        .into_iter()
        .filter_map(|span| serde_json::from_str::<Map<String, Value>>(span).ok())
        .filter(|object| object.contains_key("response"));

    let Some(mut object) = answers.next() else {
        debug!("Model answered in plain text");
        return GeneratedResponse {
            response: raw.trim().to_string(),
            citations: Vec::new(),
        };
    };
    if answers.next().is_some() {
        warn!("More than one JSON object found in the response. Using the first one.");
    }

    let response = match object.remove("response") {
        Some(Value::String(s)) => s,
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let citations = match object.remove("citations") {
        Some(Value::Array(entries)) => entries,
        Some(Value::Null) | None => Vec::new(),
        Some(entry) => vec![entry],
    };
    GeneratedResponse {
        response,
        citations,
    }
}

/// Build the final response: parse the answer, resolve its citations against
/// the plugin, and attach the active site's structured data.
///
/// Fails only when no site was fetched during the conversation.
pub async fn resolve(raw: &str, plugin: &SitePlugin) -> Result<QueryResponse> {
    let answer = parse_answer(raw);
    let citations = plugin.restore_citations(&answer.citations).await;
    debug!(
        requested = answer.citations.len(),
        resolved = citations.len(),
        "Citations restored"
    );
    let structured_data = plugin.restore_structured_data().await?;

    let mut metadata = Map::new();
    metadata.insert("structured_data".to_string(), Value::Array(structured_data));
    metadata.insert("unstructured_data".to_string(), json!([]));

    Ok(QueryResponse {
        response: answer.response,
        citations,
        metrics: None,
        metadata,
    })
}
