//! Conversation history, persisted per session.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::llm::Message;
use crate::reconcile::QueryResponse;

static CITATION_BETWEEN_WORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\S)\[\d+\](\S)").expect("valid regex"));
static CITATION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[\d+\]").expect("valid regex"));
static RUNS_OF_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{2,}").expect("valid regex"));
static SPACE_BEFORE_PUNCT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+([,.;:!?])").expect("valid regex"));

/// Remove `[n]` markers from answer text, keeping words apart and
/// punctuation attached.
///
/// `"a text[1] with multiple[2] citations[3]."` → `"a text with multiple citations."`
pub fn strip_inline_citations(text: &str) -> String {
    let text = CITATION_BETWEEN_WORDS.replace_all(text, "$1 $2");
    let text = CITATION.replace_all(&text, "");
    let text = RUNS_OF_SPACE.replace_all(&text, " ");
    SPACE_BEFORE_PUNCT.replace_all(&text, "$1").into_owned()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatHistory {
    /// Every message of the session, tool traffic included.
    pub messages: Vec<Message>,
    #[serde(skip)]
    pub user_message_limit: usize,
    /// Leave tool calls and results out of what the model is shown.
    #[serde(skip)]
    pub remove_tool_calls: bool,
}

impl ChatHistory {
    pub fn new(user_message_limit: usize) -> Self {
        Self {
            messages: Vec::new(),
            user_message_limit,
            remove_tool_calls: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn add_system_message(&mut self, content: &str) {
        self.messages.push(Message::system(content));
    }

    pub fn add_user_message(&mut self, content: &str) {
        self.messages.push(Message::user(content));
    }

    pub fn add_assistant_message(&mut self, content: &str) {
        self.messages.push(Message::assistant(content));
    }

    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn user_message_count(&self) -> usize {
        self.messages.iter().filter(|m| m.role == "user").count()
    }

    pub fn user_message_limit_exceeded(&self) -> bool {
        self.user_message_count() >= self.user_message_limit
    }

    /// The history as sent back to the model.
    ///
    /// Earlier answers recorded as response JSON are replaced by their text,
    /// without inline citation markers.
    pub fn for_model(&self) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|m| !(self.remove_tool_calls && is_tool_traffic(m)))
            .map(|m| {
                let mut message = m.clone();
                if message.role == "assistant" && message.text().starts_with('{') {
                    match serde_json::from_str::<QueryResponse>(message.text()) {
                        Ok(answer) => {
                            message.content = Some(strip_inline_citations(&answer.response))
                        }
                        Err(_) => warn!(
                            content = message.text(),
                            "Failed to parse message content as QueryResponse"
                        ),
                    }
                }
                message
            })
            .collect()
    }
}

fn is_tool_traffic(message: &Message) -> bool {
    message.role == "tool" || !message.tool_calls.is_empty()
}

/// Stores one history file per session: `<dir>/<user_id>-<session_id>.json`.
pub struct HistoryStore {
    dir: PathBuf,
    user_message_limit: usize,
    remove_tool_calls: bool,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>, user_message_limit: usize) -> Self {
        Self {
            dir: dir.into(),
            user_message_limit,
            remove_tool_calls: false,
        }
    }

    pub fn remove_tool_calls(mut self, remove: bool) -> Self {
        self.remove_tool_calls = remove;
        self
    }

    fn path(&self, session_id: &str, user_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}-{}.json", user_id.to_lowercase(), session_id))
    }

    /// The session's history, or a fresh one when none was stored.
    pub async fn read_messages(&self, session_id: &str, user_id: &str) -> Result<ChatHistory> {
        let mut history = ChatHistory::new(self.user_message_limit);
        history.remove_tool_calls = self.remove_tool_calls;

        let path = self.path(session_id, user_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let stored: ChatHistory = serde_json::from_slice(&bytes)?;
                history.messages = stored.messages;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(session_id, "No session found");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(history)
    }

    pub async fn store_messages(
        &self,
        session_id: &str,
        user_id: &str,
        history: &ChatHistory,
    ) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let bytes = serde_json::to_vec_pretty(history)?;
        tokio::fs::write(self.path(session_id, user_id), bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolCall;
    use serde_json::json;

    #[test]
    fn test_strip_inline_citations() {
        assert_eq!(
            strip_inline_citations("This is a text[1] with multiple[2] citations[3]."),
            "This is a text with multiple citations."
        );
        assert_eq!(strip_inline_citations("rent[1]and tax"), "rent and tax");
        assert_eq!(strip_inline_citations("Rent is 100 [2] , paid"), "Rent is 100, paid");
        assert_eq!(strip_inline_citations(""), "");
    }

    #[test]
    fn test_user_message_limit() {
        let mut history = ChatHistory::new(2);
        history.add_system_message("sys");
        history.add_user_message("one");
        history.add_assistant_message("answer");
        assert!(!history.user_message_limit_exceeded());
        history.add_user_message("two");
        assert!(history.user_message_limit_exceeded());
    }

    #[test]
    fn test_for_model_rewrites_recorded_answers() {
        let mut history = ChatHistory::new(10);
        history.add_user_message("What is the rent?");
        history.add_assistant_message(
            &json!({
                "response": "The rent is 100[1].",
                "citations": [["/docs/a.pdf", "D(1)"]],
                "metrics": null,
                "metadata": {}
            })
            .to_string(),
        );
        history.add_assistant_message("{not an answer");

        let messages = history.for_model();
        assert_eq!(messages[1].text(), "The rent is 100.");
        assert_eq!(messages[2].text(), "{not an answer");
        // stored history is untouched
        assert!(history.messages[1].text().contains("citations"));
    }

    #[test]
    fn test_for_model_can_drop_tool_traffic() {
        let mut history = ChatHistory::new(10);
        history.add_user_message("q");
        history.add_message(Message::assistant_tool_calls(vec![ToolCall::new(
            "call_1",
            "get_site_data",
            "{}",
        )]));
        history.add_message(Message::tool_result("call_1", "{}"));
        history.add_assistant_message("a");

        assert_eq!(history.for_model().len(), 4);
        history.remove_tool_calls = true;
        let roles: Vec<String> = history.for_model().into_iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["user", "assistant"]);
    }

    #[tokio::test]
    async fn test_store_round_trips_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("sessions"), 5);

        let empty = store.read_messages("s1", "Alice").await.unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.user_message_limit, 5);

        let mut history = empty;
        history.add_user_message("hello");
        store.store_messages("s1", "Alice", &history).await.unwrap();

        let loaded = store.read_messages("s1", "alice").await.unwrap();
        assert_eq!(loaded.messages, history.messages);
        assert!(store.read_messages("s2", "alice").await.unwrap().is_empty());
    }
}
