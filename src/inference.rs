//! Answering questions: the tool-calling loop around the chat model.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cache::SnapshotCache;
use crate::config::{ConfigStore, RuntimeSettings};
use crate::docs::ExtractionStore;
use crate::error::{Error, Result};
use crate::history::ChatHistory;
use crate::llm::{ChatModel, Message, TokenUsage, ToolChoice};
use crate::plugin::SitePlugin;
use crate::prompts::site_system_prompt;
use crate::reconcile::{self, QueryMetrics, QueryResponse};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Correlation id.
    pub cid: String,
    /// Session id.
    pub sid: String,
    pub query: String,
    #[serde(default)]
    pub model: Option<String>,
}

pub struct InferenceEngine {
    model: Arc<dyn ChatModel>,
    store: Arc<dyn ExtractionStore>,
    cache: Arc<SnapshotCache>,
    configs: ConfigStore,
    settings: RuntimeSettings,
}

impl InferenceEngine {
    pub fn new(
        model: Arc<dyn ChatModel>,
        store: Arc<dyn ExtractionStore>,
        cache: Arc<SnapshotCache>,
        configs: ConfigStore,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            model,
            store,
            cache,
            configs,
            settings,
        }
    }

    /// A plugin bound to the configuration `config_id`, sharing this engine's cache.
    pub async fn plugin(&self, config_id: &str) -> Result<SitePlugin> {
        let config = self
            .configs
            .load_config(config_id)
            .await?
            .ok_or_else(|| Error::Config(format!("Configuration not found: {}", config_id)))?;
        Ok(SitePlugin::new(
            Arc::new(config),
            self.store.clone(),
            self.cache.clone(),
        ))
    }

    /// Answer `request` under the configuration `config_id`, continuing `history`.
    pub async fn query(
        &self,
        request: &QueryRequest,
        config_id: &str,
        history: &mut ChatHistory,
    ) -> Result<QueryResponse> {
        info!(cid = %request.cid, sid = %request.sid, config_id, "Query received");
        let plugin = self.plugin(config_id).await?;

        if history.user_message_limit_exceeded() {
            return Err(Error::MessageLimitExceeded);
        }

        let system_message = site_system_prompt(&plugin.config().prompt);
        self.answer_site_question(
            &system_message,
            &request.query,
            &plugin,
            history,
            request.model.as_deref(),
        )
        .await
    }

    /// Run the tool loop for one user message and reconcile the final answer.
    ///
    /// The first round must call a tool. Fetch failures abort the question;
    /// other tool errors are handed back to the model as the tool result. The
    /// recorded answer carries no metrics.
    pub async fn answer_site_question(
        &self,
        system_message: &str,
        user_message: &str,
        plugin: &SitePlugin,
        history: &mut ChatHistory,
        model_override: Option<&str>,
    ) -> Result<QueryResponse> {
        if history.is_empty() {
            history.add_system_message(system_message);
        }
        let replay = history.for_model();
        let mut turn = vec![Message::user(user_message)];

        info!(query = user_message, "Running query");
        let started = Instant::now();
        let tools = plugin.tool_definitions();
        let mut usage = TokenUsage::default();

        for round in 0..self.settings.max_tool_rounds {
            let tool_choice = if round == 0 {
                ToolChoice::Required
            } else {
                ToolChoice::Auto
            };
            let messages: Vec<Message> = replay.iter().chain(turn.iter()).cloned().collect();
            let completion = self
                .model
                .complete(&messages, &tools, tool_choice, model_override)
                .await?;
            usage += completion.usage;
            let message = completion.message;

            if message.tool_calls.is_empty() {
                let raw = message.text().to_string();
                let mut response = reconcile::resolve(&raw, plugin).await?;

                for message in turn {
                    history.add_message(message);
                }
                history.add_assistant_message(&serde_json::to_string(&response)?);

                let latency = started.elapsed().as_secs_f64();
                info!(
                    rounds = round + 1,
                    citations = response.citations.len(),
                    total_tokens = usage.total_tokens,
                    latency_sec = latency,
                    "Query answered"
                );
                response.metrics = Some(QueryMetrics {
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                    total_tokens: usage.total_tokens,
                    total_latency_sec: latency,
                });
                return Ok(response);
            }

            let calls = message.tool_calls.clone();
            turn.push(message);
            for call in calls {
                debug!(
                    round,
                    tool = %call.function.name,
                    arguments = %call.function.arguments,
                    "Tool call"
                );
                let output = match plugin
                    .call_tool(&call.function.name, &call.function.arguments)
                    .await
                {
                    Ok(output) => output,
                    Err(e) if e.is_fetch_failure() => return Err(e),
                    Err(e) => {
                        warn!(tool = %call.function.name, error = %e, "Tool call failed");
                        json!({ "error": e.to_string() }).to_string()
                    }
                };
                turn.push(Message::tool_result(&call.id, &output));
            }
        }

        warn!(max_tool_rounds = self.settings.max_tool_rounds, "Tool loop exhausted");
        Err(Error::Llm(format!(
            "no answer after {} tool rounds",
            self.settings.max_tool_rounds
        )))
    }

    /// Answer a question that needs no site data. No tools, no history.
    pub async fn answer_general_question(
        &self,
        system_message: &str,
        user_message: &str,
    ) -> Result<String> {
        info!(query = user_message, "Running general query");
        let messages = [Message::system(system_message), Message::user(user_message)];
        let completion = self
            .model
            .complete(&messages, &[], ToolChoice::Auto, None)
            .await?;
        Ok(completion.message.text().to_string())
    }
}
