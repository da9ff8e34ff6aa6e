//! The default agent engine.
//!
//! [`ChatEngine`] drives one streaming chat completion against an
//! OpenRouter-compatible endpoint and emits `content` deltas followed by
//! a terminal `status`. The full LLM-plus-tools loop lives behind the
//! [`AgentEngine`] seam; the executor never sees past it.

use std::sync::Arc;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use kiln_billing::Ledger;
use kiln_domain::entities::MessageKind;
use kiln_domain::stream::{AgentEngine, EngineContext, ItemStream, StreamItem, StreamStatus};
use kiln_domain::Error;
use serde::Deserialize;

use crate::runtime::keys::KeyResolver;

const BYOK_REJECTED_MESSAGE: &str =
    "The LLM provider rejected your API key; please add a valid key in settings.";

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Debug, Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
}

#[derive(Clone)]
pub struct ChatEngine {
    http: reqwest::Client,
    endpoint: String,
    keys: Arc<KeyResolver>,
    ledger: Arc<Ledger>,
}

impl ChatEngine {
    pub fn new(endpoint: impl Into<String>, keys: Arc<KeyResolver>, ledger: Arc<Ledger>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            keys,
            ledger,
        }
    }

    fn llm_messages(ctx: &EngineContext) -> Vec<serde_json::Value> {
        ctx.messages
            .iter()
            .filter(|m| m.is_llm_message)
            .map(|m| {
                let role = match m.kind {
                    MessageKind::Assistant => "assistant",
                    _ => "user",
                };
                let content = m
                    .content
                    .get("text")
                    .and_then(|t| t.as_str())
                    .map(str::to_owned)
                    .unwrap_or_else(|| m.content.to_string());
                serde_json::json!({ "role": role, "content": content })
            })
            .collect()
    }
}

impl AgentEngine for ChatEngine {
    fn run(&self, ctx: EngineContext) -> ItemStream {
        let engine = self.clone();
        Box::pin(async_stream::stream! {
            let key = match engine.keys.resolve(&ctx.account_id).await {
                Ok(Some(key)) => key,
                Ok(None) => {
                    yield StreamItem::status(
                        StreamStatus::Failed,
                        Some("No LLM API key is configured for this account.".to_string()),
                    );
                    return;
                }
                Err(e) => {
                    yield StreamItem::status(StreamStatus::Failed, Some(e.to_string()));
                    return;
                }
            };

            // The router expects bare model ids.
            let model = ctx.model.strip_prefix("openrouter/").unwrap_or(&ctx.model);
            let body = serde_json::json!({
                "model": model,
                "messages": Self::llm_messages(&ctx),
                "stream": true,
                "usage": { "include": true },
            });

            let response = match engine
                .http
                .post(&engine.endpoint)
                .bearer_auth(&key.secret)
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    yield StreamItem::status(
                        StreamStatus::Failed,
                        Some(format!("LLM provider unreachable: {e}")),
                    );
                    return;
                }
            };

            if response.status() == reqwest::StatusCode::UNAUTHORIZED {
                engine.keys.handle_auth_failure(&ctx.account_id, &key.source).await;
                yield StreamItem::status(
                    StreamStatus::Failed,
                    Some(BYOK_REJECTED_MESSAGE.to_string()),
                );
                return;
            }
            if !response.status().is_success() {
                let status = response.status();
                let detail = response.text().await.unwrap_or_default();
                yield StreamItem::status(
                    StreamStatus::Failed,
                    Some(format!("LLM provider returned {status}: {detail}")),
                );
                return;
            }

            let mut events = response.bytes_stream().eventsource();
            let mut usage: Option<ChunkUsage> = None;
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        if event.data == "[DONE]" {
                            break;
                        }
                        match serde_json::from_str::<ChatChunk>(&event.data) {
                            Ok(chunk) => {
                                if let Some(u) = chunk.usage {
                                    usage = Some(u);
                                }
                                let delta = chunk
                                    .choices
                                    .first()
                                    .and_then(|c| c.delta.content.clone());
                                if let Some(text) = delta {
                                    yield StreamItem::content(serde_json::json!({ "text": text }));
                                }
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "skipping unparseable stream chunk");
                            }
                        }
                    }
                    Err(e) => {
                        yield StreamItem::Warning {
                            message: format!("stream interrupted: {e}"),
                        };
                        break;
                    }
                }
            }

            // Debit what the provider reported. Quota exhaustion fails
            // the run; logging failures never do.
            if let Some(usage) = usage {
                let total = if usage.total_tokens > 0 {
                    usage.total_tokens
                } else {
                    usage.prompt_tokens + usage.completion_tokens
                };
                if total > 0 {
                    match engine
                        .ledger
                        .consume_tokens(&ctx.account_id, total, &ctx.model, Some(ctx.thread_id), None)
                        .await
                    {
                        Ok(receipt) => {
                            tracing::debug!(
                                tokens = total,
                                remaining = receipt.tokens_remaining,
                                "recorded token usage"
                            );
                        }
                        Err(e @ Error::InsufficientTokens { .. }) => {
                            yield StreamItem::status(StreamStatus::Failed, Some(e.to_string()));
                            return;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to record token usage");
                        }
                    }
                }
            }

            yield StreamItem::status(
                StreamStatus::Completed,
                Some("Agent run completed successfully".to_string()),
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_domain::entities::Message;
    use uuid::Uuid;

    #[test]
    fn llm_messages_filter_and_shape() {
        let thread_id = Uuid::new_v4();
        let ctx = EngineContext {
            run_id: Uuid::new_v4(),
            thread_id,
            project_id: Uuid::new_v4(),
            account_id: "acc".into(),
            model: "openrouter/openai/gpt-4o".into(),
            enable_thinking: false,
            reasoning_effort: None,
            enable_context_manager: false,
            app_type: kiln_domain::entities::AppType::Web,
            messages: vec![
                Message::new(thread_id, MessageKind::User, serde_json::json!({"text": "hi"})),
                Message::new(thread_id, MessageKind::Status, serde_json::json!({"ignored": true})),
                Message::new(
                    thread_id,
                    MessageKind::Assistant,
                    serde_json::json!({"text": "hello"}),
                ),
            ],
        };

        let messages = ChatEngine::llm_messages(&ctx);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[0]["content"], "hi");
        assert_eq!(messages[1]["role"], "assistant");
        assert_eq!(messages[1]["content"], "hello");
    }

    #[test]
    fn chunk_parsing() {
        let chunk: ChatChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"content":"partial"}}]}"#,
        )
        .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("partial"));
        assert!(chunk.usage.is_none());

        let empty: ChatChunk = serde_json::from_str(r#"{"choices":[{"delta":{}}]}"#).unwrap();
        assert!(empty.choices[0].delta.content.is_none());
    }

    #[test]
    fn usage_chunk_parsing() {
        let chunk: ChatChunk = serde_json::from_str(
            r#"{"choices":[],"usage":{"prompt_tokens":120,"completion_tokens":80,"total_tokens":200}}"#,
        )
        .unwrap();
        let usage = chunk.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 120);
        assert_eq!(usage.completion_tokens, 80);
        assert_eq!(usage.total_tokens, 200);
    }
}
