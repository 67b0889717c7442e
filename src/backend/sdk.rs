//! SDK backend: adapts an in-process streaming client's typed messages to
//! `AgentEvent`. No Claude Agent SDK crate exists anywhere in the Rust
//! ecosystem, so — per DESIGN.md — this talks to an OpenAI-compatible
//! streaming chat-completions endpoint over `reqwest` instead.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use super::{Backend, BoxEventStream};
use crate::error::{OrchError, OrchResult};
use crate::types::{AgentEvent, ContinuationToken};

const STRUCTURED_OUTPUT_TOOL: &str = "StructuredOutput";

fn base_url() -> String {
    std::env::var("CLAUDE_SDK_BASE_URL").unwrap_or_else(|_| "http://localhost:8000/v1".to_string())
}

fn api_key() -> String {
    std::env::var("CLAUDE_SDK_API_KEY").unwrap_or_default()
}

pub struct ClaudeBackend {
    model: String,
    task: Arc<AsyncMutex<Option<JoinHandle<()>>>>,
}

impl ClaudeBackend {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            task: Arc::new(AsyncMutex::new(None)),
        }
    }

    fn build_client() -> OrchResult<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| OrchError::TransportFailure(format!("failed to build HTTP client: {e}")))
    }
}

#[async_trait::async_trait]
impl Backend for ClaudeBackend {
    async fn execute(
        &mut self,
        _cwd: &Path,
        prompt: &str,
        output_schema: Option<&Value>,
        _continuation: Option<&ContinuationToken>,
    ) -> OrchResult<BoxEventStream> {
        // This backend does not participate in continuation: any supplied
        // token is ignored rather than rejected.
        let client = Self::build_client()?;
        let url = format!("{}/chat/completions", base_url());
        let model = self.model.clone();
        let key = api_key();
        let wants_schema = output_schema.is_some();

        let mut messages = vec![json!({ "role": "user", "content": prompt })];
        if wants_schema {
            messages.insert(
                0,
                json!({
                    "role": "system",
                    "content": "When finished, call the StructuredOutput tool with your final answer as its arguments."
                }),
            );
        }

        let request_body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        let (tx, rx) = mpsc::channel::<OrchResult<AgentEvent>>(64);

        let handle = tokio::spawn(async move {
            let response = client
                .post(&url)
                .header("Authorization", format!("Bearer {key}"))
                .header("Content-Type", "application/json")
                .json(&request_body)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    let _ = tx
                        .send(Err(OrchError::TransportFailure(format!("SDK request failed: {e}"))))
                        .await;
                    return;
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let _ = tx
                    .send(Err(OrchError::BackendTurnFailure(format!(
                        "SDK API error {status}: {body}"
                    ))))
                    .await;
                return;
            }

            let mut structured_output: Option<Value> = None;
            let mut pending_tool_name: Option<String> = None;
            let mut pending_tool_args = String::new();
            let mut byte_stream = response.bytes_stream();
            let mut buf = String::new();

            use futures::StreamExt;
            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx
                            .send(Err(OrchError::TransportFailure(format!("SDK stream error: {e}"))))
                            .await;
                        break;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim().to_string();
                    buf.drain(..=pos);
                    let Some(data) = line.strip_prefix("data:") else { continue };
                    let data = data.trim();
                    if data.is_empty() || data == "[DONE]" {
                        continue;
                    }
                    let Ok(event): Result<Value, _> = serde_json::from_str(data) else { continue };

                    if let Some(usage) = event.get("usage") {
                        let cost_sent = tx
                            .send(Ok(AgentEvent::Cost {
                                cost_usd: None,
                                input_tokens: usage.get("prompt_tokens").and_then(Value::as_u64),
                                output_tokens: usage.get("completion_tokens").and_then(Value::as_u64),
                            }))
                            .await;
                        if cost_sent.is_err() {
                            return;
                        }
                    }

                    let Some(choice) = event.get("choices").and_then(|c| c.get(0)) else { continue };
                    let delta = choice.get("delta").cloned().unwrap_or(json!({}));

                    if let Some(reasoning) = delta.get("reasoning_content").and_then(Value::as_str) {
                        if !reasoning.is_empty()
                            && tx
                                .send(Ok(AgentEvent::Thinking { text: reasoning.to_string() }))
                                .await
                                .is_err()
                        {
                            return;
                        }
                    }

                    if let Some(content) = delta.get("content").and_then(Value::as_str) {
                        if !content.is_empty()
                            && tx
                                .send(Ok(AgentEvent::Text { text: content.to_string() }))
                                .await
                                .is_err()
                        {
                            return;
                        }
                    }

                    if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
                        for call in tool_calls {
                            let function = call.get("function").cloned().unwrap_or(json!({}));
                            if let Some(name) = function.get("name").and_then(Value::as_str) {
                                if !name.is_empty() {
                                    pending_tool_name = Some(name.to_string());
                                    pending_tool_args.clear();
                                }
                            }
                            if let Some(args) = function.get("arguments").and_then(Value::as_str) {
                                pending_tool_args.push_str(args);
                            }
                        }
                    }

                    if choice.get("finish_reason").and_then(Value::as_str).is_some() {
                        if let Some(name) = &pending_tool_name {
                            let parsed: Option<Value> = serde_json::from_str(&pending_tool_args).ok();
                            // A tool named StructuredOutput is reserved: its
                            // payload is captured, not surfaced as ToolStart.
                            if name == STRUCTURED_OUTPUT_TOOL {
                                structured_output = parsed.or(Some(json!(pending_tool_args)));
                            } else {
                                let id = uuid::Uuid::new_v4().to_string();
                                let input = parsed.unwrap_or(json!({}));
                                if tx
                                    .send(Ok(AgentEvent::ToolStart { id, name: name.clone(), input }))
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                        }
                    }
                }
            }

            let _ = tx
                .send(Ok(AgentEvent::Result {
                    structured_output,
                    continuation: None,
                }))
                .await;
        });

        *self.task.lock().await = Some(handle);
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn cancel(&mut self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }

    fn format_skill_invocation(&self, skill_key: &str, args: Option<&str>) -> String {
        // Claude uses /namespace:skill syntax and does not strip the
        // namespace prefix.
        match args {
            Some(a) if !a.is_empty() => format!("/{skill_key} {a}"),
            _ => format!("/{skill_key}"),
        }
    }

    fn name(&self) -> &'static str {
        "claude"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_skill_invocation_keeps_namespace() {
        let backend = ClaudeBackend::new("claude-opus");
        assert_eq!(
            backend.format_skill_invocation("beagle-python:review-python", None),
            "/beagle-python:review-python"
        );
    }

    #[test]
    fn format_skill_invocation_with_args() {
        let backend = ClaudeBackend::new("claude-opus");
        assert_eq!(
            backend.format_skill_invocation("commit-push", Some("--auto")),
            "/commit-push --auto"
        );
    }
}
