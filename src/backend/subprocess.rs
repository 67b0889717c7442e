//! Subprocess backend: spawns an external CLI (Codex-style), pumps a
//! prompt through stdin, and reconciles its JSONL event stream into
//! `AgentEvent`s. This is the hardest component in the crate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use super::{Backend, BoxEventStream, strip_namespace};
use crate::config::GRACEFUL_TERMINATE_GRACE_SECS;
use crate::debug_log::DebugLog;
use crate::error::{OrchError, OrchResult};
use crate::types::{AgentEvent, ContinuationToken};

fn shell_wrapper_re() -> Regex {
    RegexBuilder::new(r"/bin/(?:zsh|bash|sh)\s+-lc\s+(.+)$")
        .dot_matches_new_line(true)
        .build()
        .expect("static regex")
}

fn cd_prefix_re() -> Regex {
    Regex::new(r"^cd\s+\S+\s*&&\s*").expect("static regex")
}

/// Strips the `/bin/{zsh|bash|sh} -lc <command>` wrapper Codex puts around
/// shell commands, plus a leading `cd <path> &&`. Idempotent on
/// already-unwrapped input (there's nothing left for either regex to
/// match, so a second call is a no-op).
pub fn unwrap_shell_command(command: &str) -> String {
    let wrapper = shell_wrapper_re();
    let Some(caps) = wrapper.captures(command) else {
        return command.to_string();
    };
    let mut inner = caps.get(1).map(|m| m.as_str()).unwrap_or("").to_string();
    let bytes = inner.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
    {
        inner = inner[1..inner.len() - 1].to_string();
    }
    let cd_re = cd_prefix_re();
    let stripped = cd_re.replace(&inner, "");
    stripped.trim().to_string()
}

pub struct CodexBackend {
    model: String,
    child: Arc<AsyncMutex<Option<Child>>>,
    debug_log: DebugLog,
}

impl CodexBackend {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            child: Arc::new(AsyncMutex::new(None)),
            debug_log: DebugLog::disabled(),
        }
    }

    pub fn with_debug_log(mut self, log: DebugLog) -> Self {
        self.debug_log = log;
        self
    }

    fn write_temp_schema(schema: &Value) -> std::io::Result<PathBuf> {
        let path = std::env::temp_dir().join(format!("review-orchestrator-schema-{}.json", Uuid::new_v4()));
        std::fs::write(&path, serde_json::to_vec(schema)?)?;
        Ok(path)
    }

    /// Extracts text from a Codex item: prefer a top-level `text` field,
    /// else concatenate `text`/`output_text` content blocks.
    fn extract_text(item: &Value) -> String {
        if let Some(top) = item.get("text").and_then(Value::as_str) {
            if !top.is_empty() {
                return top.to_string();
            }
        }
        let mut parts = String::new();
        if let Some(blocks) = item.get("content").and_then(Value::as_array) {
            for block in blocks {
                let block_type = block.get("type").and_then(Value::as_str).unwrap_or("");
                if block_type == "text" || block_type == "output_text" {
                    if let Some(t) = block.get("text").and_then(Value::as_str) {
                        parts.push_str(t);
                    }
                }
            }
        }
        parts
    }

    async fn graceful_shutdown(child: &mut Child) {
        if child.try_wait().ok().flatten().is_some() {
            return;
        }
        let _ = child.start_kill();
        let waited = tokio::time::timeout(
            Duration::from_secs(GRACEFUL_TERMINATE_GRACE_SECS),
            child.wait(),
        )
        .await;
        if waited.is_err() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

#[async_trait::async_trait]
impl Backend for CodexBackend {
    async fn execute(
        &mut self,
        cwd: &Path,
        prompt: &str,
        output_schema: Option<&Value>,
        continuation: Option<&ContinuationToken>,
    ) -> OrchResult<BoxEventStream> {
        let mut args: Vec<String> = vec![
            "exec".to_string(),
            "--experimental-json".to_string(),
            "--model".to_string(),
            self.model.clone(),
            "--sandbox".to_string(),
            "danger-full-access".to_string(),
            "--cd".to_string(),
            cwd.display().to_string(),
        ];

        let schema_path = match output_schema {
            Some(schema) => {
                let path = Self::write_temp_schema(schema)?;
                args.push("--output-schema".to_string());
                args.push(path.display().to_string());
                Some(path)
            }
            None => None,
        };

        if let Some(token) = continuation {
            if token.backend == "codex" {
                if let Some(thread_id) = token.data.get("thread_id").and_then(Value::as_str) {
                    args.push("resume".to_string());
                    args.push(thread_id.to_string());
                }
            }
        }

        let mut command = Command::new("codex");
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| OrchError::TransportFailure(format!("failed to spawn codex: {e}")))?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let prompt_owned = prompt.to_string();
        stdin
            .write_all(prompt_owned.as_bytes())
            .await
            .map_err(|e| OrchError::TransportFailure(format!("failed writing prompt to codex stdin: {e}")))?;
        drop(stdin);

        let (tx, rx) = mpsc::channel::<OrchResult<AgentEvent>>(64);
        let debug_log = self.debug_log.clone();

        {
            let mut guard = self.child.lock().await;
            *guard = Some(child);
        }
        let child_slot = self.child.clone();
        let has_schema = output_schema.is_some();

        // Stderr is not part of the JSONL wire format; mirror what merging
        // it into stdout would have surfaced by logging it raw.
        let stderr_debug = debug_log.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stderr_debug.log(&format!("[CODEX_STDERR] {}", truncate(&line, 1000)));
            }
        });

        tokio::spawn(async move {
            let mut pending_item_ids: HashMap<String, String> = HashMap::new();
            let mut updated_text: HashMap<String, Vec<String>> = HashMap::new();
            let mut thread_id: Option<String> = None;
            let mut last_agent_text: Option<String> = None;

            let mut lines = BufReader::new(stdout).lines();
            let mut turn_failed: Option<String> = None;

            loop {
                let line = match lines.next_line().await {
                    Ok(Some(l)) => l,
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx
                            .send(Err(OrchError::TransportFailure(format!(
                                "error reading codex stdout: {e}"
                            ))))
                            .await;
                        break;
                    }
                };
                let raw_line = line.trim();
                if raw_line.is_empty() {
                    continue;
                }

                let event: Value = match serde_json::from_str(raw_line) {
                    Ok(v) => v,
                    Err(_) => {
                        debug_log.log(&format!("[CODEX_RAW] unparseable: {}", truncate(raw_line, 500)));
                        continue;
                    }
                };
                debug_log.log(&format!("[CODEX_RAW] {}", truncate(raw_line, 1000)));

                let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");

                match event_type {
                    "thread.started" => {
                        thread_id = event
                            .get("thread_id")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                    }
                    "item.started" => {
                        let item = event.get("item").cloned().unwrap_or(json!({}));
                        let item_type = item.get("type").and_then(Value::as_str).unwrap_or("");
                        match item_type {
                            "command_execution" => {
                                let raw_cmd = item.get("command").and_then(Value::as_str).unwrap_or("");
                                let item_id = match item.get("id").and_then(Value::as_str) {
                                    Some(id) => id.to_string(),
                                    None => {
                                        let id = Uuid::new_v4().to_string();
                                        pending_item_ids
                                            .insert(format!("command_execution:{raw_cmd}"), id.clone());
                                        id
                                    }
                                };
                                let sent = tx
                                    .send(Ok(AgentEvent::ToolStart {
                                        id: item_id,
                                        name: "shell".to_string(),
                                        input: json!({ "command": unwrap_shell_command(raw_cmd) }),
                                    }))
                                    .await;
                                if sent.is_err() {
                                    break;
                                }
                            }
                            "mcp_tool_call" => {
                                let tool = item.get("tool").and_then(Value::as_str).unwrap_or("");
                                let item_id = match item.get("id").and_then(Value::as_str) {
                                    Some(id) => id.to_string(),
                                    None => {
                                        let id = Uuid::new_v4().to_string();
                                        pending_item_ids.insert(format!("mcp_tool_call:{tool}"), id.clone());
                                        id
                                    }
                                };
                                let input = item.get("arguments").cloned().unwrap_or(json!({}));
                                let sent = tx
                                    .send(Ok(AgentEvent::ToolStart {
                                        id: item_id,
                                        name: if tool.is_empty() { "unknown".to_string() } else { tool.to_string() },
                                        input,
                                    }))
                                    .await;
                                if sent.is_err() {
                                    break;
                                }
                            }
                            _ => {}
                        }
                    }
                    "item.updated" => {
                        let item = event.get("item").cloned().unwrap_or(json!({}));
                        let item_type = item.get("type").and_then(Value::as_str).unwrap_or("");
                        if item_type == "agent_message" || item_type == "reasoning" {
                            let item_id = item.get("id").and_then(Value::as_str).unwrap_or("");
                            let text = CodexBackend::extract_text(&item);
                            if !text.is_empty() && !item_id.is_empty() {
                                updated_text.entry(item_id.to_string()).or_default().push(text);
                            }
                        }
                    }
                    "item.completed" => {
                        let item = event.get("item").cloned().unwrap_or(json!({}));
                        let item_type = item.get("type").and_then(Value::as_str).unwrap_or("");
                        match item_type {
                            "agent_message" => {
                                let mut text = CodexBackend::extract_text(&item);
                                if text.is_empty() {
                                    let item_id = item.get("id").and_then(Value::as_str).unwrap_or("");
                                    text = updated_text.remove(item_id).unwrap_or_default().concat();
                                }
                                if !text.is_empty() {
                                    last_agent_text = Some(text.clone());
                                    if tx.send(Ok(AgentEvent::Text { text })).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            "reasoning" => {
                                let mut text = CodexBackend::extract_text(&item);
                                if text.is_empty() {
                                    let item_id = item.get("id").and_then(Value::as_str).unwrap_or("");
                                    text = updated_text.remove(item_id).unwrap_or_default().concat();
                                }
                                if !text.is_empty() {
                                    if tx.send(Ok(AgentEvent::Thinking { text })).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            "command_execution" => {
                                let raw_cmd = item.get("command").and_then(Value::as_str).unwrap_or("");
                                let item_id = match item.get("id").and_then(Value::as_str) {
                                    Some(id) => id.to_string(),
                                    None => pending_item_ids
                                        .remove(&format!("command_execution:{raw_cmd}"))
                                        .unwrap_or_else(|| Uuid::new_v4().to_string()),
                                };
                                let status = item.get("status").and_then(Value::as_str).unwrap_or("");
                                let (output, is_error) = if status == "declined" {
                                    ("Command declined by sandbox".to_string(), true)
                                } else {
                                    let exit_code = item.get("exit_code").and_then(Value::as_i64).unwrap_or(-1);
                                    let output = item
                                        .get("aggregated_output")
                                        .and_then(Value::as_str)
                                        .unwrap_or("")
                                        .to_string();
                                    (output, exit_code != 0)
                                };
                                if tx
                                    .send(Ok(AgentEvent::ToolResult { id: item_id, output, is_error }))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            "file_change" => {
                                let item_id = item
                                    .get("id")
                                    .and_then(Value::as_str)
                                    .map(str::to_string)
                                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                                let file_path = item.get("file_path").and_then(Value::as_str).unwrap_or("unknown");
                                let action = item.get("action").and_then(Value::as_str).unwrap_or("modified");
                                let start_sent = tx
                                    .send(Ok(AgentEvent::ToolStart {
                                        id: item_id.clone(),
                                        name: "patch".to_string(),
                                        input: json!({ "file": file_path, "action": action }),
                                    }))
                                    .await;
                                if start_sent.is_err() {
                                    break;
                                }
                                let result_sent = tx
                                    .send(Ok(AgentEvent::ToolResult {
                                        id: item_id,
                                        output: format!("{action}: {file_path}"),
                                        is_error: false,
                                    }))
                                    .await;
                                if result_sent.is_err() {
                                    break;
                                }
                            }
                            "mcp_tool_call" => {
                                let tool = item.get("tool").and_then(Value::as_str).unwrap_or("");
                                let item_id = match item.get("id").and_then(Value::as_str) {
                                    Some(id) => id.to_string(),
                                    None => pending_item_ids
                                        .remove(&format!("mcp_tool_call:{tool}"))
                                        .unwrap_or_else(|| Uuid::new_v4().to_string()),
                                };
                                let result_content = item
                                    .get("result")
                                    .and_then(|r| r.get("content"))
                                    .map(|c| match c {
                                        Value::String(s) => s.clone(),
                                        other => other.to_string(),
                                    })
                                    .unwrap_or_default();
                                let error_present = item.get("error").is_some();
                                if tx
                                    .send(Ok(AgentEvent::ToolResult {
                                        id: item_id,
                                        output: result_content,
                                        is_error: error_present,
                                    }))
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            _ => {}
                        }
                    }
                    "turn.completed" => {
                        let usage = event.get("usage").cloned().unwrap_or(json!({}));
                        let cost_sent = tx
                            .send(Ok(AgentEvent::Cost {
                                cost_usd: None,
                                input_tokens: usage.get("input_tokens").and_then(Value::as_u64),
                                output_tokens: usage.get("output_tokens").and_then(Value::as_u64),
                            }))
                            .await;
                        if cost_sent.is_err() {
                            break;
                        }

                        let mut structured_result: Option<Value> = None;
                        if has_schema {
                            if let Some(text) = &last_agent_text {
                                structured_result = serde_json::from_str(text).ok();
                            }
                            if structured_result.is_none() {
                                for key in ["result", "output"] {
                                    if let Some(raw) = event.get(key) {
                                        structured_result = match raw {
                                            Value::Object(_) | Value::Array(_) => Some(raw.clone()),
                                            Value::String(s) if !s.trim().is_empty() => {
                                                serde_json::from_str(s).ok()
                                            }
                                            _ => None,
                                        };
                                        if structured_result.is_some() {
                                            break;
                                        }
                                    }
                                }
                            }
                        }

                        let continuation_token = thread_id.clone().map(|tid| ContinuationToken {
                            backend: "codex".to_string(),
                            data: json!({ "thread_id": tid }),
                        });

                        let result_sent = tx
                            .send(Ok(AgentEvent::Result {
                                structured_output: structured_result,
                                continuation: continuation_token,
                            }))
                            .await;
                        if result_sent.is_err() {
                            break;
                        }
                    }
                    "turn.failed" => {
                        let message = event
                            .get("error")
                            .and_then(|e| e.get("message"))
                            .and_then(Value::as_str)
                            .unwrap_or("Unknown Codex error")
                            .to_string();
                        turn_failed = Some(message);
                        break;
                    }
                    "turn.started" => {}
                    other => {
                        debug_log.log(&format!(
                            "[CODEX_UNHANDLED] {other}: {}",
                            truncate(&event.to_string(), 500)
                        ));
                    }
                }
            }

            if let Some(message) = turn_failed {
                let _ = tx.send(Err(OrchError::BackendTurnFailure(message))).await;
            }

            let mut guard = child_slot.lock().await;
            if let Some(mut child) = guard.take() {
                CodexBackend::graceful_shutdown(&mut child).await;
            }
            drop(guard);

            if let Some(path) = schema_path {
                let _ = std::fs::remove_file(path);
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn cancel(&mut self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            Self::graceful_shutdown(&mut child).await;
        }
    }

    fn format_skill_invocation(&self, skill_key: &str, args: Option<&str>) -> String {
        let name = strip_namespace(skill_key);
        match args {
            Some(a) if !a.is_empty() => format!("${name} {a}"),
            _ => format!("${name}"),
        }
    }

    fn name(&self) -> &'static str {
        "codex"
    }
}

fn truncate(s: &str, n: usize) -> String {
    if s.chars().count() <= n {
        s.to_string()
    } else {
        s.chars().take(n).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwraps_double_quoted_with_cd_prefix() {
        assert_eq!(
            unwrap_shell_command(r#"/bin/zsh -lc "cd /p && ls -la""#),
            "ls -la"
        );
    }

    #[test]
    fn unwraps_single_quoted() {
        assert_eq!(unwrap_shell_command("/bin/bash -lc 'echo hi'"), "echo hi");
    }

    #[test]
    fn unwraps_unquoted() {
        assert_eq!(unwrap_shell_command("/bin/sh -lc ls -la"), "ls -la");
    }

    #[test]
    fn passes_through_non_wrapped_commands() {
        assert_eq!(unwrap_shell_command("ls -la"), "ls -la");
    }

    #[test]
    fn unwrap_is_idempotent() {
        let once = unwrap_shell_command(r#"/bin/zsh -lc "cd /p && ls -la""#);
        let twice = unwrap_shell_command(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn format_skill_invocation_strips_namespace() {
        let backend = CodexBackend::new("gpt-5.3-codex");
        assert_eq!(
            backend.format_skill_invocation("beagle-python:review-python", None),
            "$review-python"
        );
        assert_eq!(
            backend.format_skill_invocation("review-python", None),
            "$review-python"
        );
    }

    #[test]
    fn format_skill_invocation_namespaced_and_bare_match() {
        let backend = CodexBackend::new("gpt-5.3-codex");
        assert_eq!(
            backend.format_skill_invocation("ns:name", None),
            backend.format_skill_invocation("name", None)
        );
    }
}
