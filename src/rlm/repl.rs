//! `REPLProcess`, the host side of the sandboxed code execution loop, plus
//! a reduced-capability in-process fallback for environments without
//! `python3` on `PATH`.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};

use crate::config::RLM_OUTPUT_TRUNCATION_LIMIT;
use crate::rlm::child_script::CHILD_SCRIPT;
use crate::rlm::environment;
use crate::rlm::errors::{RlmError, RlmResult};
use crate::rlm::ipc;
use crate::types::RepoContext;

#[derive(Debug, Clone)]
pub struct ExecuteResult {
    pub output: String,
    pub error: Option<String>,
    pub final_answer: Option<String>,
}

impl ExecuteResult {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_final(&self) -> bool {
        self.final_answer.is_some()
    }
}

/// Called back from the sandboxed child to reach a sub-LM. Stateless:
/// every invocation gets a fresh context.
#[async_trait]
pub trait SubLmCallback: Send + Sync {
    async fn query(&self, prompt: &str, model: &str) -> RlmResult<String>;
}

pub struct REPLProcess {
    script_path: Option<PathBuf>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout_lines: Option<tokio::io::Lines<BufReader<tokio::process::ChildStdout>>>,
    repo: RepoContext,
    on_output: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

impl REPLProcess {
    pub fn new(repo: RepoContext) -> Self {
        Self {
            script_path: None,
            child: None,
            stdin: None,
            stdout_lines: None,
            repo,
            on_output: None,
        }
    }

    pub fn set_on_output(&mut self, cb: Box<dyn Fn(&str) + Send + Sync>) {
        self.on_output = Some(cb);
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Spawns `python3` hosting the embedded child script. Returns
    /// `RlmError::ContainerNotFound` if `python3` isn't on `PATH` — callers
    /// should fall back to `InProcessRepl` in that case.
    pub async fn start(&mut self) -> RlmResult<()> {
        let path = std::env::temp_dir().join(format!("review-orchestrator-rlm-{}.py", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, CHILD_SCRIPT).await?;

        let mut child = Command::new("python3")
            .arg(&path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| RlmError::ContainerNotFound(format!("python3: {e}")))?;

        self.stdin = child.stdin.take();
        let stdout = child.stdout.take().expect("stdout was piped");
        self.stdout_lines = Some(BufReader::new(stdout).lines());
        self.child = Some(child);
        self.script_path = Some(path);
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        if let Some(path) = self.script_path.take() {
            let _ = tokio::fs::remove_file(path).await;
        }
    }

    /// Executes one block of code in the persistent namespace, answering
    /// any reverse `llm_query`/namespace-function calls the child makes
    /// along the way. Output is truncated at `RLM_OUTPUT_TRUNCATION_LIMIT`.
    pub async fn execute(
        &mut self,
        code: &str,
        sub_lm: &dyn SubLmCallback,
    ) -> RlmResult<ExecuteResult> {
        let stdin = self.stdin.as_mut().ok_or_else(|| RlmError::Ipc("REPL is not running".to_string()))?;
        let lines = self
            .stdout_lines
            .as_mut()
            .ok_or_else(|| RlmError::Ipc("REPL is not running".to_string()))?;

        let request_id = ipc::generate_id();
        let line = ipc::encode_request(&request_id, "execute", json!({ "code": code }));
        stdin
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(RlmError::Io)?;

        loop {
            let Some(raw) = lines.next_line().await.map_err(RlmError::Io)? else {
                return Err(RlmError::ContainerFailure("child closed stdout unexpectedly".to_string()));
            };
            let msg: Value = ipc::decode(&raw).map_err(|e| RlmError::Ipc(e.to_string()))?;

            if msg.get("id").and_then(Value::as_str) == Some(request_id.as_str())
                && (msg.get("result").is_some() || msg.get("error").is_some())
            {
                if let Some(error) = msg.get("error") {
                    let message = error.get("message").and_then(Value::as_str).unwrap_or("unknown error");
                    return Err(RlmError::ContainerFailure(message.to_string()));
                }
                let result = msg.get("result").cloned().unwrap_or(json!({}));
                let mut output = result
                    .get("output")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                if output.chars().count() > RLM_OUTPUT_TRUNCATION_LIMIT {
                    let truncated: String = output.chars().take(RLM_OUTPUT_TRUNCATION_LIMIT).collect();
                    output = format!("{truncated}\n[truncated - use llm_query to analyze large outputs]");
                }
                if let Some(cb) = &self.on_output {
                    cb(&output);
                }
                return Ok(ExecuteResult {
                    output,
                    error: result.get("error").and_then(Value::as_str).map(str::to_string),
                    final_answer: result.get("final_answer").and_then(Value::as_str).map(str::to_string),
                });
            }

            if ipc::is_call(&msg) {
                self.handle_callback(&msg, sub_lm).await?;
            }
        }
    }

    async fn handle_callback(&mut self, msg: &Value, sub_lm: &dyn SubLmCallback) -> RlmResult<()> {
        let method = msg.get("method").and_then(Value::as_str).unwrap_or("");
        let params = msg.get("params").cloned().unwrap_or(json!({}));
        let id = msg.get("id").cloned().unwrap_or(Value::Null);

        let response = match method {
            "llm_query" => {
                let prompt = params.get("prompt").and_then(Value::as_str).unwrap_or("");
                let model = params.get("model").and_then(Value::as_str).unwrap_or("haiku");
                match sub_lm.query(prompt, model).await {
                    Ok(answer) => ipc::encode_response(&id, json!(answer)),
                    Err(e) => ipc::encode_error(&id, -32000, &e.to_string()),
                }
            }
            "llm_query_parallel" => {
                let prompts: Vec<String> = params
                    .get("prompts")
                    .and_then(Value::as_array)
                    .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                    .unwrap_or_default();
                let model = params.get("model").and_then(Value::as_str).unwrap_or("haiku").to_string();
                let mut answers = Vec::with_capacity(prompts.len());
                for prompt in &prompts {
                    answers.push(sub_lm.query(prompt, &model).await.unwrap_or_default());
                }
                ipc::encode_response(&id, json!(answers))
            }
            "files_containing" => {
                let pattern = params.get("pattern").and_then(Value::as_str).unwrap_or("");
                ipc::encode_response(&id, json!(environment::files_containing(&self.repo, pattern)))
            }
            "files_importing" => {
                let module = params.get("module").and_then(Value::as_str).unwrap_or("");
                ipc::encode_response(&id, json!(environment::files_importing(&self.repo, module)))
            }
            "file_exists" => {
                let path = params.get("path").and_then(Value::as_str).unwrap_or("");
                ipc::encode_response(&id, json!(environment::file_exists(&self.repo, path)))
            }
            "list_files_matching" => {
                let pattern = params.get("pattern").and_then(Value::as_str).unwrap_or("");
                ipc::encode_response(&id, json!(environment::list_files_matching(&self.repo, pattern)))
            }
            "get_file_slice" => {
                let path = params.get("path").and_then(Value::as_str).unwrap_or("");
                let start = params.get("start").and_then(Value::as_u64).unwrap_or(1) as usize;
                let end = params.get("end").and_then(Value::as_u64).unwrap_or(1) as usize;
                ipc::encode_response(&id, json!(environment::get_file_slice(&self.repo, path, start, end)))
            }
            other => ipc::encode_error(&id, -32601, &format!("unknown callback method {other}")),
        };

        if let Some(stdin) = self.stdin.as_mut() {
            stdin
                .write_all(format!("{response}\n").as_bytes())
                .await
                .map_err(RlmError::Io)?;
        }
        Ok(())
    }
}

/// Reduced-capability mode for environments without `python3`: evaluates
/// only literal namespace-function calls and a trailing `FINAL`/
/// `FINAL_VAR`, with no general code execution. Documented in DESIGN.md as
/// a fallback, not a silent substitute.
pub struct InProcessRepl {
    repo: RepoContext,
    vars: std::collections::HashMap<String, String>,
}

impl InProcessRepl {
    pub fn new(repo: RepoContext) -> Self {
        Self { repo, vars: std::collections::HashMap::new() }
    }

    pub fn execute(&mut self, code: &str) -> ExecuteResult {
        let mut output = String::new();
        for raw_line in code.lines() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(inner) = line.strip_prefix("FINAL(").and_then(|s| s.strip_suffix(')')) {
                return ExecuteResult {
                    output,
                    error: None,
                    final_answer: Some(unquote(inner)),
                };
            }
            if let Some(inner) = line.strip_prefix("FINAL_VAR(").and_then(|s| s.strip_suffix(')')) {
                let name = unquote(inner);
                return match self.vars.get(&name) {
                    Some(value) => ExecuteResult { output, error: None, final_answer: Some(value.clone()) },
                    None => ExecuteResult {
                        output,
                        error: Some(format!("FINAL_VAR: no variable named {name:?} in namespace")),
                        final_answer: None,
                    },
                };
            }
            if let Some((name, call)) = line.split_once(" = ") {
                if let Some(result) = self.eval_call(call.trim()) {
                    self.vars.insert(name.trim().to_string(), result);
                    continue;
                }
            }
            if let Some(result) = self.eval_call(line) {
                output.push_str(&result);
                output.push('\n');
                continue;
            }
            output.push_str(&format!("[unsupported in reduced-capability mode: {line}]\n"));
        }
        ExecuteResult { output, error: None, final_answer: None }
    }

    fn eval_call(&self, expr: &str) -> Option<String> {
        let (name, args) = expr.split_once('(')?;
        let args = args.strip_suffix(')')?;
        match name.trim() {
            "file_exists" => Some(environment::file_exists(&self.repo, &unquote(args)).to_string()),
            "files_containing" => Some(format!("{:?}", environment::files_containing(&self.repo, &unquote(args)))),
            "list_files_matching" => {
                Some(format!("{:?}", environment::list_files_matching(&self.repo, &unquote(args))))
            }
            _ => None,
        }
    }
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 && (s.starts_with('"') || s.starts_with('\'')) {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_process_repl_resolves_final_var() {
        let mut repl = InProcessRepl::new(RepoContext::default());
        let result = repl.execute("x = file_exists(\"a.py\")\nFINAL_VAR(x)");
        assert_eq!(result.final_answer, Some("false".to_string()));
    }

    #[test]
    fn in_process_repl_final_var_missing_is_an_error() {
        let mut repl = InProcessRepl::new(RepoContext::default());
        let result = repl.execute("FINAL_VAR(nope)");
        assert!(result.is_error());
    }

    #[test]
    fn in_process_repl_final_returns_answer() {
        let mut repl = InProcessRepl::new(RepoContext::default());
        let result = repl.execute("FINAL(\"done\")");
        assert_eq!(result.final_answer, Some("done".to_string()));
    }
}
