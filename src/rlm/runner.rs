//! Top-level RLM driver: builds a `RepoContext` snapshot, opens a
//! `REPLProcess`, and iterates code-block/output round trips until the
//! model calls `FINAL`/`FINAL_VAR` or the iteration budget is exhausted.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::backend::create_backend;
use crate::config::{BackendKind, DEFAULT_RLM_MAX_ITERATIONS, RLM_OUTPUT_TRUNCATION_LIMIT};
use crate::driver::run_agent;
use crate::error::OrchResult;
use crate::rlm::errors::{RlmError, RlmResult};
use crate::rlm::history::ConversationHistory;
use crate::rlm::repl::{ExecuteResult, InProcessRepl, REPLProcess, SubLmCallback};
use crate::types::{Exchange, FileInfo, RepoContext};
use crate::ui_sink::NullUiSink;

const SOURCE_EXTENSIONS: &[&str] = &[
    "py", "rs", "js", "jsx", "ts", "tsx", "go", "rb", "ex", "exs", "java", "c", "h", "cpp", "hpp",
];

const EXCLUDED_DIRS: &[&str] = &[
    ".git", "node_modules", "target", "dist", "build", "__pycache__", ".venv", "venv",
];

pub struct RlmConfig {
    pub max_iterations: usize,
    pub backend: BackendKind,
    pub sub_lm_model: String,
    pub recent_count: usize,
    pub max_history_tokens: usize,
}

impl Default for RlmConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_RLM_MAX_ITERATIONS,
            backend: BackendKind::Codex,
            sub_lm_model: "haiku".to_string(),
            recent_count: 5,
            max_history_tokens: 8_000,
        }
    }
}

pub struct RlmReport {
    pub answer: String,
    pub iterations_used: usize,
    pub completed: bool,
}

/// Sub-LM queries are stateless: every call spins up a fresh backend turn
/// with no continuation, no memory carried across sub-LM calls.
pub struct BackendSubLm {
    pub backend: BackendKind,
    pub cwd: PathBuf,
}

#[async_trait]
impl SubLmCallback for BackendSubLm {
    async fn query(&self, prompt: &str, model: &str) -> RlmResult<String> {
        let mut backend = create_backend(self.backend, model);
        let outcome = run_agent(backend.as_mut(), &self.cwd, prompt, None, None, &NullUiSink)
            .await
            .map_err(|e| RlmError::SubLmFailure(e.to_string()))?;
        Ok(outcome.final_output)
    }
}

/// Walks `target`, filtering by extension and excluded directories, and
/// builds the `RepoContext` snapshot the REPL namespace operates on.
pub fn load_codebase(target: &Path, changed_files: Option<Vec<String>>) -> OrchResult<RepoContext> {
    let mut repo = RepoContext::default();
    let mut languages = std::collections::BTreeSet::new();

    let mut builder = ignore::WalkBuilder::new(target);
    builder.hidden(false).git_ignore(true);
    for entry in builder.build() {
        let Ok(entry) = entry else { continue };
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        if path
            .components()
            .any(|c| EXCLUDED_DIRS.contains(&c.as_os_str().to_string_lossy().as_ref()))
        {
            continue;
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else { continue };
        if !SOURCE_EXTENSIONS.contains(&ext) {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(path) else { continue };
        let rel = path.strip_prefix(target).unwrap_or(path).to_string_lossy().to_string();
        languages.insert(language_for_extension(ext).to_string());
        repo.file_sizes.insert(rel.clone(), content.len());
        repo.total_tokens += content.len() / 4;
        repo.structure.insert(
            rel.clone(),
            FileInfo { language: language_for_extension(ext).to_string(), ..Default::default() },
        );
        repo.files.insert(rel, content);
    }

    repo.file_count = repo.files.len();
    repo.languages = languages.into_iter().collect();
    let mut by_size: Vec<(String, usize)> = repo.file_sizes.iter().map(|(k, v)| (k.clone(), *v)).collect();
    by_size.sort_by(|a, b| b.1.cmp(&a.1));
    by_size.truncate(10);
    repo.largest_files = by_size;
    repo.changed_files = changed_files;
    Ok(repo)
}

fn language_for_extension(ext: &str) -> &'static str {
    match ext {
        "py" => "python",
        "rs" => "rust",
        "js" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "rb" => "ruby",
        "ex" | "exs" => "elixir",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "hpp" => "cpp",
        _ => "unknown",
    }
}

/// Builds the initial system prompt: file count, languages, a preview of
/// the first 20 files, the 5 largest with sizes, and an optional PR
/// changed-files section.
pub fn build_system_prompt(repo: &RepoContext, question: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "You are reviewing a codebase with {} files across languages: {}.\n",
        repo.file_count,
        repo.languages.join(", "),
    ));
    out.push_str("Files (preview):\n");
    for path in repo.files.keys().take(20) {
        out.push_str(&format!("  {path}\n"));
    }
    if !repo.largest_files.is_empty() {
        out.push_str("Largest files:\n");
        for (path, size) in repo.largest_files.iter().take(5) {
            out.push_str(&format!("  {path} ({size} bytes)\n"));
        }
    }
    if let Some(changed) = &repo.changed_files {
        out.push_str("Changed files in this PR:\n");
        for path in changed {
            out.push_str(&format!("  {path}\n"));
        }
    }
    out.push_str(
        "\nYou have a persistent Python namespace with: repo, llm_query, llm_query_parallel, \
         files_containing, files_importing, file_exists, list_files_matching, get_file_slice. \
         Write a ```python fenced code block each turn. Call FINAL(answer) or FINAL_VAR(name) \
         when you have your answer.\n\n",
    );
    out.push_str("Question: ");
    out.push_str(question);
    out
}

/// Extracts the first fenced ```python block, or the whole trimmed
/// response if unfenced.
fn extract_code(response: &str) -> String {
    if let Some(start) = response.find("```python") {
        let after = &response[start + "```python".len()..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }
    if let Some(start) = response.find("```") {
        let after = &response[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }
    response.trim().to_string()
}

pub struct RlmRunner {
    config: RlmConfig,
    repo: RepoContext,
    cwd: PathBuf,
}

impl RlmRunner {
    pub fn new(config: RlmConfig, repo: RepoContext, cwd: PathBuf) -> Self {
        Self { config, repo, cwd }
    }

    /// Drives the review-driver backend through the iterate-until-FINAL
    /// loop, executing each code block in a `REPLProcess` (falling back to
    /// `InProcessRepl` when `python3` isn't on `PATH`).
    pub async fn run(&self, question: &str) -> OrchResult<RlmReport> {
        let sub_lm = BackendSubLm { backend: self.config.backend, cwd: self.cwd.clone() };

        let mut repl = REPLProcess::new(self.repo.clone());
        let container_mode = repl.start().await.is_ok();
        let mut fallback = if container_mode { None } else { Some(InProcessRepl::new(self.repo.clone())) };

        let mut backend = create_backend(self.config.backend, &self.config.sub_lm_model);
        let mut history = ConversationHistory::new(self.config.recent_count, self.config.max_history_tokens);
        let mut prompt = build_system_prompt(&self.repo, question);
        let mut continuation = None;

        let result = self
            .iterate(
                backend.as_mut(),
                &mut prompt,
                &mut continuation,
                &mut history,
                &mut repl,
                &mut fallback,
                &sub_lm,
            )
            .await;

        repl.stop().await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn iterate(
        &self,
        backend: &mut dyn crate::backend::Backend,
        prompt: &mut String,
        continuation: &mut Option<crate::types::ContinuationToken>,
        history: &mut ConversationHistory,
        repl: &mut REPLProcess,
        fallback: &mut Option<InProcessRepl>,
        sub_lm: &dyn SubLmCallback,
    ) -> OrchResult<RlmReport> {
        for iteration in 1..=self.config.max_iterations {
            let outcome = run_agent(backend, &self.cwd, prompt, None, continuation.as_ref(), &NullUiSink).await?;
            *continuation = outcome.continuation;

            let code = extract_code(&outcome.final_output);
            if code.is_empty() && !outcome.final_output.contains("FINAL(") {
                *prompt = "Please respond with a ```python fenced code block.".to_string();
                continue;
            }

            let exec_result = if let Some(repl_fallback) = fallback.as_mut() {
                repl_fallback.execute(&code)
            } else {
                repl.execute(&code, sub_lm).await.unwrap_or_else(|e| ExecuteResult {
                    output: String::new(),
                    error: Some(e.to_string()),
                    final_answer: None,
                })
            };

            if let Some(answer) = exec_result.final_answer {
                return Ok(RlmReport { answer, iterations_used: iteration, completed: true });
            }

            let mut output = exec_result.output;
            if output.chars().count() > RLM_OUTPUT_TRUNCATION_LIMIT {
                let truncated: String = output.chars().take(RLM_OUTPUT_TRUNCATION_LIMIT).collect();
                output = format!("{truncated}\n[truncated - use llm_query to analyze large outputs]");
            }

            history.push(Exchange { iteration, code, output: output.clone(), error: exec_result.error.clone() });

            let mut next_prompt = history.format_for_prompt();
            next_prompt.push_str("\nContinue. Write the next ```python code block, or call FINAL/FINAL_VAR.");
            if let Some(err) = &exec_result.error {
                next_prompt.push_str(&format!("\nLast execution raised:\n{err}"));
            }
            *prompt = next_prompt;
        }

        Ok(RlmReport {
            answer: "Iteration budget exhausted without a FINAL answer.".to_string(),
            iterations_used: self.config.max_iterations,
            completed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_code_pulls_fenced_python_block() {
        let response = "some text\n```python\nFINAL(1)\n```\nmore text";
        assert_eq!(extract_code(response), "FINAL(1)");
    }

    #[test]
    fn extract_code_falls_back_to_trimmed_response() {
        assert_eq!(extract_code("  FINAL(1)  "), "FINAL(1)");
    }

    #[test]
    fn language_for_extension_maps_common_cases() {
        assert_eq!(language_for_extension("py"), "python");
        assert_eq!(language_for_extension("rs"), "rust");
        assert_eq!(language_for_extension("weird"), "unknown");
    }

    #[test]
    fn build_system_prompt_includes_question_and_file_count() {
        let mut repo = RepoContext::default();
        repo.file_count = 3;
        repo.languages = vec!["python".to_string()];
        let prompt = build_system_prompt(&repo, "why does this crash?");
        assert!(prompt.contains("3 files"));
        assert!(prompt.contains("why does this crash?"));
    }
}
