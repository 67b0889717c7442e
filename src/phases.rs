//! Phases: pure orchestration steps over backends and the filesystem.

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Semaphore;

use crate::backend::Backend;
use crate::config::{FIX_PARALLEL_CAPACITY, REVIEW_OUTPUT_FILE};
use crate::driver::run_agent;
use crate::error::{OrchError, OrchResult};
use crate::skills::detect_missing_skill;
use crate::types::{ContinuationToken, FeedbackItem, FixOutcome, TestAndHealOutcome};
use crate::ui_sink::UiSink;

const GIT_TIMEOUT: Duration = Duration::from_secs(5);

async fn run_git(cwd: &Path, args: &[&str]) -> Option<String> {
    let fut = Command::new("git").args(args).current_dir(cwd).output();
    match tokio::time::timeout(GIT_TIMEOUT, fut).await {
        Ok(Ok(output)) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
        }
        _ => None,
    }
}

/// Tries `symbolic-ref refs/remotes/origin/HEAD`, then probes `main`, then
/// `master`.
pub async fn detect_default_branch(cwd: &Path) -> String {
    if let Some(out) = run_git(cwd, &["symbolic-ref", "refs/remotes/origin/HEAD"]).await {
        if let Some(name) = out.rsplit('/').next() {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    for candidate in ["main", "master"] {
        if run_git(cwd, &["rev-parse", "--verify", candidate])
            .await
            .is_some()
        {
            return candidate.to_string();
        }
    }
    "main".to_string()
}

/// Raises a `ValidationError` when the review artifact is missing.
pub fn check_review_file_exists(cwd: &Path) -> OrchResult<()> {
    let path = cwd.join(REVIEW_OUTPUT_FILE);
    if path.exists() {
        Ok(())
    } else {
        Err(OrchError::Validation(format!(
            "Review file not found at {}. Run review first or remove --start-at.",
            path.display()
        )))
    }
}

/// Resets tracked-file modifications and removes untracked files. Returns
/// `false` (non-fatal) when `cwd` is not inside a git repository.
pub async fn revert_uncommitted_changes(cwd: &Path) -> bool {
    if run_git(cwd, &["rev-parse", "--is-inside-work-tree"])
        .await
        .is_none()
    {
        return false;
    }
    let _ = run_git(cwd, &["checkout", "--", "."]).await;
    let _ = run_git(cwd, &["clean", "-fd"]).await;
    true
}

/// Working tree is clean iff `git status --porcelain` is empty. Loop mode's
/// entry-state precondition.
pub async fn is_working_tree_clean(cwd: &Path) -> bool {
    match run_git(cwd, &["status", "--porcelain"]).await {
        Some(out) => out.trim().is_empty(),
        None => true,
    }
}

/// **review**: embeds a diff instruction and the absolute review-artifact
/// path, and invokes the chosen review skill.
pub async fn phase_review(
    backend: &mut dyn Backend,
    cwd: &Path,
    skill_key: &str,
    ui_sink: &dyn UiSink,
) -> OrchResult<Option<ContinuationToken>> {
    let base = detect_default_branch(cwd).await;
    let review_path = cwd.join(REVIEW_OUTPUT_FILE);
    let invocation = backend.format_skill_invocation(skill_key, None);
    let prompt = format!(
        "{invocation}\n\nReview the changes introduced by `git diff {base}...HEAD`.\n\
         Write your findings to the absolute path {} (markdown).",
        review_path.display()
    );

    let outcome = run_agent(backend, cwd, &prompt, None, None, ui_sink).await?;
    if let Some(skill) = detect_missing_skill(&outcome.final_output) {
        return Err(OrchError::MissingSkill(skill));
    }
    Ok(outcome.continuation)
}

/// `{issues: [{id:int, description:str, file:str, line:int}]}`.
fn feedback_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "issues": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": { "type": "integer" },
                        "description": { "type": "string" },
                        "file": { "type": "string" },
                        "line": { "type": "integer" }
                    },
                    "required": ["id", "description", "file", "line"]
                }
            }
        },
        "required": ["issues"]
    })
}

/// **parseFeedback**: loads the review artifact and asks the backend to
/// extract structured issues from it. Empty/whitespace text is zero
/// issues, not a failure.
pub async fn phase_parse_feedback(
    backend: &mut dyn Backend,
    cwd: &Path,
    ui_sink: &dyn UiSink,
) -> OrchResult<Vec<FeedbackItem>> {
    let review_path = cwd.join(REVIEW_OUTPUT_FILE);
    let review_text = tokio::fs::read_to_string(&review_path)
        .await
        .map_err(|e| OrchError::Validation(format!("failed to read {}: {e}", review_path.display())))?;

    let prompt = format!(
        "Extract actionable review issues from the following review notes as JSON \
         matching the required schema. If there are no actionable issues, return an \
         empty `issues` array.\n\n{review_text}"
    );

    let schema = feedback_schema();
    let outcome = run_agent(backend, cwd, &prompt, Some(&schema), None, ui_sink).await?;

    parse_feedback_result(outcome.structured_output, &outcome.final_output)
}

/// Pulled out of `phase_parse_feedback` so the fallback-chain logic is
/// independently testable without a backend.
fn parse_feedback_result(
    structured_output: Option<Value>,
    final_text: &str,
) -> OrchResult<Vec<FeedbackItem>> {
    if let Some(value) = structured_output {
        return extract_issues(&value);
    }

    let trimmed = final_text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => extract_issues(&value),
        Err(_) => Err(OrchError::ParseFailure(format!(
            "neither structured output nor text was valid JSON: {}",
            truncate(trimmed, 200)
        ))),
    }
}

fn extract_issues(value: &Value) -> OrchResult<Vec<FeedbackItem>> {
    let Some(issues) = value.get("issues").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    let mut items = Vec::with_capacity(issues.len());
    for raw in issues {
        let item: FeedbackItem = serde_json::from_value(raw.clone())
            .map_err(|e| OrchError::ParseFailure(format!("malformed issue entry: {e}")))?;
        items.push(item);
    }
    Ok(items)
}

fn truncate(s: &str, n: usize) -> String {
    if s.chars().count() <= n {
        s.to_string()
    } else {
        s.chars().take(n).collect()
    }
}

/// **fix**: one agent turn per item, instructing a minimal targeted change.
pub async fn phase_fix(
    backend: &mut dyn Backend,
    cwd: &Path,
    item: &FeedbackItem,
    ui_sink: &dyn UiSink,
) -> OrchResult<()> {
    let prompt = format!(
        "Fix the following review issue with the minimal change necessary. \
         Do not refactor unrelated code.\n\nFile: {}\nLine: {}\nIssue: {}",
        item.file, item.line, item.description
    );
    run_agent(backend, cwd, &prompt, None, None, ui_sink).await?;
    Ok(())
}

/// **fixParallel**: all items concurrently, bounded by a 4-slot capacity
/// limiter; independent per-item failures never abort the group.
pub async fn phase_fix_parallel(
    make_backend: impl Fn() -> Box<dyn Backend> + Send + Sync + 'static,
    cwd: &Path,
    items: Vec<FeedbackItem>,
    ui_sink: std::sync::Arc<dyn UiSink>,
) -> Vec<FixOutcome> {
    let semaphore = std::sync::Arc::new(Semaphore::new(FIX_PARALLEL_CAPACITY));
    let make_backend = std::sync::Arc::new(make_backend);
    let mut handles = Vec::with_capacity(items.len());

    for item in items {
        let semaphore = semaphore.clone();
        let cwd = cwd.to_path_buf();
        let make_backend = make_backend.clone();
        let ui_sink = ui_sink.clone();
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
            let mut backend = make_backend();
            let result = phase_fix(backend.as_mut(), &cwd, &item, ui_sink.as_ref()).await;
            match result {
                Ok(()) => FixOutcome { item, ok: true, error: None },
                Err(e) => FixOutcome { item, ok: false, error: Some(e.to_string()) },
            }
        }));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                // Task panicked — record as a failed outcome rather than
                // aborting the rest of the group.
                log::error!("fix task panicked: {e}");
            }
        }
    }
    outcomes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMenuChoice {
    Retry,
    FixAndRetry,
    IgnoreAndContinue,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestVerdict {
    Passed,
    Failed,
    Unclear,
}

/// Pulls the integer preceding `keyword` out of a summary line, e.g.
/// `count_before("5 passed, 0 failed", "failed")` == `Some(0)`. Anchoring
/// on the count (rather than bare substring presence) is what lets
/// `"0 failed"` read as a pass signal instead of a failure one.
fn count_before(text: &str, keyword: &str) -> Option<u64> {
    let re = Regex::new(&format!(r"(\d+)\s+{keyword}")).ok()?;
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

/// Best-effort textual classifier. Left deliberately approximate: the
/// exact success-marker phrase(s) are an external collaborator's own
/// heuristic, not something this crate can pin down generically.
pub fn detect_test_success(output: &str) -> TestVerdict {
    let lower = output.to_lowercase();

    let hard_fail_markers = ["panicked at", "traceback (most recent call last)"];
    if hard_fail_markers.iter().any(|m| lower.contains(m)) {
        return TestVerdict::Failed;
    }

    // Count-anchored markers take priority: a summary line naming both
    // words ("5 passed, 0 failed") is decisive once the counts are read.
    match (count_before(&lower, "failed"), count_before(&lower, "passed")) {
        (Some(f), _) if f > 0 => return TestVerdict::Failed,
        (Some(0), _) => return TestVerdict::Passed,
        (None, Some(p)) if p > 0 => return TestVerdict::Passed,
        _ => {}
    }

    let has_fail_marker = ["failed", "failure", "error:"].iter().any(|m| lower.contains(m));
    let has_pass_marker = ["all tests passed", "ok."].iter().any(|m| lower.contains(m));

    match (has_pass_marker, has_fail_marker) {
        (true, false) => TestVerdict::Passed,
        (false, true) => TestVerdict::Failed,
        (true, true) => TestVerdict::Unclear,
        (false, false) => TestVerdict::Unclear,
    }
}

/// Presents the `{retry, fix-and-retry, ignore-and-continue, abort}` menu
/// on stdin/stdout and blocks (asynchronously) until a recognized choice
/// comes back. A closed stdin (piped/non-interactive invocation) is
/// treated as `abort` rather than looping forever.
async fn prompt_test_menu() -> TestMenuChoice {
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let _ = stdout
            .write_all(
                b"Test results were ambiguous. Choose an action:\n\
                  \x20 1) retry\n\
                  \x20 2) fix-and-retry\n\
                  \x20 3) ignore-and-continue\n\
                  \x20 4) abort\n> ",
            )
            .await;
        let _ = stdout.flush().await;

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => return TestMenuChoice::Abort,
        };

        match line.trim().to_lowercase().as_str() {
            "1" | "retry" => return TestMenuChoice::Retry,
            "2" | "fix-and-retry" | "fix" => return TestMenuChoice::FixAndRetry,
            "3" | "ignore-and-continue" | "ignore" => return TestMenuChoice::IgnoreAndContinue,
            "4" | "abort" => return TestMenuChoice::Abort,
            other => {
                let _ = stdout
                    .write_all(format!("Unrecognized choice `{other}`.\n").as_bytes())
                    .await;
            }
        }
    }
}

/// **testAndHeal**: runs the test suite, classifies success, and resolves
/// ambiguity via a menu. A `Failed` verdict is decisive and always goes
/// straight to fix-and-retry; only a genuinely `Unclear` verdict consults
/// the menu, and only when `interactive` is set. Non-interactive
/// (loop-mode) callers should pass `interactive=false`, which auto-resolves
/// `Unclear` to `FixAndRetry` (see DESIGN.md).
pub async fn phase_test_and_heal(
    backend: &mut dyn Backend,
    cwd: &Path,
    test_command: &str,
    mut continuation: Option<ContinuationToken>,
    interactive: bool,
    max_retries: usize,
    ui_sink: &dyn UiSink,
) -> OrchResult<TestAndHealOutcome> {
    let mut retries_used = 0;
    loop {
        let prompt = format!("Run the test suite with: {test_command}");
        let outcome = run_agent(backend, cwd, &prompt, None, continuation.as_ref(), ui_sink).await?;
        continuation = outcome.continuation;

        let verdict = detect_test_success(&outcome.final_output);
        let resolved = match verdict {
            TestVerdict::Passed => return Ok(TestAndHealOutcome { passed: true, retries_used }),
            TestVerdict::Failed => TestMenuChoice::FixAndRetry,
            TestVerdict::Unclear => {
                if interactive {
                    prompt_test_menu().await
                } else {
                    TestMenuChoice::FixAndRetry
                }
            }
        };

        if retries_used >= max_retries || resolved == TestMenuChoice::Abort {
            return Ok(TestAndHealOutcome { passed: false, retries_used });
        }
        if resolved == TestMenuChoice::IgnoreAndContinue {
            return Ok(TestAndHealOutcome { passed: true, retries_used });
        }
        if resolved == TestMenuChoice::Retry {
            retries_used += 1;
            continue;
        }

        let fix_prompt = format!(
            "The test run above failed. Fix the issue, then the suite will be re-run.\n\n{}",
            outcome.final_output
        );
        run_agent(backend, cwd, &fix_prompt, None, continuation.as_ref(), ui_sink).await?;
        retries_used += 1;
    }
}

/// **commit** / **commitPushAuto**: invokes the commit-push skill. The
/// auto variant instructs the agent to skip any confirmation prompt.
pub async fn phase_commit(
    backend: &mut dyn Backend,
    cwd: &Path,
    message: &str,
    auto: bool,
    continuation: Option<&ContinuationToken>,
    ui_sink: &dyn UiSink,
) -> OrchResult<Option<ContinuationToken>> {
    let invocation = backend.format_skill_invocation("commit-push", None);
    let mut prompt = format!("{invocation}\n\n{message}");
    if auto {
        prompt.push_str("\n\nDo not ask for confirmation; proceed automatically.");
    }
    let outcome = run_agent(backend, cwd, &prompt, None, continuation, ui_sink).await?;
    Ok(outcome.continuation)
}

/// Loop mode's inter-iteration commit message. Must contain the literal
/// substrings `"commit all"`, `"do not push"`, and `"iteration {i}"`.
pub fn iteration_commit_message(iteration: usize) -> String {
    format!(
        "commit all staged and unstaged changes from iteration {iteration}; do not push"
    )
}

/// **fetchPrFeedback**: wraps a named skill.
pub async fn phase_fetch_pr_feedback(
    backend: &mut dyn Backend,
    cwd: &Path,
    pr_number: i64,
    ui_sink: &dyn UiSink,
) -> OrchResult<String> {
    let invocation = backend.format_skill_invocation("fetch-pr-feedback", Some(&pr_number.to_string()));
    let outcome = run_agent(backend, cwd, &invocation, None, None, ui_sink).await?;
    Ok(outcome.final_output)
}

/// **respondPrFeedback**: responds using only the successful subset of
/// `fixParallel`'s results.
pub async fn phase_respond_pr_feedback(
    backend: &mut dyn Backend,
    cwd: &Path,
    pr_number: i64,
    fix_outcomes: &[FixOutcome],
    ui_sink: &dyn UiSink,
) -> OrchResult<()> {
    let successful: Vec<&FixOutcome> = fix_outcomes.iter().filter(|o| o.ok).collect();
    let summary = successful
        .iter()
        .map(|o| format!("- {} ({})", o.item.description, o.item.file))
        .collect::<Vec<_>>()
        .join("\n");
    let invocation = backend.format_skill_invocation("respond-pr-feedback", Some(&pr_number.to_string()));
    let prompt = format!("{invocation}\n\nAddressed:\n{summary}");
    run_agent(backend, cwd, &prompt, None, None, ui_sink).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_feedback_empty_text_is_zero_issues() {
        let result = parse_feedback_result(None, "   ").unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn parse_feedback_falls_back_to_raw_text_json() {
        let text = r#"{"issues":[{"id":1,"description":"d","file":"f.py","line":3}]}"#;
        let result = parse_feedback_result(None, text).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].file, "f.py");
    }

    #[test]
    fn parse_feedback_rejects_non_json_text() {
        let err = parse_feedback_result(None, "not json at all").unwrap_err();
        assert!(matches!(err, OrchError::ParseFailure(_)));
    }

    #[test]
    fn parse_feedback_prefers_structured_output() {
        let structured = json!({ "issues": [] });
        let result = parse_feedback_result(Some(structured), "ignored text").unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn detect_test_success_classifies_clear_pass() {
        assert_eq!(detect_test_success("5 passed, 0 failed"), TestVerdict::Passed);
    }

    #[test]
    fn detect_test_success_classifies_clear_fail() {
        // "2 failed" is a decisive nonzero count, not merely the bare
        // substring "failed" — it's unambiguous even alongside "error:".
        assert_eq!(detect_test_success("2 failed, traceback: error:"), TestVerdict::Failed);
        assert_eq!(detect_test_success("FAILED test_foo"), TestVerdict::Failed);
    }

    #[test]
    fn detect_test_success_reports_unclear_without_any_marker() {
        assert_eq!(detect_test_success("done."), TestVerdict::Unclear);
    }

    #[test]
    fn iteration_commit_message_has_required_substrings() {
        let msg = iteration_commit_message(3);
        assert!(msg.contains("commit all"));
        assert!(msg.contains("do not push"));
        assert!(msg.contains("iteration 3"));
    }
}
