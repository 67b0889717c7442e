//! Runner: top-level state machine. Single-pass and loop modes,
//! dirty-tree precondition, inter-iteration commit, test-failure revert.

use std::path::Path;

use crate::backend::create_backend;
use crate::config::{RunConfig, StartAt};
use crate::error::{OrchError, OrchResult};
use crate::phases::{
    check_review_file_exists, is_working_tree_clean, iteration_commit_message, phase_commit,
    phase_fetch_pr_feedback, phase_fix, phase_fix_parallel, phase_parse_feedback, phase_respond_pr_feedback,
    phase_review, phase_test_and_heal, revert_uncommitted_changes,
};
use crate::ui_sink::UiSink;

#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub feedback_count: usize,
    pub fixes_applied: usize,
    pub iterations_used: usize,
}

/// Validates `target`/`skill`/`start_at` combinations before any phase
/// runs.
fn validate(cfg: &RunConfig) -> OrchResult<()> {
    if !cfg.target.is_dir() {
        return Err(OrchError::Validation(format!(
            "target `{}` is not a directory",
            cfg.target.display()
        )));
    }
    if matches!(cfg.start_at, StartAt::Parse | StartAt::Fix) {
        check_review_file_exists(&cfg.target)?;
    }
    if cfg.start_at == StartAt::Review && cfg.skill.is_none() && cfg.pr.is_none() && !cfg.rlm {
        return Err(OrchError::Validation(
            "--skill is required unless --start-at test, --pr, or --rlm is set".to_string(),
        ));
    }
    Ok(())
}

/// Top-level entry point; dispatches to PR-feedback mode, loop mode, or
/// single-pass mode. Returns a process exit code.
pub async fn run(cfg: &RunConfig, ui_sink: &dyn UiSink) -> OrchResult<i32> {
    validate(cfg)?;

    if cfg.pr.is_some() {
        return run_pr_feedback(cfg, ui_sink).await;
    }
    if cfg.r#loop {
        return run_loop(cfg, ui_sink).await;
    }
    run_single_pass(cfg, ui_sink).await
}

/// Single-pass mode: target validation → skill selection → review →
/// parseFeedback → fix-each → testAndHeal → summary → optional commit.
async fn run_single_pass(cfg: &RunConfig, ui_sink: &dyn UiSink) -> OrchResult<i32> {
    let mut review_backend = create_backend(cfg.review_backend(), &cfg.model);
    let mut fix_backend = create_backend(cfg.fix_backend(), &cfg.model);
    let mut test_backend = create_backend(cfg.test_backend(), &cfg.model);

    if cfg.start_at.ordinal() <= StartAt::Review.ordinal() {
        let skill = cfg
            .skill
            .ok_or_else(|| OrchError::Validation("--skill is required for the review phase".to_string()))?;
        phase_review(review_backend.as_mut(), &cfg.target, skill.skill_key(), ui_sink).await?;
    }

    if cfg.start_at.ordinal() <= StartAt::Fix.ordinal() {
        let items = phase_parse_feedback(review_backend.as_mut(), &cfg.target, ui_sink).await?;

        if cfg.review_only {
            maybe_cleanup(cfg).await;
            return Ok(0);
        }

        for item in &items {
            phase_fix(fix_backend.as_mut(), &cfg.target, item, ui_sink).await?;
        }
    }

    let outcome = phase_test_and_heal(
        test_backend.as_mut(),
        &cfg.target,
        "run the project's test suite",
        None,
        true,
        3,
        ui_sink,
    )
    .await?;

    maybe_cleanup(cfg).await;

    if !outcome.passed {
        return Ok(1);
    }

    Ok(0)
}

/// Loop mode: repeat review→parse→fix→test across iterations, reverting
/// on test failure and committing between clean, non-empty iterations.
async fn run_loop(cfg: &RunConfig, ui_sink: &dyn UiSink) -> OrchResult<i32> {
    if !is_working_tree_clean(&cfg.target).await {
        return Ok(1);
    }

    let skill = cfg
        .skill
        .ok_or_else(|| OrchError::Validation("--skill is required in loop mode".to_string()))?;

    let mut stats = RunStats::default();

    for iteration in 1..=cfg.max_iterations {
        stats.iterations_used = iteration;

        let mut review_backend = create_backend(cfg.review_backend(), &cfg.model);
        let mut fix_backend = create_backend(cfg.fix_backend(), &cfg.model);
        let mut test_backend = create_backend(cfg.test_backend(), &cfg.model);

        phase_review(review_backend.as_mut(), &cfg.target, skill.skill_key(), ui_sink).await?;
        let items = phase_parse_feedback(review_backend.as_mut(), &cfg.target, ui_sink).await?;
        stats.feedback_count += items.len();

        for item in &items {
            phase_fix(fix_backend.as_mut(), &cfg.target, item, ui_sink).await?;
            stats.fixes_applied += 1;
        }

        let test_outcome = phase_test_and_heal(
            test_backend.as_mut(),
            &cfg.target,
            "run the project's test suite",
            None,
            false,
            3,
            ui_sink,
        )
        .await?;

        if !test_outcome.passed {
            revert_uncommitted_changes(&cfg.target).await;
            return Ok(1);
        }

        if items.is_empty() {
            return Ok(0);
        }

        let message = iteration_commit_message(iteration);
        let mut commit_backend = create_backend(cfg.fix_backend(), &cfg.model);
        phase_commit(commit_backend.as_mut(), &cfg.target, &message, false, None, ui_sink).await?;
    }

    Ok(1)
}

/// PR-feedback mode: fetch → parse → fixParallel → commitPushAuto
/// (abort if zero successful) → respondPrFeedback.
async fn run_pr_feedback(cfg: &RunConfig, ui_sink: &dyn UiSink) -> OrchResult<i32> {
    let pr_number = cfg.pr.expect("caller checked cfg.pr.is_some()");
    let mut review_backend = create_backend(cfg.review_backend(), &cfg.model);

    let feedback_text = phase_fetch_pr_feedback(review_backend.as_mut(), &cfg.target, pr_number, ui_sink).await?;
    if let Some(skill) = crate::skills::detect_missing_skill(&feedback_text) {
        return Err(OrchError::MissingSkill(skill));
    }

    let items = phase_parse_feedback(review_backend.as_mut(), &cfg.target, ui_sink).await?;
    if items.is_empty() {
        return Ok(0);
    }

    let model = cfg.model.clone();
    let fix_kind = cfg.fix_backend();
    let ui_sink_arc: std::sync::Arc<dyn UiSink> = std::sync::Arc::new(crate::ui_sink::NullUiSink);
    let outcomes = phase_fix_parallel(
        move || create_backend(fix_kind, &model),
        &cfg.target,
        items,
        ui_sink_arc,
    )
    .await;

    let any_ok = outcomes.iter().any(|o| o.ok);
    if !any_ok {
        return Ok(1);
    }

    let mut commit_backend = create_backend(cfg.fix_backend(), &cfg.model);
    phase_commit(
        commit_backend.as_mut(),
        &cfg.target,
        "address PR review feedback",
        true,
        None,
        ui_sink,
    )
    .await?;

    let mut respond_backend = create_backend(cfg.review_backend(), &cfg.model);
    phase_respond_pr_feedback(respond_backend.as_mut(), &cfg.target, pr_number, &outcomes, ui_sink).await?;

    Ok(0)
}

async fn maybe_cleanup(cfg: &RunConfig) {
    if cfg.cleanup {
        let path = cfg.target.join(crate::config::REVIEW_OUTPUT_FILE);
        let _ = tokio::fs::remove_file(path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;

    #[test]
    fn validate_rejects_missing_target() {
        let mut cfg = RunConfig::default();
        cfg.target = Path::new("/nonexistent-path-for-test").to_path_buf();
        let err = validate(&cfg).unwrap_err();
        assert!(matches!(err, OrchError::Validation(_)));
    }

    #[test]
    fn validate_requires_skill_for_review_start() {
        let mut cfg = RunConfig::default();
        cfg.target = std::env::temp_dir();
        cfg.backend = BackendKind::Codex;
        let err = validate(&cfg).unwrap_err();
        assert!(matches!(err, OrchError::Validation(_)));
    }
}
