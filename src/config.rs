//! Constants and run configuration. CLI parsing is a small hand-rolled
//! `std::env::args()` loop rather than pulling in an argument-parsing
//! crate — the argument surface is small and fixed.

use std::path::PathBuf;

use crate::error::{OrchError, OrchResult};

pub const REVIEW_OUTPUT_FILE: &str = ".review-output.md";
pub const UNKNOWN_SKILL_PATTERN: &str = r"Unknown skill: ([\w:-]+)";
pub const RLM_OUTPUT_TRUNCATION_LIMIT: usize = 50_000;
pub const DEFAULT_MAX_ITERATIONS: usize = 5;
pub const DEFAULT_RLM_MAX_ITERATIONS: usize = 50;
pub const FIX_PARALLEL_CAPACITY: usize = 4;
pub const GRACEFUL_TERMINATE_GRACE_SECS: u64 = 5;
pub const DEFAULT_RLM_QUESTION: &str =
    "Review this codebase end to end and report any significant bugs, correctness issues, or risks you find.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Claude,
    Codex,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Claude => "claude",
            BackendKind::Codex => "codex",
        }
    }

    pub fn parse(s: &str) -> OrchResult<Self> {
        match s {
            "claude" => Ok(BackendKind::Claude),
            "codex" => Ok(BackendKind::Codex),
            other => Err(OrchError::Validation(format!(
                "unknown backend `{other}`, expected `claude` or `codex`"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewSkill {
    Python,
    React,
    Elixir,
}

impl ReviewSkill {
    /// Maps the CLI shorthand to the full skill key.
    pub fn skill_key(self) -> &'static str {
        match self {
            ReviewSkill::Python => "beagle-python:review-python",
            ReviewSkill::React => "beagle-frontend:review-react",
            ReviewSkill::Elixir => "beagle-elixir:review-elixir",
        }
    }

    pub fn parse(s: &str) -> OrchResult<Self> {
        match s {
            "python" => Ok(ReviewSkill::Python),
            "react" | "frontend" => Ok(ReviewSkill::React),
            "elixir" => Ok(ReviewSkill::Elixir),
            other => Err(OrchError::Validation(format!(
                "unknown skill `{other}`, expected python, react, frontend, or elixir"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAt {
    Review,
    Parse,
    Fix,
    Test,
}

impl StartAt {
    /// Ordinal position in the review→parse→fix→test chain. A phase at
    /// ordinal `k` runs iff `start_at`'s ordinal is `<= k` (open question
    /// resolution: `start_at` names the first phase to run; every later
    /// phase in the chain still runs — see DESIGN.md).
    pub fn ordinal(self) -> u8 {
        match self {
            StartAt::Review => 0,
            StartAt::Parse => 1,
            StartAt::Fix => 2,
            StartAt::Test => 3,
        }
    }

    pub fn parse(s: &str) -> OrchResult<Self> {
        match s {
            "review" => Ok(StartAt::Review),
            "parse" => Ok(StartAt::Parse),
            "fix" => Ok(StartAt::Fix),
            "test" => Ok(StartAt::Test),
            other => Err(OrchError::Validation(format!(
                "unknown --start-at `{other}`"
            ))),
        }
    }
}

/// Top-level run configuration, assembled from CLI flags. Carries the
/// loop-mode fields unconditionally, regardless of which mode ends up
/// running.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub target: PathBuf,
    pub skill: Option<ReviewSkill>,
    pub model: String,
    pub backend: BackendKind,
    pub review_backend: Option<BackendKind>,
    pub fix_backend: Option<BackendKind>,
    pub test_backend: Option<BackendKind>,
    pub start_at: StartAt,
    pub review_only: bool,
    pub r#loop: bool,
    pub max_iterations: usize,
    pub debug: bool,
    pub cleanup: bool,
    pub pr: Option<i64>,
    pub bot: Option<String>,
    pub rlm: bool,
    /// The question the RLM REPL answers about the repository; without
    /// one `--rlm` would have no task. Defaults to a generic review
    /// prompt.
    pub question: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            target: PathBuf::from("."),
            skill: None,
            model: "gpt-5.3-codex".to_string(),
            backend: BackendKind::Codex,
            review_backend: None,
            fix_backend: None,
            test_backend: None,
            start_at: StartAt::Review,
            review_only: false,
            r#loop: false,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            debug: false,
            cleanup: false,
            pr: None,
            bot: None,
            rlm: false,
            question: None,
        }
    }
}

impl RunConfig {
    pub fn review_backend(&self) -> BackendKind {
        self.review_backend.unwrap_or(self.backend)
    }

    pub fn fix_backend(&self) -> BackendKind {
        self.fix_backend.unwrap_or(self.backend)
    }

    pub fn test_backend(&self) -> BackendKind {
        self.test_backend.unwrap_or(self.backend)
    }

    /// Parses `std::env::args()` (excluding argv[0]) into a `RunConfig`.
    pub fn parse_args(args: &[String]) -> OrchResult<Self> {
        let mut cfg = RunConfig::default();
        let mut i = 0;
        while i < args.len() {
            let arg = args[i].as_str();
            macro_rules! next_val {
                () => {{
                    i += 1;
                    args.get(i).cloned().ok_or_else(|| {
                        OrchError::Validation(format!("missing value for {arg}"))
                    })?
                }};
            }
            match arg {
                "--target" => cfg.target = PathBuf::from(next_val!()),
                "--skill" => cfg.skill = Some(ReviewSkill::parse(&next_val!())?),
                "--model" => cfg.model = next_val!(),
                "--backend" => cfg.backend = BackendKind::parse(&next_val!())?,
                "--review-backend" => cfg.review_backend = Some(BackendKind::parse(&next_val!())?),
                "--fix-backend" => cfg.fix_backend = Some(BackendKind::parse(&next_val!())?),
                "--test-backend" => cfg.test_backend = Some(BackendKind::parse(&next_val!())?),
                "--start-at" => cfg.start_at = StartAt::parse(&next_val!())?,
                "--review-only" => cfg.review_only = true,
                "--loop" => cfg.r#loop = true,
                "--max-iterations" => {
                    let raw = next_val!();
                    cfg.max_iterations = raw.parse::<usize>().map_err(|_| {
                        OrchError::Validation(format!("invalid --max-iterations value `{raw}`"))
                    })?;
                    if cfg.max_iterations < 1 {
                        return Err(OrchError::Validation(
                            "--max-iterations must be >= 1".to_string(),
                        ));
                    }
                }
                "--debug" => cfg.debug = true,
                "--cleanup" => cfg.cleanup = true,
                "--pr" => {
                    let raw = next_val!();
                    cfg.pr = Some(raw.parse::<i64>().map_err(|_| {
                        OrchError::Validation(format!("invalid --pr value `{raw}`"))
                    })?);
                }
                "--bot" => cfg.bot = Some(next_val!()),
                "--rlm" => cfg.rlm = true,
                "--question" => cfg.question = Some(next_val!()),
                other => {
                    return Err(OrchError::Validation(format!("unrecognized flag `{other}`")));
                }
            }
            i += 1;
        }
        Ok(cfg)
    }
}
