//! Core event/data model shared by every backend, phase, and the runner.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One step of an agent turn. Exactly one variant per value; a turn is a
/// sequence of these ending in exactly one `Result` (or a raised error).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum AgentEvent {
    /// Model-visible prose.
    Text { text: String },
    /// Internal reasoning; may never appear for a given backend/turn.
    Thinking { text: String },
    /// `id` is unique within the turn; `input` is a free-form mapping.
    ToolStart {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// `id` must match an earlier `ToolStart` in the same turn, 1:1.
    ToolResult {
        id: String,
        output: String,
        is_error: bool,
    },
    /// Any field may be absent when the backend doesn't supply it.
    Cost {
        #[serde(skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        input_tokens: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output_tokens: Option<u64>,
    },
    /// Terminal event. Every turn ends with exactly one of these.
    Result {
        #[serde(skip_serializing_if = "Option::is_none")]
        structured_output: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        continuation: Option<ContinuationToken>,
    },
}

/// Opaque to callers outside the originating backend. Passing a token to a
/// backend whose name doesn't match `backend` must be ignored by that
/// backend (not an error).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContinuationToken {
    pub backend: String,
    pub data: serde_json::Value,
}

/// One actionable review finding, as parsed from the structured output of
/// `parseFeedback`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackItem {
    pub id: i64,
    pub description: String,
    pub file: String,
    pub line: i64,
}

/// Per-iteration bookkeeping threaded through the runner.
#[derive(Debug, Clone, Default)]
pub struct PhaseState {
    pub feedback_items: Vec<FeedbackItem>,
    pub fixes_applied: usize,
    pub test_retries: usize,
    pub tests_passed: Option<bool>,
}

/// Outcome of test-and-heal: whether the suite ultimately passed and how
/// many retries were consumed getting there.
#[derive(Debug, Clone, Copy)]
pub struct TestAndHealOutcome {
    pub passed: bool,
    pub retries_used: usize,
}

/// Result of one item in `fixParallel`: captured independently, never
/// aborts the group.
#[derive(Debug, Clone)]
pub struct FixOutcome {
    pub item: FeedbackItem,
    pub ok: bool,
    pub error: Option<String>,
}

/// Structural info about one source file, populated when a parser is
/// wired; left empty otherwise.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileInfo {
    pub language: String,
    pub functions: Vec<String>,
    pub classes: Vec<String>,
    pub imports: Vec<String>,
    pub exports: Vec<String>,
}

/// A logical grouping of files under one root, used by the RLM namespace
/// to expose coarse-grained "services" inside a monorepo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub root: String,
    pub files: Vec<String>,
    pub dependencies: Vec<String>,
}

/// Full in-memory snapshot of the repository, built once per RLM run and
/// read-only thereafter (safe to share across sub-LM callbacks).
#[derive(Debug, Clone, Default)]
pub struct RepoContext {
    pub files: BTreeMap<String, String>,
    pub structure: BTreeMap<String, FileInfo>,
    pub services: BTreeMap<String, Service>,
    pub file_sizes: BTreeMap<String, usize>,
    pub total_tokens: usize,
    pub file_count: usize,
    pub largest_files: Vec<(String, usize)>,
    pub languages: Vec<String>,
    pub changed_files: Option<Vec<String>>,
}

/// One round-trip of the RLM REPL loop.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub iteration: usize,
    pub code: String,
    pub output: String,
    pub error: Option<String>,
}

impl Exchange {
    /// Token estimate = (len(code)+len(output)+len(error)) / 4.
    pub fn token_estimate(&self) -> usize {
        let err_len = self.error.as_ref().map(|e| e.len()).unwrap_or(0);
        (self.code.len() + self.output.len() + err_len) / 4
    }
}
