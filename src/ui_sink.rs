//! Minimal UI sink. Terminal rendering is out of scope here; this exists
//! only so the agent driver genuinely forwards tool/text events to a
//! sink without this crate owning a TUI.

use crate::debug_log::DebugLog;

pub trait UiSink: Send + Sync {
    fn on_text(&self, _text: &str) {}
    fn on_thinking(&self, _text: &str) {}
    fn on_tool_start(&self, _id: &str, _name: &str, _input: &serde_json::Value) {}
    fn on_tool_result(&self, _id: &str, _output: &str, _is_error: bool) {}
    fn on_cost(&self, _cost_usd: Option<f64>, _input_tokens: Option<u64>, _output_tokens: Option<u64>) {}
}

/// Discards everything. Used by default and by tests.
pub struct NullUiSink;

impl UiSink for NullUiSink {}

/// Forwards every event to the debug log, tagged by kind.
pub struct DebugUiSink {
    pub log: DebugLog,
}

impl UiSink for DebugUiSink {
    fn on_text(&self, text: &str) {
        self.log.log(&format!("[TEXT] {text}"));
    }

    fn on_thinking(&self, text: &str) {
        self.log.log(&format!("[THINKING] {text}"));
    }

    fn on_tool_start(&self, id: &str, name: &str, input: &serde_json::Value) {
        self.log.log(&format!("[TOOL_START] id={id} name={name} input={input}"));
    }

    fn on_tool_result(&self, id: &str, output: &str, is_error: bool) {
        self.log
            .log(&format!("[TOOL_RESULT] id={id} is_error={is_error} output={output}"));
    }

    fn on_cost(&self, cost_usd: Option<f64>, input_tokens: Option<u64>, output_tokens: Option<u64>) {
        self.log.log(&format!(
            "[COST] cost_usd={cost_usd:?} input_tokens={input_tokens:?} output_tokens={output_tokens:?}"
        ));
    }
}
