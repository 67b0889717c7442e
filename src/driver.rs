//! Agent driver: thin adapter that consumes a backend's event stream,
//! forwards tool/text events to a UI sink, and accumulates the turn's
//! final output and continuation.

use std::path::Path;

use futures::StreamExt;

use crate::backend::Backend;
use crate::error::OrchResult;
use crate::types::{AgentEvent, ContinuationToken};
use crate::ui_sink::UiSink;

/// Outcome of one backend turn.
pub struct TurnOutcome {
    pub final_output: String,
    pub structured_output: Option<serde_json::Value>,
    pub continuation: Option<ContinuationToken>,
}

/// Drives one backend turn to completion. Errors raised inside the stream
/// propagate to the caller.
pub async fn run_agent(
    backend: &mut dyn Backend,
    cwd: &Path,
    prompt: &str,
    schema: Option<&serde_json::Value>,
    continuation: Option<&ContinuationToken>,
    ui_sink: &dyn UiSink,
) -> OrchResult<TurnOutcome> {
    let mut stream = backend.execute(cwd, prompt, schema, continuation).await?;

    let mut final_output = String::new();
    let mut structured_output = None;
    let mut next_continuation = None;

    while let Some(event) = stream.next().await {
        match event? {
            AgentEvent::Text { text } => {
                ui_sink.on_text(&text);
                final_output.push_str(&text);
            }
            AgentEvent::Thinking { text } => {
                ui_sink.on_thinking(&text);
            }
            AgentEvent::ToolStart { id, name, input } => {
                ui_sink.on_tool_start(&id, &name, &input);
            }
            AgentEvent::ToolResult { id, output, is_error } => {
                ui_sink.on_tool_result(&id, &output, is_error);
            }
            AgentEvent::Cost { cost_usd, input_tokens, output_tokens } => {
                ui_sink.on_cost(cost_usd, input_tokens, output_tokens);
            }
            AgentEvent::Result { structured_output: so, continuation: cont } => {
                structured_output = so;
                next_continuation = cont;
            }
        }
    }

    Ok(TurnOutcome {
        final_output,
        structured_output,
        continuation: next_continuation,
    })
}
