//! Backend interface: a uniform contract over in-process SDK-style
//! clients and external CLI subprocesses.

pub mod sdk;
pub mod subprocess;

use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::config::BackendKind;
use crate::error::OrchResult;
use crate::types::{AgentEvent, ContinuationToken};

pub type BoxEventStream = Pin<Box<dyn Stream<Item = OrchResult<AgentEvent>> + Send>>;

/// Contract implemented by every agent backend. `execute` returns a lazy,
/// finite, single-consumer stream; the stream always ends with one
/// `AgentEvent::Result` unless a failure is raised.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn execute(
        &mut self,
        cwd: &Path,
        prompt: &str,
        output_schema: Option<&serde_json::Value>,
        continuation: Option<&ContinuationToken>,
    ) -> OrchResult<BoxEventStream>;

    /// Idempotent. Causes any in-flight `execute` to terminate within a
    /// small fixed grace period before a hard kill.
    async fn cancel(&mut self);

    /// Pure function from a skill key + optional args to the textual form
    /// this backend expects embedded in the prompt.
    fn format_skill_invocation(&self, skill_key: &str, args: Option<&str>) -> String;

    fn name(&self) -> &'static str;
}

/// Builds the backend named by `kind`.
pub fn create_backend(kind: BackendKind, model: &str) -> Box<dyn Backend> {
    match kind {
        BackendKind::Codex => Box::new(subprocess::CodexBackend::new(model)),
        BackendKind::Claude => Box::new(sdk::ClaudeBackend::new(model)),
    }
}

/// Strips a `"namespace:name"` skill key down to `"name"`. Shared by both
/// backends' `format_skill_invocation` (Codex strips; Claude does not, but
/// exposes this for symmetry/testing).
pub(crate) fn strip_namespace(skill_key: &str) -> &str {
    match skill_key.rsplit_once(':') {
        Some((_, name)) => name,
        None => skill_key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_namespace_removes_prefix() {
        assert_eq!(strip_namespace("beagle-python:review-python"), "review-python");
        assert_eq!(strip_namespace("review-python"), "review-python");
    }
}
