//! Recursive-LM REPL: a sandboxed code-execution loop in which a
//! "root" model emits code executed against the codebase, iterating with
//! truncated-output discipline until a `FINAL` sentinel or the iteration
//! budget is exhausted.

pub mod child_script;
pub mod environment;
pub mod errors;
pub mod history;
pub mod ipc;
pub mod repl;
pub mod runner;
