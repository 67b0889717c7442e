//! Single append-only debug log, `.review-debug-<timestamp>.log`, shared
//! process-wide when `--debug` is set.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct DebugLog {
    inner: Option<Arc<Mutex<File>>>,
}

impl DebugLog {
    /// A no-op sink, used when `--debug` is not set.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    pub fn enabled_in(cwd: &Path) -> std::io::Result<Self> {
        let ts = chrono::Local::now().format("%Y%m%d%H%M%S");
        let path = cwd.join(format!(".review-debug-{ts}.log"));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            inner: Some(Arc::new(Mutex::new(file))),
        })
    }

    /// Appends one line. Failures to write are swallowed — debug logging
    /// must never be the reason a run fails.
    pub fn log(&self, line: &str) {
        if let Some(file) = &self.inner {
            if let Ok(mut f) = file.lock() {
                let _ = writeln!(f, "{line}");
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }
}
