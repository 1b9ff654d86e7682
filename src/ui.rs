//! Output sink for user-facing build progress.

use std::sync::Mutex;

/// User-facing output of a build.
///
/// Steps report progress through the `Ui` seeded into the state bag rather
/// than logging directly, so a host application can route messages to its
/// own display.
pub trait Ui: Send + Sync {
    /// A top-level progress line (e.g. "Creating instance...").
    fn say(&self, message: &str);

    /// A detail line under the current progress line.
    fn message(&self, message: &str);

    /// A user-visible error.
    fn error(&self, message: &str);
}

/// Ui that forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogUi;

impl Ui for LogUi {
    fn say(&self, message: &str) {
        tracing::info!("==> {}", message);
    }

    fn message(&self, message: &str) {
        tracing::info!("    {}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!("{}", message);
    }
}

/// Ui that records every line, for tests and embedding.
#[derive(Debug, Default)]
pub struct CollectingUi {
    lines: Mutex<Vec<String>>,
}

impl CollectingUi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all recorded lines, prefixed with their kind.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn push(&self, line: String) {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(line);
    }
}

impl Ui for CollectingUi {
    fn say(&self, message: &str) {
        self.push(format!("say: {}", message));
    }

    fn message(&self, message: &str) {
        self.push(format!("message: {}", message));
    }

    fn error(&self, message: &str) {
        self.push(format!("error: {}", message));
    }
}
