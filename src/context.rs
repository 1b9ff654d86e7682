//! Cancellation signal for one provisioning run.
//!
//! A [`BuildContext`] is cheap to clone; every clone observes the same
//! cancellation. It is cancelled either explicitly through
//! [`BuildContext::cancel`] (from any thread) or implicitly once its optional
//! deadline has passed. Steps and the runner check it at the top of every
//! step; waits check it between polls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::QcbakeError;

#[derive(Debug, Default)]
struct Signal {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// Cancellation handle shared between the caller and the pipeline.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    signal: Arc<Signal>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
}

impl BuildContext {
    /// Creates a context that is only cancelled explicitly.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context that is cancelled `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            signal: Arc::default(),
            deadline: Some(Instant::now() + timeout),
            timeout: Some(timeout),
        }
    }

    /// Cancels the context. The first reason given is kept.
    pub fn cancel(&self, reason: impl Into<String>) {
        let mut slot = self
            .signal
            .reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(reason.into());
        }
        self.signal.cancelled.store(true, Ordering::SeqCst);
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Returns true if the context was cancelled or its deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        self.signal.cancelled.load(Ordering::SeqCst) || self.deadline_passed()
    }

    /// Returns the cancellation reason, if the context is cancelled.
    pub fn cancel_reason(&self) -> Option<String> {
        if self.signal.cancelled.load(Ordering::SeqCst) {
            let slot = self
                .signal
                .reason
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            return Some(slot.clone().unwrap_or_else(|| "cancelled".to_string()));
        }
        if self.deadline_passed() {
            let limit = self.timeout.unwrap_or_default();
            return Some(format!("build deadline of {:?} exceeded", limit));
        }
        None
    }

    /// Returns `Err(Cancelled)` if the context is cancelled.
    pub fn check(&self) -> Result<(), QcbakeError> {
        match self.cancel_reason() {
            Some(reason) => Err(QcbakeError::Cancelled(reason)),
            None => Ok(()),
        }
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}
