//! Bounded polling for externally observable state.
//!
//! Provider operations are asynchronous: an instance is created in
//! `pending` and becomes `running` later, a captured image becomes
//! `available` later. [`wait_for`] polls at a fixed interval until the poll
//! reports a value, the ceiling is exceeded ([`QcbakeError::Timeout`]) or
//! the build context is cancelled ([`QcbakeError::Cancelled`]).

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::trace;

use crate::context::BuildContext;
use crate::error::QcbakeError;

/// Polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Ceiling on the total wait.
    pub timeout: Duration,
    /// Delay between polls.
    pub interval: Duration,
}

impl WaitPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Calls `poll` until it returns `Some`.
///
/// A poll error ends the wait immediately. The context is checked before
/// every poll and each sleep lasts one interval (clamped to the remaining
/// time), so a cancellation is observed within at most one interval.
pub fn wait_for<T>(
    ctx: &BuildContext,
    what: &str,
    policy: WaitPolicy,
    mut poll: impl FnMut() -> Result<Option<T>>,
) -> Result<T> {
    let started = Instant::now();
    let mut attempt: u32 = 0;
    loop {
        ctx.check()?;
        attempt += 1;
        if let Some(value) = poll()? {
            trace!(what, attempt, elapsed = ?started.elapsed(), "wait satisfied");
            return Ok(value);
        }

        let elapsed = started.elapsed();
        if elapsed >= policy.timeout {
            return Err(QcbakeError::Timeout {
                what: what.to_string(),
                limit: policy.timeout,
            }
            .into());
        }
        let remaining = policy.timeout - elapsed;
        trace!(what, attempt, "not ready, retrying in {:?}", policy.interval.min(remaining));
        thread::sleep(policy.interval.min(remaining));
    }
}
