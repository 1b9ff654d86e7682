//! The unit of work executed by the runner.
//!
//! A [`Step`] has a forward action ([`Step::run`]) and a compensating action
//! ([`Step::cleanup`]). Steps are stateless: everything a step needs to undo
//! its work is recorded in the [`StateBag`], so cleanup can run even when the
//! forward action stopped halfway.

use std::borrow::Cow;

use anyhow::Result;

use crate::context::BuildContext;
use crate::error::QcbakeError;
use crate::state::{StateBag, StateKey};

/// Outcome of a step's forward action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// Proceed to the next step.
    Continue,
    /// Stop the forward pass. The step has recorded its reason in the bag.
    Halt,
}

/// A provisioning step.
///
/// Implementations must:
/// - return [`StepAction::Halt`] without side effects if `ctx` is already
///   cancelled when `run` is entered (see [`halt_if_cancelled`]);
/// - record a failure reason under [`StateKey::Error`] before halting
///   (see [`halt_with`]);
/// - make `cleanup` safe to call when `run` never completed, and a no-op
///   when called a second time.
pub trait Step: Send + Sync {
    /// Human-readable name used in logs and error messages.
    fn name(&self) -> Cow<'_, str>;

    /// Forward action.
    fn run(&self, ctx: &BuildContext, state: &StateBag) -> StepAction;

    /// Compensating action. Errors are reported by the runner but never
    /// replace the run's failure reason.
    fn cleanup(&self, state: &StateBag) -> Result<()>;
}

/// Records `err` as the halt reason and returns [`StepAction::Halt`].
///
/// Typed `QcbakeError`s are kept as they are; any other error is recorded as
/// a provider error attributed to `step`. An earlier reason is never
/// overwritten.
pub fn halt_with(state: &StateBag, step: &str, err: anyhow::Error) -> StepAction {
    let typed = QcbakeError::from_anyhow(step, err);
    let ui = state.ui();
    ui.error(&format!("{}: {}", step, typed));
    if !state.contains(StateKey::Error) {
        state.put(StateKey::Error, typed);
    }
    state.halt();
    StepAction::Halt
}

/// Halts with the cancellation reason if `ctx` is already cancelled.
///
/// Returns `Some(StepAction::Halt)` when the step must not start.
pub fn halt_if_cancelled(ctx: &BuildContext, state: &StateBag, step: &str) -> Option<StepAction> {
    match ctx.check() {
        Ok(()) => None,
        Err(err) => {
            tracing::debug!(step, "context cancelled before step started");
            Some(halt_with(state, step, err.into()))
        }
    }
}

/// Converts a step body's result into a [`StepAction`].
pub fn finish(state: &StateBag, step: &str, result: Result<()>) -> StepAction {
    match result {
        Ok(()) => StepAction::Continue,
        Err(err) => halt_with(state, step, err),
    }
}
