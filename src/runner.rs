//! Sequential step runner with reverse-order rollback.
//!
//! The runner executes steps strictly in declaration order on the calling
//! thread. Before each step it checks the bag's halt flag and the context's
//! cancellation. Every step whose `run` was invoked is remembered, and once
//! the forward pass ends (all steps done, a step halted, the context was
//! cancelled, or a step panicked) `cleanup` is called on exactly those steps
//! in reverse order.
//!
//! The runner never interprets why a step halted. The reason is whatever the
//! step recorded under [`StateKey::Error`].

use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{debug, error, info, warn};

use crate::context::BuildContext;
use crate::error::{QcbakeError, panic_message};
use crate::state::{StateBag, StateKey};
use crate::step::{Step, StepAction};

/// How the forward pass ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every step ran and returned `Continue`.
    Completed,
    /// A step halted (or panicked). `step` is `None` if the bag was already
    /// halted before any step ran.
    Halted { step: Option<String> },
    /// The context was cancelled between steps.
    Cancelled { reason: String },
}

/// A compensating action that failed or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    pub step: String,
    pub message: String,
}

/// Summary of one runner pass.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Names of the steps whose `run` was invoked, in order.
    pub executed: Vec<String>,
    /// Cleanup failures, in the order they occurred. Informational only.
    pub cleanup_failures: Vec<CleanupFailure>,
}

impl RunReport {
    /// Returns true iff the forward pass reached the end without halt or cancellation.
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }
}

/// Executes an ordered list of steps against one state bag.
pub struct Runner {
    steps: Vec<Box<dyn Step>>,
}

impl Runner {
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self { steps }
    }

    /// Returns the number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if there are no steps to run.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs the forward pass, then cleans up the executed steps in reverse.
    pub fn run(&self, ctx: &BuildContext, state: &StateBag) -> RunReport {
        let (outcome, executed) = self.forward(ctx, state);
        let cleanup_failures = Self::rollback(&executed, state);

        let executed = executed.iter().map(|s| s.name().into_owned()).collect();
        RunReport {
            outcome,
            executed,
            cleanup_failures,
        }
    }

    fn forward<'s>(
        &'s self,
        ctx: &BuildContext,
        state: &StateBag,
    ) -> (RunOutcome, Vec<&'s dyn Step>) {
        let total = self.steps.len();
        let mut executed: Vec<&'s dyn Step> = Vec::with_capacity(total);

        for (index, step) in self.steps.iter().enumerate() {
            if state.is_halted() {
                let step = executed.last().map(|s| s.name().into_owned());
                return (RunOutcome::Halted { step }, executed);
            }
            if let Some(reason) = ctx.cancel_reason() {
                info!("build cancelled before step {}/{}: {}", index + 1, total, reason);
                return (RunOutcome::Cancelled { reason }, executed);
            }

            let name = step.name().into_owned();
            info!("running step {}/{}: {}", index + 1, total, name);
            executed.push(step.as_ref());

            let action = match catch_unwind(AssertUnwindSafe(|| step.run(ctx, state))) {
                Ok(action) => action,
                Err(payload) => {
                    let message = panic_message(&*payload).to_string();
                    error!(step = %name, panic = %message, "step panicked");
                    if !state.contains(StateKey::Error) {
                        state.put(
                            StateKey::Error,
                            QcbakeError::StepPanicked {
                                step: name.clone(),
                                message,
                            },
                        );
                    }
                    StepAction::Halt
                }
            };

            if action == StepAction::Halt {
                state.halt();
                info!("step {} halted the build", name);
                return (RunOutcome::Halted { step: Some(name) }, executed);
            }
        }

        // Cancellation is only observed before a step, so the last step's
        // work stands even if the context was cancelled while it ran.
        (RunOutcome::Completed, executed)
    }

    fn rollback(executed: &[&dyn Step], state: &StateBag) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();
        for step in executed.iter().rev() {
            let name = step.name().into_owned();
            debug!("cleaning up step: {}", name);
            let message = match catch_unwind(AssertUnwindSafe(|| step.cleanup(state))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(payload) => format!("cleanup panicked: {}", panic_message(&*payload)),
            };
            warn!(step = %name, "cleanup failed: {}", message);
            state.ui().error(&format!("cleanup of {} failed: {}", name, message));
            failures.push(CleanupFailure {
                step: name,
                message,
            });
        }
        failures
    }
}
