//! Caller-supplied hook invoked at well-known points of a build.

use anyhow::Result;
use strum::Display;

use crate::communicator::Session;
use crate::ui::Ui;

/// Points of the build at which the hook is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum HookEvent {
    /// The instance is reachable and ready to be provisioned.
    Provision,
}

/// Host-application hook.
///
/// The host receives the open remote session and may run its own
/// provisioning commands through it. An error halts the build.
pub trait Hook: Send + Sync {
    fn run(&self, event: HookEvent, ui: &dyn Ui, session: &dyn Session) -> Result<()>;
}

/// Hook that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHook;

impl Hook for NoopHook {
    fn run(&self, _event: HookEvent, _ui: &dyn Ui, _session: &dyn Session) -> Result<()> {
        Ok(())
    }
}
