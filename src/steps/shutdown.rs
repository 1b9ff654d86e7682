use std::borrow::Cow;
use std::sync::Arc;

use anyhow::{Result, bail};

use super::{provider_call, wait_policy};
use crate::context::BuildContext;
use crate::provider::{CloudProvider, InstanceStatus};
use crate::state::{StateBag, StateKey};
use crate::step::{Step, StepAction, finish, halt_if_cancelled};
use crate::wait::wait_for;

/// Stops the instance so its disk can be captured consistently.
///
/// Reads `instance_id`. Nothing to undo: termination belongs to
/// [`CreateInstance`](super::CreateInstance).
pub struct ShutdownInstance {
    provider: Arc<dyn CloudProvider>,
}

impl ShutdownInstance {
    pub fn new(provider: Arc<dyn CloudProvider>) -> Self {
        Self { provider }
    }

    fn stop(&self, ctx: &BuildContext, state: &StateBag) -> Result<()> {
        let config = state.config()?;
        let instance = state.require_resource(StateKey::Instance)?;
        let zone = config.zone.as_str();

        state.ui().say(&format!("Stopping instance {}", instance.id));
        provider_call("stop_instance", self.provider.stop_instance(zone, &instance.id))?;

        let what = format!("instance {} to stop", instance.id);
        wait_for(ctx, &what, wait_policy(&config), || {
            let current = provider_call(
                "describe_instance",
                self.provider.describe_instance(zone, &instance.id),
            )?;
            match current.map(|i| i.status) {
                Some(InstanceStatus::Stopped) => Ok(Some(())),
                Some(InstanceStatus::Running | InstanceStatus::Pending) => Ok(None),
                Some(status) => bail!("instance {} entered state {} while stopping", instance.id, status),
                None => bail!("instance {} disappeared", instance.id),
            }
        })
    }
}

impl Step for ShutdownInstance {
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed("shutdown_instance")
    }

    fn run(&self, ctx: &BuildContext, state: &StateBag) -> StepAction {
        if let Some(halt) = halt_if_cancelled(ctx, state, &self.name()) {
            return halt;
        }
        finish(state, &self.name(), self.stop(ctx, state))
    }

    fn cleanup(&self, _state: &StateBag) -> Result<()> {
        Ok(())
    }
}
