use std::borrow::Cow;

use anyhow::{Context, Result};

use crate::context::BuildContext;
use crate::hook::HookEvent;
use crate::state::StateBag;
use crate::step::{Step, StepAction, finish, halt_if_cancelled};

/// Runs the caller's hook, then the template's provisioners, over the open
/// session.
///
/// Reads `session`, `hook` and the provisioners from `config`. Writes
/// nothing; the changes live on the instance's disk.
#[derive(Debug, Default)]
pub struct RunProvisioners;

impl RunProvisioners {
    pub fn new() -> Self {
        Self
    }

    fn provision(&self, ctx: &BuildContext, state: &StateBag) -> Result<()> {
        let config = state.config()?;
        let session = state.session()?;
        let ui = state.ui();

        if let Some(hook) = state.hook()? {
            ui.say("Running provisioning hook");
            hook.run(HookEvent::Provision, ui.as_ref(), session.as_ref())
                .context("provisioning hook failed")?;
        }

        let total = config.provisioners.len();
        for (index, provisioner) in config.provisioners.iter().enumerate() {
            ctx.check()?;
            ui.say(&format!("Provisioning with {} ({}/{})", provisioner.name(), index + 1, total));
            provisioner
                .execute(session.as_ref())
                .with_context(|| format!("provisioner {} failed", provisioner.name()))?;
        }
        Ok(())
    }
}

impl Step for RunProvisioners {
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed("run_provisioners")
    }

    fn run(&self, ctx: &BuildContext, state: &StateBag) -> StepAction {
        if let Some(halt) = halt_if_cancelled(ctx, state, &self.name()) {
            return halt;
        }
        finish(state, &self.name(), self.provision(ctx, state))
    }

    fn cleanup(&self, _state: &StateBag) -> Result<()> {
        Ok(())
    }
}
