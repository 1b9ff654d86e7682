use std::borrow::Cow;
use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::debug;

use super::{cleanup_config, provider_call, resource_name};
use crate::config::SecurityGroupMode;
use crate::context::BuildContext;
use crate::provider::CloudProvider;
use crate::state::{Resource, StateBag, StateKey};
use crate::step::{Step, StepAction, finish, halt_if_cancelled};

/// Selects or creates the security group the instance joins.
///
/// Writes `security_group_id`.
pub struct EnsureSecurityGroup {
    provider: Arc<dyn CloudProvider>,
}

impl EnsureSecurityGroup {
    pub fn new(provider: Arc<dyn CloudProvider>) -> Self {
        Self { provider }
    }

    fn ensure(&self, state: &StateBag) -> Result<()> {
        let config = state.config()?;
        let ui = state.ui();
        match &config.security_group {
            SecurityGroupMode::Existing(id) => {
                ui.say(&format!("Using existing security group {}", id));
                let found = provider_call(
                    "describe_security_group",
                    self.provider.describe_security_group(&config.zone, id),
                )?;
                if found.is_none() {
                    bail!("security group {} not found in zone {}", id, config.zone);
                }
                state.put(StateKey::SecurityGroup, Resource::existing(id.as_str()));
            }
            SecurityGroupMode::New => {
                ui.say("Creating security group");
                let id = provider_call(
                    "create_security_group",
                    self.provider
                        .create_security_group(&config.zone, &resource_name("sg")),
                )?;
                ui.message(&format!("Created security group {}", id));
                state.put(StateKey::SecurityGroup, Resource::allocated(id));
            }
        }
        Ok(())
    }
}

impl Step for EnsureSecurityGroup {
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed("ensure_security_group")
    }

    fn run(&self, ctx: &BuildContext, state: &StateBag) -> StepAction {
        if let Some(halt) = halt_if_cancelled(ctx, state, &self.name()) {
            return halt;
        }
        finish(state, &self.name(), self.ensure(state))
    }

    fn cleanup(&self, state: &StateBag) -> Result<()> {
        let Some(group) = state.take_resource(StateKey::SecurityGroup)? else {
            return Ok(());
        };
        if !group.is_owned() {
            debug!("keeping security group {}", group);
            return Ok(());
        }
        let config = cleanup_config(state)?;
        state.ui().say(&format!("Deleting security group {}", group.id));
        provider_call(
            "delete_security_group",
            self.provider.delete_security_group(&config.zone, &group.id),
        )
    }
}
