use std::borrow::Cow;
use std::sync::Arc;

use anyhow::{Result, bail};

use super::{cleanup_config, provider_call, resource_name, wait_policy};
use crate::context::BuildContext;
use crate::provider::{CloudProvider, InstanceRequest, InstanceStatus, LoginMode};
use crate::state::{Resource, StateBag, StateKey};
use crate::step::{Step, StepAction, finish, halt_if_cancelled};
use crate::wait::wait_for;

/// Launches the build instance and waits until it is running.
///
/// Reads `security_group_id` and `keypair_id` (or `password` when there is
/// no keypair). Writes `instance_id` as soon as the instance exists, then
/// `private_ip` once it is running.
pub struct CreateInstance {
    provider: Arc<dyn CloudProvider>,
}

impl CreateInstance {
    pub fn new(provider: Arc<dyn CloudProvider>) -> Self {
        Self { provider }
    }

    fn launch(&self, ctx: &BuildContext, state: &StateBag) -> Result<()> {
        let config = state.config()?;
        let ui = state.ui();
        let security_group = state.require_resource(StateKey::SecurityGroup)?;
        let login = match state.resource(StateKey::Keypair)? {
            Some(keypair) => LoginMode::Keypair(keypair.id),
            None => LoginMode::Password(state.require_string(StateKey::Password)?),
        };

        let request = InstanceRequest {
            name: resource_name("builder"),
            image_id: config.image_id.clone(),
            instance_type: config.instance_type.clone(),
            vxnet_id: config.vxnet_id.clone(),
            security_group_id: security_group.id,
            login,
        };
        ui.say(&format!("Creating instance from {} ({})", request.image_id, request.instance_type));
        let id = provider_call("run_instance", self.provider.run_instance(&config.zone, &request))?;
        state.put(StateKey::Instance, Resource::allocated(id.as_str()));
        ui.message(&format!("Waiting for instance {} to become running", id));

        let what = format!("instance {} to become running", id);
        let private_ip = wait_for(ctx, &what, wait_policy(&config), || {
            let instance = provider_call(
                "describe_instance",
                self.provider.describe_instance(&config.zone, &id),
            )?;
            let Some(instance) = instance else {
                bail!("instance {} disappeared", id);
            };
            match instance.status {
                InstanceStatus::Running => Ok(instance.private_ip),
                InstanceStatus::Pending => Ok(None),
                status => bail!("instance {} entered state {} while starting", id, status),
            }
        })?;
        ui.message(&format!("Instance {} is running at {}", id, private_ip));
        state.put(StateKey::PrivateIp, private_ip);
        Ok(())
    }
}

impl Step for CreateInstance {
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed("create_instance")
    }

    fn run(&self, ctx: &BuildContext, state: &StateBag) -> StepAction {
        if let Some(halt) = halt_if_cancelled(ctx, state, &self.name()) {
            return halt;
        }
        finish(state, &self.name(), self.launch(ctx, state))
    }

    /// Terminates the instance and waits until it is gone, so the security
    /// group and keypair can be released by the earlier steps' cleanup.
    fn cleanup(&self, state: &StateBag) -> Result<()> {
        let Some(instance) = state.take_resource(StateKey::Instance)? else {
            return Ok(());
        };
        let config = cleanup_config(state)?;
        let zone = config.zone.as_str();
        state.ui().say(&format!("Terminating instance {}", instance.id));
        provider_call("terminate_instance", self.provider.terminate_instance(zone, &instance.id))?;

        // A cleanup context is never cancelled; only the ceiling applies.
        let what = format!("instance {} to terminate", instance.id);
        wait_for(&BuildContext::new(), &what, wait_policy(&config), || {
            let current = provider_call(
                "describe_instance",
                self.provider.describe_instance(zone, &instance.id),
            )?;
            Ok(match current {
                None => Some(()),
                Some(i) if matches!(i.status, InstanceStatus::Terminated | InstanceStatus::Ceased) => {
                    Some(())
                }
                Some(_) => None,
            })
        })?;
        Ok(())
    }
}
