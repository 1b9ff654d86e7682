use std::borrow::Cow;
use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::debug;

use super::{cleanup_config, provider_call, wait_policy};
use crate::config::EipMode;
use crate::context::BuildContext;
use crate::provider::{CloudProvider, EipStatus};
use crate::state::{Resource, StateBag, StateKey};
use crate::step::{Step, StepAction, finish, halt_if_cancelled};
use crate::wait::wait_for;

/// Gives the instance a public address.
///
/// Reads `instance_id`. Writes `eip_id` and `public_ip`. With `eip: false`
/// it does nothing and the instance is reached on `private_ip`.
pub struct EnsureElasticIp {
    provider: Arc<dyn CloudProvider>,
}

impl EnsureElasticIp {
    pub fn new(provider: Arc<dyn CloudProvider>) -> Self {
        Self { provider }
    }

    fn attach(&self, ctx: &BuildContext, state: &StateBag) -> Result<()> {
        let config = state.config()?;
        let ui = state.ui();
        let zone = config.zone.as_str();

        let eip = match &config.eip {
            EipMode::Disabled => {
                ui.message("No elastic IP requested, using the private address");
                return Ok(());
            }
            EipMode::Existing(id) => {
                ui.say(&format!("Using existing elastic IP {}", id));
                let Some(eip) = provider_call("describe_eip", self.provider.describe_eip(zone, id))?
                else {
                    bail!("elastic IP {} not found in zone {}", id, zone);
                };
                if let Some(holder) = &eip.instance_id {
                    bail!("elastic IP {} is already associated with {}", id, holder);
                }
                Resource::existing(id.as_str())
            }
            EipMode::New => {
                ui.say(&format!("Allocating elastic IP ({} Mbps)", config.eip_bandwidth));
                let id = provider_call(
                    "allocate_eip",
                    self.provider.allocate_eip(zone, config.eip_bandwidth),
                )?;
                Resource::allocated(id)
            }
        };
        state.put(StateKey::Eip, eip.clone());

        let policy = wait_policy(&config);
        wait_for(ctx, &format!("elastic IP {} to become available", eip.id), policy, || {
            let current = provider_call("describe_eip", self.provider.describe_eip(zone, &eip.id))?;
            match current.map(|e| e.status) {
                Some(EipStatus::Available) => Ok(Some(())),
                Some(EipStatus::Pending) => Ok(None),
                Some(status) => bail!("elastic IP {} is {}", eip.id, status),
                None => bail!("elastic IP {} disappeared", eip.id),
            }
        })?;

        let instance = state.require_resource(StateKey::Instance)?;
        provider_call(
            "associate_eip",
            self.provider.associate_eip(zone, &eip.id, &instance.id),
        )?;

        let what = format!("elastic IP {} to attach to {}", eip.id, instance.id);
        let address = wait_for(ctx, &what, policy, || {
            let current = provider_call("describe_instance", self.provider.describe_instance(zone, &instance.id))?;
            Ok(current.and_then(|i| i.public_ip))
        })?;
        ui.message(&format!("Instance {} is reachable at {}", instance.id, address));
        state.put(StateKey::PublicIp, address);
        Ok(())
    }
}

impl Step for EnsureElasticIp {
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed("ensure_elastic_ip")
    }

    fn run(&self, ctx: &BuildContext, state: &StateBag) -> StepAction {
        if let Some(halt) = halt_if_cancelled(ctx, state, &self.name()) {
            return halt;
        }
        finish(state, &self.name(), self.attach(ctx, state))
    }

    fn cleanup(&self, state: &StateBag) -> Result<()> {
        let Some(eip) = state.take_resource(StateKey::Eip)? else {
            return Ok(());
        };
        state.take(StateKey::PublicIp);
        let config = cleanup_config(state)?;
        let zone = config.zone.as_str();

        let current = provider_call("describe_eip", self.provider.describe_eip(zone, &eip.id))?;
        if current.as_ref().is_some_and(|e| e.instance_id.is_some()) {
            state.ui().say(&format!("Dissociating elastic IP {}", eip.id));
            provider_call("dissociate_eip", self.provider.dissociate_eip(zone, &eip.id))?;
        }
        if !eip.is_owned() {
            debug!("keeping elastic IP {}", eip);
            return Ok(());
        }
        if current.is_none() {
            debug!("elastic IP {} already released", eip.id);
            return Ok(());
        }
        state.ui().say(&format!("Releasing elastic IP {}", eip.id));
        provider_call("release_eip", self.provider.release_eip(zone, &eip.id))
    }
}
