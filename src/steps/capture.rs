use std::borrow::Cow;
use std::sync::Arc;

use anyhow::{Result, bail};

use super::{cleanup_config, provider_call, wait_policy};
use crate::context::BuildContext;
use crate::provider::{CloudProvider, ImageStatus};
use crate::state::{Resource, StateBag, StateKey};
use crate::step::{Step, StepAction, finish, halt_if_cancelled};
use crate::wait::wait_for;

/// Captures the stopped instance into an image.
///
/// Reads `instance_id`. Writes `pending_image` while the image is being
/// built, then moves it to `image_id` once the provider reports it
/// available. Only `image_id` outlives the run.
pub struct CaptureImage {
    provider: Arc<dyn CloudProvider>,
}

impl CaptureImage {
    pub fn new(provider: Arc<dyn CloudProvider>) -> Self {
        Self { provider }
    }

    fn capture(&self, ctx: &BuildContext, state: &StateBag) -> Result<()> {
        let config = state.config()?;
        let instance = state.require_resource(StateKey::Instance)?;
        let zone = config.zone.as_str();
        let ui = state.ui();

        ui.say(&format!("Capturing instance {} as {}", instance.id, config.image_name));
        let image_id = provider_call(
            "capture_instance",
            self.provider
                .capture_instance(zone, &instance.id, &config.image_name),
        )?;
        state.put(StateKey::PendingImage, Resource::allocated(image_id.as_str()));

        let what = format!("image {} to become available", image_id);
        wait_for(ctx, &what, wait_policy(&config), || {
            let current = provider_call("describe_image", self.provider.describe_image(zone, &image_id))?;
            match current.map(|i| i.status) {
                Some(ImageStatus::Available) => Ok(Some(())),
                Some(ImageStatus::Pending) => Ok(None),
                Some(status) => bail!("image {} entered state {} while capturing", image_id, status),
                None => bail!("image {} disappeared", image_id),
            }
        })?;

        state.take(StateKey::PendingImage);
        state.put(StateKey::ImageId, image_id.as_str());
        ui.message(&format!("Image {} is available", image_id));
        Ok(())
    }
}

impl Step for CaptureImage {
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed("capture_image")
    }

    fn run(&self, ctx: &BuildContext, state: &StateBag) -> StepAction {
        if let Some(halt) = halt_if_cancelled(ctx, state, &self.name()) {
            return halt;
        }
        finish(state, &self.name(), self.capture(ctx, state))
    }

    /// Deletes an image whose capture did not finish. A finished image is
    /// left alone.
    fn cleanup(&self, state: &StateBag) -> Result<()> {
        let Some(image) = state.take_resource(StateKey::PendingImage)? else {
            return Ok(());
        };
        let config = cleanup_config(state)?;
        state.ui().say(&format!("Deleting unfinished image {}", image.id));
        provider_call("delete_image", self.provider.delete_image(&config.zone, &image.id))
    }
}
