//! Build orchestration.
//!
//! [`Builder::prepare`] validates a template; [`Builder::run`] seeds a fresh
//! [`StateBag`], runs the fixed step sequence and turns the final state into
//! an [`ImageArtifact`] or an error.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{info, warn};

use crate::artifact::ImageArtifact;
use crate::communicator::{AuthMethod, Communicator, ConnectionConfig, PrivateKey};
use crate::config::{BuildConfig, RawConfig};
use crate::context::BuildContext;
use crate::error::QcbakeError;
use crate::hook::Hook;
use crate::provider::{CloudProvider, ImageService};
use crate::runner::{RunOutcome, Runner};
use crate::state::{StateBag, StateKey, StateValue};
use crate::step::Step;
use crate::steps::{
    CaptureImage, ConnectRemote, CreateInstance, EnsureElasticIp, EnsureKeypair,
    EnsureSecurityGroup, RunProvisioners, ShutdownInstance,
};
use crate::ui::Ui;

/// Identifier of this builder, reported by its artifacts.
pub const BUILDER_ID: &str = "qingcloud.builder";

/// Bakes one image per [`Builder::run`].
pub struct Builder {
    provider: Arc<dyn CloudProvider>,
    communicator: Arc<dyn Communicator>,
    config: Option<Arc<BuildConfig>>,
}

impl Builder {
    pub fn new(provider: Arc<dyn CloudProvider>, communicator: Arc<dyn Communicator>) -> Self {
        Self {
            provider,
            communicator,
            config: None,
        }
    }

    /// Validates `raw` and keeps the result for later runs.
    ///
    /// Returns the validation warnings. No provider call is made.
    pub fn prepare(&mut self, raw: &RawConfig) -> Result<Vec<String>, QcbakeError> {
        let (config, warnings) = raw.validate()?;
        for warning in &warnings {
            warn!("{}", warning);
        }
        self.config = Some(Arc::new(config));
        Ok(warnings)
    }

    /// The prepared configuration.
    pub fn config(&self) -> Option<&BuildConfig> {
        self.config.as_deref()
    }

    /// The step sequence of a build, in execution order.
    pub fn steps(&self) -> Vec<Box<dyn Step>> {
        vec![
            Box::new(EnsureSecurityGroup::new(Arc::clone(&self.provider))),
            Box::new(EnsureKeypair::new(Arc::clone(&self.provider))),
            Box::new(CreateInstance::new(Arc::clone(&self.provider))),
            Box::new(EnsureElasticIp::new(Arc::clone(&self.provider))),
            Box::new(ConnectRemote::new(Arc::clone(&self.communicator), connection_config)),
            Box::new(RunProvisioners::new()),
            Box::new(ShutdownInstance::new(Arc::clone(&self.provider))),
            Box::new(CaptureImage::new(Arc::clone(&self.provider))),
        ]
    }

    /// Runs one build.
    pub fn run(
        &self,
        ctx: &BuildContext,
        ui: Arc<dyn Ui>,
        hook: Option<Arc<dyn Hook>>,
    ) -> Result<ImageArtifact, QcbakeError> {
        self.run_with_steps(ctx, ui, hook, self.steps())
    }

    /// Runs one build with a caller-supplied step sequence.
    pub fn run_with_steps(
        &self,
        ctx: &BuildContext,
        ui: Arc<dyn Ui>,
        hook: Option<Arc<dyn Hook>>,
        steps: Vec<Box<dyn Step>>,
    ) -> Result<ImageArtifact, QcbakeError> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| QcbakeError::Config("builder was not prepared".to_string()))?;

        let state = StateBag::new();
        state.put(StateKey::Config, StateValue::Config(Arc::clone(&config)));
        state.put(StateKey::Ui, StateValue::Ui(Arc::clone(&ui)));
        if let Some(hook) = hook {
            state.put(StateKey::Hook, StateValue::Hook(hook));
        }

        let runner = Runner::new(steps);
        info!("starting build in {} with {} steps", config.zone, runner.len());
        let report = runner.run(ctx, &state);
        if !report.cleanup_failures.is_empty() {
            warn!(
                "{} cleanup action(s) failed; resources may need manual removal",
                report.cleanup_failures.len()
            );
        }

        if let Some(StateValue::Error(err)) = state.take(StateKey::Error) {
            return Err(Arc::try_unwrap(err).unwrap_or_else(|shared| {
                // Some step still holds the error; keep its text.
                QcbakeError::Provider {
                    operation: "build".to_string(),
                    message: shared.to_string(),
                }
            }));
        }
        match report.outcome {
            RunOutcome::Cancelled { reason } => return Err(QcbakeError::Cancelled(reason)),
            RunOutcome::Halted { step } => {
                return Err(QcbakeError::Halted(step.unwrap_or_default()));
            }
            RunOutcome::Completed => {}
        }

        match state.string(StateKey::ImageId)? {
            Some(image_id) if !image_id.is_empty() => {
                let images = ImageService::new(Arc::clone(&self.provider), config.zone.as_str());
                let artifact = ImageArtifact::new(image_id, images);
                ui.say(&format!("Build finished: {}", artifact));
                Ok(artifact)
            }
            _ => Err(QcbakeError::NoArtifact),
        }
    }
}

/// Chooses the address to connect to: the public IP if it is a valid IP
/// address, else the private IP under the same check.
pub fn resolve_host(state: &StateBag) -> Result<String, QcbakeError> {
    let public = state.string(StateKey::PublicIp)?;
    let private = state.string(StateKey::PrivateIp)?;
    for candidate in [&public, &private].into_iter().flatten() {
        if candidate.parse::<IpAddr>().is_ok() {
            return Ok(candidate.clone());
        }
    }
    Err(QcbakeError::AddressResolution(format!(
        "no usable address (public: {}, private: {})",
        public.as_deref().unwrap_or("none"),
        private.as_deref().unwrap_or("none")
    )))
}

/// Builds the remote access parameters from the bag.
///
/// A private key is offered first and must parse; a password follows if one
/// was recorded. Host keys are not verified.
pub fn connection_config(state: &StateBag) -> Result<ConnectionConfig, QcbakeError> {
    let config = state.config()?;
    let host = resolve_host(state)?;

    let mut auth = Vec::new();
    if let Some(private_key) = state.string(StateKey::PrivateKey)? {
        auth.push(AuthMethod::PublicKey(PrivateKey::parse(&private_key)?));
    }
    if let Some(password) = state.string(StateKey::Password)? {
        auth.push(AuthMethod::Password(password));
    }

    Ok(ConnectionConfig {
        host,
        port: config.ssh.port,
        username: config.ssh.username.clone(),
        auth,
        timeout: config.ssh.timeout,
    })
}
