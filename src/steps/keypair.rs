use std::borrow::Cow;
use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use camino::Utf8Path;
use tracing::debug;

use super::{cleanup_config, provider_call, resource_name};
use crate::config::KeypairMode;
use crate::context::BuildContext;
use crate::error::QcbakeError;
use crate::provider::CloudProvider;
use crate::state::{Resource, StateBag, StateKey};
use crate::step::{Step, StepAction, finish, halt_if_cancelled};

fn read_key(path: &Utf8Path, what: &str) -> Result<String> {
    let content = fs::read_to_string(path)
        .map_err(|e| QcbakeError::io(format!("{} {}", what, path), e))?;
    if content.trim().is_empty() {
        return Err(QcbakeError::Credentials(format!("{} {} is empty", what, path)).into());
    }
    Ok(content)
}

/// Selects, imports or generates the login keypair.
///
/// Writes `keypair_id`, and `private_key_content` whenever the private half
/// is known. The configured SSH password, if any, is written to `password`.
pub struct EnsureKeypair {
    provider: Arc<dyn CloudProvider>,
}

impl EnsureKeypair {
    pub fn new(provider: Arc<dyn CloudProvider>) -> Self {
        Self { provider }
    }

    fn ensure(&self, state: &StateBag) -> Result<()> {
        let config = state.config()?;
        let ui = state.ui();
        let zone = config.zone.as_str();

        match &config.keypair {
            KeypairMode::New => {
                ui.say("Creating keypair");
                let keypair = provider_call(
                    "create_keypair",
                    self.provider.create_keypair(zone, &resource_name("kp"), None),
                )?;
                state.put(StateKey::Keypair, Resource::allocated(keypair.id.as_str()));
                let Some(private_key) = keypair.private_key else {
                    return Err(QcbakeError::Credentials(format!(
                        "provider returned no private key for generated keypair {}",
                        keypair.id
                    ))
                    .into());
                };
                ui.message(&format!("Created keypair {}", keypair.id));
                state.put(StateKey::PrivateKey, private_key);
            }
            KeypairMode::Paths(paths) => {
                // Read both halves before creating anything.
                let public_key = read_key(&paths.public_key, "public key")?;
                let private_key = read_key(&paths.private_key, "private key")?;
                ui.say(&format!("Importing keypair from {}", paths.public_key));
                let keypair = provider_call(
                    "create_keypair",
                    self.provider
                        .create_keypair(zone, &resource_name("kp"), Some(public_key.trim())),
                )?;
                ui.message(&format!("Imported keypair {}", keypair.id));
                state.put(StateKey::Keypair, Resource::allocated(keypair.id));
                state.put(StateKey::PrivateKey, private_key);
            }
            KeypairMode::Existing(id) => {
                ui.say(&format!("Using existing keypair {}", id));
                let private_key = config
                    .ssh
                    .private_key_path
                    .as_deref()
                    .map(|path| read_key(path, "private key"))
                    .transpose()?;
                let found = provider_call(
                    "describe_keypair",
                    self.provider.describe_keypair(zone, id),
                )?;
                if found.is_none() {
                    bail!("keypair {} not found in zone {}", id, zone);
                }
                state.put(StateKey::Keypair, Resource::existing(id.as_str()));
                if let Some(private_key) = private_key {
                    state.put(StateKey::PrivateKey, private_key);
                }
            }
        }

        if let Some(password) = &config.ssh.password {
            state.put(StateKey::Password, password.as_str());
        }
        Ok(())
    }
}

impl Step for EnsureKeypair {
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed("ensure_keypair")
    }

    fn run(&self, ctx: &BuildContext, state: &StateBag) -> StepAction {
        if let Some(halt) = halt_if_cancelled(ctx, state, &self.name()) {
            return halt;
        }
        finish(state, &self.name(), self.ensure(state))
    }

    fn cleanup(&self, state: &StateBag) -> Result<()> {
        let Some(keypair) = state.take_resource(StateKey::Keypair)? else {
            return Ok(());
        };
        if !keypair.is_owned() {
            debug!("keeping keypair {}", keypair);
            return Ok(());
        }
        let config = cleanup_config(state)?;
        state.ui().say(&format!("Deleting keypair {}", keypair.id));
        provider_call(
            "delete_keypair",
            self.provider.delete_keypair(&config.zone, &keypair.id),
        )
        .with_context(|| format!("keypair {} may need manual removal", keypair.id))
    }
}
