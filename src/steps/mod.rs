//! The concrete steps of an image build, in pipeline order.
//!
//! | Step | Writes | Cleanup |
//! |---|---|---|
//! | [`EnsureSecurityGroup`] | `security_group_id` | deletes the group if it was created |
//! | [`EnsureKeypair`] | `keypair_id`, `private_key_content`, `password` | deletes the keypair if it was created |
//! | [`CreateInstance`] | `instance_id`, `private_ip` | terminates the instance and waits |
//! | [`EnsureElasticIp`] | `eip_id`, `public_ip` | dissociates; releases if allocated |
//! | [`ConnectRemote`] | `session` | disconnects |
//! | [`RunProvisioners`] | | |
//! | [`ShutdownInstance`] | | |
//! | [`CaptureImage`] | `pending_image`, then `image_id` | deletes an image still pending |

mod capture;
mod connect;
mod eip;
mod instance;
mod keypair;
mod provision;
mod security_group;
mod shutdown;

use std::sync::Arc;

use anyhow::Result;

use crate::config::BuildConfig;
use crate::error::QcbakeError;
use crate::state::StateBag;
use crate::wait::WaitPolicy;

pub use capture::CaptureImage;
pub use connect::{ConnectRemote, ConnectionResolver};
pub use eip::EnsureElasticIp;
pub use instance::CreateInstance;
pub use keypair::EnsureKeypair;
pub use provision::RunProvisioners;
pub use security_group::EnsureSecurityGroup;
pub use shutdown::ShutdownInstance;

/// Attributes a provider failure to `operation`, keeping typed errors as they are.
fn provider_call<T>(operation: &str, result: Result<T>) -> Result<T> {
    result.map_err(|e| QcbakeError::from_anyhow(operation, e).into())
}

fn wait_policy(config: &BuildConfig) -> WaitPolicy {
    WaitPolicy::new(config.timeout, config.interval)
}

/// Config for a cleanup action. Cleanup may run after a failure anywhere, so
/// a missing config is an error rather than a panic.
fn cleanup_config(state: &StateBag) -> Result<Arc<BuildConfig>> {
    Ok(state.config()?)
}

/// Name for a resource created by this build.
fn resource_name(kind: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("qcbake-{}-{}", kind, &id[..8])
}
