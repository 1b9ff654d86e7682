//! Cloud provider capability.
//!
//! The builder never talks HTTP itself. Every provider interaction goes
//! through the [`CloudProvider`] trait, which a host application implements
//! on top of its API client. [`SimulatedProvider`] is an in-memory
//! implementation used by `qcbake plan` and by the tests.

mod simulated;

use std::sync::Arc;

use anyhow::Result;
use strum::{Display, EnumString};

pub use simulated::{Operation, SimulatedProvider};

/// Lifecycle states of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Running,
    Stopped,
    Suspended,
    Terminated,
    Ceased,
}

/// Lifecycle states of an elastic IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum EipStatus {
    Pending,
    Available,
    Associated,
    Suspended,
    Released,
    Ceased,
}

/// Lifecycle states of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ImageStatus {
    Pending,
    Available,
    Deprecated,
    Suspended,
    Deleted,
    Ceased,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
}

/// A login keypair. `private_key` is only returned when the provider
/// generated the key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keypair {
    pub id: String,
    pub private_key: Option<String>,
}

/// How the instance accepts its first login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginMode {
    Keypair(String),
    Password(String),
}

/// Parameters of a `run_instance` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    pub name: String,
    pub image_id: String,
    pub instance_type: String,
    pub vxnet_id: String,
    pub security_group_id: String,
    pub login: LoginMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub status: InstanceStatus,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eip {
    pub id: String,
    pub address: String,
    pub status: EipStatus,
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub status: ImageStatus,
}

/// Provider API operations used by the build steps.
///
/// All operations are scoped to a zone. `describe_*` operations return
/// `Ok(None)` for resources that do not exist.
pub trait CloudProvider: Send + Sync {
    fn create_security_group(&self, zone: &str, name: &str) -> Result<String>;
    fn describe_security_group(&self, zone: &str, id: &str) -> Result<Option<SecurityGroup>>;
    fn delete_security_group(&self, zone: &str, id: &str) -> Result<()>;

    /// Creates a keypair. With `public_key` the provider imports it;
    /// without, it generates key material and returns the private half.
    fn create_keypair(&self, zone: &str, name: &str, public_key: Option<&str>) -> Result<Keypair>;
    fn describe_keypair(&self, zone: &str, id: &str) -> Result<Option<Keypair>>;
    fn delete_keypair(&self, zone: &str, id: &str) -> Result<()>;

    fn run_instance(&self, zone: &str, request: &InstanceRequest) -> Result<String>;
    fn describe_instance(&self, zone: &str, id: &str) -> Result<Option<Instance>>;
    fn stop_instance(&self, zone: &str, id: &str) -> Result<()>;
    fn terminate_instance(&self, zone: &str, id: &str) -> Result<()>;

    fn allocate_eip(&self, zone: &str, bandwidth: u32) -> Result<String>;
    fn describe_eip(&self, zone: &str, id: &str) -> Result<Option<Eip>>;
    fn associate_eip(&self, zone: &str, eip_id: &str, instance_id: &str) -> Result<()>;
    fn dissociate_eip(&self, zone: &str, eip_id: &str) -> Result<()>;
    fn release_eip(&self, zone: &str, eip_id: &str) -> Result<()>;

    fn capture_instance(&self, zone: &str, instance_id: &str, image_name: &str) -> Result<String>;
    fn describe_image(&self, zone: &str, id: &str) -> Result<Option<Image>>;
    fn delete_image(&self, zone: &str, id: &str) -> Result<()>;
}

/// Image management scoped to one zone.
///
/// This is the handle an artifact keeps to inspect or delete its image
/// after the build has finished.
#[derive(Clone)]
pub struct ImageService {
    provider: Arc<dyn CloudProvider>,
    zone: String,
}

impl ImageService {
    pub fn new(provider: Arc<dyn CloudProvider>, zone: impl Into<String>) -> Self {
        Self {
            provider,
            zone: zone.into(),
        }
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn describe(&self, image_id: &str) -> Result<Option<Image>> {
        self.provider.describe_image(&self.zone, image_id)
    }

    pub fn delete(&self, image_id: &str) -> Result<()> {
        self.provider.delete_image(&self.zone, image_id)
    }
}

impl std::fmt::Debug for ImageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageService").field("zone", &self.zone).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn statuses_parse_from_provider_strings() {
        assert_eq!(InstanceStatus::from_str("running").unwrap(), InstanceStatus::Running);
        assert_eq!(ImageStatus::from_str("available").unwrap(), ImageStatus::Available);
        assert_eq!(EipStatus::from_str("associated").unwrap(), EipStatus::Associated);
        assert!(InstanceStatus::from_str("exploded").is_err());
    }

    #[test]
    fn statuses_display_lowercase() {
        assert_eq!(InstanceStatus::Terminated.to_string(), "terminated");
        assert_eq!(ImageStatus::Pending.to_string(), "pending");
    }

    #[test]
    fn image_service_is_zone_scoped() {
        let provider = Arc::new(SimulatedProvider::new());
        let service = ImageService::new(provider.clone(), "pek3a");
        assert_eq!(service.zone(), "pek3a");
        assert!(service.describe("img-missing").unwrap().is_none());
        assert!(service.delete("img-missing").is_err());
        assert_eq!(provider.calls(Operation::DeleteImage), 1);
    }
}
