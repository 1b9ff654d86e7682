//! In-memory provider.
//!
//! Behaves like the real API closely enough to drive the whole pipeline:
//! instances and images start `pending` and become ready after a configurable
//! number of describe calls, deletes of unknown resources fail, security
//! groups in use cannot be deleted, and capture requires a stopped instance.
//! Every call is counted per [`Operation`], and any operation can be made to
//! fail.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, bail};
use strum::Display;
use tracing::debug;

use super::{
    CloudProvider, Eip, EipStatus, Image, ImageStatus, Instance, InstanceRequest,
    InstanceStatus, Keypair, SecurityGroup,
};

/// Provider operations, for call counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    CreateSecurityGroup,
    DescribeSecurityGroup,
    DeleteSecurityGroup,
    CreateKeypair,
    DescribeKeypair,
    DeleteKeypair,
    RunInstance,
    DescribeInstance,
    StopInstance,
    TerminateInstance,
    AllocateEip,
    DescribeEip,
    AssociateEip,
    DissociateEip,
    ReleaseEip,
    CaptureInstance,
    DescribeImage,
    DeleteImage,
}

struct Zoned<T> {
    zone: String,
    value: T,
}

struct SimInstance {
    instance: Instance,
    security_group_id: String,
    polls_left: u32,
}

struct SimImage {
    image: Image,
    polls_left: u32,
}

#[derive(Default)]
struct SimState {
    calls: HashMap<Operation, usize>,
    failing: HashSet<Operation>,
    pending_polls: u32,
    next_address: u8,
    security_groups: HashMap<String, Zoned<SecurityGroup>>,
    keypairs: HashMap<String, Zoned<Keypair>>,
    instances: HashMap<String, Zoned<SimInstance>>,
    eips: HashMap<String, Zoned<Eip>>,
    images: HashMap<String, Zoned<SimImage>>,
}

impl SimState {
    fn next_address(&mut self) -> u8 {
        self.next_address = self.next_address.wrapping_add(1).max(2);
        self.next_address
    }
}

fn new_id(prefix: &str) -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &uuid[..8])
}

fn generated_private_key() -> Result<String> {
    let key = ssh_key::PrivateKey::random(&mut ssh_key::rand_core::OsRng, ssh_key::Algorithm::Ed25519)
        .context("failed to generate keypair")?;
    let pem = key
        .to_openssh(ssh_key::LineEnding::LF)
        .context("failed to encode generated keypair")?;
    Ok(pem.to_string())
}

/// In-memory [`CloudProvider`].
#[derive(Default)]
pub struct SimulatedProvider {
    state: Mutex<SimState>,
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of describe calls that still report `pending` for new
    /// instances and images.
    #[must_use]
    pub fn with_pending_polls(self, polls: u32) -> Self {
        self.lock().pending_polls = polls;
        self
    }

    /// Makes every call of `operation` fail.
    #[must_use]
    pub fn failing_on(self, operation: Operation) -> Self {
        self.lock().failing.insert(operation);
        self
    }

    /// Registers a pre-existing security group.
    #[must_use]
    pub fn with_security_group(self, zone: &str, id: &str) -> Self {
        self.lock().security_groups.insert(
            id.to_string(),
            Zoned {
                zone: zone.to_string(),
                value: SecurityGroup {
                    id: id.to_string(),
                    name: id.to_string(),
                },
            },
        );
        self
    }

    /// Registers a pre-existing keypair.
    #[must_use]
    pub fn with_keypair(self, zone: &str, id: &str) -> Self {
        self.lock().keypairs.insert(
            id.to_string(),
            Zoned {
                zone: zone.to_string(),
                value: Keypair {
                    id: id.to_string(),
                    private_key: None,
                },
            },
        );
        self
    }

    /// Registers a pre-existing, unassociated elastic IP.
    #[must_use]
    pub fn with_eip(self, zone: &str, id: &str, address: &str) -> Self {
        self.lock().eips.insert(
            id.to_string(),
            Zoned {
                zone: zone.to_string(),
                value: Eip {
                    id: id.to_string(),
                    address: address.to_string(),
                    status: EipStatus::Available,
                    instance_id: None,
                },
            },
        );
        self
    }

    /// Stops failing `operation`.
    pub fn recover(&self, operation: Operation) {
        self.lock().failing.remove(&operation);
    }

    /// Number of times `operation` was called, including failed calls.
    pub fn calls(&self, operation: Operation) -> usize {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    pub fn has_security_group(&self, id: &str) -> bool {
        self.lock().security_groups.contains_key(id)
    }

    pub fn has_keypair(&self, id: &str) -> bool {
        self.lock().keypairs.contains_key(id)
    }

    pub fn eip(&self, id: &str) -> Option<Eip> {
        self.lock().eips.get(id).map(|e| e.value.clone())
    }

    pub fn instance(&self, id: &str) -> Option<Instance> {
        self.lock().instances.get(id).map(|i| i.value.instance.clone())
    }

    /// Ids of all instances ever created, in no particular order.
    pub fn instance_ids(&self) -> Vec<String> {
        self.lock().instances.keys().cloned().collect()
    }

    pub fn image(&self, id: &str) -> Option<Image> {
        self.lock().images.get(id).map(|i| i.value.image.clone())
    }

    /// Ids of all images that still exist.
    pub fn image_ids(&self) -> Vec<String> {
        self.lock().images.keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Counts the call and applies failure injection.
    fn begin(&self, operation: Operation) -> Result<MutexGuard<'_, SimState>> {
        let mut state = self.lock();
        *state.calls.entry(operation).or_default() += 1;
        debug!(%operation, "simulated provider call");
        if state.failing.contains(&operation) {
            bail!("simulated {} failure", operation);
        }
        Ok(state)
    }
}

fn in_zone<'a, T>(map: &'a HashMap<String, Zoned<T>>, zone: &str, id: &str) -> Option<&'a T> {
    map.get(id).filter(|z| z.zone == zone).map(|z| &z.value)
}

fn in_zone_mut<'a, T>(
    map: &'a mut HashMap<String, Zoned<T>>,
    zone: &str,
    id: &str,
) -> Result<&'a mut T> {
    match map.get_mut(id) {
        Some(z) if z.zone == zone => Ok(&mut z.value),
        _ => bail!("resource {} not found in zone {}", id, zone),
    }
}

fn remove_in_zone<T>(map: &mut HashMap<String, Zoned<T>>, zone: &str, id: &str) -> Result<T> {
    in_zone_mut(map, zone, id)?;
    match map.remove(id) {
        Some(z) => Ok(z.value),
        None => bail!("resource {} not found in zone {}", id, zone),
    }
}

impl CloudProvider for SimulatedProvider {
    fn create_security_group(&self, zone: &str, name: &str) -> Result<String> {
        let mut state = self.begin(Operation::CreateSecurityGroup)?;
        let id = new_id("sg");
        state.security_groups.insert(
            id.clone(),
            Zoned {
                zone: zone.to_string(),
                value: SecurityGroup {
                    id: id.clone(),
                    name: name.to_string(),
                },
            },
        );
        Ok(id)
    }

    fn describe_security_group(&self, zone: &str, id: &str) -> Result<Option<SecurityGroup>> {
        let state = self.begin(Operation::DescribeSecurityGroup)?;
        Ok(in_zone(&state.security_groups, zone, id).cloned())
    }

    fn delete_security_group(&self, zone: &str, id: &str) -> Result<()> {
        let mut state = self.begin(Operation::DeleteSecurityGroup)?;
        let in_use = state.instances.values().any(|i| {
            i.value.security_group_id == id
                && i.value.instance.status != InstanceStatus::Terminated
        });
        if in_use {
            bail!("security group {} is still in use", id);
        }
        remove_in_zone(&mut state.security_groups, zone, id)?;
        Ok(())
    }

    fn create_keypair(&self, zone: &str, name: &str, public_key: Option<&str>) -> Result<Keypair> {
        let mut state = self.begin(Operation::CreateKeypair)?;
        if public_key.is_some_and(|k| k.trim().is_empty()) {
            bail!("public key for keypair {} is empty", name);
        }
        let keypair = Keypair {
            id: new_id("kp"),
            private_key: match public_key {
                Some(_) => None,
                None => Some(generated_private_key()?),
            },
        };
        state.keypairs.insert(
            keypair.id.clone(),
            Zoned {
                zone: zone.to_string(),
                value: Keypair {
                    id: keypair.id.clone(),
                    private_key: None,
                },
            },
        );
        Ok(keypair)
    }

    fn describe_keypair(&self, zone: &str, id: &str) -> Result<Option<Keypair>> {
        let state = self.begin(Operation::DescribeKeypair)?;
        Ok(in_zone(&state.keypairs, zone, id).cloned())
    }

    fn delete_keypair(&self, zone: &str, id: &str) -> Result<()> {
        let mut state = self.begin(Operation::DeleteKeypair)?;
        remove_in_zone(&mut state.keypairs, zone, id)?;
        Ok(())
    }

    fn run_instance(&self, zone: &str, request: &InstanceRequest) -> Result<String> {
        let mut state = self.begin(Operation::RunInstance)?;
        if in_zone(&state.security_groups, zone, &request.security_group_id).is_none() {
            bail!("security group {} not found in zone {}", request.security_group_id, zone);
        }
        if let super::LoginMode::Keypair(keypair) = &request.login
            && in_zone(&state.keypairs, zone, keypair).is_none()
        {
            bail!("keypair {} not found in zone {}", keypair, zone);
        }
        let id = new_id("i");
        let polls_left = state.pending_polls;
        state.instances.insert(
            id.clone(),
            Zoned {
                zone: zone.to_string(),
                value: SimInstance {
                    instance: Instance {
                        id: id.clone(),
                        status: InstanceStatus::Pending,
                        private_ip: None,
                        public_ip: None,
                    },
                    security_group_id: request.security_group_id.clone(),
                    polls_left,
                },
            },
        );
        Ok(id)
    }

    fn describe_instance(&self, zone: &str, id: &str) -> Result<Option<Instance>> {
        let mut state = self.begin(Operation::DescribeInstance)?;
        let address = state.next_address();
        let Ok(sim) = in_zone_mut(&mut state.instances, zone, id) else {
            return Ok(None);
        };
        if sim.instance.status == InstanceStatus::Pending {
            if sim.polls_left > 0 {
                sim.polls_left -= 1;
            } else {
                sim.instance.status = InstanceStatus::Running;
                sim.instance.private_ip = Some(format!("10.0.0.{}", address));
            }
        }
        Ok(Some(sim.instance.clone()))
    }

    fn stop_instance(&self, zone: &str, id: &str) -> Result<()> {
        let mut state = self.begin(Operation::StopInstance)?;
        let sim = in_zone_mut(&mut state.instances, zone, id)?;
        if sim.instance.status != InstanceStatus::Running {
            bail!("instance {} is {}, not running", id, sim.instance.status);
        }
        sim.instance.status = InstanceStatus::Stopped;
        Ok(())
    }

    fn terminate_instance(&self, zone: &str, id: &str) -> Result<()> {
        let mut state = self.begin(Operation::TerminateInstance)?;
        let sim = in_zone_mut(&mut state.instances, zone, id)?;
        if sim.instance.status == InstanceStatus::Terminated {
            bail!("instance {} is already terminated", id);
        }
        sim.instance.status = InstanceStatus::Terminated;
        sim.instance.public_ip = None;
        for eip in state.eips.values_mut() {
            if eip.value.instance_id.as_deref() == Some(id) {
                eip.value.instance_id = None;
                eip.value.status = EipStatus::Available;
            }
        }
        Ok(())
    }

    fn allocate_eip(&self, zone: &str, bandwidth: u32) -> Result<String> {
        let mut state = self.begin(Operation::AllocateEip)?;
        if bandwidth == 0 {
            bail!("eip bandwidth must be positive");
        }
        let id = new_id("eip");
        let address = format!("203.0.113.{}", state.next_address());
        state.eips.insert(
            id.clone(),
            Zoned {
                zone: zone.to_string(),
                value: Eip {
                    id: id.clone(),
                    address,
                    status: EipStatus::Available,
                    instance_id: None,
                },
            },
        );
        Ok(id)
    }

    fn describe_eip(&self, zone: &str, id: &str) -> Result<Option<Eip>> {
        let state = self.begin(Operation::DescribeEip)?;
        Ok(in_zone(&state.eips, zone, id).cloned())
    }

    fn associate_eip(&self, zone: &str, eip_id: &str, instance_id: &str) -> Result<()> {
        let mut state = self.begin(Operation::AssociateEip)?;
        let address = {
            let eip = in_zone_mut(&mut state.eips, zone, eip_id)?;
            if eip.status != EipStatus::Available {
                bail!("eip {} is {}, not available", eip_id, eip.status);
            }
            eip.address.clone()
        };
        let sim = in_zone_mut(&mut state.instances, zone, instance_id)?;
        sim.instance.public_ip = Some(address);
        let eip = in_zone_mut(&mut state.eips, zone, eip_id)?;
        eip.status = EipStatus::Associated;
        eip.instance_id = Some(instance_id.to_string());
        Ok(())
    }

    fn dissociate_eip(&self, zone: &str, eip_id: &str) -> Result<()> {
        let mut state = self.begin(Operation::DissociateEip)?;
        let eip = in_zone_mut(&mut state.eips, zone, eip_id)?;
        let Some(instance_id) = eip.instance_id.take() else {
            bail!("eip {} is not associated", eip_id);
        };
        eip.status = EipStatus::Available;
        if let Ok(sim) = in_zone_mut(&mut state.instances, zone, &instance_id) {
            sim.instance.public_ip = None;
        }
        Ok(())
    }

    fn release_eip(&self, zone: &str, eip_id: &str) -> Result<()> {
        let mut state = self.begin(Operation::ReleaseEip)?;
        let eip = in_zone_mut(&mut state.eips, zone, eip_id)?;
        if eip.instance_id.is_some() {
            bail!("eip {} is still associated", eip_id);
        }
        remove_in_zone(&mut state.eips, zone, eip_id)?;
        Ok(())
    }

    fn capture_instance(&self, zone: &str, instance_id: &str, image_name: &str) -> Result<String> {
        let mut state = self.begin(Operation::CaptureInstance)?;
        let sim = in_zone_mut(&mut state.instances, zone, instance_id)?;
        if sim.instance.status != InstanceStatus::Stopped {
            bail!("instance {} must be stopped before capture, it is {}", instance_id, sim.instance.status);
        }
        let id = new_id("img");
        let polls_left = state.pending_polls;
        state.images.insert(
            id.clone(),
            Zoned {
                zone: zone.to_string(),
                value: SimImage {
                    image: Image {
                        id: id.clone(),
                        name: image_name.to_string(),
                        status: ImageStatus::Pending,
                    },
                    polls_left,
                },
            },
        );
        Ok(id)
    }

    fn describe_image(&self, zone: &str, id: &str) -> Result<Option<Image>> {
        let mut state = self.begin(Operation::DescribeImage)?;
        let Ok(sim) = in_zone_mut(&mut state.images, zone, id) else {
            return Ok(None);
        };
        if sim.image.status == ImageStatus::Pending {
            if sim.polls_left > 0 {
                sim.polls_left -= 1;
            } else {
                sim.image.status = ImageStatus::Available;
            }
        }
        Ok(Some(sim.image.clone()))
    }

    fn delete_image(&self, zone: &str, id: &str) -> Result<()> {
        let mut state = self.begin(Operation::DeleteImage)?;
        remove_in_zone(&mut state.images, zone, id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::LoginMode;

    const ZONE: &str = "pek3a";

    fn request(sg: &str, keypair: &str) -> InstanceRequest {
        InstanceRequest {
            name: "qcbake-test".to_string(),
            image_id: "centos7x64".to_string(),
            instance_type: "s1.small.r1".to_string(),
            vxnet_id: "vxnet-0".to_string(),
            security_group_id: sg.to_string(),
            login: LoginMode::Keypair(keypair.to_string()),
        }
    }

    #[test]
    fn instance_becomes_running_after_pending_polls() {
        let provider = SimulatedProvider::new()
            .with_pending_polls(1)
            .with_security_group(ZONE, "sg-1")
            .with_keypair(ZONE, "kp-1");
        let id = provider.run_instance(ZONE, &request("sg-1", "kp-1")).unwrap();

        let first = provider.describe_instance(ZONE, &id).unwrap().unwrap();
        assert_eq!(first.status, InstanceStatus::Pending);
        let second = provider.describe_instance(ZONE, &id).unwrap().unwrap();
        assert_eq!(second.status, InstanceStatus::Running);
        assert!(second.private_ip.is_some());
    }

    #[test]
    fn resources_are_zone_scoped() {
        let provider = SimulatedProvider::new().with_security_group(ZONE, "sg-1");
        assert!(provider.describe_security_group("gd2", "sg-1").unwrap().is_none());
        assert!(provider.delete_security_group("gd2", "sg-1").is_err());
        assert!(provider.has_security_group("sg-1"));
    }

    #[test]
    fn security_group_in_use_cannot_be_deleted() {
        let provider = SimulatedProvider::new()
            .with_security_group(ZONE, "sg-1")
            .with_keypair(ZONE, "kp-1");
        let id = provider.run_instance(ZONE, &request("sg-1", "kp-1")).unwrap();
        assert!(provider.delete_security_group(ZONE, "sg-1").is_err());
        provider.terminate_instance(ZONE, &id).unwrap();
        assert!(provider.delete_security_group(ZONE, "sg-1").is_ok());
    }

    #[test]
    fn generated_keypair_returns_private_key() {
        let provider = SimulatedProvider::new();
        let generated = provider.create_keypair(ZONE, "k", None).unwrap();
        let pem = generated.private_key.unwrap();
        let key = ssh_key::PrivateKey::from_openssh(&pem).unwrap();
        assert_eq!(key.algorithm(), ssh_key::Algorithm::Ed25519);
        assert!(!key.is_encrypted());
        let imported = provider.create_keypair(ZONE, "k", Some("ssh-rsa AAAA")).unwrap();
        assert!(imported.private_key.is_none());
    }

    #[test]
    fn capture_requires_stopped_instance() {
        let provider = SimulatedProvider::new()
            .with_security_group(ZONE, "sg-1")
            .with_keypair(ZONE, "kp-1");
        let id = provider.run_instance(ZONE, &request("sg-1", "kp-1")).unwrap();
        provider.describe_instance(ZONE, &id).unwrap();
        assert!(provider.capture_instance(ZONE, &id, "img").is_err());
        provider.stop_instance(ZONE, &id).unwrap();
        let image = provider.capture_instance(ZONE, &id, "img").unwrap();
        let described = provider.describe_image(ZONE, &image).unwrap().unwrap();
        assert_eq!(described.status, ImageStatus::Available);
    }

    #[test]
    fn eip_association_sets_public_ip() {
        let provider = SimulatedProvider::new()
            .with_security_group(ZONE, "sg-1")
            .with_keypair(ZONE, "kp-1");
        let instance = provider.run_instance(ZONE, &request("sg-1", "kp-1")).unwrap();
        let eip = provider.allocate_eip(ZONE, 2).unwrap();
        provider.associate_eip(ZONE, &eip, &instance).unwrap();
        let described = provider.describe_instance(ZONE, &instance).unwrap().unwrap();
        assert_eq!(described.public_ip, provider.eip(&eip).map(|e| e.address));
        assert!(provider.release_eip(ZONE, &eip).is_err());
        provider.dissociate_eip(ZONE, &eip).unwrap();
        provider.release_eip(ZONE, &eip).unwrap();
        assert!(provider.eip(&eip).is_none());
    }

    #[test]
    fn failure_injection_counts_calls() {
        let provider = SimulatedProvider::new().failing_on(Operation::CreateSecurityGroup);
        let err = provider.create_security_group(ZONE, "sg").unwrap_err();
        assert!(err.to_string().contains("simulated create_security_group failure"));
        assert_eq!(provider.calls(Operation::CreateSecurityGroup), 1);
        provider.recover(Operation::CreateSecurityGroup);
        assert!(provider.create_security_group(ZONE, "sg").is_ok());
    }
}
