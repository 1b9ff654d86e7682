mod helpers;

use std::sync::Arc;

use helpers::{ED25519_KEY, ED25519_PUBLIC_KEY, MINIMAL_TEMPLATE, utf8_tempdir, write_file};
use qcbake::config::RawConfig;
use qcbake::context::BuildContext;
use qcbake::provider::{Operation, SimulatedProvider};
use qcbake::state::{Ownership, Resource, StateBag, StateKey, StateValue};
use qcbake::step::{Step, StepAction};
use qcbake::steps::{CreateInstance, EnsureKeypair, EnsureSecurityGroup};

const ZONE: &str = "pek3a";

fn bag_for(raw: &RawConfig) -> StateBag {
    let (config, _) = raw.validate().unwrap();
    let state = StateBag::new();
    state.put(StateKey::Config, StateValue::Config(Arc::new(config)));
    state
}

fn bag_from(template: &str) -> StateBag {
    bag_for(&RawConfig::from_yaml_str(template, None).unwrap())
}

#[test]
fn test_allocated_security_group_is_deleted_once() {
    let provider = Arc::new(SimulatedProvider::new());
    let state = bag_from(MINIMAL_TEMPLATE);
    let step = EnsureSecurityGroup::new(provider.clone());

    assert_eq!(step.run(&BuildContext::new(), &state), StepAction::Continue);
    let group = state.require_resource(StateKey::SecurityGroup).unwrap();
    assert_eq!(group.ownership, Ownership::Allocated);
    assert!(provider.has_security_group(&group.id));

    step.cleanup(&state).unwrap();
    step.cleanup(&state).unwrap();
    assert!(!provider.has_security_group(&group.id));
    assert_eq!(provider.calls(Operation::DeleteSecurityGroup), 1);
}

#[test]
fn test_existing_security_group_is_never_deleted() {
    let provider = Arc::new(SimulatedProvider::new().with_security_group(ZONE, "sg-shared"));
    let state = bag_from(&format!("{}security_group: sg-shared\n", MINIMAL_TEMPLATE));
    let step = EnsureSecurityGroup::new(provider.clone());

    assert_eq!(step.run(&BuildContext::new(), &state), StepAction::Continue);
    let group = state.require_resource(StateKey::SecurityGroup).unwrap();
    assert_eq!(group.ownership, Ownership::Existing);

    step.cleanup(&state).unwrap();
    assert!(provider.has_security_group("sg-shared"));
    assert_eq!(provider.calls(Operation::DeleteSecurityGroup), 0);
}

#[test]
fn test_keypair_paths_resolve_against_template_directory() {
    let (_dir, path) = utf8_tempdir();
    write_file(&path, "id_ed25519.pub", ED25519_PUBLIC_KEY);
    write_file(&path, "id_ed25519", ED25519_KEY);
    let template = write_file(
        &path,
        "template.yml",
        &format!(
            "{}keypair:\n  public_key: id_ed25519.pub\n  private_key: id_ed25519\n",
            MINIMAL_TEMPLATE
        ),
    );

    let provider = Arc::new(SimulatedProvider::new());
    let state = bag_for(&RawConfig::from_file(&template).unwrap());
    let step = EnsureKeypair::new(provider.clone());

    assert_eq!(step.run(&BuildContext::new(), &state), StepAction::Continue);
    let keypair = state.require_resource(StateKey::Keypair).unwrap();
    assert_eq!(keypair.ownership, Ownership::Allocated);
    assert_eq!(state.require_string(StateKey::PrivateKey).unwrap(), ED25519_KEY);

    step.cleanup(&state).unwrap();
    assert!(!provider.has_keypair(&keypair.id));
}

#[test]
fn test_instance_creation_failure_leaves_nothing_to_terminate() {
    let provider = Arc::new(
        SimulatedProvider::new()
            .with_security_group(ZONE, "sg-1")
            .failing_on(Operation::RunInstance),
    );
    let state = bag_from(MINIMAL_TEMPLATE);
    let step = CreateInstance::new(provider.clone());
    state.put(StateKey::SecurityGroup, Resource::existing("sg-1"));
    state.put(StateKey::Password, "s3cret");

    assert_eq!(step.run(&BuildContext::new(), &state), StepAction::Halt);
    assert_eq!(provider.calls(Operation::RunInstance), 1);
    assert!(!state.contains(StateKey::Instance));

    step.cleanup(&state).unwrap();
    assert_eq!(provider.calls(Operation::TerminateInstance), 0);
}
