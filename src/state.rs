//! Shared state passed through one provisioning run.
//!
//! The [`StateBag`] maps a closed set of [`StateKey`]s to tagged
//! [`StateValue`]s. Steps communicate exclusively through it: an earlier step
//! writes identifiers and connection parameters, later steps and the builder
//! read them. Typed getters fail with [`QcbakeError::StateType`] when a key
//! holds a different variant than the reader expects.
//!
//! The bag also carries an independent halt flag which the runner checks
//! before every step.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use strum::{Display, EnumIter};

use crate::communicator::Session;
use crate::config::BuildConfig;
use crate::error::QcbakeError;
use crate::hook::Hook;
use crate::ui::{LogUi, Ui};

/// Keys of the state bag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum StateKey {
    /// Validated build configuration, seeded by the builder.
    Config,
    /// Output sink, seeded by the builder.
    Ui,
    /// Provisioning hook, seeded by the builder.
    Hook,
    /// Reason recorded by the step that halted the run.
    Error,
    #[strum(serialize = "security_group_id")]
    SecurityGroup,
    #[strum(serialize = "keypair_id")]
    Keypair,
    #[strum(serialize = "private_key_content")]
    PrivateKey,
    Password,
    #[strum(serialize = "instance_id")]
    Instance,
    #[strum(serialize = "eip_id")]
    Eip,
    PublicIp,
    PrivateIp,
    /// Open remote session, owned by the connect step.
    Session,
    /// Captured image that has not reached the available state yet.
    PendingImage,
    ImageId,
}

/// Whether a provider resource was allocated by the run or supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Ownership {
    /// The caller named an existing resource; it must never be deleted.
    Existing,
    /// The run allocated the resource; cleanup must release it.
    Allocated,
}

/// A provider resource identifier together with its ownership flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub id: String,
    pub ownership: Ownership,
}

impl Resource {
    pub fn existing(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ownership: Ownership::Existing,
        }
    }

    pub fn allocated(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ownership: Ownership::Allocated,
        }
    }

    /// Returns true if the run is responsible for releasing this resource.
    pub fn is_owned(&self) -> bool {
        self.ownership == Ownership::Allocated
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.ownership)
    }
}

/// Tagged value stored in the state bag.
#[derive(Clone)]
pub enum StateValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Duration(Duration),
    Resource(Resource),
    Config(Arc<BuildConfig>),
    Ui(Arc<dyn Ui>),
    Hook(Arc<dyn Hook>),
    Session(Arc<dyn Session>),
    Error(Arc<QcbakeError>),
}

impl StateValue {
    /// Name of the variant, used in type mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Int(_) => "integer",
            Self::Bool(_) => "bool",
            Self::Duration(_) => "duration",
            Self::Resource(_) => "resource",
            Self::Config(_) => "config",
            Self::Ui(_) => "ui",
            Self::Hook(_) => "hook",
            Self::Session(_) => "session",
            Self::Error(_) => "error",
        }
    }
}

impl fmt::Debug for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.debug_tuple("Str").field(s).finish(),
            Self::Int(i) => f.debug_tuple("Int").field(i).finish(),
            Self::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Self::Duration(d) => f.debug_tuple("Duration").field(d).finish(),
            Self::Resource(r) => f.debug_tuple("Resource").field(r).finish(),
            Self::Error(e) => f.debug_tuple("Error").field(e).finish(),
            other => write!(f, "<{}>", other.type_name()),
        }
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Duration> for StateValue {
    fn from(value: Duration) -> Self {
        Self::Duration(value)
    }
}

impl From<Resource> for StateValue {
    fn from(value: Resource) -> Self {
        Self::Resource(value)
    }
}

impl From<QcbakeError> for StateValue {
    fn from(value: QcbakeError) -> Self {
        Self::Error(Arc::new(value))
    }
}

/// Key/value context shared by the steps of one run.
///
/// Access is serialized through an internal mutex so the bag can be shared
/// with helper threads a step may spawn. Values are cloned out on read; the
/// lock is never held across a step boundary.
#[derive(Default)]
pub struct StateBag {
    values: Mutex<HashMap<StateKey, StateValue>>,
    halted: AtomicBool,
}

impl StateBag {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<StateKey, StateValue>> {
        // A panicking step is caught by the runner; the map itself stays consistent.
        self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn put(&self, key: StateKey, value: impl Into<StateValue>) {
        let value = value.into();
        tracing::trace!(key = %key, kind = value.type_name(), "state put");
        self.lock().insert(key, value);
    }

    /// Returns a clone of the value under `key`, or `None` if absent.
    pub fn get(&self, key: StateKey) -> Option<StateValue> {
        self.lock().get(&key).cloned()
    }

    /// Returns true if `key` has been written.
    pub fn contains(&self, key: StateKey) -> bool {
        self.lock().contains_key(&key)
    }

    /// Removes and returns the value under `key`.
    pub fn take(&self, key: StateKey) -> Option<StateValue> {
        self.lock().remove(&key)
    }

    /// Sets the halt flag. The runner stops before the next step.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    /// Returns true once [`halt`](Self::halt) has been called.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn typed<T>(
        &self,
        key: StateKey,
        expected: &'static str,
        extract: impl FnOnce(StateValue) -> Result<T, StateValue>,
    ) -> Result<Option<T>, QcbakeError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => extract(value).map(Some).map_err(|other| QcbakeError::StateType {
                key: key.to_string(),
                expected,
                found: other.type_name(),
            }),
        }
    }

    fn required<T>(&self, key: StateKey, value: Result<Option<T>, QcbakeError>) -> Result<T, QcbakeError> {
        value?.ok_or_else(|| QcbakeError::MissingState(key.to_string()))
    }

    pub fn string(&self, key: StateKey) -> Result<Option<String>, QcbakeError> {
        self.typed(key, "string", |v| match v {
            StateValue::Str(s) => Ok(s),
            other => Err(other),
        })
    }

    pub fn require_string(&self, key: StateKey) -> Result<String, QcbakeError> {
        self.required(key, self.string(key))
    }

    pub fn int(&self, key: StateKey) -> Result<Option<i64>, QcbakeError> {
        self.typed(key, "integer", |v| match v {
            StateValue::Int(i) => Ok(i),
            other => Err(other),
        })
    }

    pub fn duration(&self, key: StateKey) -> Result<Option<Duration>, QcbakeError> {
        self.typed(key, "duration", |v| match v {
            StateValue::Duration(d) => Ok(d),
            other => Err(other),
        })
    }

    pub fn resource(&self, key: StateKey) -> Result<Option<Resource>, QcbakeError> {
        self.typed(key, "resource", |v| match v {
            StateValue::Resource(r) => Ok(r),
            other => Err(other),
        })
    }

    pub fn require_resource(&self, key: StateKey) -> Result<Resource, QcbakeError> {
        self.required(key, self.resource(key))
    }

    /// Removes and returns the resource under `key`.
    ///
    /// Cleanup actions use this so that a second cleanup finds nothing to
    /// release. A value of another type is left in place and reported.
    pub fn take_resource(&self, key: StateKey) -> Result<Option<Resource>, QcbakeError> {
        let mut values = self.lock();
        match values.remove(&key) {
            None => Ok(None),
            Some(StateValue::Resource(r)) => Ok(Some(r)),
            Some(other) => {
                let found = other.type_name();
                values.insert(key, other);
                Err(QcbakeError::StateType {
                    key: key.to_string(),
                    expected: "resource",
                    found,
                })
            }
        }
    }

    pub fn config(&self) -> Result<Arc<BuildConfig>, QcbakeError> {
        let value = self.typed(StateKey::Config, "config", |v| match v {
            StateValue::Config(c) => Ok(c),
            other => Err(other),
        });
        self.required(StateKey::Config, value)
    }

    /// Returns the seeded output sink, or a log-backed one if none was seeded.
    pub fn ui(&self) -> Arc<dyn Ui> {
        match self.get(StateKey::Ui) {
            Some(StateValue::Ui(ui)) => ui,
            _ => Arc::new(LogUi),
        }
    }

    pub fn hook(&self) -> Result<Option<Arc<dyn Hook>>, QcbakeError> {
        self.typed(StateKey::Hook, "hook", |v| match v {
            StateValue::Hook(h) => Ok(h),
            other => Err(other),
        })
    }

    pub fn session(&self) -> Result<Arc<dyn Session>, QcbakeError> {
        let value = self.typed(StateKey::Session, "session", |v| match v {
            StateValue::Session(s) => Ok(s),
            other => Err(other),
        });
        self.required(StateKey::Session, value)
    }

    pub fn error(&self) -> Result<Option<Arc<QcbakeError>>, QcbakeError> {
        self.typed(StateKey::Error, "error", |v| match v {
            StateValue::Error(e) => Ok(e),
            other => Err(other),
        })
    }
}

impl fmt::Debug for StateBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateBag")
            .field("values", &*self.lock())
            .field("halted", &self.is_halted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use strum::IntoEnumIterator;

    #[test]
    fn put_then_get_returns_value() {
        let state = StateBag::new();
        state.put(StateKey::ImageId, "img-123");
        assert!(state.contains(StateKey::ImageId));
        assert_eq!(state.string(StateKey::ImageId).unwrap(), Some("img-123".to_string()));
    }

    #[test]
    fn get_absent_key_returns_none() {
        let state = StateBag::new();
        assert!(state.get(StateKey::PublicIp).is_none());
        assert_eq!(state.string(StateKey::PublicIp).unwrap(), None);
    }

    #[test]
    fn typed_getter_rejects_mismatched_variant() {
        let state = StateBag::new();
        state.put(StateKey::ImageId, 42_i64);
        let err = state.string(StateKey::ImageId).unwrap_err();
        assert!(
            matches!(err, QcbakeError::StateType { expected: "string", found: "integer", .. }),
            "unexpected error: {:?}",
            err
        );
    }

    #[test]
    fn require_missing_key_reports_key_name() {
        let state = StateBag::new();
        let err = state.require_string(StateKey::PrivateIp).unwrap_err();
        assert_eq!(err.to_string(), "missing state: 'private_ip' was not set by an earlier step");
    }

    #[test]
    fn take_resource_removes_value() {
        let state = StateBag::new();
        state.put(StateKey::SecurityGroup, Resource::allocated("sg-1"));
        let taken = state.take_resource(StateKey::SecurityGroup).unwrap();
        assert_eq!(taken, Some(Resource::allocated("sg-1")));
        assert_eq!(state.take_resource(StateKey::SecurityGroup).unwrap(), None);
    }

    #[test]
    fn take_resource_keeps_mismatched_value() {
        let state = StateBag::new();
        state.put(StateKey::Eip, "eip-1");
        assert!(state.take_resource(StateKey::Eip).is_err());
        assert!(state.contains(StateKey::Eip));
    }

    #[test]
    fn halt_flag_is_independent_of_values() {
        let state = StateBag::new();
        assert!(!state.is_halted());
        state.halt();
        assert!(state.is_halted());
        assert!(state.get(StateKey::Error).is_none());
    }

    #[test]
    fn ui_falls_back_to_log_ui() {
        let state = StateBag::new();
        // Does not panic without a seeded ui.
        state.ui().say("hello");
    }

    #[test]
    fn key_names_are_unique() {
        let names: HashSet<String> = StateKey::iter().map(|k| k.to_string()).collect();
        assert_eq!(names.len(), StateKey::iter().count());
        assert!(names.contains("security_group_id"));
        assert!(names.contains("private_key_content"));
    }

    #[test]
    fn resource_ownership() {
        assert!(Resource::allocated("kp-1").is_owned());
        assert!(!Resource::existing("kp-1").is_owned());
        assert_eq!(Resource::existing("kp-1").to_string(), "kp-1 (existing)");
    }

    #[test]
    fn concurrent_put_and_get() {
        let state = Arc::new(StateBag::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || {
                    state.put(StateKey::PublicIp, format!("203.0.113.{}", i));
                    state.get(StateKey::PublicIp).is_some()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }
}
