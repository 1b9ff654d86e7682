//! Build template loading and validation.
//!
//! A template is YAML. [`RawConfig`] is what the file says;
//! [`RawConfig::validate`] checks it before any provider call and turns it
//! into a [`BuildConfig`] with defaults applied and paths resolved, plus a
//! list of human-readable warnings.
//!
//! ```yaml
//! zone: pek3a
//! image_id: centos7x64d
//! instance_type: s1.small.r1
//! security_group: new        # or sg-xxxxxxxx
//! keypair: local             # new | local | kp-xxxxxxxx | {public_key, private_key}
//! eip: true                  # false | true | new | eip-xxxxxxxx
//! provisioners:
//!   - type: shell
//!     content: yum -y update
//! ```

use std::fmt;
use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use serde::de::{self, MapAccess, Visitor};
use tracing::debug;

use crate::communicator::DEFAULT_SSH_PORT;
use crate::error::QcbakeError;
use crate::provisioner::Provisioner;

/// Sentinel meaning "allocate a new resource for this build".
pub const ALLOCATE_NEW: &str = "new";
/// Keypair sentinel meaning "import the local default key pair".
pub const LOCAL_KEY: &str = "local";
pub const DEFAULT_PUBLIC_KEY: &str = "~/.ssh/id_rsa.pub";
pub const DEFAULT_PRIVATE_KEY: &str = "~/.ssh/id_rsa";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3600);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_SSH_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_SSH_USERNAME: &str = "root";
pub const DEFAULT_VXNET: &str = "vxnet-0";
pub const DEFAULT_EIP_BANDWIDTH: u32 = 2;

/// Security group selection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SecurityGroupMode {
    /// Create a group for the build and delete it afterwards.
    #[default]
    New,
    /// Use the named group; never deleted.
    Existing(String),
}

impl<'de> Deserialize<'de> for SecurityGroupMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        match value.trim() {
            "" => Err(de::Error::custom("security_group must not be empty")),
            ALLOCATE_NEW => Ok(Self::New),
            id => Ok(Self::Existing(id.to_string())),
        }
    }
}

/// Host-side key pair files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPaths {
    pub public_key: Utf8PathBuf,
    pub private_key: Utf8PathBuf,
}

impl KeyPaths {
    fn local_default() -> Self {
        Self {
            public_key: Utf8PathBuf::from(DEFAULT_PUBLIC_KEY),
            private_key: Utf8PathBuf::from(DEFAULT_PRIVATE_KEY),
        }
    }
}

/// Login keypair selection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeypairMode {
    /// Let the provider generate a keypair; its private key is kept in memory.
    #[default]
    New,
    /// Import the public key from disk as a build keypair and log in with
    /// the matching private key.
    Paths(KeyPaths),
    /// Use the named keypair; never deleted. The private key must come from
    /// `ssh.private_key_path`.
    Existing(String),
}

impl<'de> Deserialize<'de> for KeypairMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(field_identifier, rename_all = "snake_case")]
        enum Field {
            PublicKey,
            PrivateKey,
        }

        struct KeypairVisitor;

        impl<'de> Visitor<'de> for KeypairVisitor {
            type Value = KeypairMode;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str(
                    "'new', 'local', a keypair id, or a map with 'public_key' and 'private_key'",
                )
            }

            fn visit_str<E>(self, value: &str) -> Result<KeypairMode, E>
            where
                E: de::Error,
            {
                match value.trim() {
                    "" => Err(E::custom("keypair must not be empty")),
                    ALLOCATE_NEW => Ok(KeypairMode::New),
                    LOCAL_KEY => Ok(KeypairMode::Paths(KeyPaths::local_default())),
                    id => Ok(KeypairMode::Existing(id.to_string())),
                }
            }

            fn visit_map<V>(self, mut map: V) -> Result<KeypairMode, V::Error>
            where
                V: MapAccess<'de>,
            {
                let mut public_key: Option<Utf8PathBuf> = None;
                let mut private_key: Option<Utf8PathBuf> = None;
                while let Some(key) = map.next_key()? {
                    match key {
                        Field::PublicKey if public_key.is_some() => {
                            return Err(de::Error::duplicate_field("public_key"));
                        }
                        Field::PublicKey => public_key = Some(map.next_value()?),
                        Field::PrivateKey if private_key.is_some() => {
                            return Err(de::Error::duplicate_field("private_key"));
                        }
                        Field::PrivateKey => private_key = Some(map.next_value()?),
                    }
                }
                Ok(KeypairMode::Paths(KeyPaths {
                    public_key: public_key.ok_or_else(|| de::Error::missing_field("public_key"))?,
                    private_key: private_key
                        .ok_or_else(|| de::Error::missing_field("private_key"))?,
                }))
            }
        }

        deserializer.deserialize_any(KeypairVisitor)
    }
}

/// Elastic IP selection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EipMode {
    /// No public address; the instance is reached on its private address.
    #[default]
    Disabled,
    /// Allocate an address for the build and release it afterwards.
    New,
    /// Associate the named address; dissociated but never released.
    Existing(String),
}

impl<'de> Deserialize<'de> for EipMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct EipVisitor;

        impl Visitor<'_> for EipVisitor {
            type Value = EipMode;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a boolean, 'new', or an eip id")
            }

            fn visit_bool<E>(self, value: bool) -> Result<EipMode, E>
            where
                E: de::Error,
            {
                Ok(if value { EipMode::New } else { EipMode::Disabled })
            }

            fn visit_str<E>(self, value: &str) -> Result<EipMode, E>
            where
                E: de::Error,
            {
                match value.trim() {
                    "" => Err(E::custom("eip must not be empty")),
                    ALLOCATE_NEW => Ok(EipMode::New),
                    id => Ok(EipMode::Existing(id.to_string())),
                }
            }
        }

        deserializer.deserialize_any(EipVisitor)
    }
}

/// `ssh:` section as written.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RawSshConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub private_key_path: Option<Utf8PathBuf>,
    pub port: Option<u16>,
    /// Seconds to wait for the instance to accept a login.
    pub timeout: Option<u64>,
}

/// The template as written.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    pub zone: Option<String>,
    /// Source image the instance boots from.
    pub image_id: Option<String>,
    pub instance_type: Option<String>,
    pub vxnet_id: Option<String>,
    #[serde(default)]
    pub security_group: SecurityGroupMode,
    #[serde(default)]
    pub keypair: KeypairMode,
    #[serde(default)]
    pub eip: EipMode,
    /// Mbps, for allocated addresses.
    pub eip_bandwidth: Option<u32>,
    #[serde(default)]
    pub ssh: RawSshConfig,
    /// Name of the captured image.
    pub image_name: Option<String>,
    /// Ceiling, in seconds, on every wait for provider state.
    pub timeout: Option<u64>,
    /// Polling interval in seconds.
    pub interval: Option<u64>,
    #[serde(default)]
    pub provisioners: Vec<Provisioner>,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub base_dir: Option<Utf8PathBuf>,
}

/// Validated `ssh:` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub username: String,
    pub password: Option<String>,
    pub private_key_path: Option<Utf8PathBuf>,
    pub port: u16,
    pub timeout: Duration,
}

/// Validated build configuration, seeded into the state bag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    pub zone: String,
    pub image_id: String,
    pub instance_type: String,
    pub vxnet_id: String,
    pub security_group: SecurityGroupMode,
    pub keypair: KeypairMode,
    pub eip: EipMode,
    pub eip_bandwidth: u32,
    pub ssh: SshConfig,
    pub image_name: String,
    pub timeout: Duration,
    pub interval: Duration,
    pub provisioners: Vec<Provisioner>,
}

impl RawConfig {
    /// Loads a template file. Relative paths in it resolve against its directory.
    pub fn from_file(path: &Utf8Path) -> Result<Self, QcbakeError> {
        let source = fs::read_to_string(path).map_err(|e| QcbakeError::io(path.as_str(), e))?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_str().is_empty())
            .unwrap_or(Utf8Path::new("."));
        debug!("loaded template {} (base dir {})", path, base_dir);
        let mut raw: RawConfig = serde_yaml::from_str(&source)
            .map_err(|e| QcbakeError::Config(format!("{}: {}", path, e)))?;
        raw.base_dir = Some(base_dir.to_path_buf());
        Ok(raw)
    }

    pub fn from_yaml_str(source: &str, base_dir: Option<&Utf8Path>) -> Result<Self, QcbakeError> {
        let mut raw: RawConfig =
            serde_yaml::from_str(source).map_err(|e| QcbakeError::Config(e.to_string()))?;
        raw.base_dir = base_dir.map(Utf8Path::to_path_buf);
        Ok(raw)
    }

    /// Checks the template and applies defaults.
    ///
    /// Every violated constraint is collected into one
    /// [`QcbakeError::Validation`]. Problems that do not prevent a build are
    /// returned as warnings instead.
    pub fn validate(&self) -> Result<(BuildConfig, Vec<String>), QcbakeError> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let home = std::env::var("HOME").ok();
        let resolve = |path: &Utf8Path| resolve_path(path, self.base_dir.as_deref(), home.as_deref());

        let mut required = |name: &str, value: &Option<String>| match value.as_deref().map(str::trim) {
            Some(v) if !v.is_empty() => v.to_string(),
            _ => {
                errors.push(format!("{} is required", name));
                String::new()
            }
        };
        let zone = required("zone", &self.zone);
        let image_id = required("image_id", &self.image_id);
        let instance_type = required("instance_type", &self.instance_type);

        let vxnet_id = match self.vxnet_id.as_deref().map(str::trim) {
            Some("") => {
                errors.push("vxnet_id must not be empty".to_string());
                String::new()
            }
            Some(v) => v.to_string(),
            None => DEFAULT_VXNET.to_string(),
        };

        if let SecurityGroupMode::Existing(id) = &self.security_group
            && !id.starts_with("sg-")
        {
            warnings.push(format!("security_group '{}' does not look like a security group id", id));
        }

        let ssh = self.validate_ssh(&resolve, &mut errors, &mut warnings);

        let keypair = match &self.keypair {
            KeypairMode::New => {
                if ssh.private_key_path.is_some() {
                    warnings.push(
                        "ssh.private_key_path is ignored: keypair 'new' logs in with the generated key"
                            .to_string(),
                    );
                }
                KeypairMode::New
            }
            KeypairMode::Paths(paths) => {
                let paths = KeyPaths {
                    public_key: resolve(&paths.public_key),
                    private_key: resolve(&paths.private_key),
                };
                for path in [&paths.public_key, &paths.private_key] {
                    if !path.is_file() {
                        errors.push(format!("key file not found: {}", path));
                    }
                }
                if ssh.private_key_path.is_some() {
                    warnings.push(
                        "ssh.private_key_path is ignored: the keypair's private_key is used"
                            .to_string(),
                    );
                }
                KeypairMode::Paths(paths)
            }
            KeypairMode::Existing(id) => {
                if ssh.private_key_path.is_none() && ssh.password.is_none() {
                    errors.push(format!(
                        "keypair '{}' is an existing keypair: set ssh.private_key_path or ssh.password to log in",
                        id
                    ));
                }
                if !id.starts_with("kp-") {
                    warnings.push(format!("keypair '{}' does not look like a keypair id", id));
                }
                KeypairMode::Existing(id.clone())
            }
        };

        let eip_bandwidth = match (&self.eip, self.eip_bandwidth) {
            (_, Some(0)) => {
                errors.push("eip_bandwidth must be positive".to_string());
                0
            }
            (EipMode::New, bandwidth) => bandwidth.unwrap_or(DEFAULT_EIP_BANDWIDTH),
            (_, Some(bandwidth)) => {
                warnings.push("eip_bandwidth only applies to eip: new and is ignored".to_string());
                bandwidth
            }
            (_, None) => DEFAULT_EIP_BANDWIDTH,
        };
        if self.eip == EipMode::Disabled {
            warnings.push(
                "eip is disabled: the instance is reached on its private address".to_string(),
            );
        }

        let timeout = seconds(self.timeout, DEFAULT_TIMEOUT, "timeout", &mut errors);
        let interval = seconds(self.interval, DEFAULT_INTERVAL, "interval", &mut errors);
        if !interval.is_zero() && interval >= timeout {
            errors.push(format!(
                "interval ({}s) must be shorter than timeout ({}s)",
                interval.as_secs(),
                timeout.as_secs()
            ));
        }
        if ssh.timeout > timeout {
            warnings.push(format!(
                "ssh.timeout ({}s) exceeds timeout ({}s)",
                ssh.timeout.as_secs(),
                timeout.as_secs()
            ));
        }

        let image_name = match self.image_name.as_deref().map(str::trim) {
            Some("") => {
                errors.push("image_name must not be empty".to_string());
                String::new()
            }
            Some(name) => name.to_string(),
            None => default_image_name(),
        };

        let mut provisioners = self.provisioners.clone();
        for (index, provisioner) in provisioners.iter_mut().enumerate() {
            if let Some(base_dir) = &self.base_dir {
                provisioner.resolve_paths(base_dir);
            }
            if let Err(e) = provisioner.validate() {
                errors.push(format!("provisioner {} ({}): {}", index + 1, provisioner.name(), e));
            }
        }
        if provisioners.is_empty() {
            warnings.push("no provisioners: the image will be a copy of the source image".to_string());
        }

        if !errors.is_empty() {
            return Err(QcbakeError::Validation(errors.join("; ")));
        }

        let config = BuildConfig {
            zone,
            image_id,
            instance_type,
            vxnet_id,
            security_group: self.security_group.clone(),
            keypair,
            eip: self.eip.clone(),
            eip_bandwidth,
            ssh,
            image_name,
            timeout,
            interval,
            provisioners,
        };
        Ok((config, warnings))
    }

    fn validate_ssh(
        &self,
        resolve: &impl Fn(&Utf8Path) -> Utf8PathBuf,
        errors: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) -> SshConfig {
        let raw = &self.ssh;
        let username = match raw.username.as_deref().map(str::trim) {
            Some("") => {
                errors.push("ssh.username must not be empty".to_string());
                String::new()
            }
            Some(name) => name.to_string(),
            None => DEFAULT_SSH_USERNAME.to_string(),
        };
        if raw.port == Some(0) {
            errors.push("ssh.port must not be 0".to_string());
        }
        let private_key_path = raw.private_key_path.as_deref().map(resolve);
        if let Some(path) = &private_key_path
            && !path.is_file()
        {
            errors.push(format!("ssh.private_key_path not found: {}", path));
        }
        if raw.password.as_deref() == Some("") {
            warnings.push("ssh.password is empty and will not be offered".to_string());
        }
        SshConfig {
            username,
            password: raw.password.clone().filter(|p| !p.is_empty()),
            private_key_path,
            port: raw.port.unwrap_or(DEFAULT_SSH_PORT),
            timeout: seconds(raw.timeout, DEFAULT_SSH_TIMEOUT, "ssh.timeout", errors),
        }
    }
}

fn seconds(value: Option<u64>, default: Duration, name: &str, errors: &mut Vec<String>) -> Duration {
    match value {
        Some(0) => {
            errors.push(format!("{} must be positive", name));
            Duration::ZERO
        }
        Some(secs) => Duration::from_secs(secs),
        None => default,
    }
}

fn default_image_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("qcbake-{}", &id[..8])
}

/// Expands a leading `~/` from `home`, then anchors relative paths at `base_dir`.
pub(crate) fn resolve_path(path: &Utf8Path, base_dir: Option<&Utf8Path>, home: Option<&str>) -> Utf8PathBuf {
    if let (Ok(rest), Some(home)) = (path.strip_prefix("~"), home) {
        return Utf8Path::new(home).join(rest);
    }
    match base_dir {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    }
}
