//! [`SshCommunicator`]: sessions over the system `ssh` client.
//!
//! Key authentication passes the key with `-i` from a private temp file.
//! Password authentication runs `ssh` under `sshpass -e`, with the password
//! in the `SSHPASS` environment variable so it never appears on a command
//! line.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use camino::Utf8PathBuf;
use tracing::{debug, info};

use super::keyfile::KeyFile;
use super::{AuthMethod, Communicator, ConnectionConfig, Session};
use crate::context::BuildContext;
use crate::error::QcbakeError;
use crate::executor::{CommandExecutor, CommandSpec, ExecutionResult};
use crate::wait::{WaitPolicy, wait_for};

/// Command run to check that a login succeeds.
const LOGIN_CHECK_COMMAND: &str = "true";

/// Opens sessions by shelling out to `ssh`.
pub struct SshCommunicator {
    executor: Arc<dyn CommandExecutor>,
    retry_interval: Duration,
    key_dir: Utf8PathBuf,
}

impl SshCommunicator {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        let key_dir = Utf8PathBuf::from_path_buf(std::env::temp_dir())
            .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"));
        Self {
            executor,
            retry_interval: Duration::from_secs(5),
            key_dir,
        }
    }

    /// Delay between login attempts while the instance boots.
    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Directory that receives temporary key files.
    #[must_use]
    pub fn with_key_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.key_dir = dir.into();
        self
    }

    fn prepare(&self, config: &ConnectionConfig) -> Result<Vec<Login>> {
        if config.auth.is_empty() {
            return Err(QcbakeError::Credentials(
                "no authentication method available".to_string(),
            )
            .into());
        }
        config
            .auth
            .iter()
            .map(|method| -> Result<Login> {
                Ok(match method {
                    AuthMethod::PublicKey(key) => Login::Key(KeyFile::write(&self.key_dir, key)?),
                    AuthMethod::Password(password) => Login::Password(password.clone()),
                })
            })
            .collect()
    }
}

impl Communicator for SshCommunicator {
    fn connect(&self, ctx: &BuildContext, config: &ConnectionConfig) -> Result<Arc<dyn Session>> {
        let mut logins = self.prepare(config)?;
        info!("waiting for ssh on {}@{}:{}", config.username, config.host, config.port);

        let policy = WaitPolicy::new(config.timeout, self.retry_interval);
        let what = format!("ssh on {}:{}", config.host, config.port);
        let chosen = wait_for(ctx, &what, policy, || {
            for (index, login) in logins.iter().enumerate() {
                let spec = command_for(config, login, LOGIN_CHECK_COMMAND);
                let result = self.executor.execute(&spec)?;
                if result.success() {
                    return Ok(Some(index));
                }
                debug!(host = %config.host, method = login.kind(), code = ?result.code(), "login attempt failed");
            }
            Ok(None)
        })?;

        let login = logins.swap_remove(chosen);
        info!("connected to {} using {} authentication", config.host, login.kind());
        Ok(Arc::new(SshSession {
            executor: Arc::clone(&self.executor),
            config: config.clone(),
            login: Mutex::new(Some(login)),
        }))
    }
}

enum Login {
    Key(KeyFile),
    Password(String),
}

impl Login {
    fn kind(&self) -> &'static str {
        match self {
            Self::Key(_) => "key",
            Self::Password(_) => "password",
        }
    }
}

fn command_for(config: &ConnectionConfig, login: &Login, remote_command: &str) -> CommandSpec {
    let mut args = vec![
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", config.timeout.as_secs().clamp(1, 30)),
        "-p".to_string(),
        config.port.to_string(),
    ];
    let spec = match login {
        Login::Key(file) => {
            args.extend([
                "-o".to_string(),
                "BatchMode=yes".to_string(),
                "-o".to_string(),
                "IdentitiesOnly=yes".to_string(),
                "-i".to_string(),
                file.path().to_string(),
            ]);
            args.push(format!("{}@{}", config.username, config.host));
            args.push(remote_command.to_string());
            CommandSpec::new("ssh", args)
        }
        Login::Password(password) => {
            args.extend([
                "-o".to_string(),
                "PubkeyAuthentication=no".to_string(),
                "-o".to_string(),
                "NumberOfPasswordPrompts=1".to_string(),
            ]);
            args.push(format!("{}@{}", config.username, config.host));
            args.push(remote_command.to_string());
            let mut sshpass = vec!["-e".to_string(), "ssh".to_string()];
            sshpass.extend(args);
            CommandSpec::new("sshpass", sshpass).with_env("SSHPASS", password.as_str())
        }
    };
    spec.with_label(config.host.clone())
}

struct SshSession {
    executor: Arc<dyn CommandExecutor>,
    config: ConnectionConfig,
    login: Mutex<Option<Login>>,
}

impl Session for SshSession {
    fn host(&self) -> &str {
        &self.config.host
    }

    fn execute(&self, command: &str) -> Result<ExecutionResult> {
        let guard = self.login.lock().unwrap_or_else(|p| p.into_inner());
        let Some(login) = guard.as_ref() else {
            bail!("session to {} is closed", self.config.host);
        };
        let spec = command_for(&self.config, login, command);
        debug!(host = %self.config.host, "remote: {}", command);
        self.executor.execute(&spec)
    }

    fn disconnect(&self) -> Result<()> {
        let login = self.login.lock().unwrap_or_else(|p| p.into_inner()).take();
        if login.is_some() {
            info!("disconnected from {}", self.config.host);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::PrivateKey;
    use crate::communicator::test_keys::ED25519 as KEY;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    #[derive(Default)]
    struct Recording {
        specs: Mutex<Vec<CommandSpec>>,
        failures_left: Mutex<usize>,
    }

    impl CommandExecutor for Recording {
        fn execute(&self, spec: &CommandSpec) -> Result<ExecutionResult> {
            self.specs.lock().unwrap().push(spec.clone());
            let mut left = self.failures_left.lock().unwrap();
            let code = if *left > 0 {
                *left -= 1;
                255
            } else {
                0
            };
            Ok(ExecutionResult {
                status: Some(ExitStatus::from_raw(code << 8)),
            })
        }
    }

    fn config(auth: Vec<AuthMethod>) -> ConnectionConfig {
        ConnectionConfig {
            host: "203.0.113.5".to_string(),
            port: 22,
            username: "root".to_string(),
            auth,
            timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn password_login_uses_sshpass_env() {
        let executor = Arc::new(Recording::default());
        let communicator = SshCommunicator::new(executor.clone());
        let session = communicator
            .connect(&BuildContext::new(), &config(vec![AuthMethod::Password("pw".to_string())]))
            .unwrap();
        session.execute("uname -a").unwrap();

        let specs = executor.specs.lock().unwrap();
        assert_eq!(specs.len(), 2);
        let last = &specs[1];
        assert_eq!(last.command, "sshpass");
        assert_eq!(last.args[..2], ["-e".to_string(), "ssh".to_string()]);
        assert_eq!(last.args.last().unwrap(), "uname -a");
        assert!(last.args.contains(&"root@203.0.113.5".to_string()));
        assert!(!last.args.iter().any(|a| a.contains("pw")));
        assert_eq!(last.env, vec![("SSHPASS".to_string(), "pw".to_string())]);
    }

    #[test]
    fn key_login_disables_host_key_checks() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(Recording::default());
        let communicator = SshCommunicator::new(executor.clone())
            .with_key_dir(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap());
        let key = PrivateKey::parse(KEY).unwrap();
        let session = communicator
            .connect(&BuildContext::new(), &config(vec![AuthMethod::PublicKey(key)]))
            .unwrap();

        let first = executor.specs.lock().unwrap()[0].clone();
        assert_eq!(first.command, "ssh");
        assert!(first.args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(first.args.contains(&"-i".to_string()));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        session.disconnect().unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(session.execute("true").is_err());
        session.disconnect().unwrap();
    }

    #[test]
    fn falls_back_to_next_method_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Arc::new(Recording::default());
        *executor.failures_left.lock().unwrap() = 1;
        let communicator = SshCommunicator::new(executor.clone())
            .with_key_dir(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap());
        let key = PrivateKey::parse(KEY).unwrap();
        communicator
            .connect(
                &BuildContext::new(),
                &config(vec![AuthMethod::PublicKey(key), AuthMethod::Password("pw".to_string())]),
            )
            .unwrap();

        let specs = executor.specs.lock().unwrap();
        let commands: Vec<&str> = specs.iter().map(|s| s.command.as_str()).collect();
        assert_eq!(commands, vec!["ssh", "sshpass"]);
        // the unused key file is removed once the session is chosen
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn unreachable_host_times_out() {
        let executor = Arc::new(Recording::default());
        *executor.failures_left.lock().unwrap() = usize::MAX;
        let communicator =
            SshCommunicator::new(executor).with_retry_interval(Duration::from_millis(1));
        let mut cfg = config(vec![AuthMethod::Password("pw".to_string())]);
        cfg.timeout = Duration::from_millis(20);
        let err = communicator.connect(&BuildContext::new(), &cfg).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<QcbakeError>(),
            Some(QcbakeError::Timeout { .. })
        ));
    }

    #[test]
    fn no_auth_methods_is_a_credentials_error() {
        let communicator = SshCommunicator::new(Arc::new(Recording::default()));
        let err = communicator.connect(&BuildContext::new(), &config(vec![])).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<QcbakeError>(),
            Some(QcbakeError::Credentials(_))
        ));
    }
}
