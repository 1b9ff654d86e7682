//! Remote command capability.
//!
//! [`Communicator`] opens a [`Session`] to a freshly booted instance,
//! described by a [`ConnectionConfig`]. The default implementation,
//! [`SshCommunicator`], drives the system `ssh` client through a
//! [`CommandExecutor`](crate::executor::CommandExecutor).
//!
//! Host keys are never verified. Instances are created moments before the
//! connection and have no known host key to check against.

mod keyfile;
mod ssh;

use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Result;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use regex::Regex;

use crate::context::BuildContext;
use crate::error::QcbakeError;
use crate::executor::ExecutionResult;

pub use ssh::SshCommunicator;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

static PEM_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)\A\s*-----BEGIN ([A-Z0-9 ]*PRIVATE KEY)-----\r?\n(.*?)\r?\n?-----END ([A-Z0-9 ]*PRIVATE KEY)-----\s*\z",
    )
    .expect("PEM block pattern is valid")
});

const OPENSSH_LABEL: &str = "OPENSSH PRIVATE KEY";

/// A PEM armored private key that decodes to real key material.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey {
    label: String,
    pem: String,
}

impl PrivateKey {
    /// Parses PEM armored key material.
    ///
    /// OpenSSH keys are decoded with `ssh-key`. Other PEM labels (PKCS#1,
    /// SEC1, PKCS#8) must carry a base64 body that decodes to a single DER
    /// sequence. Passphrase protected keys are rejected because the build
    /// runs unattended.
    pub fn parse(pem: &str) -> Result<Self, QcbakeError> {
        let captures = PEM_BLOCK.captures(pem).ok_or_else(|| {
            QcbakeError::Credentials("private key is not a PEM armored private key".to_string())
        })?;
        let label = &captures[1];
        if label != &captures[3] {
            return Err(QcbakeError::Credentials(format!(
                "private key armor mismatch: BEGIN {} but END {}",
                label, &captures[3]
            )));
        }
        if label.contains("ENCRYPTED") {
            return Err(passphrase_protected());
        }

        let mut pem = pem.trim().to_string();
        pem.push('\n');
        if label == OPENSSH_LABEL {
            let key = ssh_key::PrivateKey::from_openssh(&pem).map_err(|e| {
                QcbakeError::Credentials(format!("private key is not a valid OpenSSH key: {}", e))
            })?;
            if key.is_encrypted() {
                return Err(passphrase_protected());
            }
        } else {
            check_der_body(&captures[2])?;
        }

        Ok(Self {
            label: label.to_string(),
            pem,
        })
    }

    /// The armor label, e.g. `OPENSSH PRIVATE KEY`.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

fn passphrase_protected() -> QcbakeError {
    QcbakeError::Credentials("passphrase protected private keys are not supported".to_string())
}

/// Decodes a legacy PEM body and checks it holds exactly one DER sequence.
fn check_der_body(body: &str) -> Result<(), QcbakeError> {
    let mut encoded = String::new();
    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some((header, value)) = line.split_once(':') {
            if header == "Proc-Type" && value.contains("ENCRYPTED") {
                return Err(passphrase_protected());
            }
            continue;
        }
        encoded.push_str(line);
    }
    if encoded.is_empty() {
        return Err(QcbakeError::Credentials("private key body is empty".to_string()));
    }

    let der = BASE64_STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| QcbakeError::Credentials(format!("private key body is not valid base64: {}", e)))?;
    match der_sequence_len(&der) {
        Some(len) if len == der.len() => Ok(()),
        _ => Err(QcbakeError::Credentials(
            "private key body is not a DER encoded key".to_string(),
        )),
    }
}

/// Total encoded length of the DER SEQUENCE at the start of `der`.
fn der_sequence_len(der: &[u8]) -> Option<usize> {
    let (&tag, rest) = der.split_first()?;
    if tag != 0x30 {
        return None;
    }
    let (&first, rest) = rest.split_first()?;
    let (content, header) = if first & 0x80 == 0 {
        (usize::from(first), 2)
    } else {
        let octets = usize::from(first & 0x7f);
        if octets == 0 || octets > 4 || rest.len() < octets {
            return None;
        }
        let content = rest[..octets].iter().fold(0usize, |acc, &b| (acc << 8) | usize::from(b));
        (content, 2 + octets)
    };
    if content == 0 {
        return None;
    }
    content.checked_add(header)
}

/// One way of authenticating. Methods are tried in the order configured.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    PublicKey(PrivateKey),
    Password(String),
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PublicKey(key) => f.debug_tuple("PublicKey").field(key).finish(),
            Self::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

/// Remote access parameters, computed from the state bag on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: Vec<AuthMethod>,
    /// How long to wait for the endpoint to accept a login.
    pub timeout: Duration,
}

/// An open remote session.
pub trait Session: Send + Sync {
    /// The host this session is connected to.
    fn host(&self) -> &str;

    /// Runs a shell command line on the remote host.
    fn execute(&self, command: &str) -> Result<ExecutionResult>;

    /// Closes the session. Calling it twice is harmless.
    fn disconnect(&self) -> Result<()>;
}

/// Opens remote sessions.
pub trait Communicator: Send + Sync {
    /// Waits, bounded by `config.timeout`, until the host accepts a login.
    fn connect(&self, ctx: &BuildContext, config: &ConnectionConfig) -> Result<Arc<dyn Session>>;
}
