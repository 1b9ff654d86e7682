//! Provisioners run on the instance before it is captured.
//!
//! A provisioner is declared in the template under `provisioners:` with a
//! `type` tag. Only `shell` exists today: an inline `content` block or a
//! host-side `script` file, executed through the open remote session.

use std::borrow::Cow;
use std::fmt;
use std::fs;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use serde::de::{self, MapAccess, Visitor};
use tracing::info;

use crate::communicator::Session;
use crate::error::QcbakeError;

/// Where a script comes from. Exactly one of `script` or `content`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    /// Script file on the machine running the build.
    Script(Utf8PathBuf),
    /// Inline script.
    Content(String),
}

impl ScriptSource {
    pub fn name(&self) -> &str {
        match self {
            Self::Script(path) => path.as_str(),
            Self::Content(_) => "<inline>",
        }
    }

    fn load(&self) -> Result<Cow<'_, str>> {
        match self {
            Self::Script(path) => fs::read_to_string(path)
                .map(Cow::Owned)
                .with_context(|| format!("failed to read script {}", path)),
            Self::Content(content) => Ok(Cow::Borrowed(content)),
        }
    }
}

/// Shell provisioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellProvisioner {
    source: ScriptSource,
    /// Remote interpreter (default: /bin/sh).
    shell: String,
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

impl<'de> Deserialize<'de> for ShellProvisioner {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(field_identifier, rename_all = "lowercase")]
        enum Field {
            Script,
            Content,
            Shell,
        }

        struct ShellVisitor;

        impl<'de> Visitor<'de> for ShellVisitor {
            type Value = ShellProvisioner;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a shell provisioner with either 'script' or 'content'")
            }

            fn visit_map<V>(self, mut map: V) -> std::result::Result<ShellProvisioner, V::Error>
            where
                V: MapAccess<'de>,
            {
                let mut script: Option<Utf8PathBuf> = None;
                let mut content: Option<String> = None;
                let mut shell: Option<String> = None;

                while let Some(key) = map.next_key()? {
                    match key {
                        Field::Script if script.is_some() => {
                            return Err(de::Error::duplicate_field("script"));
                        }
                        Field::Script => script = Some(map.next_value()?),
                        Field::Content if content.is_some() => {
                            return Err(de::Error::duplicate_field("content"));
                        }
                        Field::Content => content = Some(map.next_value()?),
                        Field::Shell if shell.is_some() => {
                            return Err(de::Error::duplicate_field("shell"));
                        }
                        Field::Shell => shell = Some(map.next_value()?),
                    }
                }

                let source = match (script, content) {
                    (Some(_), Some(_)) => {
                        return Err(de::Error::custom(
                            "'script' and 'content' are mutually exclusive",
                        ));
                    }
                    (None, None) => {
                        return Err(de::Error::custom(
                            "either 'script' or 'content' must be specified",
                        ));
                    }
                    (Some(s), None) => ScriptSource::Script(s),
                    (None, Some(c)) => ScriptSource::Content(c),
                };

                Ok(ShellProvisioner {
                    source,
                    shell: shell.unwrap_or_else(default_shell),
                })
            }
        }

        const FIELDS: &[&str] = &["script", "content", "shell"];
        deserializer.deserialize_struct("ShellProvisioner", FIELDS, ShellVisitor)
    }
}

impl ShellProvisioner {
    pub fn new(source: ScriptSource) -> Self {
        Self {
            source,
            shell: default_shell(),
        }
    }

    pub fn with_shell(source: ScriptSource, shell: impl Into<String>) -> Self {
        Self {
            source,
            shell: shell.into(),
        }
    }

    pub fn source(&self) -> &ScriptSource {
        &self.source
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    fn resolve_paths(&mut self, base_dir: &Utf8Path) {
        if let ScriptSource::Script(path) = &mut self.source
            && path.is_relative()
        {
            *path = base_dir.join(path.as_path());
        }
    }

    fn validate(&self) -> Result<(), QcbakeError> {
        if !self.shell.starts_with('/') {
            return Err(QcbakeError::Validation(format!(
                "shell must be an absolute path on the instance: '{}'",
                self.shell
            )));
        }
        match &self.source {
            ScriptSource::Script(path) => {
                let metadata = fs::metadata(path)
                    .map_err(|e| QcbakeError::io(format!("shell script {}", path), e))?;
                if !metadata.is_file() {
                    return Err(QcbakeError::Validation(format!(
                        "shell script is not a file: {}",
                        path
                    )));
                }
            }
            ScriptSource::Content(content) if content.trim().is_empty() => {
                return Err(QcbakeError::Validation(
                    "inline shell content must not be empty".to_string(),
                ));
            }
            ScriptSource::Content(_) => {}
        }
        Ok(())
    }

    /// The remote command line that runs this script.
    pub fn command(&self) -> Result<String> {
        let script = self.source.load()?;
        Ok(format!(
            "{} -c {}",
            shell_words::quote(&self.shell),
            shell_words::quote(&script)
        ))
    }

    fn execute(&self, session: &dyn Session) -> Result<()> {
        let command = self.command()?;
        info!("running shell provisioner {} on {}", self.source.name(), session.host());
        let result = session.execute(&command)?;
        match result.status {
            Some(status) if !status.success() => Err(QcbakeError::Execution {
                command: format!("shell:{}", self.source.name()),
                status: status.to_string(),
            }
            .into()),
            _ => Ok(()),
        }
    }
}

/// Declared provisioner, dispatched on its `type` tag.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Provisioner {
    Shell(ShellProvisioner),
}

impl Provisioner {
    pub fn name(&self) -> Cow<'_, str> {
        match self {
            Self::Shell(p) => Cow::Owned(format!("shell:{}", p.source().name())),
        }
    }

    /// Makes relative script paths relative to the template directory.
    pub fn resolve_paths(&mut self, base_dir: &Utf8Path) {
        match self {
            Self::Shell(p) => p.resolve_paths(base_dir),
        }
    }

    pub fn validate(&self) -> Result<(), QcbakeError> {
        match self {
            Self::Shell(p) => p.validate(),
        }
    }

    /// Runs the provisioner through `session`.
    pub fn execute(&self, session: &dyn Session) -> Result<()> {
        match self {
            Self::Shell(p) => p.execute(session),
        }
    }
}
