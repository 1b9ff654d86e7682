//! Domain-specific error types for qcbake.
//!
//! This module defines `QcbakeError`, a `thiserror`-based enum that
//! provides typed error variants for the failure modes of a build. Public API
//! functions return `Result<T, QcbakeError>` for programmatic error
//! handling, while trait boundaries (provider, communicator, executor, hook)
//! use `anyhow::Result`.
//!
//! `QcbakeError` implements `Into<anyhow::Error>`, so the `?` operator
//! converts it automatically at trait boundaries, and callers recover the
//! typed kind with `downcast`.

use std::io;
use std::time::Duration;

/// Formats an IO error kind into a human-readable message.
///
/// Common kinds get a short, stable message ("I/O error: not found")
/// instead of the OS-level text. Other kinds fall back to the OS message.
pub(crate) fn io_error_kind_message(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => "I/O error: not found".to_string(),
        io::ErrorKind::PermissionDenied => "I/O error: permission denied".to_string(),
        io::ErrorKind::IsADirectory => "I/O error: is a directory".to_string(),
        _ => format!("I/O error: {}", err),
    }
}

/// Extracts a human-readable message from a panic payload.
///
/// The returned `&str` borrows from the payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(|s| s.as_str()))
        .unwrap_or("unknown panic")
}

/// Domain-specific error type for qcbake.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum QcbakeError {
    /// The template could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A validation constraint on the template was violated.
    #[error("validation error: {0}")]
    Validation(String),

    /// A provider API call failed.
    #[error("provider error: {operation}: {message}")]
    Provider {
        /// The provider operation that failed (e.g. `run_instance`).
        operation: String,
        /// Provider-specific failure description.
        message: String,
    },

    /// Waiting for an externally observable state exceeded its ceiling.
    #[error("timed out after {limit:?} waiting for {what}")]
    Timeout {
        /// What was being waited for.
        what: String,
        /// The ceiling that was exceeded.
        limit: Duration,
    },

    /// Neither the public nor the private address is a usable IP address.
    #[error("address resolution error: {0}")]
    AddressResolution(String),

    /// Login credentials could not be used (e.g. unparsable private key).
    #[error("credentials error: {0}")]
    Credentials(String),

    /// The build was cancelled, explicitly or by its deadline.
    #[error("build cancelled: {0}")]
    Cancelled(String),

    /// A step panicked during its forward action.
    #[error("step '{step}' panicked: {message}")]
    StepPanicked {
        /// Name of the panicking step.
        step: String,
        /// Panic payload, if it was a string.
        message: String,
    },

    /// A step halted the pipeline without recording a reason.
    #[error("step '{0}' halted the build")]
    Halted(String),

    /// A state bag key a step depends on was never written.
    #[error("missing state: '{0}' was not set by an earlier step")]
    MissingState(String),

    /// A state bag key holds a value of an unexpected type.
    #[error("state type mismatch for '{key}': expected {expected}, found {found}")]
    StateType {
        /// The key that was read.
        key: String,
        /// The type the reader expected.
        expected: &'static str,
        /// The type actually stored.
        found: &'static str,
    },

    /// The pipeline ended without producing an image identifier.
    #[error("no artifact produced: the image id was never written")]
    NoArtifact,

    /// A local command failed (non-zero exit, spawn failure, thread panic, etc.).
    #[error("command execution failed: {command}: {status}")]
    Execution {
        /// The command that was executed.
        command: String,
        /// Human-readable reason for the failure.
        status: String,
    },

    /// An I/O operation failed with contextual information.
    #[error("{context}: {message}")]
    Io {
        /// What was being done when the error occurred (usually a path).
        context: String,
        /// Description derived from [`io_error_kind_message`].
        message: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl QcbakeError {
    /// Creates an `Io` variant with the `message` field derived from `source`.
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: io_error_kind_message(&source),
            source,
        }
    }

    /// Creates a `Provider` variant from an operation name and any displayable cause.
    pub(crate) fn provider(operation: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::Provider {
            operation: operation.into(),
            message: format!("{:#}", cause),
        }
    }

    /// Recovers a typed error from an `anyhow::Error`.
    ///
    /// If the error wraps a `QcbakeError` its kind is kept and any context
    /// attached above it is folded into its description; anything else
    /// becomes a `Provider` error attributed to `operation`.
    pub(crate) fn from_anyhow(operation: &str, err: anyhow::Error) -> Self {
        let context: Vec<String> = err
            .chain()
            .take_while(|cause| !cause.is::<QcbakeError>())
            .map(ToString::to_string)
            .collect();
        match err.downcast::<QcbakeError>() {
            Ok(typed) if context.is_empty() => typed,
            Ok(typed) => typed.with_context(&context.join(": ")),
            Err(other) => Self::provider(operation, other),
        }
    }

    /// Prefixes `context` to the free-text part of the error.
    ///
    /// Kinds whose fields name a step or state key are returned unchanged.
    fn with_context(self, context: &str) -> Self {
        let prefixed = |detail: String| format!("{}: {}", context, detail);
        match self {
            Self::Config(message) => Self::Config(prefixed(message)),
            Self::Validation(message) => Self::Validation(prefixed(message)),
            Self::Provider { operation, message } => Self::Provider {
                operation,
                message: prefixed(message),
            },
            Self::Timeout { what, limit } => Self::Timeout {
                what: format!("{} ({})", what, context),
                limit,
            },
            Self::AddressResolution(message) => Self::AddressResolution(prefixed(message)),
            Self::Credentials(message) => Self::Credentials(prefixed(message)),
            Self::Cancelled(reason) => Self::Cancelled(format!("{} ({})", reason, context)),
            Self::StepPanicked { step, message } => Self::StepPanicked {
                step,
                message: prefixed(message),
            },
            Self::Execution { command, status } => Self::Execution {
                command: prefixed(command),
                status,
            },
            Self::Io {
                context: what,
                message,
                source,
            } => Self::Io {
                context: prefixed(what),
                message,
                source,
            },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_display() {
        let err = QcbakeError::Validation("zone must not be empty".to_string());
        assert_eq!(err.to_string(), "validation error: zone must not be empty");
    }

    #[test]
    fn test_provider_display() {
        let err = QcbakeError::Provider {
            operation: "run_instance".to_string(),
            message: "quota exceeded".to_string(),
        };
        assert_eq!(err.to_string(), "provider error: run_instance: quota exceeded");
    }

    #[test]
    fn test_timeout_display() {
        let err = QcbakeError::Timeout {
            what: "instance i-123 to reach running".to_string(),
            limit: Duration::from_secs(5),
        };
        assert_eq!(err.to_string(), "timed out after 5s waiting for instance i-123 to reach running");
    }

    #[test]
    fn test_no_artifact_display() {
        assert!(QcbakeError::NoArtifact.to_string().contains("no artifact produced"));
    }

    #[test]
    fn test_state_type_display() {
        let err = QcbakeError::StateType {
            key: "image_id".to_string(),
            expected: "string",
            found: "integer",
        };
        assert_eq!(
            err.to_string(),
            "state type mismatch for 'image_id': expected string, found integer"
        );
    }

    #[test]
    fn test_io_display() {
        let source = io::Error::new(io::ErrorKind::NotFound, "entity not found");
        let err = QcbakeError::io("/path/to/template.yml", source);
        assert_eq!(err.to_string(), "/path/to/template.yml: I/O error: not found");
    }

    #[test]
    fn test_io_error_kind_message_other() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        assert!(io_error_kind_message(&err).starts_with("I/O error: "));
    }

    #[test]
    fn test_from_anyhow_preserves_typed_error() {
        let err: anyhow::Error = QcbakeError::AddressResolution("none".to_string()).into();
        let typed = QcbakeError::from_anyhow("connect", err);
        assert!(matches!(typed, QcbakeError::AddressResolution(_)));
    }

    #[test]
    fn test_from_anyhow_folds_context_into_typed_error() {
        use anyhow::Context as _;

        let result: anyhow::Result<()> = Err(QcbakeError::Execution {
            command: "shell:<inline>".to_string(),
            status: "exit status: 1".to_string(),
        }
        .into());
        let err = result.context("provisioner shell:<inline> failed").unwrap_err();

        let typed = QcbakeError::from_anyhow("run_provisioners", err);
        assert!(matches!(typed, QcbakeError::Execution { .. }));
        assert_eq!(
            typed.to_string(),
            "command execution failed: provisioner shell:<inline> failed: shell:<inline>: exit status: 1"
        );
    }

    #[test]
    fn test_from_anyhow_folds_nested_context_outermost_first() {
        use anyhow::Context as _;

        let result: Result<(), QcbakeError> = Err(QcbakeError::Credentials("no key".to_string()));
        let err = result
            .context("reading login")
            .context("connecting")
            .unwrap_err();

        let typed = QcbakeError::from_anyhow("connect", err);
        assert!(matches!(typed, QcbakeError::Credentials(ref m) if m == "connecting: reading login: no key"));
    }

    #[test]
    fn test_from_anyhow_wraps_untyped_error() {
        let err = anyhow::anyhow!("connection reset");
        let typed = QcbakeError::from_anyhow("describe_instance", err);
        match typed {
            QcbakeError::Provider { operation, message } => {
                assert_eq!(operation, "describe_instance");
                assert_eq!(message, "connection reset");
            }
            other => panic!("expected Provider error, got: {:?}", other),
        }
    }

    #[test]
    fn test_into_anyhow_error() {
        let err = QcbakeError::NoArtifact;
        let anyhow_err: anyhow::Error = err.into();
        assert!(matches!(
            anyhow_err.downcast_ref::<QcbakeError>(),
            Some(QcbakeError::NoArtifact)
        ));
    }
}
