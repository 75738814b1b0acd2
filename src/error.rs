//! Error types for bootstrap and launcher operations.
//!
//! Every variant maps to a process exit status via [`BootstrapError::exit_code`]
//! so that `main` can mirror the failing step's status to the operator.

use std::fmt;
use std::time::Duration;

/// Exit status used when the installer is not run with elevated privilege.
pub const EXIT_NOT_PRIVILEGED: i32 = 1;

/// Exit status for invalid or missing configuration.
pub const EXIT_CONFIG: i32 = 2;

/// Exit status when a service never became ready.
pub const EXIT_NOT_READY: i32 = 3;

/// Exit status for interrupted runs (128 + SIGINT).
pub const EXIT_CANCELLED: i32 = 130;

/// Errors that can occur while bootstrapping a cell or launching a node.
#[derive(Debug)]
pub enum BootstrapError {
    /// The effective user is not root.
    NotPrivileged { euid: u32 },

    /// Configuration could not be loaded or failed validation.
    Config(String),

    /// An external command exited unsuccessfully.
    CommandFailed {
        /// Rendered command line, for the operator.
        command: String,
        /// Exit status, `None` if killed by a signal or timed out.
        status: Option<i32>,
        /// Trimmed stderr of the command.
        stderr: String,
    },

    /// A readiness probe did not succeed within its window.
    NotReady {
        target: String,
        waited: Duration,
        last_error: String,
    },

    /// The operator interrupted the run.
    Cancelled,

    /// A unit name contains characters unsafe for paths or argv.
    InvalidUnitName(String),

    /// Filesystem error outside of an external command.
    Io(String),
}

impl fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPrivileged { euid } => {
                write!(f, "must be run as root (effective uid is {})", euid)
            }
            Self::Config(msg) => write!(f, "Configuration error: {}", msg),
            Self::CommandFailed {
                command,
                status,
                stderr,
            } => {
                match status {
                    Some(code) => write!(f, "`{}` failed with exit status {}", command, code)?,
                    None => write!(f, "`{}` was terminated before completing", command)?,
                }
                if !stderr.is_empty() {
                    write!(f, ": {}", stderr)?;
                }
                Ok(())
            }
            Self::NotReady {
                target,
                waited,
                last_error,
            } => write!(
                f,
                "{} not ready after {}s (last error: {})",
                target,
                waited.as_secs(),
                last_error
            ),
            Self::Cancelled => write!(f, "Interrupted"),
            Self::InvalidUnitName(name) => write!(f, "Invalid unit name: {:?}", name),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for BootstrapError {}

/// Result type for bootstrap operations.
pub type BootstrapResult<T> = Result<T, BootstrapError>;

impl From<std::io::Error> for BootstrapError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl BootstrapError {
    /// Process exit status to report for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotPrivileged { .. } => EXIT_NOT_PRIVILEGED,
            Self::Config(_) | Self::InvalidUnitName(_) => EXIT_CONFIG,
            Self::CommandFailed { status, .. } => match status {
                Some(code) if *code != 0 => *code,
                _ => 1,
            },
            Self::NotReady { .. } => EXIT_NOT_READY,
            Self::Cancelled => EXIT_CANCELLED,
            Self::Io(_) => 1,
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

/// Map an `anyhow` error chain to an exit status, preferring the first
/// [`BootstrapError`] found in the chain.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<BootstrapError>())
        .map(BootstrapError::exit_code)
        .unwrap_or(1)
}
