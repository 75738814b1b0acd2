// External command execution

use std::future::Future;
use std::time::Duration;

use crate::error::{BootstrapError, BootstrapResult};
use crate::types::Identity;

pub mod system;

#[cfg(test)]
pub mod recording;

pub use system::SystemRunner;

/// A single external command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Account to run as; `None` runs as the invoking user.
    pub run_as: Option<Identity>,
    pub timeout: Option<Duration>,
    /// Indices into `args` that are masked when rendered.
    pub secret_args: Vec<usize>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            run_as: None,
            timeout: None,
            secret_args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append an argument that must never show up in logs.
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.secret_args.push(self.args.len());
        self.args.push(arg.into());
        self
    }

    pub fn run_as(mut self, identity: Option<Identity>) -> Self {
        self.run_as = identity;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Human-readable command line for logs and error messages.
    pub fn render(&self) -> String {
        let mut out = self.program.clone();
        for (idx, arg) in self.args.iter().enumerate() {
            out.push(' ');
            if self.secret_args.contains(&idx) {
                out.push_str("****");
            } else if arg.is_empty() || arg.contains(char::is_whitespace) {
                out.push_str(&format!("{:?}", arg));
            } else {
                out.push_str(arg);
            }
        }
        out
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status; `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success() -> Self {
        Self {
            status: Some(0),
            ..Default::default()
        }
    }

    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(0)
    }

    /// Convert a non-zero exit into [`BootstrapError::CommandFailed`].
    pub fn check(self, spec: &CommandSpec) -> BootstrapResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(BootstrapError::CommandFailed {
                command: spec.render(),
                status: self.status,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs external commands.
///
/// Implementations return `Ok` for any command that ran to completion, even
/// with a non-zero status; callers decide whether that status is fatal via
/// [`CommandOutput::check`]. `Err` is reserved for commands that could not be
/// started or did not finish.
pub trait CommandRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec)
    -> impl Future<Output = BootstrapResult<CommandOutput>> + Send;
}

/// Run a command and fail on non-zero exit.
pub async fn run_checked<R: CommandRunner>(
    runner: &R,
    spec: &CommandSpec,
) -> BootstrapResult<CommandOutput> {
    runner.run(spec).await?.check(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_quotes_whitespace() {
        let spec = CommandSpec::new("admin")
            .arg("ldap")
            .arg("cell configure")
            .arg("");
        assert_eq!(spec.render(), "admin ldap \"cell configure\" \"\"");
    }

    #[test]
    fn test_render_masks_secrets() {
        let spec = CommandSpec::new("admin")
            .arg("--rootpw")
            .secret_arg("hunter2")
            .arg("--owner");
        assert_eq!(spec.render(), "admin --rootpw **** --owner");
        assert_eq!(spec.args[1], "hunter2");
    }

    #[test]
    fn test_check_maps_failure() {
        let spec = CommandSpec::new("systemctl").args(["daemon-reload"]);
        let err = CommandOutput::failure(4, "  access denied\n")
            .check(&spec)
            .unwrap_err();

        match err {
            BootstrapError::CommandFailed {
                command,
                status,
                stderr,
            } => {
                assert_eq!(command, "systemctl daemon-reload");
                assert_eq!(status, Some(4));
                assert_eq!(stderr, "access denied");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert!(CommandOutput::success().check(&spec).is_ok());
    }
}
