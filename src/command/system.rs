//! Runner that spawns real child processes via tokio.

use std::io::ErrorKind;
use std::process::Stdio;

use nix::unistd::User;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{CommandOutput, CommandRunner, CommandSpec};
use crate::error::{BootstrapError, BootstrapResult};
use crate::types::Identity;

/// Shell convention for "command not found".
const EXIT_NOT_FOUND: i32 = 127;

/// Runs commands on the local host.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn lookup_user(identity: &Identity) -> BootstrapResult<User> {
    User::from_name(identity.as_str())
        .map_err(|e| BootstrapError::config(format!("looking up user `{identity}`: {e}")))?
        .ok_or_else(|| BootstrapError::config(format!("user `{identity}` does not exist")))
}

impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> BootstrapResult<CommandOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(identity) = &spec.run_as {
            let user = lookup_user(identity)?;
            cmd.uid(user.uid.as_raw())
                .gid(user.gid.as_raw())
                .env("HOME", &user.dir)
                .env("USER", &user.name)
                .env("LOGNAME", &user.name);
        }

        let rendered = spec.render();
        match &spec.run_as {
            Some(identity) => info!(user = %identity, "Running `{}`", rendered),
            None => info!("Running `{}`", rendered),
        }

        let output = match spec.timeout {
            Some(limit) => match tokio::time::timeout(limit, cmd.output()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout_secs = limit.as_secs(), "`{}` timed out", rendered);
                    return Err(BootstrapError::CommandFailed {
                        command: rendered,
                        status: None,
                        stderr: format!("timed out after {}s", limit.as_secs()),
                    });
                }
            },
            None => cmd.output().await,
        };

        let output = match output {
            Ok(output) => output,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(BootstrapError::CommandFailed {
                    command: rendered,
                    status: Some(EXIT_NOT_FOUND),
                    stderr: format!("{}: command not found", spec.program),
                });
            }
            Err(e) => return Err(BootstrapError::Io(format!("spawning `{rendered}`: {e}"))),
        };

        let result = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(status = ?result.status, "`{}` finished", rendered);

        Ok(result)
    }
}
