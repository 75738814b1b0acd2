//! The launch chain: each stage adjusts the process environment and then
//! execs the next one, ending in the service scanner.

use std::convert::Infallible;
use std::ffi::CString;
use std::path::PathBuf;

use nix::unistd::execvp;
use tracing::info;

use crate::config::LauncherConfig;
use crate::error::{BootstrapError, BootstrapResult};
use crate::types::Identity;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchStage {
    /// Lower I/O scheduling priority.
    IoPriority {
        ionice: PathBuf,
        class: u8,
        level: u8,
    },
    /// Load environment variables from a directory of files.
    EnvDir { envdir: PathBuf, dir: PathBuf },
    /// Orchestration tool's `sproc exec` wrapper.
    OrchestrationExec { admin_bin: PathBuf },
    /// Minimal init that reaps orphans.
    InitReaper { pid1: PathBuf, args: Vec<String> },
    /// Switch to the owner identity.
    PrivilegeDrop { setuidgid: PathBuf, owner: Identity },
    /// Supervise every service directory under `scan_dir`.
    ServiceScanner { svscan: PathBuf, scan_dir: PathBuf },
}

impl LaunchStage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::IoPriority { .. } => "io-priority",
            Self::EnvDir { .. } => "env-dir",
            Self::OrchestrationExec { .. } => "orchestration-exec",
            Self::InitReaper { .. } => "init-reaper",
            Self::PrivilegeDrop { .. } => "privilege-drop",
            Self::ServiceScanner { .. } => "service-scanner",
        }
    }

    fn push_argv(&self, argv: &mut Vec<String>) {
        let path = |p: &PathBuf| p.to_string_lossy().into_owned();
        match self {
            Self::IoPriority {
                ionice,
                class,
                level,
            } => argv.extend([path(ionice), format!("-c{class}"), format!("-n{level}")]),
            Self::EnvDir { envdir, dir } => argv.extend([path(envdir), path(dir)]),
            Self::OrchestrationExec { admin_bin } => argv.extend([
                path(admin_bin),
                "sproc".to_string(),
                "--cell".to_string(),
                "-".to_string(),
                "exec".to_string(),
                "--".to_string(),
            ]),
            Self::InitReaper { pid1, args } => {
                argv.push(path(pid1));
                argv.extend(args.iter().cloned());
            }
            Self::PrivilegeDrop { setuidgid, owner } => {
                argv.extend([path(setuidgid), owner.to_string()])
            }
            Self::ServiceScanner { svscan, scan_dir } => {
                argv.extend([path(svscan), path(scan_dir)])
            }
        }
    }
}

/// Ordered stages flattened into a single argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecChain {
    stages: Vec<LaunchStage>,
}

impl ExecChain {
    pub fn new(stages: Vec<LaunchStage>) -> Self {
        Self { stages }
    }

    /// The node supervisor chain described by a launcher config.
    pub fn from_config(config: &LauncherConfig) -> Self {
        let tools = &config.tools;
        Self::new(vec![
            LaunchStage::IoPriority {
                ionice: tools.ionice.clone(),
                class: config.io_priority.class,
                level: config.io_priority.level,
            },
            LaunchStage::EnvDir {
                envdir: tools.envdir.clone(),
                dir: config.env_dir(),
            },
            LaunchStage::OrchestrationExec {
                admin_bin: config.admin_bin.clone(),
            },
            LaunchStage::InitReaper {
                pid1: tools.pid1.clone(),
                args: config.pid1_args.clone(),
            },
            LaunchStage::PrivilegeDrop {
                setuidgid: tools.setuidgid.clone(),
                owner: config.owner.clone(),
            },
            LaunchStage::ServiceScanner {
                svscan: tools.svscan.clone(),
                scan_dir: config.init_dir(),
            },
        ])
    }

    pub fn stages(&self) -> &[LaunchStage] {
        &self.stages
    }

    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::new();
        for stage in &self.stages {
            stage.push_argv(&mut argv);
        }
        argv
    }

    /// Replace the current process with the chain. Only returns on failure.
    pub fn exec(&self) -> BootstrapResult<Infallible> {
        let argv = self
            .argv()
            .into_iter()
            .map(CString::new)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| BootstrapError::config(format!("launch argument contains NUL: {e}")))?;
        let program = argv
            .first()
            .ok_or_else(|| BootstrapError::config("launch chain is empty"))?;

        let stages: Vec<_> = self.stages.iter().map(LaunchStage::name).collect();
        info!(?stages, "Exec into launch chain");

        execvp(program, &argv).map_err(|e| {
            BootstrapError::Io(format!("exec `{}`: {}", program.to_string_lossy(), e))
        })
    }
}
