// Core modules
pub mod config;
pub mod error;
pub mod types;

// External commands and the things they drive
pub mod admin;
pub mod command;
pub mod readiness;
pub mod units;

// Operations
pub mod bootstrap;
pub mod cell;
pub mod launcher;

pub use admin::{AdminCli, OutputFormat};
pub use bootstrap::{BootstrapReport, Bootstrapper, current_euid, ensure_privileged};
pub use cell::CellConfig;
pub use command::{CommandRunner, CommandSpec, SystemRunner};
pub use config::{BootstrapConfig, LauncherConfig};
pub use error::{BootstrapError, BootstrapResult, exit_code_for};
pub use launcher::{ExecChain, LaunchReport, ReconcileReport};
pub use units::{UnitAction, UnitManager};

use serde::Serialize;

/// Render a report for stdout in the requested format.
pub fn render<T: Serialize>(value: &T, format: OutputFormat) -> anyhow::Result<String> {
    Ok(match format {
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
        OutputFormat::Json => serde_json::to_string_pretty(value)? + "\n",
    })
}
