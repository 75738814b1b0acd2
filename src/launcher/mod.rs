//! Node supervisor launcher.
//!
//! Prepares the runtime directory and then replaces itself with the launch
//! chain. Nothing survives the exec; the service scanner owns everything
//! after that.

pub mod chain;
pub mod limits;
pub mod ownership;
pub mod service_dir;

use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

pub use chain::{ExecChain, LaunchStage};
pub use limits::{ResourceLimit, ResourceLimits, current_limits, raise_limits};
pub use ownership::{chown_tree, resolve_owner};
pub use service_dir::{ReconcileReport, reconcile_service_dir};

use crate::config::LauncherConfig;
use crate::error::BootstrapResult;

/// Everything done before the exec, plus the argv about to be exec'd.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchReport {
    pub runtime_dir: PathBuf,
    pub services: ReconcileReport,
    pub limits: ResourceLimits,
    pub chowned: usize,
    pub argv: Vec<String>,
}

/// Prune stale services, raise limits and fix ownership. Returns the
/// report and the chain to exec into.
pub fn prepare(config: &LauncherConfig) -> BootstrapResult<(LaunchReport, ExecChain)> {
    info!(runtime_dir = %config.runtime_dir.display(), owner = %config.owner, "Preparing node");

    let services = reconcile_service_dir(&config.init_dir(), &config.reference_dir())?;
    let limits = raise_limits(&config.limits)?;
    let (uid, gid) = resolve_owner(&config.owner)?;
    let chowned = chown_tree(&config.runtime_dir, uid, gid)?;
    let chain = ExecChain::from_config(config);

    let report = LaunchReport {
        runtime_dir: config.runtime_dir.clone(),
        services,
        limits,
        chowned,
        argv: chain.argv(),
    };
    Ok((report, chain))
}
