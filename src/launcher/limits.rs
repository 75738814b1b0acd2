//! Resource ceilings for the supervised tree.

use nix::sys::resource::{Resource, getrlimit, setrlimit};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::LimitsConfig;
use crate::error::{BootstrapError, BootstrapResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceLimit {
    pub soft: u64,
    pub hard: u64,
}

impl ResourceLimit {
    /// Smallest change that brings both limits up to `target`.
    pub fn raised_to(self, target: u64) -> Self {
        Self {
            soft: self.soft.max(target),
            hard: self.hard.max(target),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceLimits {
    pub nofile: ResourceLimit,
    pub nproc: ResourceLimit,
}

fn get(resource: Resource, name: &str) -> BootstrapResult<ResourceLimit> {
    let (soft, hard) =
        getrlimit(resource).map_err(|e| BootstrapError::Io(format!("getrlimit {name}: {e}")))?;
    Ok(ResourceLimit { soft, hard })
}

fn raise(resource: Resource, name: &str, target: u64) -> BootstrapResult<ResourceLimit> {
    let current = get(resource, name)?;
    let wanted = current.raised_to(target);
    if wanted == current {
        debug!(resource = name, soft = current.soft, hard = current.hard, "Limit already sufficient");
        return Ok(current);
    }

    setrlimit(resource, wanted.soft, wanted.hard)
        .map_err(|e| BootstrapError::Io(format!("setrlimit {name} to {target}: {e}")))?;
    info!(
        resource = name,
        soft = wanted.soft,
        hard = wanted.hard,
        "Raised limit"
    );
    get(resource, name)
}

pub fn current_limits() -> BootstrapResult<ResourceLimits> {
    Ok(ResourceLimits {
        nofile: get(Resource::RLIMIT_NOFILE, "nofile")?,
        nproc: get(Resource::RLIMIT_NPROC, "nproc")?,
    })
}

/// Raise open-file and process limits of this process (inherited by the
/// exec chain) to at least the configured values. Limits are never lowered.
pub fn raise_limits(limits: &LimitsConfig) -> BootstrapResult<ResourceLimits> {
    Ok(ResourceLimits {
        nofile: raise(Resource::RLIMIT_NOFILE, "nofile", limits.nofile)?,
        nproc: raise(Resource::RLIMIT_NPROC, "nproc", limits.nproc)?,
    })
}
