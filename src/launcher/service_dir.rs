//! Prune the live service tree against its reference copy.

use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{info, warn};

use crate::error::{BootstrapError, BootstrapResult};

/// Which service directories survived reconcile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub kept: Vec<String>,
    pub removed: Vec<String>,
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> BootstrapError {
    BootstrapError::Io(format!("{} `{}`: {}", action, path.display(), e))
}

/// Remove every service directory under `init` that has no counterpart
/// directory under `reference`. Hidden entries and plain files are left
/// alone. A missing `init` directory means there is nothing to prune.
pub fn reconcile_service_dir(init: &Path, reference: &Path) -> BootstrapResult<ReconcileReport> {
    let mut report = ReconcileReport::default();

    let entries = match fs::read_dir(init) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            warn!(path = %init.display(), "Service directory does not exist, nothing to reconcile");
            return Ok(report);
        }
        Err(e) => return Err(io_error("reading", init, e)),
    };

    let mut services = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| io_error("reading", init, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let file_type = entry
            .file_type()
            .map_err(|e| io_error("inspecting", &entry.path(), e))?;
        if file_type.is_dir() {
            services.push(name);
        }
    }
    services.sort();

    for name in services {
        if reference.join(&name).is_dir() {
            info!(service = %name, "Keeping service");
            report.kept.push(name);
        } else {
            let path = init.join(&name);
            info!(service = %name, "Removing stale service");
            fs::remove_dir_all(&path).map_err(|e| io_error("removing", &path, e))?;
            report.removed.push(name);
        }
    }

    Ok(report)
}
