//! Recursive ownership fix-up of the runtime directory.

use std::fs;
use std::os::unix::fs::lchown;
use std::path::Path;
use tracing::info;

use crate::command::system::lookup_user;
use crate::error::{BootstrapError, BootstrapResult};
use crate::types::Identity;

/// Numeric uid/gid of a named account.
pub fn resolve_owner(owner: &Identity) -> BootstrapResult<(u32, u32)> {
    let user = lookup_user(owner)?;
    Ok((user.uid.as_raw(), user.gid.as_raw()))
}

/// Change ownership of `root` and everything below it. Symlinks are
/// re-owned themselves and never followed. Returns the number of entries
/// touched.
pub fn chown_tree(root: &Path, uid: u32, gid: u32) -> BootstrapResult<usize> {
    let count = chown_entry(root, uid, gid)?;
    info!(path = %root.display(), uid, gid, entries = count, "Changed ownership");
    Ok(count)
}

fn chown_entry(path: &Path, uid: u32, gid: u32) -> BootstrapResult<usize> {
    let io = |action: &str, e: std::io::Error| {
        BootstrapError::Io(format!("{} `{}`: {}", action, path.display(), e))
    };

    lchown(path, Some(uid), Some(gid)).map_err(|e| io("chown", e))?;
    let mut count = 1;

    let meta = fs::symlink_metadata(path).map_err(|e| io("inspecting", e))?;
    if meta.file_type().is_dir() {
        for entry in fs::read_dir(path).map_err(|e| io("reading", e))? {
            let entry = entry.map_err(|e| io("reading", e))?;
            count += chown_entry(&entry.path(), uid, gid)?;
        }
    }
    Ok(count)
}
