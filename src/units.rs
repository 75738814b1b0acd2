//! Declarative reconcile of systemd units.
//!
//! The desired state of a unit is the definition file generated by the
//! orchestration tool's `install` step plus a fingerprint of what that step
//! was given; the actual state is what sits in the unit directory, the
//! fingerprint recorded by the previous run and what `systemctl` reports.
//! Only the difference is applied, so repeated runs converge on one
//! installed, running unit per name.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::command::{CommandRunner, CommandSpec, run_checked};
use crate::error::{BootstrapError, BootstrapResult};
use crate::types::UnitName;

const SYSTEMCTL: &str = "systemctl";

const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(90);

/// Fingerprint of the last applied install inputs, kept in the install
/// directory.
pub const INPUTS_STAMP: &str = ".cellstrap-inputs";

/// A unit definition produced by an install step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    pub name: UnitName,
    /// Generated definition file to install.
    pub source: PathBuf,
    /// Directory the install step wrote into.
    pub install_dir: PathBuf,
    /// Digest of everything the install step was given.
    pub inputs: String,
}

impl UnitSpec {
    /// The install step writes `<install_dir>/<unit name>`.
    pub fn in_install_dir(name: UnitName, install_dir: &Path) -> Self {
        let source = install_dir.join(name.as_str());
        Self {
            name,
            source,
            install_dir: install_dir.to_path_buf(),
            inputs: inputs_digest(&[], None),
        }
    }

    pub fn with_inputs(mut self, inputs: String) -> Self {
        self.inputs = inputs;
        self
    }

    fn stamp_path(&self) -> PathBuf {
        self.install_dir.join(INPUTS_STAMP)
    }
}

/// Observed state of a unit on this host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitState {
    pub installed: bool,
    /// SHA-256 of the installed definition, hex encoded.
    pub digest: Option<String>,
    /// Input fingerprint recorded when the unit was last (re)started.
    pub inputs: Option<String>,
    pub enabled: bool,
    pub active: bool,
}

/// What reconcile did (or would do) to a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitAction {
    /// Installed, identical, enabled and running.
    Unchanged,
    /// Identical definition, but not enabled or not running.
    Start,
    /// Identical definition, but installed from different inputs, so the
    /// service's generated configuration changed underneath it.
    Restart,
    /// Not installed yet.
    Create,
    /// Installed with a different definition, or a forced reinstall.
    Replace,
}

/// Hex-encoded SHA-256 of a unit definition.
pub fn digest(contents: &[u8]) -> String {
    format!("{:x}", Sha256::digest(contents))
}

/// Fingerprint of an install invocation: its argv and the contents of the
/// configuration file it was pointed at.
pub fn inputs_digest(args: &[String], config: Option<&[u8]>) -> String {
    let mut hasher = Sha256::new();
    for arg in args {
        hasher.update((arg.len() as u64).to_le_bytes());
        hasher.update(arg.as_bytes());
    }
    if let Some(config) = config {
        hasher.update(b"config");
        hasher.update((config.len() as u64).to_le_bytes());
        hasher.update(config);
    }
    format!("{:x}", hasher.finalize())
}

/// Decide the action for a unit given its desired definition digest, its
/// desired inputs and its observed state.
pub fn plan(
    desired_digest: &str,
    desired_inputs: &str,
    state: &UnitState,
    force: bool,
) -> UnitAction {
    if !state.installed {
        return UnitAction::Create;
    }
    if force || state.digest.as_deref() != Some(desired_digest) {
        return UnitAction::Replace;
    }
    if state.inputs.as_deref() != Some(desired_inputs) {
        return UnitAction::Restart;
    }
    if state.enabled && state.active {
        UnitAction::Unchanged
    } else {
        UnitAction::Start
    }
}

/// Manages unit files in one unit directory through `systemctl`.
pub struct UnitManager<'a, R> {
    runner: &'a R,
    unit_dir: PathBuf,
    timeout: Duration,
}

impl<'a, R: CommandRunner> UnitManager<'a, R> {
    pub fn new(runner: &'a R, unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            unit_dir: unit_dir.into(),
            timeout: SYSTEMCTL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn unit_path(&self, name: &UnitName) -> PathBuf {
        self.unit_dir.join(name.as_str())
    }

    fn systemctl<'s>(&self, args: impl IntoIterator<Item = &'s str>) -> CommandSpec {
        CommandSpec::new(SYSTEMCTL).args(args).timeout(self.timeout)
    }

    /// Read the installed definition and recorded inputs, and ask systemd
    /// about the unit.
    pub async fn observe(&self, unit: &UnitSpec) -> BootstrapResult<UnitState> {
        let name = &unit.name;
        let digest = read_optional(&self.unit_path(name))
            .await?
            .map(|contents| digest(&contents));
        let inputs = read_optional(&unit.stamp_path())
            .await?
            .map(|stamp| String::from_utf8_lossy(&stamp).trim().to_string());

        let enabled = self
            .runner
            .run(&self.systemctl(["is-enabled", "--quiet", name.as_str()]))
            .await?
            .is_success();
        let active = self
            .runner
            .run(&self.systemctl(["is-active", "--quiet", name.as_str()]))
            .await?
            .is_success();

        let state = UnitState {
            installed: digest.is_some(),
            digest,
            inputs,
            enabled,
            active,
        };
        debug!(unit = %name, ?state, "Observed unit state");
        Ok(state)
    }

    /// Bring the unit in line with `unit.source` and return what was done.
    pub async fn reconcile(&self, unit: &UnitSpec, force: bool) -> BootstrapResult<UnitAction> {
        if !unit.name.is_valid() {
            return Err(BootstrapError::InvalidUnitName(unit.name.to_string()));
        }

        let contents = tokio::fs::read(&unit.source).await.map_err(|e| {
            BootstrapError::Io(format!(
                "reading unit definition `{}`: {}",
                unit.source.display(),
                e
            ))
        })?;
        let desired = digest(&contents);
        let state = self.observe(unit).await?;
        let action = plan(&desired, &unit.inputs, &state, force);

        info!(unit = %unit.name, ?action, "Reconciling unit");

        match action {
            UnitAction::Unchanged => {}
            UnitAction::Start => {
                self.enable_now(&unit.name).await?;
            }
            UnitAction::Restart => {
                let name = unit.name.as_str();
                run_checked(self.runner, &self.systemctl(["enable", name])).await?;
                run_checked(self.runner, &self.systemctl(["restart", name])).await?;
            }
            UnitAction::Create => {
                self.add(&unit.name, &contents).await?;
            }
            UnitAction::Replace => {
                self.remove(&unit.name).await?;
                self.add(&unit.name, &contents).await?;
            }
        }

        if state.inputs.as_deref() != Some(unit.inputs.as_str()) {
            let stamp = unit.stamp_path();
            tokio::fs::write(&stamp, format!("{}\n", unit.inputs))
                .await
                .map_err(|e| {
                    BootstrapError::Io(format!("writing `{}`: {}", stamp.display(), e))
                })?;
        }

        Ok(action)
    }

    /// Stop, disable and delete a unit. A unit that is not loaded, or a
    /// `disable` that fails or times out, is not an error.
    pub async fn remove(&self, name: &UnitName) -> BootstrapResult<()> {
        let disable = self.systemctl(["disable", "--now", name.as_str()]);
        match self.runner.run(&disable).await {
            Ok(output) if output.is_success() => {}
            Ok(output) => warn!(
                unit = %name,
                status = ?output.status,
                stderr = %output.stderr.trim(),
                "Ignoring failed disable"
            ),
            Err(e @ BootstrapError::CommandFailed { .. }) => {
                warn!(unit = %name, error = %e, "Ignoring failed disable")
            }
            Err(e) => return Err(e),
        }

        let path = self.unit_path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(BootstrapError::Io(format!(
                    "removing `{}`: {}",
                    path.display(),
                    e
                )));
            }
        }

        self.daemon_reload().await
    }

    /// Install a definition, reload systemd and start the unit.
    async fn add(&self, name: &UnitName, contents: &[u8]) -> BootstrapResult<()> {
        self.write_unit_file(name, contents).await?;
        self.daemon_reload().await?;
        self.enable_now(name).await
    }

    async fn write_unit_file(&self, name: &UnitName, contents: &[u8]) -> BootstrapResult<()> {
        let path = self.unit_path(name);
        let tmp = self.unit_dir.join(format!(".{}.tmp", name));

        let result = async {
            tokio::fs::create_dir_all(&self.unit_dir).await?;
            tokio::fs::write(&tmp, contents).await?;
            tokio::fs::rename(&tmp, &path).await
        }
        .await;

        result.map_err(|e| {
            BootstrapError::Io(format!("installing `{}`: {}", path.display(), e))
        })?;
        debug!(unit = %name, path = %path.display(), "Installed unit file");
        Ok(())
    }

    async fn daemon_reload(&self) -> BootstrapResult<()> {
        run_checked(self.runner, &self.systemctl(["daemon-reload"])).await?;
        Ok(())
    }

    async fn enable_now(&self, name: &UnitName) -> BootstrapResult<()> {
        run_checked(self.runner, &self.systemctl(["enable", "--now", name.as_str()])).await?;
        Ok(())
    }
}

async fn read_optional(path: &Path) -> BootstrapResult<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BootstrapError::Io(format!(
            "reading `{}`: {}",
            path.display(),
            e
        ))),
    }
}
