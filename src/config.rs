use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

use crate::error::{BootstrapError, BootstrapResult};
use crate::types::{CellName, Hostname, Identity, UnitName};

/// File name of the env file looked up next to the executable.
pub const DEFAULT_ENV_FILE: &str = "bootstrap.env";

/// Default location of the launcher configuration.
pub const DEFAULT_LAUNCHER_CONFIG: &str = "/etc/cellstrap/launcher.yml";

/// Default open-file-descriptor limit for the supervised tree.
pub const DEFAULT_NOFILE: u64 = 131_072;

/// Default process-count limit for the supervised tree.
pub const DEFAULT_NPROC: u64 = 65_536;

/// Install-time settings for `cellstrap bootstrap`, read from `CELL_*`
/// variables after the env file has been loaded.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub admin_bin: PathBuf,
    pub cell: CellName,
    /// Low-privilege account that owns the installed services.
    pub proid: Identity,
    pub hostname: Hostname,
    pub version: String,
    pub root: PathBuf,
    pub location: String,
    pub ldap_url: Url,
    pub ldap_suffix: String,
    pub ldap_admin_password: Option<String>,
    pub zk_client_port: u16,
    pub master_id: u8,
    pub ldap_dir: PathBuf,
    pub zk_dir: PathBuf,
    pub master_dir: PathBuf,
    pub ldap_unit: UnitName,
    pub zk_unit: UnitName,
    pub master_unit: UnitName,
    pub unit_dir: PathBuf,
    pub config_out: PathBuf,
    pub ready_timeout: Duration,
    pub ready_interval: Duration,
    pub command_timeout: Duration,
}

/// Path of `bootstrap.env` next to the running executable.
pub fn default_env_file() -> anyhow::Result<PathBuf> {
    let exe = env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| anyhow::anyhow!("executable `{}` has no parent directory", exe.display()))?;
    Ok(dir.join(DEFAULT_ENV_FILE))
}

/// Load `KEY=value` lines (optionally prefixed with `export`) into the
/// process environment, overriding existing values so child processes see
/// exactly what the file says.
pub fn load_env_file(path: &Path) -> BootstrapResult<()> {
    dotenvy::from_path_override(path).map_err(|e| {
        BootstrapError::config(format!("loading env file `{}`: {}", path.display(), e))
    })
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> BootstrapResult<String> {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| BootstrapError::config(format!("{key} is not set")))
}

fn or_default(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_num<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> BootstrapResult<T>
where
    T::Err: std::fmt::Display,
{
    match lookup(key).filter(|v| !v.trim().is_empty()) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| BootstrapError::config(format!("{key}={raw:?}: {e}"))),
        None => Ok(default),
    }
}

impl BootstrapConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> BootstrapResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read the configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> BootstrapResult<Self> {
        let ldap_raw = required(&lookup, "CELL_LDAP_URL")?;
        let ldap_url = Url::parse(&ldap_raw)
            .map_err(|e| BootstrapError::config(format!("CELL_LDAP_URL={ldap_raw:?}: {e}")))?;

        let hostname = lookup("CELL_HOSTNAME")
            .or_else(|| lookup("HOSTNAME"))
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| BootstrapError::config("CELL_HOSTNAME is not set"))?;

        let config = Self {
            admin_bin: required(&lookup, "CELL_ADMIN_BIN")?.into(),
            cell: required(&lookup, "CELL_NAME")?.into(),
            proid: required(&lookup, "CELL_PROID")?.into(),
            hostname: hostname.into(),
            version: or_default(&lookup, "CELL_VERSION", "0.1"),
            root: required(&lookup, "CELL_ROOT")?.into(),
            location: or_default(&lookup, "CELL_LOCATION", "local.local"),
            ldap_url,
            ldap_suffix: required(&lookup, "CELL_LDAP_SUFFIX")?,
            ldap_admin_password: lookup("CELL_LDAP_ROOTPW").filter(|v| !v.is_empty()),
            zk_client_port: parse_num(&lookup, "CELL_ZK_CLIENT_PORT", 2181)?,
            master_id: parse_num(&lookup, "CELL_MASTER_ID", 1)?,
            ldap_dir: or_default(&lookup, "CELL_LDAP_DIR", "/var/tmp/cell-ldap").into(),
            zk_dir: or_default(&lookup, "CELL_ZK_DIR", "/var/tmp/cell-zookeeper").into(),
            master_dir: or_default(&lookup, "CELL_MASTER_DIR", "/var/tmp/cell-master").into(),
            ldap_unit: or_default(&lookup, "CELL_LDAP_UNIT", "cell-ldap.service").into(),
            zk_unit: or_default(&lookup, "CELL_ZK_UNIT", "cell-zookeeper.service").into(),
            master_unit: or_default(&lookup, "CELL_MASTER_UNIT", "cell-master.service").into(),
            unit_dir: or_default(&lookup, "CELL_UNIT_DIR", "/etc/systemd/system").into(),
            config_out: or_default(&lookup, "CELL_CONFIG_OUT", "/tmp/cell_conf.yml").into(),
            ready_timeout: Duration::from_secs(parse_num(&lookup, "CELL_READY_TIMEOUT_SECS", 60)?),
            ready_interval: Duration::from_millis(parse_num(
                &lookup,
                "CELL_READY_INTERVAL_MS",
                500,
            )?),
            command_timeout: Duration::from_secs(parse_num(
                &lookup,
                "CELL_COMMAND_TIMEOUT_SECS",
                300,
            )?),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> BootstrapResult<()> {
        for unit in [&self.ldap_unit, &self.zk_unit, &self.master_unit] {
            if !unit.is_valid() {
                return Err(BootstrapError::InvalidUnitName(unit.to_string()));
            }
        }
        if !matches!(self.ldap_url.scheme(), "ldap" | "ldaps") {
            return Err(BootstrapError::config(format!(
                "CELL_LDAP_URL must use ldap:// or ldaps://, got `{}`",
                self.ldap_url
            )));
        }
        if self.ldap_url.host_str().is_none() {
            return Err(BootstrapError::config("CELL_LDAP_URL has no host"));
        }
        if !(1..=3).contains(&self.master_id) {
            return Err(BootstrapError::config(format!(
                "CELL_MASTER_ID must be 1, 2 or 3, got {}",
                self.master_id
            )));
        }
        if self.ready_timeout.is_zero() || self.ready_interval.is_zero() {
            return Err(BootstrapError::config("readiness timeout and interval must be positive"));
        }
        if self.command_timeout.is_zero() {
            return Err(BootstrapError::config("CELL_COMMAND_TIMEOUT_SECS must be positive"));
        }
        Ok(())
    }
}

/// Paths of the supervision tools the launcher chains into. Bare names are
/// resolved through `PATH` at exec time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub ionice: PathBuf,
    pub envdir: PathBuf,
    pub pid1: PathBuf,
    pub setuidgid: PathBuf,
    pub svscan: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ionice: "ionice".into(),
            envdir: "s6-envdir".into(),
            pid1: "pid1".into(),
            setuidgid: "s6-setuidgid".into(),
            svscan: "s6-svscan".into(),
        }
    }
}

/// `ionice` scheduling class and level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct IoPriority {
    pub class: u8,
    pub level: u8,
}

impl Default for IoPriority {
    fn default() -> Self {
        // best-effort, lowest priority
        Self { class: 2, level: 7 }
    }
}

/// Minimum resource limits for the supervised tree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    pub nofile: u64,
    pub nproc: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            nofile: DEFAULT_NOFILE,
            nproc: DEFAULT_NPROC,
        }
    }
}

fn default_pid1_args() -> Vec<String> {
    vec!["-m".into(), "-p".into(), "-i".into()]
}

/// Node launcher settings, loaded at runtime from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    pub runtime_dir: PathBuf,
    pub owner: Identity,
    pub admin_bin: PathBuf,
    /// Directory of `KEY` files loaded by the env stage; defaults to
    /// `<runtime_dir>/env`.
    #[serde(default)]
    pub env_dir: Option<PathBuf>,
    #[serde(default)]
    pub tools: ToolPaths,
    #[serde(default = "default_pid1_args")]
    pub pid1_args: Vec<String>,
    #[serde(default)]
    pub io_priority: IoPriority,
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl LauncherConfig {
    /// Load from a YAML file, expanding `${VAR}` placeholders first.
    pub fn load(path: &Path) -> BootstrapResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            BootstrapError::config(format!("reading `{}`: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> BootstrapResult<Self> {
        let expanded = expand_env_vars(raw);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| BootstrapError::config(format!("invalid launcher config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn init_dir(&self) -> PathBuf {
        self.runtime_dir.join("init")
    }

    pub fn reference_dir(&self) -> PathBuf {
        self.runtime_dir.join("spawn").join("init")
    }

    pub fn env_dir(&self) -> PathBuf {
        self.env_dir
            .clone()
            .unwrap_or_else(|| self.runtime_dir.join("env"))
    }

    fn validate(&self) -> BootstrapResult<()> {
        let paths = [
            ("runtime_dir", &self.runtime_dir),
            ("admin_bin", &self.admin_bin),
            ("tools.ionice", &self.tools.ionice),
            ("tools.envdir", &self.tools.envdir),
            ("tools.pid1", &self.tools.pid1),
            ("tools.setuidgid", &self.tools.setuidgid),
            ("tools.svscan", &self.tools.svscan),
        ];
        for (field, path) in paths {
            if path.to_string_lossy().contains("${") {
                return Err(BootstrapError::config(format!(
                    "{field} has an unresolved placeholder: `{}`",
                    path.display()
                )));
            }
        }

        if !self.runtime_dir.is_absolute() {
            return Err(BootstrapError::config(format!(
                "runtime_dir must be absolute, got `{}`",
                self.runtime_dir.display()
            )));
        }
        if self.owner.as_str().is_empty() {
            return Err(BootstrapError::config("owner must not be empty"));
        }
        if self.io_priority.class > 3 || self.io_priority.level > 7 {
            return Err(BootstrapError::config(format!(
                "io_priority out of range: class {} level {}",
                self.io_priority.class, self.io_priority.level
            )));
        }
        if self.limits.nofile == 0 || self.limits.nproc == 0 {
            return Err(BootstrapError::config("limits must be positive"));
        }
        Ok(())
    }
}

/// Replace `${NAME}` with the value of the environment variable `NAME`.
/// Unknown variables are left untouched so validation can report them.
pub fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                name.push(c);
            }
            match env::var(&name) {
                Ok(val) if closed => out.push_str(&val),
                _ => {
                    out.push_str("${");
                    out.push_str(&name);
                    if closed {
                        out.push('}');
                    }
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}
