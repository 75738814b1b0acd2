//! Command builders for the external orchestration CLI.
//!
//! Only argv is assembled here; running it is the caller's business. Keeping
//! the builders pure lets the bootstrap sequence be asserted command by
//! command in tests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::command::CommandSpec;
use crate::types::{CellName, Hostname, Identity};

/// Encoding requested from the orchestration tool with `--outfmt`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Yaml,
    Json,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yaml => "yaml",
            Self::Json => "json",
        }
    }
}

/// What `admin install` should lay down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallTarget {
    /// Directory service (OpenLDAP).
    Directory {
        owner: Identity,
        uri: String,
        suffix: String,
        root_password: Option<String>,
    },
    /// Coordination service (ZooKeeper).
    Coordination { master_id: u8 },
    /// Master daemon.
    Master { master_id: u8 },
}

impl InstallTarget {
    fn subcommand(&self) -> &'static str {
        match self {
            Self::Directory { .. } => "openldap",
            Self::Coordination { .. } => "zookeeper",
            Self::Master { .. } => "master",
        }
    }
}

/// The orchestration tool's coordination node entry for `cell insert`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub idx: u8,
    pub hostname: Hostname,
    pub client_port: u16,
}

/// Fixed parameters written into the directory for a new cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellSpec {
    pub name: CellName,
    pub version: String,
    pub root: PathBuf,
    pub username: Identity,
    pub location: String,
}

/// Builds invocations of the orchestration binary.
#[derive(Debug, Clone)]
pub struct AdminCli {
    bin: String,
    timeout: Duration,
}

impl AdminCli {
    pub fn new(bin: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            bin: bin.as_ref().to_string_lossy().into_owned(),
            timeout,
        }
    }

    fn admin(&self) -> CommandSpec {
        CommandSpec::new(&self.bin)
            .arg("admin")
            .timeout(self.timeout)
    }

    fn ldap(&self) -> CommandSpec {
        self.admin().arg("ldap")
    }

    /// `admin install --cell - --install-dir <dir> [--config <file>] <target> ...`
    ///
    /// The cell is never resolved from the directory: it does not exist yet
    /// for the directory install, and later installs read it from `--config`.
    pub fn install(
        &self,
        install_dir: &Path,
        config: Option<&Path>,
        target: &InstallTarget,
        run_as: Option<Identity>,
    ) -> CommandSpec {
        let mut spec = self
            .admin()
            .arg("install")
            .args(["--cell", "-"])
            .arg("--install-dir")
            .arg(install_dir.to_string_lossy());
        if let Some(config) = config {
            spec = spec.arg("--config").arg(config.to_string_lossy());
        }
        spec = spec.arg(target.subcommand());

        spec = match target {
            InstallTarget::Directory {
                owner,
                uri,
                suffix,
                root_password,
            } => {
                let spec = spec
                    .args(["--owner", owner.as_str()])
                    .args(["--uri", uri.as_str()])
                    .args(["--suffix", suffix.as_str()]);
                match root_password {
                    Some(pw) => spec.arg("--rootpw").secret_arg(pw.as_str()),
                    None => spec,
                }
            }
            InstallTarget::Coordination { master_id } | InstallTarget::Master { master_id } => spec
                .arg("--master-id")
                .arg(master_id.to_string()),
        };

        spec.run_as(run_as)
    }

    /// `admin ldap init`
    pub fn ldap_init(&self) -> CommandSpec {
        self.ldap().arg("init")
    }

    /// `admin ldap schema --update`
    pub fn ldap_schema_update(&self) -> CommandSpec {
        self.ldap().args(["schema", "--update"])
    }

    /// `admin ldap cell configure <cell> --version --root --username --location`
    pub fn cell_configure(&self, cell: &CellSpec) -> CommandSpec {
        self.ldap()
            .args(["cell", "configure", cell.name.as_str()])
            .args(["--version", cell.version.as_str()])
            .arg("--root")
            .arg(cell.root.to_string_lossy())
            .args(["--username", cell.username.as_str()])
            .args(["--location", cell.location.as_str()])
    }

    /// `admin ldap cell insert <cell> --idx --hostname --client-port`
    pub fn cell_insert(&self, cell: &CellName, node: &NodeEntry) -> CommandSpec {
        self.ldap()
            .args(["cell", "insert", cell.as_str()])
            .arg("--idx")
            .arg(node.idx.to_string())
            .args(["--hostname", node.hostname.as_str()])
            .arg("--client-port")
            .arg(node.client_port.to_string())
    }

    /// `admin ldap server configure <node> --cell <cell>`
    pub fn server_configure(&self, hostname: &Hostname, cell: &CellName) -> CommandSpec {
        self.ldap()
            .args(["server", "configure", hostname.as_str()])
            .args(["--cell", cell.as_str()])
    }

    /// `--outfmt <fmt> admin ldap cell configure <cell>`: prints the resolved
    /// cell configuration without changing it. `--outfmt` belongs to the
    /// top-level command.
    pub fn cell_export(&self, cell: &CellName, format: OutputFormat) -> CommandSpec {
        CommandSpec::new(&self.bin)
            .args(["--outfmt", format.as_str()])
            .args(["admin", "ldap", "cell", "configure", cell.as_str()])
            .timeout(self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli() -> AdminCli {
        AdminCli::new("/opt/cell/bin/cell-admin", Duration::from_secs(30))
    }

    #[test]
    fn test_install_directory() {
        let target = InstallTarget::Directory {
            owner: Identity::new("proid"),
            uri: "ldap://node1:22389".to_string(),
            suffix: "dc=local".to_string(),
            root_password: Some("secret".to_string()),
        };
        let spec = cli().install(
            Path::new("/var/tmp/cell-ldap"),
            None,
            &target,
            Some(Identity::new("proid")),
        );

        assert_eq!(
            spec.render(),
            "/opt/cell/bin/cell-admin admin install --cell - --install-dir /var/tmp/cell-ldap \
             openldap --owner proid --uri ldap://node1:22389 --suffix dc=local --rootpw ****"
        );
        assert_eq!(spec.args.last().map(String::as_str), Some("secret"));
        assert_eq!(spec.run_as, Some(Identity::new("proid")));
        assert_eq!(spec.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_install_with_config() {
        let spec = cli().install(
            Path::new("/var/tmp/cell-master"),
            Some(Path::new("/tmp/cell_conf.yml")),
            &InstallTarget::Master { master_id: 1 },
            None,
        );

        assert_eq!(
            spec.args,
            vec![
                "admin",
                "install",
                "--cell",
                "-",
                "--install-dir",
                "/var/tmp/cell-master",
                "--config",
                "/tmp/cell_conf.yml",
                "master",
                "--master-id",
                "1"
            ]
        );
        assert!(spec.run_as.is_none());
    }

    #[test]
    fn test_cell_commands() {
        let cell = CellSpec {
            name: CellName::new("local"),
            version: "0.1".to_string(),
            root: PathBuf::from("/opt/cell"),
            username: Identity::new("proid"),
            location: "local.local".to_string(),
        };

        assert_eq!(
            cli().cell_configure(&cell).args,
            vec![
                "admin", "ldap", "cell", "configure", "local", "--version", "0.1", "--root",
                "/opt/cell", "--username", "proid", "--location", "local.local"
            ]
        );

        let node = NodeEntry {
            idx: 1,
            hostname: Hostname::new("node1"),
            client_port: 2181,
        };
        assert_eq!(
            cli().cell_insert(&cell.name, &node).args,
            vec![
                "admin", "ldap", "cell", "insert", "local", "--idx", "1", "--hostname", "node1",
                "--client-port", "2181"
            ]
        );

        assert_eq!(
            cli().server_configure(&Hostname::new("node1"), &cell.name).args,
            vec!["admin", "ldap", "server", "configure", "node1", "--cell", "local"]
        );
    }

    #[test]
    fn test_export_outfmt_is_a_top_level_option() {
        let spec = cli().cell_export(&CellName::new("local"), OutputFormat::Json);
        assert_eq!(
            spec.args,
            vec!["--outfmt", "json", "admin", "ldap", "cell", "configure", "local"]
        );
    }
}
