//! Single-node cell bootstrap: directory service, cell registration,
//! coordination service and master daemon, in that order.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

use crate::admin::{AdminCli, CellSpec, InstallTarget, NodeEntry, OutputFormat};
use crate::cell::{CellConfig, write_export};
use crate::command::{CommandRunner, CommandSpec, run_checked};
use crate::config::BootstrapConfig;
use crate::error::{BootstrapError, BootstrapResult};
use crate::readiness::{AllOf, ReadinessPolicy, TcpProbe, UnitActiveProbe, wait_until_ready};
use crate::types::{CellName, UnitName};
use crate::units::{UnitAction, UnitManager, UnitSpec, inputs_digest};

/// Fail unless running with effective UID 0.
pub fn ensure_privileged(euid: u32) -> BootstrapResult<()> {
    if euid == 0 {
        Ok(())
    } else {
        Err(BootstrapError::NotPrivileged { euid })
    }
}

/// Effective UID of this process.
pub fn current_euid() -> u32 {
    nix::unistd::geteuid().as_raw()
}

/// Outcome of one unit reconcile.
#[derive(Debug, Clone, Serialize)]
pub struct UnitOutcome {
    pub unit: UnitName,
    pub action: UnitAction,
}

/// Summary printed after a successful bootstrap.
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReport {
    pub run_id: Uuid,
    pub cell: CellName,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub units: Vec<UnitOutcome>,
    pub config_path: PathBuf,
    pub masters: usize,
}

/// Drives the bootstrap sequence against a [`CommandRunner`].
pub struct Bootstrapper<'a, R> {
    runner: &'a R,
    config: &'a BootstrapConfig,
    admin: AdminCli,
    format: OutputFormat,
    force: bool,
    euid: u32,
}

impl<'a, R: CommandRunner> Bootstrapper<'a, R> {
    pub fn new(runner: &'a R, config: &'a BootstrapConfig) -> Self {
        Self {
            runner,
            config,
            admin: AdminCli::new(&config.admin_bin, config.command_timeout),
            format: OutputFormat::default(),
            force: false,
            euid: current_euid(),
        }
    }

    /// Format requested from the orchestration tool for the exported config.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Remove and re-add every unit even when nothing changed.
    pub fn with_force_reinstall(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Override the effective UID used for the privilege check.
    pub fn with_euid(mut self, euid: u32) -> Self {
        self.euid = euid;
        self
    }

    fn units(&self) -> UnitManager<'a, R> {
        UnitManager::new(self.runner, &self.config.unit_dir)
            .with_timeout(self.config.command_timeout)
    }

    /// Run the whole sequence. `cancel` aborts the readiness wait.
    pub async fn run<C>(&self, cancel: C) -> BootstrapResult<BootstrapReport>
    where
        C: Future<Output = ()>,
    {
        ensure_privileged(self.euid)?;

        let run_id = Uuid::new_v4();
        let span = info_span!("bootstrap", %run_id, cell = %self.config.cell);
        self.run_steps(run_id, cancel).instrument(span).await
    }

    async fn run_steps<C>(&self, run_id: Uuid, cancel: C) -> BootstrapResult<BootstrapReport>
    where
        C: Future<Output = ()>,
    {
        let started_at = Utc::now();
        let cfg = self.config;
        let mut units = Vec::with_capacity(3);

        info!("Installing directory service");
        let directory = InstallTarget::Directory {
            owner: cfg.proid.clone(),
            uri: cfg.ldap_url.to_string(),
            suffix: cfg.ldap_suffix.clone(),
            root_password: cfg.ldap_admin_password.clone(),
        };
        units.push(
            self.install_service(&cfg.ldap_dir, None, &directory, &cfg.ldap_unit)
                .await?,
        );

        self.wait_for_directory(cancel).await?;
        self.initialize_cell().await?;

        let exported = self.export_config().await?;
        let config_path = cfg.config_out.as_path();

        info!("Installing coordination service");
        let coordination = InstallTarget::Coordination {
            master_id: cfg.master_id,
        };
        units.push(
            self.install_service(&cfg.zk_dir, Some(config_path), &coordination, &cfg.zk_unit)
                .await?,
        );

        info!("Installing master daemon");
        let master = InstallTarget::Master {
            master_id: cfg.master_id,
        };
        units.push(
            self.install_service(&cfg.master_dir, Some(config_path), &master, &cfg.master_unit)
                .await?,
        );

        let report = BootstrapReport {
            run_id,
            cell: cfg.cell.clone(),
            started_at,
            finished_at: Utc::now(),
            units,
            config_path: cfg.config_out.clone(),
            masters: exported.masters.len(),
        };
        info!(
            elapsed_ms = (report.finished_at - report.started_at).num_milliseconds(),
            "Bootstrap complete"
        );
        Ok(report)
    }

    async fn exec(&self, spec: CommandSpec) -> BootstrapResult<String> {
        Ok(run_checked(self.runner, &spec).await?.stdout)
    }

    /// `admin install` as the service identity, then reconcile the unit it
    /// generated.
    async fn install_service(
        &self,
        install_dir: &Path,
        config: Option<&Path>,
        target: &InstallTarget,
        unit: &UnitName,
    ) -> BootstrapResult<UnitOutcome> {
        let install = self.admin.install(
            install_dir,
            config,
            target,
            Some(self.config.proid.clone()),
        );
        let config_contents = match config {
            Some(path) => Some(tokio::fs::read(path).await.map_err(|e| {
                BootstrapError::Io(format!("reading `{}`: {}", path.display(), e))
            })?),
            None => None,
        };
        let inputs = inputs_digest(&install.args, config_contents.as_deref());
        self.exec(install).await?;

        let spec = UnitSpec::in_install_dir(unit.clone(), install_dir).with_inputs(inputs);
        let action = self.units().reconcile(&spec, self.force).await?;
        Ok(UnitOutcome {
            unit: unit.clone(),
            action,
        })
    }

    async fn wait_for_directory<C>(&self, cancel: C) -> BootstrapResult<()>
    where
        C: Future<Output = ()>,
    {
        let probe = AllOf(
            UnitActiveProbe::new(self.runner, self.config.ldap_unit.clone()),
            TcpProbe::from_ldap_url(&self.config.ldap_url)?,
        );
        let policy = ReadinessPolicy {
            timeout: self.config.ready_timeout,
            interval: self.config.ready_interval,
        };
        wait_until_ready(&probe, policy, cancel).await?;
        Ok(())
    }

    /// Schema, cell definition, coordination node and server registration.
    async fn initialize_cell(&self) -> BootstrapResult<()> {
        let cfg = self.config;
        info!("Initializing directory schema and cell");

        self.exec(self.admin.ldap_init()).await?;
        self.exec(self.admin.ldap_schema_update()).await?;

        let cell = CellSpec {
            name: cfg.cell.clone(),
            version: cfg.version.clone(),
            root: cfg.root.clone(),
            username: cfg.proid.clone(),
            location: cfg.location.clone(),
        };
        self.exec(self.admin.cell_configure(&cell)).await?;

        let node = NodeEntry {
            idx: cfg.master_id,
            hostname: cfg.hostname.clone(),
            client_port: cfg.zk_client_port,
        };
        self.exec(self.admin.cell_insert(&cfg.cell, &node)).await?;
        self.exec(self.admin.server_configure(&cfg.hostname, &cfg.cell))
            .await?;
        Ok(())
    }

    /// Query the resolved cell configuration and write it to
    /// `config_out`.
    pub async fn export_config(&self) -> BootstrapResult<CellConfig> {
        let cfg = self.config;
        let raw = self
            .exec(self.admin.cell_export(&cfg.cell, self.format))
            .await?;
        write_export(&raw, self.format, &cfg.config_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use crate::command::recording::RecordingRunner;
    use crate::types::Identity;
    use std::collections::HashMap;
    use std::fs;
    use tokio::net::TcpListener;

    const EXPORT: &str = "\
cell: local
username: proid
masters:
- idx: 1
  hostname: node1.example.com
  zk-client-port: 2181
";

    struct Fixture {
        tmp: tempfile::TempDir,
        config: BootstrapConfig,
    }

    fn fixture(ldap_port: u16) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let path = |p: &str| root.join(p).to_string_lossy().into_owned();

        let mut env: HashMap<&str, String> = HashMap::new();
        env.insert("CELL_ADMIN_BIN", "/opt/cell/bin/cell-admin".to_string());
        env.insert("CELL_NAME", "local".to_string());
        env.insert("CELL_PROID", "proid".to_string());
        env.insert("CELL_HOSTNAME", "node1.example.com".to_string());
        env.insert("CELL_ROOT", "/opt/cell".to_string());
        env.insert("CELL_LDAP_URL", format!("ldap://127.0.0.1:{ldap_port}"));
        env.insert("CELL_LDAP_SUFFIX", "dc=local".to_string());
        env.insert("CELL_LDAP_DIR", path("ldap"));
        env.insert("CELL_ZK_DIR", path("zk"));
        env.insert("CELL_MASTER_DIR", path("master"));
        env.insert("CELL_UNIT_DIR", path("units"));
        env.insert("CELL_CONFIG_OUT", path("cell_conf.yml"));
        env.insert("CELL_READY_TIMEOUT_SECS", "1".to_string());
        env.insert("CELL_READY_INTERVAL_MS", "20".to_string());

        let config = BootstrapConfig::from_lookup(|k| env.get(k).cloned()).unwrap();

        // what `admin install` would have generated
        for (dir, unit) in [
            (&config.ldap_dir, &config.ldap_unit),
            (&config.zk_dir, &config.zk_unit),
            (&config.master_dir, &config.master_unit),
        ] {
            fs::create_dir_all(dir).unwrap();
            fs::write(dir.join(unit.as_str()), format!("[Unit]\nDescription={unit}\n")).unwrap();
        }

        Fixture { tmp, config }
    }

    fn scripted_runner() -> RecordingRunner {
        let runner = RecordingRunner::new();
        runner.respond("--outfmt yaml", CommandOutput::with_stdout(EXPORT));
        runner
    }

    fn unit_files(fx: &Fixture) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(fx.tmp.path().join("units"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_ensure_privileged() {
        assert!(ensure_privileged(0).is_ok());
        let err = ensure_privileged(1000).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_full_bootstrap_sequence() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let fx = fixture(listener.local_addr().unwrap().port());
        let runner = scripted_runner();

        let report = Bootstrapper::new(&runner, &fx.config)
            .with_euid(0)
            .run(std::future::pending())
            .await
            .unwrap();

        let expected = [
            "admin install --cell - --install-dir",
            "enable --now cell-ldap.service",
            "is-active cell-ldap.service",
            "admin ldap init",
            "admin ldap schema --update",
            "admin ldap cell configure local --version 0.1",
            "admin ldap cell insert local --idx 1 --hostname node1.example.com --client-port 2181",
            "admin ldap server configure node1.example.com --cell local",
            "cell-admin --outfmt yaml admin ldap cell configure local",
            "zookeeper --master-id 1",
            "enable --now cell-zookeeper.service",
            "master --master-id 1",
            "enable --now cell-master.service",
        ];
        let rendered = runner.rendered();
        let mut cursor = 0;
        for step in expected {
            let found = rendered[cursor..]
                .iter()
                .position(|line| line.contains(step))
                .unwrap_or_else(|| panic!("`{step}` not issued after position {cursor}"));
            cursor += found + 1;
        }

        let config_out = fx.config.config_out.to_string_lossy().into_owned();
        let installs: Vec<_> = runner
            .calls()
            .into_iter()
            .filter(|c| c.args.get(1).map(String::as_str) == Some("install"))
            .collect();
        assert_eq!(installs.len(), 3);
        for install in &installs {
            assert_eq!(install.run_as, Some(Identity::new("proid")));
        }
        assert!(!installs[0].args.contains(&config_out));
        assert!(installs[1].args.contains(&config_out));
        assert!(installs[2].args.contains(&config_out));

        assert!(report.units.iter().all(|u| u.action == UnitAction::Create));
        assert_eq!(report.masters, 1);
        assert_eq!(fs::read_to_string(&fx.config.config_out).unwrap(), EXPORT);
        assert!(CellConfig::load(&fx.config.config_out, OutputFormat::Yaml).is_ok());
    }

    #[tokio::test]
    async fn test_second_run_converges() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let fx = fixture(listener.local_addr().unwrap().port());
        let runner = scripted_runner();
        let bootstrapper = Bootstrapper::new(&runner, &fx.config).with_euid(0);

        bootstrapper.run(std::future::pending()).await.unwrap();
        let report = bootstrapper.run(std::future::pending()).await.unwrap();

        assert!(report.units.iter().all(|u| u.action == UnitAction::Unchanged));
        assert_eq!(
            unit_files(&fx),
            vec![
                "cell-ldap.service",
                "cell-master.service",
                "cell-zookeeper.service"
            ]
        );
        assert_eq!(runner.count_matching("enable --now"), 3);
    }

    #[tokio::test]
    async fn test_changed_export_restarts_dependent_services() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let fx = fixture(listener.local_addr().unwrap().port());
        let runner = scripted_runner();

        Bootstrapper::new(&runner, &fx.config)
            .with_euid(0)
            .run(std::future::pending())
            .await
            .unwrap();

        let grown = format!("{EXPORT}- idx: 2\n  hostname: node2.example.com\n");
        runner.clear_rules();
        runner.respond("--outfmt yaml", CommandOutput::with_stdout(grown));
        let report = Bootstrapper::new(&runner, &fx.config)
            .with_euid(0)
            .run(std::future::pending())
            .await
            .unwrap();

        let actions: Vec<_> = report.units.iter().map(|u| u.action).collect();
        assert_eq!(
            actions,
            vec![
                UnitAction::Unchanged,
                UnitAction::Restart,
                UnitAction::Restart
            ]
        );
        assert_eq!(runner.count_matching("systemctl restart"), 2);
        assert_eq!(report.masters, 2);
    }

    #[tokio::test]
    async fn test_forced_rerun_replaces_units() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let fx = fixture(listener.local_addr().unwrap().port());
        let runner = scripted_runner();

        Bootstrapper::new(&runner, &fx.config)
            .with_euid(0)
            .run(std::future::pending())
            .await
            .unwrap();
        let report = Bootstrapper::new(&runner, &fx.config)
            .with_euid(0)
            .with_force_reinstall(true)
            .run(std::future::pending())
            .await
            .unwrap();

        assert!(report.units.iter().all(|u| u.action == UnitAction::Replace));
        assert_eq!(runner.count_matching("disable --now"), 3);
        assert_eq!(unit_files(&fx).len(), 3);
    }

    #[tokio::test]
    async fn test_unprivileged_run_has_no_side_effects() {
        let fx = fixture(1);
        let runner = scripted_runner();

        let err = Bootstrapper::new(&runner, &fx.config)
            .with_euid(1000)
            .run(std::future::pending())
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), 1);
        assert!(runner.calls().is_empty());
        assert!(!fx.config.config_out.exists());
        assert!(!fx.tmp.path().join("units").exists());
    }

    #[tokio::test]
    async fn test_directory_never_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let fx = fixture(port);
        let runner = scripted_runner();

        let err = Bootstrapper::new(&runner, &fx.config)
            .with_euid(0)
            .run(std::future::pending())
            .await
            .unwrap_err();

        assert!(matches!(err, BootstrapError::NotReady { .. }));
        assert!(err.to_string().contains(&format!("127.0.0.1:{port}")));
        assert_eq!(runner.count_matching("ldap init"), 0);
    }

    #[tokio::test]
    async fn test_failing_step_aborts_with_its_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let fx = fixture(listener.local_addr().unwrap().port());
        let runner = scripted_runner();
        runner.fail_on("schema --update", 7);

        let err = Bootstrapper::new(&runner, &fx.config)
            .with_euid(0)
            .run(std::future::pending())
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), 7);
        assert_eq!(runner.count_matching("cell configure"), 0);
        assert_eq!(runner.count_matching("zookeeper"), 0);
        assert!(!fx.config.config_out.exists());
    }

    #[tokio::test]
    async fn test_export_config_only() {
        let fx = fixture(1);
        let runner = RecordingRunner::new();
        runner.respond(
            "--outfmt json",
            CommandOutput::with_stdout(r#"{"cell": "local", "masters": []}"#),
        );

        let config = Bootstrapper::new(&runner, &fx.config)
            .with_format(OutputFormat::Json)
            .export_config()
            .await
            .unwrap();

        assert_eq!(config.cell.as_deref(), Some("local"));
        assert_eq!(runner.calls().len(), 1);
        assert!(fx.config.config_out.exists());
    }
}
