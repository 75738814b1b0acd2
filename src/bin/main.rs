use anyhow::{Context, Result};
use cellstrap::config::{DEFAULT_LAUNCHER_CONFIG, default_env_file, load_env_file};
use cellstrap::{
    BootstrapConfig, Bootstrapper, LauncherConfig, OutputFormat, SystemRunner, current_euid,
    ensure_privileged, exit_code_for, launcher, render,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cellstrap")]
#[command(about = "Single-node cell bootstrap and node supervisor launcher")]
struct Cli {
    /// Output format for reports and the exported cell configuration
    #[arg(long, value_enum, global = true, default_value = "yaml")]
    outfmt: OutputFormat,
    /// Increase log verbosity
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install directory service, coordination service and master daemon
    Bootstrap {
        /// Environment file (defaults to bootstrap.env next to the executable)
        #[arg(long, env = "CELLSTRAP_ENV_FILE")]
        env_file: Option<PathBuf>,
        /// Remove and re-add every unit even when unchanged
        #[arg(long, default_value_t = false)]
        force_reinstall: bool,
    },
    /// Prepare the runtime directory and exec into the supervisor chain
    Launch {
        #[arg(long, env = "CELLSTRAP_LAUNCHER_CONFIG", default_value = DEFAULT_LAUNCHER_CONFIG)]
        config: PathBuf,
        /// Stop before exec and print what would run
        #[arg(long, default_value_t = false)]
        no_exec: bool,
    },
    /// Only prune stale service directories
    Reconcile {
        #[arg(long, env = "CELLSTRAP_LAUNCHER_CONFIG", default_value = DEFAULT_LAUNCHER_CONFIG)]
        config: PathBuf,
    },
    /// Re-export the cell configuration from the directory service
    ExportConfig {
        #[arg(long, env = "CELLSTRAP_ENV_FILE")]
        env_file: Option<PathBuf>,
    },
}

fn init_tracing(verbose: u8) -> Result<()> {
    let directive = match verbose {
        0 => "cellstrap=info",
        1 => "cellstrap=debug",
        _ => "cellstrap=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn load_bootstrap_config(env_file: Option<&Path>) -> Result<BootstrapConfig> {
    let env_file = match env_file {
        Some(path) => path.to_path_buf(),
        None => default_env_file()?,
    };
    info!("Loading environment from {}", env_file.display());
    load_env_file(&env_file)?;
    Ok(BootstrapConfig::from_env()?)
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Bootstrap {
            env_file,
            force_reinstall,
        } => {
            ensure_privileged(current_euid())?;
            let config = load_bootstrap_config(env_file.as_deref())?;
            info!(
                "Bootstrapping cell {} on {} (force_reinstall={})",
                config.cell, config.hostname, force_reinstall
            );

            let runner = SystemRunner::new();
            let report = Bootstrapper::new(&runner, &config)
                .with_format(cli.outfmt)
                .with_force_reinstall(force_reinstall)
                .run(shutdown_signal())
                .await?;
            print!("{}", render(&report, cli.outfmt)?);
        }
        Commands::Launch { config, no_exec } => {
            let launcher_config = LauncherConfig::load(&config)
                .with_context(|| format!("loading launcher config {}", config.display()))?;
            let (report, chain) = launcher::prepare(&launcher_config)?;
            if no_exec {
                print!("{}", render(&report, cli.outfmt)?);
            } else {
                chain.exec()?;
            }
        }
        Commands::Reconcile { config } => {
            let launcher_config = LauncherConfig::load(&config)
                .with_context(|| format!("loading launcher config {}", config.display()))?;
            let report = launcher::reconcile_service_dir(
                &launcher_config.init_dir(),
                &launcher_config.reference_dir(),
            )?;
            print!("{}", render(&report, cli.outfmt)?);
        }
        Commands::ExportConfig { env_file } => {
            let config = load_bootstrap_config(env_file.as_deref())?;
            let runner = SystemRunner::new();
            let exported = Bootstrapper::new(&runner, &config)
                .with_format(cli.outfmt)
                .export_config()
                .await?;
            info!(
                "Wrote {} ({} masters)",
                config.config_out.display(),
                exported.masters.len()
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.verbose) {
        eprintln!("failed to initialize logging: {e}");
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            let code = exit_code_for(&e);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}
