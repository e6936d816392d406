use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use keyphy_core::{
    auth::{derive_device_key, AuthSession},
    config::{KeyphyConfig, DEFAULT_CONFIG_PATH},
    logging,
    protect::{ChattrProtector, NoopProtector, Protector},
};
use keyphy_dns::{DnsBlockingServer, DnsSystemIntegrator, SystemResolver};
use keyphy_usb::UdevDeviceEnumerator;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

mod blockers;
mod commands;
mod daemon;
mod monitors;
mod procfs;
mod status;

use blockers::SystemBlockProvider;
use commands::{daemon_alive, send_command, spawn_dispatcher, spawn_signal_listener, Command, PidFile};
use daemon::Daemon;
use monitors::spawn_supervisor;
use procfs::ProcfsProbe;
use status::{bind_status, serve_status, BlockCounts, StatusReport};

#[derive(Parser)]
#[command(name = "keyphyd", version, about = "Physical-key enforcement daemon")]
struct Cli {
    /// Configuration file (JSON, or TOML by extension).
    #[arg(long, short, global = true, env = "KEYPHY_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the enforcement daemon in the foreground (default).
    Run,
    /// Print authentication state and block counts as JSON.
    Status,
    /// Apply every block (requires the key device).
    Lock,
    /// Remove every block (requires the key device).
    Unlock,
    /// Stop the daemon (requires the key device).
    Stop,
    /// Print the JSON schema of the configuration file.
    Schema,
    /// Print the credential to store for a device.
    DeriveKey { uuid: String, name: String },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    logging::init("info");
    let cli = Cli::parse();
    if let Err(err) = dispatch(cli).await {
        error!("keyphyd: {err:?}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command.unwrap_or(Cmd::Run) {
        Cmd::Run => run(&cli.config).await,
        Cmd::Status => print_status(&cli.config),
        Cmd::Lock => control(&cli.config, Command::Lock),
        Cmd::Unlock => control(&cli.config, Command::Unlock),
        Cmd::Stop => control(&cli.config, Command::Stop),
        Cmd::Schema => {
            let schema = schemars::schema_for!(KeyphyConfig);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
        Cmd::DeriveKey { uuid, name } => {
            println!("{}", derive_device_key(&uuid, &name));
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<KeyphyConfig> {
    KeyphyConfig::load(path).with_context(|| format!("load config {}", path.display()))
}

async fn run(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    info!("keyphy daemon booting (config: {})", config_path.display());

    let protector: Arc<dyn Protector> = if config.daemon.protect_config {
        Arc::new(ChattrProtector::discover())
    } else {
        Arc::new(NoopProtector)
    };
    if config.daemon.protect_config {
        if let Err(err) = protector.protect(&config.path) {
            warn!("could not protect {}: {err}", config.path.display());
        }
    }

    let server = Arc::new(DnsBlockingServer::from_config(&config.dns).context("configure dns server")?);
    let resolver = Arc::new(SystemResolver::discover(&config.dns, protector.clone()));
    let dns = Arc::new(DnsSystemIntegrator::new(
        server.clone(),
        resolver,
        config.dns.fallback_servers.clone(),
    ));
    let provider = SystemBlockProvider::discover(server, protector);

    let pid_path = config.daemon.pid_file();
    let supervisor_every = Duration::from_secs(config.daemon.supervisor_interval_secs.max(1));
    let status_addr = config.daemon.status_addr.clone();

    let daemon = Arc::new(Daemon::new(
        config,
        Arc::new(UdevDeviceEnumerator::new()),
        provider,
        Some(dns.clone()),
        Arc::new(ProcfsProbe::new()),
    ));

    // Restores host DNS if anything below bails out or unwinds.
    let emergency = dns.emergency_guard();
    let _pid_file = PidFile::create(&pid_path)
        .with_context(|| format!("write pid file {}", pid_path.display()))?;

    daemon.start().await.context("start daemon")?;

    let (exit_tx, mut exit_rx) = watch::channel(false);
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let signals = spawn_signal_listener(cmd_tx, exit_rx.clone()).context("install signal handlers")?;
    let dispatcher = spawn_dispatcher(daemon.clone(), cmd_rx, exit_rx.clone(), exit_tx.clone());
    let supervisor = spawn_supervisor(daemon.clone(), supervisor_every, exit_rx.clone());
    let status = match status_addr {
        Some(addr) => {
            let listener = bind_status(&addr).await.context("bind status endpoint")?;
            Some(tokio::spawn(serve_status(
                listener,
                daemon.subscribe_state(),
                exit_rx.clone(),
            )))
        }
        None => None,
    };

    while !*exit_rx.borrow() {
        if exit_rx.changed().await.is_err() {
            break;
        }
    }
    info!("shutting down");
    let _ = exit_tx.send(true);

    for handle in [signals, dispatcher, supervisor] {
        if let Err(err) = handle.await {
            warn!("task ended abnormally: {err}");
        }
    }
    if let Some(status) = status {
        match status.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("status endpoint failed: {err}"),
            Err(err) => warn!("status endpoint ended abnormally: {err}"),
        }
    }

    if daemon.is_running() {
        daemon.stop().await.context("stop daemon")?;
    }
    emergency.disarm();
    Ok(())
}

fn print_status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let auth = AuthSession::new(Arc::new(UdevDeviceEnumerator::new()), config.auth.clone());
    let report = StatusReport {
        daemon_running: daemon_alive(&config.daemon.pid_file()),
        auth_configured: config.auth_configured(),
        auth: auth.status(),
        blocks: BlockCounts::from(&config.blocks),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Prove possession of the key locally, then hand the command to the daemon.
/// The daemon authenticates again before acting.
fn control(config_path: &Path, command: Command) -> Result<()> {
    let config = load_config(config_path)?;
    if !config.auth_configured() {
        bail!("no authentication device configured in {}", config_path.display());
    }
    let auth = AuthSession::new(Arc::new(UdevDeviceEnumerator::new()), config.auth.clone());
    auth.authenticate_device()
        .with_context(|| format!("{command} refused"))?;
    let pid = send_command(&config.daemon.pid_file(), command)
        .with_context(|| format!("send {command} to daemon"))?;
    println!("{command} sent to keyphyd (pid {pid})");
    Ok(())
}
