//! callwatch daemon - PBX agent state and call history engine
//!
//! Connects to the PBX management interface, tracks every extension's
//! registration and call state, merges completed calls with the CDR table,
//! and serves snapshots to local clients over a Unix socket.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! callwatchd start
//!
//! # Start the daemon (background/daemonized)
//! callwatchd start -d
//!
//! # Stop the daemon
//! callwatchd stop
//!
//! # Show daemon and PBX link status
//! callwatchd status
//!
//! # Force a new PBX session / a channel poll
//! callwatchd reconnect
//! callwatchd poll
//!
//! # Use another config file
//! callwatchd --config /etc/callwatch.toml start
//!
//! # Enable debug logging
//! RUST_LOG=callwatchd=debug callwatchd start
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown (Logoff is sent to the PBX)

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use callwatchd::ami::spawn_connection_manager;
use callwatchd::cdr::spawn_cdr_ingestion;
use callwatchd::client::DaemonClient;
use callwatchd::config::{Config, DirectoryConfig, LeadsConfig};
use callwatchd::db;
use callwatchd::directory::{
    spawn_directory_refresh, AgentDirectorySource, FileAgentDirectory, MySqlAgentDirectory,
};
use callwatchd::engine::{spawn_engine, EngineSettings};
use callwatchd::leads::{LeadCache, MySqlLeadSource};
use callwatchd::server::DaemonServer;

/// callwatch daemon - PBX agent state monitor
#[derive(Parser, Debug)]
#[command(name = "callwatchd", version, about)]
struct Args {
    /// Configuration file (default: $CALLWATCH_CONFIG or <config dir>/callwatch/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon and PBX link status
    Status,
    /// Drop the PBX session and connect again now
    Reconnect,
    /// Run a channel reconciliation poll now
    Poll,
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("callwatch")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("callwatchd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("callwatchd.log")
}

fn read_pid() -> Option<u32> {
    let mut file = File::open(pid_file_path()).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

/// Returns the PID of a running daemon, removing a stale PID file.
fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        let pid = i32::try_from(pid).context("PID out of range")?;
        let result = unsafe { libc::kill(pid, libc::SIGTERM) };
        if result != 0 {
            bail!("Failed to send SIGTERM to process {pid}");
        }
    }
    #[cfg(not(unix))]
    {
        bail!("Stop command is only supported on Unix systems");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Start { daemon: false });

    match command {
        Command::Start { daemon } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'callwatchd stop' to stop it first.");
                process::exit(1);
            }

            // Fail before forking so configuration errors reach the terminal
            let config = Config::load(args.config.as_deref()).context("Invalid configuration")?;

            if daemon {
                daemonize()?;
            }

            write_pid()?;
            let result = run_daemon(config);
            remove_pid_file();
            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            let Some(pid) = is_daemon_running() else {
                println!("Daemon is not running.");
                process::exit(1);
            };
            println!("Daemon is running (PID {pid})");
            let config = Config::load(args.config.as_deref()).context("Invalid configuration")?;
            print_status(&config.server.socket_path)
        }
        Command::Reconnect => {
            let config = Config::load(args.config.as_deref()).context("Invalid configuration")?;
            send_control(&config.server.socket_path, Control::Reconnect)
        }
        Command::Poll => {
            let config = Config::load(args.config.as_deref()).context("Invalid configuration")?;
            send_control(&config.server.socket_path, Control::Poll)
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = File::create(&log_path).context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

// ============================================================================
// Client Subcommands
// ============================================================================

enum Control {
    Reconnect,
    Poll,
}

#[tokio::main(flavor = "current_thread")]
async fn print_status(socket_path: &Path) -> Result<()> {
    let mut client = DaemonClient::connect(socket_path, None)
        .await
        .with_context(|| format!("Cannot reach daemon at {}", socket_path.display()))?;
    let status = client.status().await?;
    let _ = client.disconnect().await;

    println!("Socket: {}", socket_path.display());
    println!(
        "PBX: {} (connection #{})",
        match (status.connected, status.authenticated) {
            (true, true) => "connected",
            (true, false) => "connected, not logged in",
            _ => "disconnected",
        },
        status.connection_id
    );
    if status.auth_failures > 0 {
        println!("Rejected logins: {}", status.auth_failures);
    }
    println!("Peers: {}", status.peer_count);
    println!(
        "History: {} records (CDR ingestion {})",
        status.history_len,
        if status.cdr_enabled { "on" } else { "off" }
    );
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn send_control(socket_path: &Path, control: Control) -> Result<()> {
    let mut client = DaemonClient::connect(socket_path, None)
        .await
        .with_context(|| format!("Cannot reach daemon at {}", socket_path.display()))?;
    match control {
        Control::Reconnect => {
            client.reconnect().await?;
            println!("Reconnect requested.");
        }
        Control::Poll => {
            client.poll().await?;
            println!("Channel poll requested.");
        }
    }
    let _ = client.disconnect().await;
    Ok(())
}

// ============================================================================
// Daemon
// ============================================================================

async fn build_lead_cache(config: &LeadsConfig) -> Option<LeadCache> {
    let url = config.database_url.as_deref()?;
    let source = match db::connect(url).await {
        Ok(pool) => MySqlLeadSource::new(pool, &config.table),
        Err(e) => {
            warn!(error = %e, "Lead lookups disabled");
            return None;
        }
    };
    match source {
        Ok(source) => Some(LeadCache::new(
            Arc::new(source),
            config.cache_ttl(),
            config.cache_capacity,
        )),
        Err(e) => {
            warn!(error = %e, "Lead lookups disabled");
            None
        }
    }
}

async fn build_directory_source(config: &DirectoryConfig) -> Option<Arc<dyn AgentDirectorySource>> {
    if let Some(path) = &config.file {
        return Some(Arc::new(FileAgentDirectory::new(path)));
    }
    let url = config.database_url.as_deref()?;
    let pool = match db::connect(url).await {
        Ok(pool) => pool,
        Err(e) => {
            warn!(error = %e, "Agent directory disabled");
            return None;
        }
    };
    match MySqlAgentDirectory::new(pool, &config.table) {
        Ok(source) => Some(Arc::new(source)),
        Err(e) => {
            warn!(error = %e, "Agent directory disabled");
            None
        }
    }
}

#[tokio::main]
async fn run_daemon(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("callwatchd=info".parse()?)
                .add_directive("callwatch_core=info".parse()?)
                .add_directive("callwatch_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        pbx = %config.pbx.address(),
        "callwatch daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let leads = build_lead_cache(&config.leads).await;
    let engine = spawn_engine(
        EngineSettings {
            max_history: config.history.max_records,
            auth_failure_alert_threshold: config.pbx.auth_failure_alert_threshold,
        },
        leads.clone(),
    );
    info!(leads = leads.is_some(), "Engine started");

    if let Some(source) = build_directory_source(&config.directory).await {
        spawn_directory_refresh(
            source,
            engine.clone(),
            config.directory.refresh_interval(),
            cancel_token.clone(),
        );
    }

    let cdr_task = spawn_cdr_ingestion(
        config.cdr.clone(),
        leads,
        engine.clone(),
        cancel_token.clone(),
    );
    if cdr_task.is_none() {
        info!("No CDR database configured, history is event-sourced only");
    }

    let (ami, ami_task) =
        spawn_connection_manager(config.pbx.clone(), engine.clone(), cancel_token.clone());

    let server = DaemonServer::new(
        &config.server.socket_path,
        engine,
        Some(ami),
        cancel_token.clone(),
    );
    info!(socket = %config.server.socket_path.display(), "Starting server");

    let result = server.run().await;
    cancel_token.cancel();
    if let Err(e) = ami_task.await {
        warn!(error = %e, "Connection manager task failed");
    }

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("callwatch daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
