use clap::{Parser, Subcommand};
use lazyconnect::ipc::client::IPC_TIMEOUT;
use lazyconnect::ipc::{Command, DaemonClient, Event};
use lazyconnect::platform::native_platform;
use lazyconnect::{Daemon, DaemonOptions, DaemonPaths};
use std::sync::Mutex;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "lazyconnect")]
#[command(about = "Background session daemon for OpenConnect VPN")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the background daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Run the daemon in the foreground (logs to daemon.log)
    Run,
    /// Ask a running daemon to shut down
    Stop,
    /// Show whether a daemon is running and what it is doing
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let paths = DaemonPaths::default();
    let Commands::Daemon { action } = cli.command;

    // Set up logging
    let level = if cli.debug { Level::DEBUG } else { Level::INFO };
    if matches!(action, DaemonAction::Run) {
        paths.ensure_dir()?;
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&paths.daemon_log)?;
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .with_ansi(false) // No color codes in log file
            .with_writer(Mutex::new(log_file))
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    match action {
        DaemonAction::Run => run_daemon(paths).await,
        DaemonAction::Stop => stop_daemon(&paths).await,
        DaemonAction::Status => daemon_status(&paths).await,
    }
}

async fn run_daemon(paths: DaemonPaths) -> Result<(), Box<dyn std::error::Error>> {
    let options = DaemonOptions::load_or_default(&paths.options)?;
    info!("Starting lazyconnect daemon {} in {:?}", VERSION, paths.dir);

    let daemon = Daemon::new(VERSION, options, paths, native_platform())?;
    if let Err(e) = daemon.run().await {
        error!("Daemon failed: {}", e);
        return Err(e.into());
    }
    Ok(())
}

async fn stop_daemon(paths: &DaemonPaths) -> Result<(), Box<dyn std::error::Error>> {
    let Ok(mut client) = DaemonClient::connect(&paths.socket).await else {
        println!("Daemon is not running");
        return Ok(());
    };

    // A mismatched daemon shuts itself down after the handshake anyway
    if client.hello(VERSION).await? {
        client.send(&Command::Shutdown).await?;
    }
    println!("Daemon stopping");
    Ok(())
}

async fn daemon_status(paths: &DaemonPaths) -> Result<(), Box<dyn std::error::Error>> {
    let Ok(mut client) = DaemonClient::connect(&paths.socket).await else {
        println!("Daemon is not running");
        return Ok(());
    };

    if !client.hello(VERSION).await? {
        println!("Daemon is running a different version and will shut down");
        return Ok(());
    }

    client.send(&Command::GetState).await?;
    let event = client
        .wait_for(IPC_TIMEOUT, |e| matches!(e, Event::State(_)))
        .await?;

    if let Event::State(state) = event {
        println!("Daemon running (version {})", VERSION);
        println!("  Status:     {:?}", state.status);
        if !state.active_conn_id.is_empty() {
            println!("  Connection: {}", state.active_conn_id);
        }
        if !state.ip.is_empty() {
            println!("  IP:         {}", state.ip);
        }
        if state.pid != 0 {
            println!("  VPN PID:    {}", state.pid);
        }
        println!("  Log lines:  {}", state.total_log_lines);
    }
    Ok(())
}
