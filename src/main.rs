//! ExecGuard CLI entry point.
//!
//! Provides `start`, `digest`, and `check-config` subcommands for running the
//! authorization daemon, printing a file's content identity, or validating
//! configuration.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use execguard::client::EventClient;
use execguard::config::GuardConfig;
use execguard::control::handshake::KeyMaterial;
use execguard::control::server::ControlServer;
use execguard::control::session::SessionRegistry;
use execguard::engine::{run_sweeper, Engine};
use execguard::identity::{digest_of, DigestOptions};
use execguard::monitor::feed;
use execguard::monitor::MonitorClient;
use execguard::notify::app::AppSink;
use execguard::notify::tty::TerminalSink;
use execguard::notify::{NoticeSink, Notifier};
use execguard::protection::SelfProtection;
use execguard::{logging, socket};

/// ExecGuard: content-identity execution authorization daemon.
#[derive(Parser)]
#[command(name = "execguard", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the authorization daemon.
    Start {
        /// Configuration file (default: `~/.execguard/config.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the content digest of a file as the engine computes it.
    Digest {
        /// File to hash.
        path: PathBuf,
        /// Hash the whole file instead of the leading bytes only.
        #[arg(long)]
        full: bool,
    },
    /// Validate configuration and exit.
    CheckConfig {
        /// Configuration file (default: `~/.execguard/config.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start { config } => handle_start(config.as_deref()).await,
        Command::Digest { path, full } => handle_digest(&path, full),
        Command::CheckConfig { config } => handle_check_config(config.as_deref()),
    }
}

/// Run the daemon until SIGINT or SIGTERM.
async fn handle_start(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = GuardConfig::load(config_path).context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    let logs_dir = config.logs_dir()?;
    let _logging_guard = logging::init_production(&logs_dir)?;
    info!(version = env!("CARGO_PKG_VERSION"), "execguard starting");

    // Notices fan out to the blocked process's terminal and to the app.
    let sessions = Arc::new(SessionRegistry::new());
    let sinks: Vec<Arc<dyn NoticeSink>> = vec![
        Arc::new(TerminalSink::new(config.control.notice_title.clone())),
        Arc::new(AppSink::new(Arc::clone(&sessions))),
    ];
    let (notifier, notifier_task) =
        Notifier::new(sinks, config.control.retry_delays()).spawn(config.control.notify_queue);

    let engine = Arc::new(Engine::new(
        config.engine.clone(),
        SelfProtection::new(config.protection.clone()),
        notifier,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Fresh signing identity for this launch.
    let keys = KeyMaterial::generate();
    let control_listener = ControlServer::bind(&config.control.socket_path).with_context(|| {
        format!(
            "failed to bind control socket {}",
            config.control.socket_path.display()
        )
    })?;
    let server = Arc::new(ControlServer::new(Arc::clone(&engine), sessions, keys));
    let control_task = tokio::spawn(server.serve(control_listener, shutdown_rx.clone()));

    let feed_listener = socket::bind_owner_only(&config.monitor.feed_socket).with_context(|| {
        format!(
            "failed to bind event feed socket {}",
            config.monitor.feed_socket.display()
        )
    })?;
    let feed_task = tokio::spawn(run_feed(
        feed_listener,
        Arc::clone(&engine),
        shutdown_rx.clone(),
    ));

    let sweeper_task = tokio::spawn(run_sweeper(Arc::clone(&engine), shutdown_rx));

    info!(
        control = %config.control.socket_path.display(),
        feed = %config.monitor.feed_socket.display(),
        "execguard running"
    );

    wait_for_shutdown_signal().await?;
    info!(in_flight = engine.in_flight(), "shutdown requested");

    let _ = shutdown_tx.send(true);
    for (name, task) in [
        ("control", control_task),
        ("feed", feed_task),
        ("sweeper", sweeper_task),
    ] {
        if let Err(e) = task.await {
            warn!(task = name, error = %e, "task ended abnormally");
        }
    }
    notifier_task.abort();

    for path in [&config.control.socket_path, &config.monitor.feed_socket] {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "failed to remove socket");
        }
    }

    info!("execguard stopped");
    Ok(())
}

/// Accept event producer connections and run one event client per stream.
async fn run_feed(
    listener: UnixListener,
    engine: Arc<Engine>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let engine = Arc::clone(&engine);
                    tokio::spawn(async move {
                        let connection = match feed::accept_stream(stream).await {
                            Ok(connection) => connection,
                            Err(e) => {
                                warn!(error = %e, "rejected event feed connection");
                                return;
                            }
                        };
                        let monitor: Arc<dyn MonitorClient> = connection.monitor;
                        let client = EventClient::new(connection.role, engine, monitor);
                        if let Err(e) = client.start() {
                            error!(role = %connection.role, error = %e, "event client failed to start");
                            return;
                        }
                        client.run(connection.messages).await;
                    });
                }
                Err(e) => warn!(error = %e, "event feed accept failed"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("event feed listener stopped");
}

async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for SIGINT")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

/// Print `<digest>  <path>`.
fn handle_digest(path: &Path, full: bool) -> anyhow::Result<()> {
    logging::init_cli();
    let mut options = DigestOptions::default();
    if full {
        options.read_limit = None;
    }
    let digest = digest_of(path, options)?;
    println!("{digest}  {}", path.display());
    Ok(())
}

/// Load and validate configuration, then print where things will live.
fn handle_check_config(config_path: Option<&Path>) -> anyhow::Result<()> {
    logging::init_cli();
    let config = GuardConfig::load(config_path).context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    println!("configuration OK");
    println!("  control socket: {}", config.control.socket_path.display());
    println!("  event feed:     {}", config.monitor.feed_socket.display());
    println!("  logs:           {}", config.logs_dir()?.display());
    println!("  bundle:         {}", config.protection.bundle_path.display());
    println!("  config file:    {}", config.protection.config_file.display());
    println!("  workers:        {}", config.engine.workers);
    Ok(())
}
