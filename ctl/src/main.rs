//! `execguard-ctl`: authenticate to the daemon and issue one request.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use execguard::config::GuardConfig;
use execguard::control::client::ControlClient;
use execguard::control::handshake::KeyMaterial;
use execguard::control::protocol::ServerFrame;
use execguard::logging;
use execguard::monitor::Pid;

/// Control client for the ExecGuard daemon.
#[derive(Parser)]
#[command(name = "execguard-ctl", version, about)]
struct Cli {
    /// Control socket (default: from the daemon configuration).
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Replace the blocked set with the entries in a JSON file.
    ReplacePolicy {
        /// File holding `[{identifier, path, digest}]`.
        file: PathBuf,
    },
    /// Let a blocked digest run for the temporary allow window.
    Allow {
        /// Hex SHA-256 digest.
        digest: String,
    },
    /// Let a process read the protected configuration briefly.
    Grant {
        /// Process id.
        pid: Pid,
    },
    /// Set the language code for notices.
    Language {
        /// Language code, e.g. `en`.
        code: String,
    },
    /// Print blocked notices as they arrive.
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_cli();
    let cli = Cli::parse();

    let socket = match cli.socket {
        Some(socket) => socket,
        None => GuardConfig::load(None)?.control.socket_path,
    };

    let mut client = ControlClient::connect(&socket)
        .await
        .with_context(|| format!("failed to connect to {}", socket.display()))?;
    let keys = KeyMaterial::generate();
    client
        .authenticate(&keys)
        .await
        .context("control handshake failed")?;

    let request = match cli.command {
        Command::ReplacePolicy { file } => {
            let entries = execguard_ctl::load_policy(&file)?;
            println!("replacing policy with {} entries", entries.len());
            execguard_ctl::replace_policy(entries)
        }
        Command::Allow { digest } => execguard_ctl::allow(&digest)?,
        Command::Grant { pid } => execguard_ctl::grant(pid),
        Command::Language { code } => execguard_ctl::language(&code),
        Command::Watch => return watch(client).await,
    };

    client
        .call(&request)
        .await
        .with_context(|| format!("{} failed", request.name()))?;
    println!("ok");
    Ok(())
}

/// Print notices until the daemon hangs up.
async fn watch(mut client: ControlClient) -> anyhow::Result<()> {
    loop {
        match client.next_frame().await? {
            ServerFrame::BlockedNotice { name, path, digest } => {
                let digest = digest.map(|d| d.to_string()).unwrap_or_else(|| "-".to_owned());
                println!("blocked {name} ({path}) sha256={digest}");
            }
            other => println!("{other:?}"),
        }
    }
}
