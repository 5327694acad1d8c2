#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # rtty
//!
//! Device agent that exposes login shells to a remote management server.
//!
//! The agent dials out to `ws://<host>:<port>/ws/device?mac=<id>` and keeps
//! that one connection up. The server opens and closes terminal sessions
//! over it; each session is a `login` process on its own pseudo-terminal,
//! with keystrokes and output relayed as base64 in JSON frames.
//!
//! ```text
//! rtty -i eth0 -h 10.0.0.1 -p 5912 -a
//! ```
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, CLI, startup checks
//! agent.rs         — single-task event loop, keepalive, graceful shutdown
//! config.rs        — TOML + env-var + CLI configuration
//! device.rs        — device identity from the interface hardware address
//! protocol.rs      — wire messages and the base64 payload codec
//! handler.rs       — inbound frames → session table, session events → frames
//! sessions/
//!   mod.rs         — SessionTable, Spawner / SessionHandle traits
//!   session.rs     — PtySession (reader, writer, exit watcher, teardown)
//! shell/
//!   mod.rs         — login program lookup
//!   pty.rs         — PTY allocation, spawn, async master I/O
//! tunnel/
//!   client.rs      — WebSocket connect, reconnect, send, close
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use tracing::{error, info};

use rtty::config::{Config, Overrides};
use rtty::tunnel::client::device_url;
use rtty::{agent, device, shell};

#[derive(Parser)]
#[command(name = "rtty", version, disable_help_flag = true)]
struct Cli {
    /// Network interface whose hardware address identifies this device.
    #[arg(short = 'i', long)]
    ifname: Option<String>,

    /// Management server host.
    #[arg(short = 'h', long)]
    host: Option<String>,

    /// Management server port.
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Reconnect whenever the connection fails or closes.
    #[arg(short = 'a', long)]
    auto_reconnect: bool,

    /// Path to TOML config file (default: ./rtty.toml if present).
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Print help.
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("rtty: {e}");
            return ExitCode::FAILURE;
        }
    };
    config.apply_overrides(Overrides {
        ifname: cli.ifname,
        host: cli.host,
        port: cli.port,
        auto_reconnect: cli.auto_reconnect,
    });

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    if let Err(e) = config.validate() {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    let (Some(ifname), Some(host), Some(port)) = (
        config.device.ifname.clone(),
        config.server.host.clone(),
        config.server.port,
    ) else {
        Cli::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                "an interface (-i), a host (-h) and a port (-p) are required",
            )
            .exit();
    };

    if let Err(e) = nix::unistd::setuid(nix::unistd::Uid::from_raw(0)) {
        error!("Operation not permitted: {e}");
        return ExitCode::FAILURE;
    }

    let login = match shell::locate_login_program(config.login_override().as_deref()) {
        Ok(path) => path,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let device_id = match device::resolve_device_identity(&ifname) {
        Ok(id) => id,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    info!("rtty v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Device id: {device_id} ({ifname})");
    info!("Login program: {}", login.display());

    let url = device_url(&host, port, &config.server.path, &device_id);
    match agent::run(&config, url, device_id, login).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
