//! The agent event loop.
//!
//! Everything that changes state runs on one task: connection events,
//! session notifications, the keepalive timer and the shutdown signal are
//! multiplexed in a single `select!`. The session table and the connection
//! are therefore never touched concurrently.

use std::future::Future;
use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AgentError, SendError};
use crate::handler::Handler;
use crate::protocol::Outbound;
use crate::sessions::{PtySpawner, Spawner, EVENT_QUEUE};
use crate::tunnel::client::{ConnectionManager, ConnectionSettings, ConnectionUpdate};

/// Run until a shutdown signal arrives (`Ok`) or the connection is lost for
/// good (`Err`, only without auto-reconnect).
pub async fn run(
    config: &Config,
    url: String,
    device_id: String,
    login: PathBuf,
) -> Result<(), AgentError> {
    let spawner = PtySpawner::new(login, config.agent.reap_timeout());
    run_with(config, url, device_id, spawner, shutdown_signal()).await
}

/// The event loop proper, with the session spawner and the shutdown trigger
/// supplied by the caller.
pub async fn run_with<S: Spawner>(
    config: &Config,
    url: String,
    device_id: String,
    spawner: S,
    shutdown: impl Future<Output = ()>,
) -> Result<(), AgentError> {
    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();
    let (session_tx, mut session_rx) = mpsc::channel(EVENT_QUEUE);

    let mut handler = Handler::new(
        device_id,
        spawner,
        session_tx,
        config.agent.max_data_bytes,
    );

    let mut connection = ConnectionManager::new(
        ConnectionSettings {
            url,
            connect_timeout: config.agent.connect_timeout(),
            reconnect_delay: config.agent.reconnect_delay(),
            auto_reconnect: config.agent.auto_reconnect,
        },
        conn_tx,
    );
    connection.start();

    let mut keepalive = tokio::time::interval(config.agent.keepalive_interval());
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::pin!(shutdown);

    let result = loop {
        tokio::select! {
            () = &mut shutdown => break Ok(()),

            Some(event) = conn_rx.recv() => {
                match connection.on_event(event) {
                    Ok(ConnectionUpdate::Opened) => {
                        match connection.reconnects() {
                            0 => info!("Registered as {}", handler.device_id()),
                            n => info!("Registered as {} after {n} reconnect(s)", handler.device_id()),
                        }
                        keepalive.reset_immediately();
                    }
                    Ok(ConnectionUpdate::Frame(text)) => handler.handle_frame(&text).await,
                    Ok(ConnectionUpdate::Idle) => {}
                    Err(e) => break Err(e),
                }
            }

            Some(event) = session_rx.recv() => {
                if let Some(frame) = handler.handle_session_event(event).await {
                    deliver(&mut connection, &frame).await;
                }
            }

            _ = keepalive.tick() => {
                if connection.is_connected() {
                    deliver(&mut connection, &handler.keepalive()).await;
                }
            }
        }
    };

    info!("Shutting down...");
    let live = handler.sessions().sids();
    if !live.is_empty() {
        info!("Closing {} session(s): {}", live.len(), live.join(", "));
    }
    for frame in handler.shutdown().await {
        deliver(&mut connection, &frame).await;
    }
    connection.close().await;
    info!("Goodbye");
    result
}

/// Send a frame, logging instead of failing. Frames produced while
/// disconnected are dropped.
async fn deliver(connection: &mut ConnectionManager, frame: &Outbound) {
    match connection.send(frame).await {
        Ok(()) => {}
        Err(SendError::NotConnected) => {
            debug!("Not connected, dropping {} frame", frame.kind());
        }
        Err(e) => warn!("Failed to send {} frame: {e}", frame.kind()),
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {e}");
            if let Err(e) = ctrl_c.await {
                warn!("Failed to listen for SIGINT: {e}");
                std::future::pending::<()>().await;
            }
            info!("Received SIGINT");
        }
    }
}
