//! The real PTY-backed session.
//!
//! A [`PtySession`] owns one login process running on a pseudo-terminal and
//! three background tasks:
//!
//! - **reader** — PTY master → [`SessionEvent::Output`], chunk-based so
//!   keystroke echo is forwarded immediately. It waits for room on the event
//!   queue before reading again, so a slow consumer throttles the terminal.
//! - **writer** — bounded input queue → PTY master; a failed write is logged
//!   and the queue keeps draining
//! - **exit watcher** — waits for the process, reaps it, and reports
//!   [`SessionEvent::Exited`]
//!
//! ## Teardown
//!
//! [`PtySession::terminate`] stops the reader and writer, closes the master
//! (which hangs up the terminal), then sends SIGTERM if the exit watcher has
//! not seen the process go. The watcher signals the reap separately from the
//! exit event, so teardown never waits on a full event queue. The wait for
//! the reap is bounded by the reap
//! timeout; a process still alive after that gets SIGKILL and one more
//! bounded wait. This wait runs on the event loop, so a child that ignores
//! SIGTERM stalls the agent for up to one reap timeout.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{SessionEvent, SessionHandle, Spawner};
use crate::error::SessionError;
use crate::shell::pty::{self, PtyMaster, PtyPair};

/// Largest chunk forwarded per terminal read.
const READ_CHUNK: usize = 4096;

/// Pending writes per session before further input is refused.
pub const INPUT_QUEUE: usize = 64;

/// Spawns the login program on a fresh PTY for each session.
pub struct PtySpawner {
    login: PathBuf,
    reap_timeout: Duration,
}

impl PtySpawner {
    pub fn new(login: PathBuf, reap_timeout: Duration) -> Self {
        Self {
            login,
            reap_timeout,
        }
    }
}

impl Spawner for PtySpawner {
    type Session = PtySession;

    fn spawn(
        &self,
        sid: &str,
        serial: u64,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<PtySession, SessionError> {
        PtySession::spawn(sid, serial, &self.login, self.reap_timeout, events)
    }
}

/// A login process attached to a pseudo-terminal.
pub struct PtySession {
    sid: String,
    /// OS process ID of the login program.
    pid: u32,
    /// PTY master. The reader and writer hold clones; the fd closes when the
    /// last one drops.
    master: Arc<PtyMaster>,
    /// Ordered input queue drained by the writer task.
    input_tx: mpsc::Sender<Vec<u8>>,
    /// Reader and writer tasks, aborted on teardown.
    io_tasks: Vec<JoinHandle<()>>,
    /// Owns the `Child`; reaps it, then reports the exit.
    exit_task: JoinHandle<()>,
    /// Fires once the process has been reaped.
    reaped: oneshot::Receiver<()>,
    reap_timeout: Duration,
}

impl PtySession {
    fn spawn(
        sid: &str,
        serial: u64,
        login: &Path,
        reap_timeout: Duration,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Self, SessionError> {
        let pair = pty::allocate_pty()?;
        let mut child =
            pty::spawn_on_pty(&pair, login).map_err(|source| SessionError::Spawn {
                program: login.to_path_buf(),
                source,
            })?;
        // The child has its own copies of the slave; ours must go so the
        // master sees a hangup once the child is gone.
        let PtyPair { master, slave } = pair;
        drop(slave);

        let pid = child.id().unwrap_or(0);
        // On failure `child` drops here and kill_on_drop takes the process down.
        let master = Arc::new(PtyMaster::new(master).map_err(SessionError::Setup)?);

        // Output reader task: PTY master → session events
        let reader = Arc::clone(&master);
        let sid_out = sid.to_string();
        let events_out = events.clone();
        let output_task = tokio::spawn(async move {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let event = SessionEvent::Output {
                            sid: sid_out.clone(),
                            serial,
                            data: buf[..n].to_vec(),
                        };
                        if events_out.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Session {sid_out} terminal read failed: {e}");
                        break;
                    }
                }
            }
            debug!("Session {sid_out} PTY output closed");
        });

        // Input writer task: queue → PTY master
        let writer = Arc::clone(&master);
        let sid_in = sid.to_string();
        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE);
        let input_task = tokio::spawn(async move {
            while let Some(data) = input_rx.recv().await {
                if let Err(e) = writer.write_all(&data).await {
                    warn!("Session {sid_in} write to terminal failed: {e}");
                }
            }
        });

        // Exit watcher task
        let sid_exit = sid.to_string();
        let (reaped_tx, reaped) = oneshot::channel();
        let exit_task = tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => {
                    info!("Session {sid_exit} login process exited: {status}");
                    status.code()
                }
                Err(e) => {
                    error!("Session {sid_exit} wait error: {e}");
                    None
                }
            };
            let _ = reaped_tx.send(());
            let _ = events
                .send(SessionEvent::Exited {
                    sid: sid_exit,
                    serial,
                    code,
                })
                .await;
        });

        info!(
            "Session {sid} started: {} (pid {pid}, pty fd {})",
            login.display(),
            master.as_raw_fd()
        );

        Ok(Self {
            sid: sid.to_string(),
            pid,
            master,
            input_tx,
            io_tasks: vec![output_task, input_task],
            exit_task,
            reaped,
            reap_timeout,
        })
    }
}

impl SessionHandle for PtySession {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn write(&mut self, data: Vec<u8>) -> Result<(), SessionError> {
        self.input_tx.try_send(data).map_err(|e| match e {
            TrySendError::Full(_) => SessionError::InputFull,
            TrySendError::Closed(_) => SessionError::InputClosed,
        })
    }

    async fn terminate(self) {
        let PtySession {
            sid,
            pid,
            master,
            input_tx,
            io_tasks,
            exit_task,
            mut reaped,
            reap_timeout,
        } = self;

        drop(input_tx);
        for task in io_tasks {
            task.abort();
            let _ = task.await;
        }
        // Last reference: closes the master fd.
        drop(master);

        if reaped.try_recv().is_err() {
            signal(pid, Signal::SIGTERM);
            if tokio::time::timeout(reap_timeout, &mut reaped).await.is_err() {
                warn!("Session {sid} pid {pid} survived SIGTERM, sending SIGKILL");
                signal(pid, Signal::SIGKILL);
                if tokio::time::timeout(reap_timeout, &mut reaped)
                    .await
                    .is_err()
                {
                    error!("Session {sid} pid {pid} could not be reaped, abandoning it");
                }
            }
        }
        // The exit report, if still pending, is stale once the session is
        // out of the table.
        exit_task.abort();
        info!("Session {sid} closed");
    }
}

fn signal(pid: u32, sig: Signal) {
    // pid 0 would signal our own process group.
    if pid == 0 {
        return;
    }
    #[allow(clippy::cast_possible_wrap)]
    let target = Pid::from_raw(pid as i32);
    if let Err(e) = kill(target, sig) {
        debug!("kill({pid}, {sig:?}) failed: {e}");
    }
}
