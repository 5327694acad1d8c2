//! PTY session abstraction and the table of live sessions.
//!
//! [`SessionTable`] is the single authority over which `sid`s are live. It is
//! owned by the handler and only touched from the event loop, so it needs no
//! locking. Sessions are created through a [`Spawner`] and driven through the
//! [`SessionHandle`] trait; the real implementation lives in [`session`],
//! tests substitute fakes that never fork.
//!
//! ## Serials
//!
//! Every spawned session gets a serial number unique for the life of the
//! process. Output and exit notifications carry `(sid, serial)` and are only
//! applied when the serial matches the table entry for that `sid`, so late
//! notifications from a torn-down session cannot touch a newer session that
//! reuses the same `sid`.
//!
//! ## Backpressure
//!
//! Session events travel on one bounded queue of [`EVENT_QUEUE`] entries.
//! Readers wait for room, so a stalled event loop stops terminal reads
//! instead of buffering output without limit.

pub mod session;

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::error::SessionError;

pub use session::{PtySession, PtySpawner};

/// Capacity of the session event queue shared by all sessions.
pub const EVENT_QUEUE: usize = 64;

/// Notifications produced by a live session's background tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The terminal produced bytes.
    Output {
        sid: String,
        serial: u64,
        data: Vec<u8>,
    },
    /// The login process exited on its own and has been reaped.
    Exited {
        sid: String,
        serial: u64,
        code: Option<i32>,
    },
}

/// Creates sessions. One per agent.
pub trait Spawner {
    type Session: SessionHandle;

    /// Start a login process on a fresh pseudo-terminal. Output and exit
    /// notifications for it are delivered on `events` tagged with `sid` and
    /// `serial`.
    fn spawn(
        &self,
        sid: &str,
        serial: u64,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Self::Session, SessionError>;
}

/// A running session as seen by the handler.
#[allow(async_fn_in_trait)]
pub trait SessionHandle {
    /// OS process id of the login process.
    fn pid(&self) -> u32;

    /// Queue bytes for the terminal. Delivery order matches call order; a
    /// full queue is an error, never a wait.
    fn write(&mut self, data: Vec<u8>) -> Result<(), SessionError>;

    /// Release everything: stop watching the terminal, close it, terminate
    /// the process if it may still be alive and reap it.
    async fn terminate(self);
}

/// A table entry: the session plus the serial it was spawned with.
#[derive(Debug)]
pub struct Tracked<H> {
    pub serial: u64,
    pub handle: H,
}

/// Live sessions keyed by `sid`. No two entries share a `sid`.
pub struct SessionTable<H> {
    entries: HashMap<String, Tracked<H>>,
}

impl<H> Default for SessionTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> SessionTable<H> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Insert a new session. A present `sid` is left untouched and the
    /// rejected entry is handed back.
    pub fn insert(&mut self, sid: String, entry: Tracked<H>) -> Result<(), Tracked<H>> {
        if self.entries.contains_key(&sid) {
            return Err(entry);
        }
        self.entries.insert(sid, entry);
        Ok(())
    }

    pub fn contains(&self, sid: &str) -> bool {
        self.entries.contains_key(sid)
    }

    /// Whether `sid` is live and was spawned with `serial`.
    pub fn is_current(&self, sid: &str, serial: u64) -> bool {
        self.entries.get(sid).is_some_and(|e| e.serial == serial)
    }

    pub fn get_mut(&mut self, sid: &str) -> Option<&mut H> {
        self.entries.get_mut(sid).map(|e| &mut e.handle)
    }

    pub fn remove(&mut self, sid: &str) -> Option<Tracked<H>> {
        self.entries.remove(sid)
    }

    /// Remove `sid` only if the entry was spawned with `serial`.
    pub fn remove_current(&mut self, sid: &str, serial: u64) -> Option<Tracked<H>> {
        if self.entries.get(sid)?.serial != serial {
            return None;
        }
        self.entries.remove(sid)
    }

    /// Take every entry out of the table.
    pub fn drain(&mut self) -> Vec<(String, Tracked<H>)> {
        self.entries.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted `sid`s.
    pub fn sids(&self) -> Vec<String> {
        let mut sids: Vec<String> = self.entries.keys().cloned().collect();
        sids.sort();
        sids
    }
}
