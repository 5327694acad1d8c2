//! Protocol dispatch against the session table.
//!
//! [`Handler`] turns inbound frames into session table changes and session
//! notifications into outbound frames. It never touches the transport:
//! the event loop hands it frames and sends whatever it returns.
//!
//! Nothing here fails outward. Malformed frames, spawn failures, oversized
//! payloads and terminal write errors are logged and dropped; the table is
//! only ever changed by a successful `login` or by a teardown.

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::protocol::{self, Inbound, Outbound};
use crate::sessions::{SessionEvent, SessionHandle, SessionTable, Spawner, Tracked};

/// Owns the session table and applies the wire protocol to it.
pub struct Handler<S: Spawner> {
    device_id: String,
    spawner: S,
    sessions: SessionTable<S::Session>,
    events: mpsc::Sender<SessionEvent>,
    next_serial: u64,
    max_data_bytes: usize,
}

impl<S: Spawner> Handler<S> {
    /// `events` is handed to every spawned session; its receiver belongs to
    /// the event loop.
    pub fn new(
        device_id: String,
        spawner: S,
        events: mpsc::Sender<SessionEvent>,
        max_data_bytes: usize,
    ) -> Self {
        Self {
            device_id,
            spawner,
            sessions: SessionTable::new(),
            events,
            next_serial: 0,
            max_data_bytes,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn sessions(&self) -> &SessionTable<S::Session> {
        &self.sessions
    }

    /// Apply one inbound text frame. Inbound frames never produce a reply.
    pub async fn handle_frame(&mut self, text: &str) {
        let msg = match Inbound::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Dropping inbound frame: {e}");
                return;
            }
        };
        match msg {
            Inbound::Login { sid } => self.login(sid).await,
            Inbound::Logout { sid } => self.logout(&sid).await,
            Inbound::Data { sid, data } => self.write(&sid, &data),
            Inbound::Heartbeat => {}
        }
    }

    async fn login(&mut self, sid: String) {
        if self.sessions.contains(&sid) {
            warn!("Session {sid} already open, ignoring duplicate login");
            return;
        }
        self.next_serial += 1;
        let serial = self.next_serial;

        let handle = match self.spawner.spawn(&sid, serial, self.events.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                error!("Session {sid} could not be started: {e}");
                return;
            }
        };
        debug!("Session {sid} serial {serial} pid {}", handle.pid());
        if let Err(rejected) = self.sessions.insert(sid, Tracked { serial, handle }) {
            rejected.handle.terminate().await;
        }
    }

    async fn logout(&mut self, sid: &str) {
        match self.sessions.remove(sid) {
            Some(entry) => {
                info!("Session {sid} logout requested by server");
                entry.handle.terminate().await;
            }
            None => debug!("Logout for unknown session {sid}"),
        }
    }

    fn write(&mut self, sid: &str, payload: &str) {
        let Some(handle) = self.sessions.get_mut(sid) else {
            debug!("Data for unknown session {sid} dropped");
            return;
        };
        let bytes = match protocol::decode(payload, self.max_data_bytes) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Session {sid} data dropped: {e}");
                return;
            }
        };
        if bytes.is_empty() {
            return;
        }
        if let Err(e) = handle.write(bytes) {
            warn!("Session {sid} write failed: {e}");
        }
    }

    /// Apply a notification from a session task. Returns the frame to send,
    /// if any.
    pub async fn handle_session_event(&mut self, event: SessionEvent) -> Option<Outbound> {
        match event {
            SessionEvent::Output { sid, serial, data } => {
                if !self.sessions.is_current(&sid, serial) {
                    return None;
                }
                Some(Outbound::data(&self.device_id, &sid, &data))
            }
            SessionEvent::Exited { sid, serial, code } => {
                let entry = self.sessions.remove_current(&sid, serial)?;
                info!("Session {sid} ended on its own (exit code {code:?})");
                entry.handle.terminate().await;
                Some(Outbound::logout(&self.device_id, &sid))
            }
        }
    }

    /// The periodic liveness frame.
    pub fn keepalive(&self) -> Outbound {
        Outbound::ping(&self.device_id)
    }

    /// Tear down every session, returning a `logout` for each so the server
    /// learns they are gone.
    pub async fn shutdown(&mut self) -> Vec<Outbound> {
        let mut frames = Vec::with_capacity(self.sessions.len());
        for (sid, entry) in self.sessions.drain() {
            entry.handle.terminate().await;
            frames.push(Outbound::logout(&self.device_id, &sid));
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use crate::error::SessionError;

    const MAC: &str = "AA:BB";

    #[derive(Default)]
    struct Record {
        spawned: Vec<(String, u64)>,
        writes: Vec<(String, Vec<u8>)>,
        terminated: Vec<String>,
        fail_spawn: bool,
        fail_write: bool,
    }

    #[derive(Clone, Default)]
    struct FakeSpawner(Rc<RefCell<Record>>);

    struct FakeSession {
        sid: String,
        pid: u32,
        record: Rc<RefCell<Record>>,
    }

    impl Spawner for FakeSpawner {
        type Session = FakeSession;

        fn spawn(
            &self,
            sid: &str,
            serial: u64,
            _events: mpsc::Sender<SessionEvent>,
        ) -> Result<FakeSession, SessionError> {
            let mut record = self.0.borrow_mut();
            if record.fail_spawn {
                return Err(SessionError::Setup(std::io::Error::other("no pty")));
            }
            record.spawned.push((sid.to_string(), serial));
            Ok(FakeSession {
                sid: sid.to_string(),
                pid: 1000 + u32::try_from(serial).unwrap(),
                record: Rc::clone(&self.0),
            })
        }
    }

    impl SessionHandle for FakeSession {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn write(&mut self, data: Vec<u8>) -> Result<(), SessionError> {
            let mut record = self.record.borrow_mut();
            if record.fail_write {
                return Err(SessionError::InputClosed);
            }
            record.writes.push((self.sid.clone(), data));
            Ok(())
        }

        async fn terminate(self) {
            self.record.borrow_mut().terminated.push(self.sid);
        }
    }

    fn handler() -> (Handler<FakeSpawner>, FakeSpawner) {
        let spawner = FakeSpawner::default();
        let (tx, _rx) = mpsc::channel(crate::sessions::EVENT_QUEUE);
        let handler = Handler::new(MAC.to_string(), spawner.clone(), tx, 1024);
        (handler, spawner)
    }

    fn login(sid: &str) -> String {
        format!(r#"{{"type":"login","mac":"{MAC}","sid":"{sid}"}}"#)
    }

    fn logout(sid: &str) -> String {
        format!(r#"{{"type":"logout","mac":"{MAC}","sid":"{sid}"}}"#)
    }

    fn data(sid: &str, payload: &str) -> String {
        format!(r#"{{"type":"data","mac":"{MAC}","sid":"{sid}","data":"{payload}"}}"#)
    }

    #[tokio::test]
    async fn test_login_creates_one_session_per_sid() {
        let (mut h, spawner) = handler();
        for sid in ["S1", "S2", "S3"] {
            h.handle_frame(&login(sid)).await;
        }
        assert_eq!(h.sessions().sids(), vec!["S1", "S2", "S3"]);
        assert_eq!(spawner.0.borrow().spawned.len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_login_keeps_running_session() {
        let (mut h, spawner) = handler();
        h.handle_frame(&login("S1")).await;
        h.handle_frame(&login("S1")).await;

        assert_eq!(h.sessions().len(), 1);
        assert_eq!(spawner.0.borrow().spawned, vec![("S1".to_string(), 1)]);
        assert!(spawner.0.borrow().terminated.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_creates_nothing() {
        let (mut h, spawner) = handler();
        spawner.0.borrow_mut().fail_spawn = true;
        h.handle_frame(&login("S1")).await;
        assert!(h.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_data_is_decoded_and_written_in_order() {
        let (mut h, spawner) = handler();
        h.handle_frame(&login("S1")).await;
        h.handle_frame(&data("S1", "bHM=")).await;
        h.handle_frame(&data("S1", "IC1sYQo=")).await;

        let record = spawner.0.borrow();
        assert_eq!(
            record.writes,
            vec![
                ("S1".to_string(), b"ls".to_vec()),
                ("S1".to_string(), b" -la\n".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_data_for_unknown_session_is_dropped() {
        let (mut h, spawner) = handler();
        h.handle_frame(&login("S1")).await;
        h.handle_frame(&data("S2", "bHM=")).await;
        assert!(spawner.0.borrow().writes.is_empty());
    }

    #[tokio::test]
    async fn test_bad_payloads_are_dropped() {
        let (mut h, spawner) = handler();
        h.handle_frame(&login("S1")).await;
        h.handle_frame(&data("S1", "not base64!")).await;
        let oversized = protocol::encode(&[b'x'; 2048]);
        h.handle_frame(&data("S1", &oversized)).await;

        assert!(spawner.0.borrow().writes.is_empty());
        assert_eq!(h.sessions().sids(), vec!["S1"]);
    }

    #[tokio::test]
    async fn test_write_failure_keeps_session() {
        let (mut h, spawner) = handler();
        h.handle_frame(&login("S1")).await;
        spawner.0.borrow_mut().fail_write = true;
        h.handle_frame(&data("S1", "bHM=")).await;

        assert_eq!(h.sessions().sids(), vec!["S1"]);
        assert!(spawner.0.borrow().terminated.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_frames_change_nothing() {
        let (mut h, spawner) = handler();
        h.handle_frame(&login("S1")).await;
        for text in [
            "garbage",
            r#"{"mac":"AA:BB","sid":"S2"}"#,
            r#"{"type":"login","sid":"S2"}"#,
            r#"{"type":"login","mac":"AA:BB"}"#,
            r#"{"type":"logout","mac":"AA:BB"}"#,
            r#"{"type":"data","mac":"AA:BB","sid":"S1"}"#,
            r#"{"type":"reboot","mac":"AA:BB","sid":"S1"}"#,
            r#"{"type":"pong","mac":"AA:BB"}"#,
        ] {
            h.handle_frame(text).await;
        }
        let record = spawner.0.borrow();
        assert_eq!(record.spawned.len(), 1);
        assert!(record.writes.is_empty());
        assert!(record.terminated.is_empty());
        assert_eq!(h.sessions().sids(), vec!["S1"]);
    }

    #[tokio::test]
    async fn test_server_logout_tears_down_without_echo() {
        let (mut h, spawner) = handler();
        h.handle_frame(&login("S1")).await;
        h.handle_frame(&logout("S1")).await;

        assert!(h.sessions().is_empty());
        assert_eq!(spawner.0.borrow().terminated, vec!["S1"]);

        // The exit notification that follows a server logout is stale.
        let late = SessionEvent::Exited {
            sid: "S1".into(),
            serial: 1,
            code: Some(0),
        };
        assert_eq!(h.handle_session_event(late).await, None);
    }

    #[tokio::test]
    async fn test_logout_for_unknown_session_is_noop() {
        let (mut h, spawner) = handler();
        h.handle_frame(&login("S1")).await;
        h.handle_frame(&logout("S9")).await;
        h.handle_frame(&logout("S9")).await;

        assert_eq!(h.sessions().sids(), vec!["S1"]);
        assert!(spawner.0.borrow().terminated.is_empty());
    }

    #[tokio::test]
    async fn test_output_becomes_data_frame() {
        let (mut h, _spawner) = handler();
        h.handle_frame(&login("S1")).await;
        let frame = h
            .handle_session_event(SessionEvent::Output {
                sid: "S1".into(),
                serial: 1,
                data: b"hello\n".to_vec(),
            })
            .await
            .unwrap();
        assert_eq!(
            frame.to_json().unwrap(),
            r#"{"type":"data","mac":"AA:BB","sid":"S1","data":"aGVsbG8K"}"#
        );
    }

    #[tokio::test]
    async fn test_process_exit_sends_logout_once() {
        let (mut h, spawner) = handler();
        h.handle_frame(&login("S1")).await;
        let exited = SessionEvent::Exited {
            sid: "S1".into(),
            serial: 1,
            code: Some(0),
        };

        let frame = h.handle_session_event(exited.clone()).await.unwrap();
        assert_eq!(
            frame.to_json().unwrap(),
            r#"{"type":"logout","mac":"AA:BB","sid":"S1"}"#
        );
        assert!(h.sessions().is_empty());
        assert_eq!(spawner.0.borrow().terminated, vec!["S1"]);

        assert_eq!(h.handle_session_event(exited).await, None);
    }

    #[tokio::test]
    async fn test_stale_events_do_not_touch_reused_sid() {
        let (mut h, spawner) = handler();
        h.handle_frame(&login("S1")).await;
        h.handle_frame(&logout("S1")).await;
        h.handle_frame(&login("S1")).await;

        let stale_output = SessionEvent::Output {
            sid: "S1".into(),
            serial: 1,
            data: b"old".to_vec(),
        };
        let stale_exit = SessionEvent::Exited {
            sid: "S1".into(),
            serial: 1,
            code: None,
        };
        assert_eq!(h.handle_session_event(stale_output).await, None);
        assert_eq!(h.handle_session_event(stale_exit).await, None);
        assert_eq!(h.sessions().sids(), vec!["S1"]);
        assert_eq!(spawner.0.borrow().terminated, vec!["S1"]);
    }

    #[tokio::test]
    async fn test_shutdown_logs_out_every_session() {
        let (mut h, spawner) = handler();
        h.handle_frame(&login("S1")).await;
        h.handle_frame(&login("S2")).await;

        let mut frames: Vec<String> = h
            .shutdown()
            .await
            .iter()
            .map(|f| f.to_json().unwrap())
            .collect();
        frames.sort();
        assert_eq!(
            frames,
            vec![
                r#"{"type":"logout","mac":"AA:BB","sid":"S1"}"#,
                r#"{"type":"logout","mac":"AA:BB","sid":"S2"}"#,
            ]
        );
        assert!(h.sessions().is_empty());
        assert_eq!(spawner.0.borrow().terminated.len(), 2);
    }

    #[test]
    fn test_keepalive_frame() {
        let (h, _spawner) = handler();
        assert_eq!(
            h.keepalive().to_json().unwrap(),
            r#"{"type":"ping","mac":"AA:BB"}"#
        );
    }
}
