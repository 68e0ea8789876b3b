/// In-flight handshake state shared between the client-side proxy and the
/// OOB peer: buffered client flights, queued target responses, the target
/// socket's write half, and the set-once completion flag.
///
/// Locking: the registry map takes a coarse mutex; each session takes its
/// own short-lived mutex for mutable fields. Neither lock is held across an
/// await — the target write half sits behind a tokio mutex of its own.
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

/// Sessions idle longer than this are swept.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Grace between handshake completion and removal, so in-flight
/// `get_response` callers observe the final state.
pub const REMOVAL_GRACE: Duration = Duration::from_millis(500);

// ── Session ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct SessionInner {
    sni: String,
    target_ip: Option<String>,
    target_port: u16,
    client_messages: Vec<Vec<u8>>,
    responses: VecDeque<Vec<u8>>,
    handshake_complete: bool,
    session_ticket: Option<Vec<u8>>,
    tls_version: Option<u16>,
    last_activity: Instant,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    inner: Mutex<SessionInner>,
    target_writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    shutdown: Notify,
}

impl Session {
    fn new(id: &str, sni: &str) -> Self {
        Session {
            id: id.to_string(),
            inner: Mutex::new(SessionInner {
                sni: sni.to_string(),
                target_ip: None,
                target_port: 443,
                client_messages: Vec::new(),
                responses: VecDeque::new(),
                handshake_complete: false,
                session_ticket: None,
                tls_version: None,
                last_activity: Instant::now(),
            }),
            target_writer: tokio::sync::Mutex::new(None),
            shutdown: Notify::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sni(&self) -> String {
        self.inner.lock().unwrap().sni.clone()
    }

    pub fn set_sni(&self, sni: &str) {
        self.inner.lock().unwrap().sni = sni.to_string();
    }

    pub fn set_target_addr(&self, ip: &str, port: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner.target_ip = Some(ip.to_string());
        inner.target_port = port;
    }

    pub fn target_addr(&self) -> Option<(String, u16)> {
        let inner = self.inner.lock().unwrap();
        inner.target_ip.as_ref().map(|ip| (ip.clone(), inner.target_port))
    }

    /// Append a client-side flight. The first message stored is treated as
    /// the ClientHello.
    pub fn store_client_message(&self, data: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.client_messages.push(data);
        inner.last_activity = Instant::now();
    }

    pub fn first_client_message(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().client_messages.first().cloned()
    }

    /// Append a response read from the target.
    pub fn push_response(&self, data: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.responses.push_back(data);
        inner.last_activity = Instant::now();
    }

    /// Dequeue the oldest buffered response. Responses come out in arrival
    /// order and are never delivered twice.
    pub fn get_response(&self) -> (Option<Vec<u8>>, bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_activity = Instant::now();
        let data = inner.responses.pop_front();
        (data, inner.handshake_complete)
    }

    /// Look at a buffered response without consuming it.
    pub fn peek_response(&self, index: usize) -> (Option<Vec<u8>>, bool) {
        let inner = self.inner.lock().unwrap();
        (inner.responses.get(index).cloned(), inner.handshake_complete)
    }

    /// Flip the completion flag. Monotonic: returns true only on the
    /// first transition.
    pub fn mark_handshake_complete(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.last_activity = Instant::now();
        if inner.handshake_complete {
            return false;
        }
        inner.handshake_complete = true;
        true
    }

    pub fn handshake_complete(&self) -> bool {
        self.inner.lock().unwrap().handshake_complete
    }

    pub fn set_session_ticket(&self, data: Vec<u8>) {
        self.inner.lock().unwrap().session_ticket = Some(data);
    }

    pub fn session_ticket(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().session_ticket.clone()
    }

    pub fn set_tls_version(&self, version: u16) {
        self.inner.lock().unwrap().tls_version = Some(version);
    }

    pub fn tls_version(&self) -> Option<u16> {
        self.inner.lock().unwrap().tls_version
    }

    pub fn touch(&self) {
        self.inner.lock().unwrap().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.lock().unwrap().last_activity.elapsed()
    }

    /// Park the write half of the target socket. Set at most once per
    /// session; dropped (and therefore closed) exactly once, at removal.
    pub async fn set_target_writer(&self, writer: OwnedWriteHalf) {
        let mut guard = self.target_writer.lock().await;
        debug_assert!(guard.is_none(), "target socket set twice");
        *guard = Some(writer);
    }

    /// Write client bytes through to the target, if a target is attached.
    /// Sessions without a brokered connection just buffer.
    pub async fn write_to_target(&self, data: &[u8]) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        let mut guard = self.target_writer.lock().await;
        match guard.as_mut() {
            Some(writer) => writer.write_all(data).await,
            None => Ok(()),
        }
    }

    /// Resolves once the session is removed. Used by the response pump to
    /// stop reading from the target.
    pub async fn closed(&self) {
        self.shutdown.notified().await
    }
}

// ── Registry ─────────────────────────────────────────────────────────

/// Map of session id → session, shared between the OOB surface and the
/// connection handlers.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    idle_timeout: Duration,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        SessionRegistry {
            sessions: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Insert a fresh session. Duplicate ids are rejected.
    pub fn create(&self, id: &str, initial_sni: &str) -> io::Result<Arc<Session>> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(id) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("session {} already exists", id),
            ));
        }
        let session = Arc::new(Session::new(id, initial_sni));
        sessions.insert(id.to_string(), session.clone());
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop a session: stop its response pump and close the target write
    /// half. Returns false when the id was not present.
    pub async fn remove(&self, id: &str) -> bool {
        let session = self.sessions.lock().unwrap().remove(id);
        match session {
            Some(session) => {
                // notify_one stores a permit, so a pump that is mid-read
                // still observes the shutdown on its next select.
                session.shutdown.notify_one();
                *session.target_writer.lock().await = None;
                tracing::debug!("Removed session {}", id);
                true
            }
            None => false,
        }
    }

    /// Spawn the idle sweeper: every `interval`, sessions whose last
    /// activity exceeds the registry's idle timeout are removed and their
    /// target sockets closed.
    pub fn start_cleanup(self: &Arc<Self>, interval: Duration) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let stale: Vec<String> = {
                    let sessions = registry.sessions.lock().unwrap();
                    sessions
                        .iter()
                        .filter(|(_, s)| s.idle_for() > registry.idle_timeout)
                        .map(|(id, _)| id.clone())
                        .collect()
                };
                for id in stale {
                    tracing::info!("Sweeping idle session {}", id);
                    registry.remove(&id).await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn duplicate_create_rejected() {
        let registry = SessionRegistry::default();
        registry.create("s1", "example.com").unwrap();
        let err = registry.create("s1", "example.com").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn responses_come_out_in_store_order_once() {
        let registry = SessionRegistry::default();
        let session = registry.create("s1", "example.com").unwrap();

        session.push_response(vec![1]);
        session.push_response(vec![2, 2]);
        session.push_response(vec![3, 3, 3]);

        assert_eq!(session.get_response().0, Some(vec![1]));
        assert_eq!(session.get_response().0, Some(vec![2, 2]));
        assert_eq!(session.get_response().0, Some(vec![3, 3, 3]));
        assert_eq!(session.get_response().0, None);
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let registry = SessionRegistry::default();
        let session = registry.create("s1", "example.com").unwrap();
        session.push_response(vec![9]);

        assert_eq!(session.peek_response(0).0, Some(vec![9]));
        assert_eq!(session.peek_response(1).0, None);
        assert_eq!(session.get_response().0, Some(vec![9]));
    }

    #[tokio::test]
    async fn handshake_flag_transitions_once() {
        let registry = SessionRegistry::default();
        let session = registry.create("s1", "example.com").unwrap();

        assert!(!session.handshake_complete());
        assert!(session.mark_handshake_complete());
        assert!(!session.mark_handshake_complete());
        assert!(session.handshake_complete());

        let (_, complete) = session.get_response();
        assert!(complete);
    }

    #[tokio::test]
    async fn first_client_message_is_the_client_hello() {
        let registry = SessionRegistry::default();
        let session = registry.create("s1", "").unwrap();
        session.store_client_message(vec![0x16, 0x03, 0x01]);
        session.store_client_message(vec![0x17]);
        assert_eq!(session.first_client_message(), Some(vec![0x16, 0x03, 0x01]));
    }

    #[tokio::test]
    async fn remove_closes_target_socket() {
        let registry = SessionRegistry::default();
        let session = registry.create("s1", "example.com").unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (conn, (mut peer, _)) =
            tokio::join!(TcpStream::connect(addr), async { listener.accept().await.unwrap() });
        let (_read_half, write_half) = conn.unwrap().into_split();
        session.set_target_writer(write_half).await;

        assert!(registry.remove("s1").await);
        assert!(!registry.remove("s1").await);

        // Write half dropped at removal — the peer observes EOF.
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(5), peer.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sweeper_removes_stale_sessions() {
        let registry = Arc::new(SessionRegistry::default());
        registry.create("stale", "example.com").unwrap();
        registry.start_cleanup(Duration::from_secs(60));

        // Six simulated minutes beats the five-minute idle threshold.
        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(registry.get("stale").is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_keeps_active_sessions() {
        let registry = Arc::new(SessionRegistry::default());
        let session = registry.create("busy", "example.com").unwrap();
        registry.start_cleanup(Duration::from_secs(60));

        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(60)).await;
            session.touch();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.get("busy").is_some());
    }
}
