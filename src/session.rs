// ABOUTME: Session identity, the live session table and the per-session pump
// ABOUTME: One entry per tunnelled TCP connection, keyed by a 128-bit random id

use crate::codec::{Endpoint, Frame};
use crate::link::LinkWriter;
use bytes::Bytes;
use core::fmt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// How many bytes a pump reads from its socket at a time. Reads may return
/// less; the resulting chunk maps one-to-one onto a Data frame.
pub(crate) const READ_CHUNK: usize = 8 * 1024;

/// Depth of the peer-to-socket payload queue. On the egress side this same
/// queue buffers payloads that arrive while the dial is still in flight. A
/// full queue suspends the frame dispatch loop, which is the intended
/// backpressure.
pub(crate) const SESSION_QUEUE: usize = 64;

/// Opaque 128-bit session identifier, unique for the lifetime of the tunnel
/// pair. Minted from the operating system's CSPRNG via a v4 UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Draws a fresh random id.
    pub fn fresh() -> SessionId {
        SessionId(Uuid::new_v4())
    }

    /// Reconstructs an id from its 16-byte wire form.
    pub fn from_bytes(bytes: [u8; 16]) -> SessionId {
        SessionId(Uuid::from_bytes(bytes))
    }

    /// The 16-byte wire form.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.0.simple())
    }
}

/// Lifecycle state of a session.
///
/// Sessions normally go straight from `Open` to `Closed`; `HalfClosed` is
/// internal bookkeeping used while shutdown drains a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Open = 0,
    HalfClosed = 1,
    Closed = 2,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} already present in table")]
    Duplicate(SessionId),

    #[error("session socket closed")]
    SocketClosed,
}

/// State and counters shared between a table entry and its pump, without
/// keeping the payload channel alive. The send-side frame counter exists for
/// tests only and is never transmitted.
#[derive(Debug, Default)]
pub struct SessionProgress {
    state: AtomicU8,
    frames_sent: AtomicU64,
}

impl SessionProgress {
    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::Relaxed) {
            0 => SessionState::Open,
            1 => SessionState::HalfClosed,
            _ => SessionState::Closed,
        }
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    fn note_frame_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }
}

/// One live tunnelled connection, as the table sees it.
///
/// The entry owns the sending half of the session's payload channel, so a
/// session's pump observes closure exactly when the table (and any transient
/// clone made by the dispatch loop) lets go of the entry. The pump itself
/// only holds the [`SessionProgress`] handle.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub id: SessionId,
    pub target: Endpoint,
    /// Listen port the client arrived on; ingress only.
    pub local_port: Option<u16>,
    progress: Arc<SessionProgress>,
    to_socket: mpsc::Sender<Bytes>,
}

impl SessionEntry {
    pub fn new(
        id: SessionId,
        target: Endpoint,
        local_port: Option<u16>,
        to_socket: mpsc::Sender<Bytes>,
    ) -> SessionEntry {
        SessionEntry {
            id,
            target,
            local_port,
            progress: Arc::new(SessionProgress::default()),
            to_socket,
        }
    }

    pub fn state(&self) -> SessionState {
        self.progress.state()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.progress.set_state(state);
    }

    /// The sender-free view of this session's state, safe to hold across the
    /// session's removal.
    pub fn progress(&self) -> Arc<SessionProgress> {
        self.progress.clone()
    }

    /// Queues a peer payload for delivery to the local socket, suspending
    /// the caller when the queue is full. Fails once the pump has gone away.
    pub async fn deliver(&self, payload: Bytes) -> Result<(), SessionError> {
        self.to_socket
            .send(payload)
            .await
            .map_err(|_| SessionError::SocketClosed)
    }
}

/// The per-side map of live sessions.
///
/// Insert and remove are atomic; a concurrent `get` sees either the pre- or
/// post-state. The per-port index is advisory (logging and scoped teardown)
/// and only eventually consistent with the primary map.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    by_port: Mutex<HashMap<u16, Vec<SessionId>>>,
}

impl SessionTable {
    pub fn new() -> SessionTable {
        SessionTable::default()
    }

    /// Registers a new session. Fails if the id is already present.
    pub fn insert(&self, entry: SessionEntry) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&entry.id) {
            return Err(SessionError::Duplicate(entry.id));
        }
        if let Some(port) = entry.local_port {
            self.by_port
                .lock()
                .unwrap()
                .entry(port)
                .or_default()
                .push(entry.id);
        }
        sessions.insert(entry.id, entry);
        Ok(())
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionEntry> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    /// Removes a session; idempotent. Returns the entry if it was still
    /// live, which is how callers decide whether a Disconnect is owed.
    pub fn remove(&self, id: &SessionId) -> Option<SessionEntry> {
        let removed = self.sessions.lock().unwrap().remove(id);
        if let Some(entry) = &removed {
            if let Some(port) = entry.local_port {
                if let Some(ids) = self.by_port.lock().unwrap().get_mut(&port) {
                    ids.retain(|other| other != id);
                }
            }
        }
        removed
    }

    /// Snapshot of the current entries, for shutdown. May run concurrently
    /// with mutation; the snapshot is whatever was live at the instant of
    /// the call.
    pub fn snapshot(&self) -> Vec<SessionEntry> {
        self.sessions.lock().unwrap().values().cloned().collect()
    }

    /// Drops every entry, closing each session's payload channel. Terminal;
    /// used only by shutdown.
    pub fn clear(&self) {
        self.sessions.lock().unwrap().clear();
        self.by_port.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advisory count of sessions accepted on a listen port.
    pub fn sessions_on_port(&self, port: u16) -> usize {
        self.by_port
            .lock()
            .unwrap()
            .get(&port)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

enum PumpEnd {
    /// Local socket saw EOF or an error; this side owes the Disconnect.
    LocalClosed,
    /// Payload channel closed: peer Disconnect or shutdown drain.
    PeerClosed,
    /// The link writer is gone; the tunnel is already coming down.
    LinkDead,
}

/// Moves bytes between one TCP socket and the link until either side ends.
///
/// Two directions run in one select loop: socket reads become Data frames
/// through the link writer, and payloads queued by the frame dispatch loop
/// are written to the socket in arrival order. Used identically by ingress
/// (after accept) and egress (after dial).
pub(crate) async fn run_pump(
    id: SessionId,
    target: Endpoint,
    progress: Arc<SessionProgress>,
    stream: TcpStream,
    mut to_socket: mpsc::Receiver<Bytes>,
    table: Arc<SessionTable>,
    writer: LinkWriter,
) {
    let (mut socket_rd, mut socket_wr) = stream.into_split();
    let mut read_buf = vec![0u8; READ_CHUNK];

    let end = loop {
        tokio::select! {
            read = socket_rd.read(&mut read_buf) => match read {
                Ok(0) => {
                    debug!(%id, "socket closed by local peer");
                    break PumpEnd::LocalClosed;
                }
                Ok(n) => {
                    progress.note_frame_sent();
                    let frame = Frame::Data {
                        id,
                        target,
                        payload: Bytes::copy_from_slice(&read_buf[..n]),
                    };
                    trace!(%id, bytes = n, "forwarding chunk to link");
                    if writer.send(frame).await.is_err() {
                        break PumpEnd::LinkDead;
                    }
                }
                Err(e) => {
                    warn!(%id, "socket read failed: {e}");
                    break PumpEnd::LocalClosed;
                }
            },
            payload = to_socket.recv() => match payload {
                Some(payload) => {
                    if let Err(e) = socket_wr.write_all(&payload).await {
                        warn!(%id, "socket write failed: {e}");
                        break PumpEnd::LocalClosed;
                    }
                }
                // recv only returns None once the queue is drained, so every
                // payload accepted before the Disconnect has been written
                None => break PumpEnd::PeerClosed,
            },
        }
    };

    match end {
        PumpEnd::LocalClosed => {
            // Whoever removes the live entry owes the single Disconnect; if
            // a peer Disconnect won the race the entry is already gone.
            if table.remove(&id).is_some() {
                let _ = writer.send(Frame::Disconnect { id }).await;
                debug!(%id, "session closed locally, disconnect sent");
            }
        }
        PumpEnd::PeerClosed => {
            let _ = socket_wr.shutdown().await;
            debug!(%id, "session closed by peer");
        }
        PumpEnd::LinkDead => {
            table.remove(&id);
        }
    }

    progress.set_state(SessionState::Closed);
}
