// ABOUTME: Egress session manager - dials targets on first sight of a session
// ABOUTME: Mirrors ingress but has no listeners; everything reacts to frames

use crate::codec::{Endpoint, Frame};
use crate::framer::Framer;
use crate::link::{Link, LinkWriter};
use crate::session::{
    self, SessionEntry, SessionId, SessionProgress, SessionState, SessionTable,
};
use crate::shutdown::{self, ShutdownReason};
use bytes::Bytes;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// The egress side: no listeners, sessions are born when the first Data
/// frame for an unseen id arrives and die with the target socket.
pub struct Egress {
    table: Arc<SessionTable>,
    tracker: TaskTracker,
    writer: LinkWriter,
}

/// Runs the egress side to completion, returning the process exit code.
pub async fn run(link: Link) -> i32 {
    Egress::new(link.writer.clone()).run(link).await
}

impl Egress {
    pub fn new(writer: LinkWriter) -> Egress {
        Egress {
            table: Arc::new(SessionTable::new()),
            tracker: TaskTracker::new(),
            writer,
        }
    }

    /// The live session table; shared with the pumps and the tests.
    pub fn table(&self) -> Arc<SessionTable> {
        self.table.clone()
    }

    /// Consumes peer frames until something ends the tunnel, then runs the
    /// shutdown sequence. Once the dispatch loop has stopped, no further
    /// unknown id can trigger a dial. Returns the process exit code.
    pub async fn run(self, mut link: Link) -> i32 {
        let reason = self.serve(&mut link).await;
        shutdown::run(reason, Vec::new(), self.table, self.tracker, link).await
    }

    async fn serve(&self, link: &mut Link) -> ShutdownReason {
        let mut framer = Framer::new();

        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        error!("could not listen for interrupt: {e}");
                    }
                    info!("interrupt received");
                    return ShutdownReason::Interrupt;
                }
                _ = link.writer.closed() => {
                    error!("serial writer terminated");
                    return ShutdownReason::LinkFailure;
                }
                chunk = link.incoming.recv() => match chunk {
                    Some(Ok(bytes)) => {
                        framer.feed(&bytes);
                        loop {
                            match framer.next_frame() {
                                Ok(Some(frame)) => {
                                    link.stats.note_frame_in();
                                    if let Some(reason) = self.handle_frame(frame).await {
                                        return reason;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    error!("framing error, link is corrupt: {e}");
                                    return ShutdownReason::LinkFailure;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        error!("serial read failed: {e}");
                        return ShutdownReason::LinkFailure;
                    }
                    None => {
                        error!("serial reader terminated");
                        return ShutdownReason::LinkFailure;
                    }
                },
            }
        }
    }

    async fn handle_frame(&self, frame: Frame) -> Option<ShutdownReason> {
        match frame {
            Frame::Data {
                id,
                target,
                payload,
            } => {
                if let Some(entry) = self.table.get(&id) {
                    // routing fields after the first frame are informational
                    if entry.deliver(payload).await.is_err() {
                        warn!(%id, "session socket already closed; dropping payload");
                    }
                } else {
                    self.open_session(id, target, payload).await;
                }
            }
            Frame::Disconnect { id } => match self.table.remove(&id) {
                Some(_) => debug!(%id, "peer disconnected session"),
                None => warn!(%id, "disconnect for unknown session; ignoring"),
            },
            Frame::ProgramClose { .. } => {
                info!("peer is shutting down");
                return Some(ShutdownReason::RemoteClose);
            }
            Frame::Unknown { cmd, id, data_len } => {
                warn!(cmd, %id, data_len, "unknown command; skipping frame");
            }
        }
        None
    }

    /// First Data frame for an unseen id: register the session and start the
    /// dial. Payloads arriving while the dial is in flight queue up in the
    /// session channel and flush, in order, once the target connects.
    async fn open_session(&self, id: SessionId, target: Endpoint, payload: Bytes) {
        debug!(%id, %target, "first data frame for new session; dialling");

        let (tx, rx) = mpsc::channel(session::SESSION_QUEUE);
        let entry = SessionEntry::new(id, target, None, tx);
        let progress = entry.progress();
        // cannot fail: the receiver is alive until the dial task takes over
        let _ = entry.deliver(payload).await;
        if let Err(e) = self.table.insert(entry) {
            warn!("could not register session: {e}");
            return;
        }

        self.tracker.spawn(dial_and_pump(
            id,
            target,
            progress,
            rx,
            self.table.clone(),
            self.writer.clone(),
        ));
    }
}

async fn dial_and_pump(
    id: SessionId,
    target: Endpoint,
    progress: Arc<SessionProgress>,
    rx: mpsc::Receiver<Bytes>,
    table: Arc<SessionTable>,
    writer: LinkWriter,
) {
    match TcpStream::connect((target.host, target.port)).await {
        Ok(stream) => {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("could not set TCP_NODELAY for {target}: {e}");
            }
            info!(%id, %target, "connected to target");
            session::run_pump(id, target, progress, stream, rx, table, writer).await;
        }
        Err(e) => {
            error!(%id, %target, "dial failed: {e}");
            // queued payloads go down with the dial
            drop(rx);
            if table.remove(&id).is_some() {
                let _ = writer.send(Frame::Disconnect { id }).await;
            }
            progress.set_state(SessionState::Closed);
        }
    }
}
