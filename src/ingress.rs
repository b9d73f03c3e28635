// ABOUTME: Ingress session manager - accepts TCP clients on the mapped ports
// ABOUTME: Mints session ids, pumps bytes to the link and dispatches peer frames

use crate::codec::Frame;
use crate::config::{MappingTable, PortMapping};
use crate::framer::Framer;
use crate::link::{Link, LinkWriter};
use crate::session::{self, SessionEntry, SessionId, SessionTable};
use crate::shutdown::{self, ShutdownReason};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// The ingress side: one listening socket per mapping entry, one session per
/// accepted client.
pub struct Ingress {
    table: Arc<SessionTable>,
    tracker: TaskTracker,
    listeners: Vec<JoinHandle<()>>,
    local_addrs: Vec<SocketAddr>,
}

/// Binds the listeners and runs the ingress side to completion, returning
/// the process exit code.
pub async fn run(link: Link, mappings: &MappingTable) -> i32 {
    let ingress = match Ingress::bind(mappings, link.writer.clone()).await {
        Ok(ingress) => ingress,
        Err(e) => {
            error!("could not bind listeners: {e}");
            return 1;
        }
    };
    ingress.run(link).await
}

impl Ingress {
    /// Binds one listener per mapping entry and starts accepting clients.
    /// Sessions begin pumping as soon as they are accepted, even before
    /// [`Ingress::run`] starts consuming peer frames.
    pub async fn bind(mappings: &MappingTable, writer: LinkWriter) -> crate::Result<Ingress> {
        let table = Arc::new(SessionTable::new());
        let tracker = TaskTracker::new();
        let mut listeners = Vec::new();
        let mut local_addrs = Vec::new();

        for mapping in mappings.entries() {
            let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, mapping.local_port)).await?;
            let addr = listener.local_addr()?;
            info!(
                port = mapping.local_port,
                target = %mapping.target(),
                description = %mapping.description,
                "listening"
            );
            local_addrs.push(addr);
            listeners.push(tokio::spawn(accept_loop(
                listener,
                mapping.clone(),
                table.clone(),
                tracker.clone(),
                writer.clone(),
            )));
        }

        Ok(Ingress {
            table,
            tracker,
            listeners,
            local_addrs,
        })
    }

    /// The live session table; shared with the pumps and the tests.
    pub fn table(&self) -> Arc<SessionTable> {
        self.table.clone()
    }

    /// Actual bound addresses, in mapping order. Differs from the mapping's
    /// ports only when a mapping asked for port 0.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Consumes peer frames until something ends the tunnel, then runs the
    /// shutdown sequence. Returns the process exit code.
    pub async fn run(self, mut link: Link) -> i32 {
        let reason = self.serve(&mut link).await;
        shutdown::run(reason, self.listeners, self.table, self.tracker, link).await
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
            Frame::Data { id, payload, .. } => match self.table.get(&id) {
                Some(entry) => {
                    if entry.deliver(payload).await.is_err() {
                        warn!(%id, "session socket already closed; dropping payload");
                    }
                }
                None => warn!(%id, "data frame for unknown session; dropping payload"),
            },
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
}

async fn accept_loop(
    listener: TcpListener,
    mapping: PortMapping,
    table: Arc<SessionTable>,
    tracker: TaskTracker,
    writer: LinkWriter,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("could not set TCP_NODELAY for {peer}: {e}");
                }

                let id = SessionId::fresh();
                let (tx, rx) = mpsc::channel(session::SESSION_QUEUE);
                let entry = SessionEntry::new(id, mapping.target(), Some(mapping.local_port), tx);
                let progress = entry.progress();
                if let Err(e) = table.insert(entry) {
                    warn!("dropping connection from {peer}: {e}");
                    continue;
                }

                info!(
                    %id,
                    %peer,
                    port = mapping.local_port,
                    live = table.sessions_on_port(mapping.local_port),
                    "accepted client"
                );
                tracker.spawn(session::run_pump(
                    id,
                    mapping.target(),
                    progress,
                    stream,
                    rx,
                    table.clone(),
                    writer.clone(),
                ));
            }
            Err(e) => {
                // transient accept errors (fd pressure) should not kill the
                // listener
                warn!(port = mapping.local_port, "accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
