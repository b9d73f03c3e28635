//! Orderly teardown of one tunnel side.
//!
//! Both sides run the same sequence whether the shutdown started here
//! (signal, fatal link error) or at the peer (received ProgramClose): stop
//! accepting work, disconnect every live session, drain the sockets and the
//! serial queue under bounded waits, then exit.

use crate::codec::Frame;
use crate::link::Link;
use crate::session::{SessionId, SessionState, SessionTable};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Bound on each of the two drain waits: session sockets, then the serial
/// flush. A wait that expires turns the exit dirty.
pub const SHUTDOWN_WAIT: Duration = Duration::from_secs(3);

/// Why this side is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Local interrupt (SIGINT).
    Interrupt,
    /// The peer announced its own termination with ProgramClose.
    RemoteClose,
    /// The link is unusable: read or write failure, or a corrupt frame
    /// header. Always exits non-zero.
    LinkFailure,
}

impl ShutdownReason {
    /// Locally initiated shutdowns announce themselves to the peer with one
    /// ProgramClose before any Disconnect.
    fn locally_initiated(&self) -> bool {
        !matches!(self, ShutdownReason::RemoteClose)
    }

    fn clean_exit(&self) -> bool {
        !matches!(self, ShutdownReason::LinkFailure)
    }
}

/// Runs the teardown sequence and returns the process exit code: 0 for a
/// clean shutdown, 1 when the shutdown was caused by a link failure or any
/// bounded wait expired.
pub async fn run(
    reason: ShutdownReason,
    listeners: Vec<JoinHandle<()>>,
    table: Arc<SessionTable>,
    tracker: TaskTracker,
    link: Link,
) -> i32 {
    info!(?reason, sessions = table.len(), "shutting down");

    // step 1: no new work
    for listener in &listeners {
        listener.abort();
    }

    let writer = link.writer.clone();
    if reason.locally_initiated() {
        // announced before any Disconnect so the peer tears down concurrently
        let close = Frame::ProgramClose {
            id: SessionId::fresh(),
        };
        if writer.send(close).await.is_err() {
            warn!("could not announce shutdown; link already down");
        }
    }

    // step 2: one Disconnect per live session, arbitrated through remove()
    // so a session racing into its own local close cannot double-emit
    for entry in table.snapshot() {
        entry.set_state(SessionState::HalfClosed);
        if table.remove(&entry.id).is_some()
            && writer.send(Frame::Disconnect { id: entry.id }).await.is_err()
        {
            break;
        }
    }

    // step 3: dropping the entries closes each pump's payload channel; the
    // pumps flush and close their sockets on the way out
    table.clear();
    drop(writer);

    let mut clean = reason.clean_exit();
    tracker.close();
    if timeout(SHUTDOWN_WAIT, tracker.wait()).await.is_err() {
        warn!("session sockets did not drain in {SHUTDOWN_WAIT:?}");
        clean = false;
    }

    // step 4: drain the serial queue and flush the UART
    if !link.finish(SHUTDOWN_WAIT).await {
        clean = false;
    }

    if clean { 0 } else { 1 }
}
