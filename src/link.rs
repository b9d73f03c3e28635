// ABOUTME: Serial link transport - bridges blocking UART I/O onto the runtime
// ABOUTME: All frame writes funnel through one bounded queue and one writer thread

use crate::codec::Frame;
use bytes::Bytes;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{error, info, warn};

/// Capacity of the outbound frame queue. A full queue suspends submitters
/// until the UART drains; frames are never dropped.
const WRITE_QUEUE: usize = 32;

/// Size of the reader thread's chunk buffer.
const READ_CHUNK: usize = 4 * 1024;

/// Poll interval for the blocking serial read.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("could not open serial port: {0}")]
    Open(#[from] serialport::Error),

    #[error("link writer closed")]
    Closed,
}

/// Traffic counters for the link, reported when the tunnel closes.
#[derive(Debug, Default)]
pub struct LinkStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
}

impl LinkStats {
    pub fn note_frame_in(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    fn note_bytes_in(&self, n: usize) {
        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn note_frame_out(&self, bytes: usize) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn frames_out(&self) -> u64 {
        self.frames_out.load(Ordering::Relaxed)
    }
}

/// Cloneable handle submitting whole frames to the link.
///
/// The writer thread behind the queue is the sole UART writer and emits each
/// frame with a single write, so frames from concurrent sessions never
/// interleave mid-frame. Within one submitter, submission order equals
/// emission order.
#[derive(Clone)]
pub struct LinkWriter {
    tx: mpsc::Sender<Frame>,
}

impl LinkWriter {
    /// Submits one frame, suspending while the queue is full. Fails only
    /// once the link is dead, which submitters treat as shutdown-in-progress.
    pub async fn send(&self, frame: Frame) -> Result<(), LinkError> {
        self.tx.send(frame).await.map_err(|_| LinkError::Closed)
    }

    /// Resolves when the writer thread has terminated (UART write failure).
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// One side's handle on the serial channel: inbound byte chunks, the shared
/// frame writer and the traffic counters.
pub struct Link {
    pub writer: LinkWriter,
    pub incoming: mpsc::Receiver<io::Result<Bytes>>,
    pub stats: Arc<LinkStats>,
    done: oneshot::Receiver<io::Result<()>>,
}

impl Link {
    /// Opens the serial device and starts the reader and writer threads.
    pub fn open_serial(path: &str, baud: u32, hardware_flow: bool) -> Result<Link, LinkError> {
        let flow = if hardware_flow {
            serialport::FlowControl::Hardware
        } else {
            serialport::FlowControl::None
        };
        let port = serialport::new(path, baud)
            .flow_control(flow)
            .timeout(READ_TIMEOUT)
            .open()?;
        let reader = port.try_clone()?;
        Ok(Link::from_parts(reader, port))
    }

    /// Builds the same machinery over arbitrary byte pipes. Production code
    /// goes through [`Link::open_serial`]; tests wire two ends together with
    /// in-memory pipes.
    ///
    /// Blocking I/O stays on two dedicated threads; tokio channels form the
    /// seam to the async side.
    pub fn from_parts(
        mut reader: impl Read + Send + 'static,
        mut writer: impl Write + Send + 'static,
    ) -> Link {
        let stats = Arc::new(LinkStats::default());

        let (in_tx, incoming) = mpsc::channel::<io::Result<Bytes>>(WRITE_QUEUE);
        let reader_stats = stats.clone();
        thread::spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        // a reliable serial link never ends; EOF means the
                        // transport itself went away
                        let _ = in_tx.blocking_send(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "serial link closed",
                        )));
                        break;
                    }
                    Ok(n) => {
                        reader_stats.note_bytes_in(n);
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        if in_tx.blocking_send(Ok(chunk)).is_err() {
                            break;
                        }
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::TimedOut
                                | io::ErrorKind::WouldBlock
                                | io::ErrorKind::Interrupted
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        let _ = in_tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
        });

        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(WRITE_QUEUE);
        let (done_tx, done) = oneshot::channel();
        let writer_stats = stats.clone();
        thread::spawn(move || {
            let result = (|| -> io::Result<()> {
                while let Some(frame) = out_rx.blocking_recv() {
                    let encoded = frame.to_bytes();
                    writer.write_all(&encoded)?;
                    writer_stats.note_frame_out(encoded.len());
                }
                writer.flush()
            })();
            if let Err(e) = &result {
                error!("serial write failed: {e}");
            }
            // dropping out_rx here fails every pending and future send
            let _ = done_tx.send(result);
        });

        Link {
            writer: LinkWriter { tx: out_tx },
            incoming,
            stats,
            done,
        }
    }

    /// Closes the link: waits (bounded) for the writer thread to drain its
    /// queue and flush the UART. Returns `true` when the flush completed
    /// cleanly within the wait.
    ///
    /// Every [`LinkWriter`] clone must have been dropped for the drain to
    /// finish; a clone still held by a stuck session pump turns into a
    /// timeout here, which callers surface as a dirty exit.
    pub async fn finish(self, wait: Duration) -> bool {
        let Link {
            writer,
            incoming,
            stats,
            done,
        } = self;
        drop(writer);
        drop(incoming);

        let clean = match timeout(wait, done).await {
            Ok(Ok(Ok(()))) => true,
            Ok(Ok(Err(_))) => false,
            Ok(Err(_)) => false,
            Err(_) => {
                warn!("serial flush did not finish in {wait:?}");
                false
            }
        };

        info!(
            bytes_in = stats.bytes_in.load(Ordering::Relaxed),
            bytes_out = stats.bytes_out.load(Ordering::Relaxed),
            frames_in = stats.frames_in.load(Ordering::Relaxed),
            frames_out = stats.frames_out.load(Ordering::Relaxed),
            "serial link closed"
        );

        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Endpoint;
    use crate::framer::Framer;
    use crate::session::SessionId;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    /// Write half that appends into a shared buffer, standing in for the
    /// UART when only the outbound direction matters.
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn concurrent_submitters_never_interleave() {
        let sink = SharedSink::default();
        let wire = sink.0.clone();
        let link = Link::from_parts(io::empty(), sink);

        const SESSIONS: usize = 4;
        const FRAMES_EACH: u64 = 25;
        let target = Endpoint::new(Ipv4Addr::LOCALHOST, 7);

        let ids: Vec<SessionId> = (0..SESSIONS).map(|_| SessionId::fresh()).collect();
        let mut tasks = Vec::new();
        for id in &ids {
            let id = *id;
            let writer = link.writer.clone();
            tasks.push(tokio::spawn(async move {
                for seq in 0..FRAMES_EACH {
                    let frame = Frame::Data {
                        id,
                        target,
                        payload: Bytes::from(seq.to_be_bytes().to_vec()),
                    };
                    writer.send(frame).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let stats = link.stats.clone();
        assert!(link.finish(Duration::from_secs(1)).await);
        assert_eq!(stats.frames_out(), (SESSIONS as u64) * FRAMES_EACH);

        // every frame must decode whole and per-session submission order
        // must survive on the wire
        let wire = wire.lock().unwrap();
        let mut framer = Framer::new();
        framer.feed(&wire);
        let mut seen: HashMap<SessionId, u64> = HashMap::new();
        while let Some(frame) = framer.next_frame().unwrap() {
            match frame {
                Frame::Data { id, payload, .. } => {
                    let seq = u64::from_be_bytes(payload.as_ref().try_into().unwrap());
                    let next = seen.entry(id).or_insert(0);
                    assert_eq!(seq, *next, "session {id} out of order");
                    *next += 1;
                }
                other => panic!("unexpected frame on wire: {other}"),
            }
        }
        assert_eq!(framer.buffered(), 0);
        assert_eq!(seen.len(), SESSIONS);
        assert!(seen.values().all(|count| *count == FRAMES_EACH));
    }

    #[tokio::test]
    async fn send_fails_after_writer_error() {
        struct FailingSink;
        impl Write for FailingSink {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "uart gone"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let link = Link::from_parts(io::empty(), FailingSink);
        let id = SessionId::fresh();

        // the first send lands in the queue; once the writer thread dies,
        // sends start failing
        let _ = link.writer.send(Frame::Disconnect { id }).await;
        link.writer.closed().await;
        assert!(link.writer.send(Frame::Disconnect { id }).await.is_err());
        assert!(!link.finish(Duration::from_secs(1)).await);
    }
}
