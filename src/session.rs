//! One network connection with line framing and liveness tracking.
//!
//! A [`Session`] wraps a TCP stream and presents it to its owner as a
//! sequence of newline-delimited lines plus lifecycle notifications.
//! Reads and writes are carried out by two background tasks; the handle
//! itself is cheap to clone, but logical ownership stays with whichever
//! component created the session (its [`Service`](crate::Service), or
//! the caller of [`Session::connect`]). Handing a live session to a
//! different owner is an explicit [`attach`](Session::attach).
//!
//! The session answers the `hello`/`yes` liveness handshake internally,
//! so the protocol layer above it never sees probe traffic.

use crate::codec::{self, Value};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Capacity of the inbound line buffer. A line longer than this cannot
/// be framed and is a fatal protocol error.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Hard cap on lines held by an enabled write cache. Exceeding it
/// closes the connection instead of growing without bound.
pub const WRITE_CACHE_LIMIT: usize = 1000;

const PROBE: &str = "hello";
const PROBE_REPLY: &str = "yes";

/// A shared handle to a [`SessionHandler`].
pub type SharedHandler = Arc<dyn SessionHandler>;

/// Receives a session's lifecycle notifications and inbound lines.
///
/// Exactly one of `on_connect`/`on_connect_fail` is delivered per
/// connection attempt, followed by any number of `on_line` calls, and
/// finally exactly one `on_close`. Calls are delivered one at a time,
/// in order, from the session's reactor task.
#[async_trait::async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn on_connect(&self, session: &Session);
    async fn on_connect_fail(&self);
    async fn on_close(&self, session: &Session);
    async fn on_line(&self, session: &Session, line: &str);
}

/// Returned when an outbound connection attempt fails. No half-open
/// resource remains; the handler has already received `on_connect_fail`.
#[derive(Debug, thiserror::Error)]
#[error("failed to connect to {host}:{port}")]
pub struct ConnectError {
    pub host: String,
    pub port: u16,
    #[source]
    pub source: io::Error,
}

enum WriterOp {
    Line(String),
    /// Liveness traffic bypasses the cache; it belongs to the session
    /// layer, not the protocol above it.
    Probe(&'static str),
    EnableCache,
    FlushCache,
    Shutdown,
}

struct Inner {
    peer: SocketAddr,
    handler: RwLock<Option<SharedHandler>>,
    writer: mpsc::UnboundedSender<WriterOp>,
    read_half: Mutex<Option<OwnedReadHalf>>,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
    timed_out: AtomicBool,
    close_notified: AtomicBool,
    close_wake: Notify,
    closed_tx: watch::Sender<bool>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

/// One network connection. See the module documentation.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Opens an outbound connection and starts the session. The handler
    /// receives `on_connect` before any line is read. On failure the
    /// handler receives `on_connect_fail` and no resource remains.
    pub async fn connect(
        host: &str,
        port: u16,
        handler: SharedHandler,
    ) -> Result<Session, ConnectError> {
        let stream = match TcpStream::connect((host, port)).await {
            Ok(stream) => stream,
            Err(source) => {
                handler.on_connect_fail().await;
                return Err(ConnectError {
                    host: host.to_owned(),
                    port,
                    source,
                });
            }
        };
        let session = match Session::new(stream) {
            Ok(session) => session,
            Err(source) => {
                handler.on_connect_fail().await;
                return Err(ConnectError {
                    host: host.to_owned(),
                    port,
                    source,
                });
            }
        };
        session.start(handler).await;
        Ok(session)
    }

    /// Wraps an established stream. The session is inert until
    /// [`start`](Session::start) attaches a handler and begins reading.
    pub(crate) fn new(stream: TcpStream) -> io::Result<Session> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        let (writer, ops) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let session = Session {
            inner: Arc::new(Inner {
                peer,
                handler: RwLock::new(None),
                writer,
                read_half: Mutex::new(Some(read_half)),
                last_activity: Mutex::new(Instant::now()),
                closed: AtomicBool::new(false),
                timed_out: AtomicBool::new(false),
                close_notified: AtomicBool::new(false),
                close_wake: Notify::new(),
                closed_tx,
                keepalive: Mutex::new(None),
            }),
        };
        tokio::spawn(write_loop(session.clone(), write_half, ops));
        Ok(session)
    }

    /// Attaches the handler, delivers `on_connect`, and begins the read
    /// loop.
    pub(crate) async fn start(&self, handler: SharedHandler) {
        self.attach(handler);
        let handler = self.handler();
        handler.on_connect(self).await;
        let read_half = self
            .inner
            .read_half
            .lock()
            .unwrap()
            .take()
            .expect("session was started twice");
        tokio::spawn(read_loop(self.clone(), read_half));
    }

    /// Replaces the notification handler. This is the single-owner
    /// hand-off used to give a live connection to a different actor,
    /// for example on reconnect.
    pub fn attach(&self, handler: SharedHandler) {
        *self.inner.handler.write().unwrap() = Some(handler);
    }

    fn handler(&self) -> SharedHandler {
        self.inner
            .handler
            .read()
            .unwrap()
            .clone()
            .expect("session has no handler")
    }

    /// Queues a line for transmission. Lines are transmitted in the
    /// order queued; a transport error closes the session.
    pub fn send_line(&self, line: &str) {
        debug_assert!(!line.contains('\n'), "lines must not embed newlines");
        if self.is_closed() {
            return;
        }
        let _ = self.inner.writer.send(WriterOp::Line(line.to_owned()));
    }

    /// Encodes a command with [`codec::encode`] and queues it.
    pub fn send(&self, fmt: &str, args: &[Value]) {
        self.send_line(&codec::encode(fmt, args));
    }

    /// Enables or disables the outbound write cache. While enabled,
    /// queued lines are held back; disabling flushes them in FIFO
    /// order. Holding back more than [`WRITE_CACHE_LIMIT`] lines closes
    /// the session.
    pub fn set_cache(&self, enabled: bool) {
        let op = if enabled {
            WriterOp::EnableCache
        } else {
            WriterOp::FlushCache
        };
        let _ = self.inner.writer.send(op);
    }

    /// Schedules liveness probing. After `period` of inbound silence a
    /// probe is sent; after twice `period` the session is marked timed
    /// out and closed. A zero period cancels probing. Outbound traffic,
    /// including probes, does not count as activity.
    pub fn set_keepalive(&self, period: Duration) {
        let mut slot = self.inner.keepalive.lock().unwrap();
        if let Some(task) = slot.take() {
            task.abort();
        }
        if period.is_zero() {
            return;
        }
        let session = self.clone();
        *slot = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            tick.tick().await;
            loop {
                tick.tick().await;
                if session.is_closed() {
                    break;
                }
                let idle = session.inner.last_activity.lock().unwrap().elapsed();
                if idle >= period * 2 {
                    tracing::info!(peer = %session.inner.peer, "keepalive timed out, closing");
                    session.inner.timed_out.store(true, Ordering::SeqCst);
                    session.close();
                    break;
                }
                if idle >= period {
                    let _ = session.inner.writer.send(WriterOp::Probe(PROBE));
                }
            }
        }));
    }

    /// Begins shutdown. Safe to call from any context, including from
    /// inside a handler callback currently processing this session's
    /// input; the single `on_close` notification is delivered after
    /// that callback unwinds. Repeated calls are no-ops.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(peer = %self.inner.peer, "session closing");
        let _ = self.inner.writer.send(WriterOp::Shutdown);
        self.inner.close_wake.notify_one();
    }

    /// Whether shutdown has begun. The terminal notification may still
    /// be in flight.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Whether the session was closed by keepalive timeout.
    pub fn timed_out(&self) -> bool {
        self.inner.timed_out.load(Ordering::SeqCst)
    }

    /// Completes once the terminal `on_close` notification has been
    /// delivered.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Reads raw bytes, frames them into lines, and dispatches each line in
/// order. This task is the only deliverer of `on_line` and `on_close`,
/// which is what makes the terminal notification single and a `close`
/// issued mid-callback deferred rather than reentrant.
async fn read_loop(session: Session, mut read_half: OwnedReadHalf) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut fill = 0usize;
    'read: while !session.inner.closed.load(Ordering::SeqCst) {
        let n = tokio::select! {
            _ = session.inner.close_wake.notified() => break 'read,
            result = read_half.read(&mut buf[fill..]) => match result {
                Ok(0) => {
                    tracing::debug!(peer = %session.inner.peer, "peer closed the connection");
                    break 'read;
                }
                Ok(n) => n,
                Err(error) => {
                    tracing::debug!(peer = %session.inner.peer, %error, "read failed");
                    break 'read;
                }
            },
        };
        *session.inner.last_activity.lock().unwrap() = Instant::now();
        fill += n;

        let mut start = 0usize;
        while let Some(offset) = buf[start..fill].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let mut line = String::from_utf8_lossy(&buf[start..end]).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            start = end + 1;
            if line == PROBE {
                let _ = session.inner.writer.send(WriterOp::Probe(PROBE_REPLY));
                continue;
            }
            if line == PROBE_REPLY {
                continue;
            }
            let handler = session.handler();
            handler.on_line(&session, &line).await;
            if session.inner.closed.load(Ordering::SeqCst) {
                // Closed from inside the callback; drop the rest of the
                // batch and notify below.
                break 'read;
            }
        }
        if start > 0 {
            buf.copy_within(start..fill, 0);
            fill -= start;
        }
        if fill == buf.len() {
            tracing::error!(
                peer = %session.inner.peer,
                capacity = READ_BUFFER_SIZE,
                "line exceeds the read buffer, closing"
            );
            break 'read;
        }
    }

    session.inner.closed.store(true, Ordering::SeqCst);
    let _ = session.inner.writer.send(WriterOp::Shutdown);
    if let Some(task) = session.inner.keepalive.lock().unwrap().take() {
        task.abort();
    }
    if !session.inner.close_notified.swap(true, Ordering::SeqCst) {
        let handler = session.handler();
        handler.on_close(&session).await;
        session.inner.closed_tx.send_replace(true);
    }
}

/// Transmits queued lines in order, holding them back while the cache
/// is enabled. Any transport error funnels into the close path.
async fn write_loop(
    session: Session,
    mut write_half: OwnedWriteHalf,
    mut ops: mpsc::UnboundedReceiver<WriterOp>,
) {
    let mut cache: Option<Vec<String>> = None;
    while let Some(op) = ops.recv().await {
        match op {
            WriterOp::Shutdown => break,
            WriterOp::EnableCache => {
                if cache.is_none() {
                    cache = Some(Vec::new());
                }
            }
            WriterOp::FlushCache => {
                if let Some(pending) = cache.take() {
                    for line in pending {
                        if write_line(&mut write_half, &line).await.is_err() {
                            session.close();
                            return;
                        }
                    }
                }
            }
            WriterOp::Probe(line) => {
                if write_line(&mut write_half, line).await.is_err() {
                    session.close();
                    return;
                }
            }
            WriterOp::Line(line) => {
                if let Some(pending) = cache.as_mut() {
                    pending.push(line);
                    if pending.len() > WRITE_CACHE_LIMIT {
                        tracing::error!(
                            peer = %session.inner.peer,
                            limit = WRITE_CACHE_LIMIT,
                            "write cache overflow, closing"
                        );
                        session.close();
                        return;
                    }
                } else if let Err(error) = write_line(&mut write_half, &line).await {
                    tracing::debug!(peer = %session.inner.peer, %error, "write failed, closing");
                    session.close();
                    return;
                }
            }
        }
    }
    let _ = write_half.shutdown().await;
}

async fn write_line(half: &mut OwnedWriteHalf, line: &str) -> io::Result<()> {
    half.write_all(line.as_bytes()).await?;
    half.write_all(b"\n").await
}
