//! A listening endpoint that accepts connections and spawns
//! [`Session`]s.

use crate::session::{Session, SharedHandler};
use crate::shutdown::Shutdown;
use dashmap::DashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Supplies the handler for each accepted connection.
///
/// The session passed to `on_accept` is live but not yet reading; the
/// returned handler receives its `on_connect` before any line arrives.
#[async_trait::async_trait]
pub trait Acceptor: Send + Sync + 'static {
    async fn on_accept(&self, session: &Session) -> SharedHandler;
}

/// Returned when a listening endpoint cannot be established.
#[derive(Debug, thiserror::Error)]
pub enum ListenError {
    #[error("port {0} is already in use")]
    AddrInUse(u16),
    #[error("binding port {0} was not permitted")]
    PermissionDenied(u16),
    #[error("failed to bind port {port}")]
    Other {
        port: u16,
        #[source]
        source: io::Error,
    },
}

/// How [`Service::stop`] treats sessions that are still tearing down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Cancel the accept loop and request closure of every spawned
    /// session, without waiting.
    Now,
    /// Additionally wait until every spawned session has delivered its
    /// terminal notification.
    AfterLastSession,
}

struct ServiceInner {
    local_addr: SocketAddr,
    sessions: DashMap<u64, Session>,
    next_id: AtomicU64,
    shutdown: Shutdown,
}

/// One bound listening port. See [`Service::listen`].
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    /// Binds `port` (0 lets the OS pick; see
    /// [`local_addr`](Service::local_addr)) and starts an accept loop.
    /// Each accepted connection becomes a [`Session`] whose handler is
    /// supplied by `acceptor`. Accept errors are logged and the loop
    /// re-arms; only [`stop`](Service::stop) ends it.
    pub async fn listen(port: u16, acceptor: Arc<dyn Acceptor>) -> Result<Service, ListenError> {
        Service::listen_with_shutdown(port, acceptor, Shutdown::new()).await
    }

    /// Like [`listen`](Service::listen), but the accept loop waits on a
    /// caller-supplied [`Shutdown`], so an embedder running several
    /// endpoints (game server, admin console, metaserver link) can stop
    /// them all with one signal. [`stop`](Service::stop) signals the
    /// shared handle, ending every accept loop that waits on it.
    pub async fn listen_with_shutdown(
        port: u16,
        acceptor: Arc<dyn Acceptor>,
        shutdown: Shutdown,
    ) -> Result<Service, ListenError> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| match source.kind() {
                io::ErrorKind::AddrInUse => ListenError::AddrInUse(port),
                io::ErrorKind::PermissionDenied => ListenError::PermissionDenied(port),
                _ => ListenError::Other { port, source },
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ListenError::Other { port, source })?;
        let inner = Arc::new(ServiceInner {
            local_addr,
            sessions: DashMap::new(),
            next_id: AtomicU64::new(0),
            shutdown,
        });
        tracing::info!(%local_addr, "listening");
        tokio::spawn(accept_loop(listener, inner.clone(), acceptor));
        Ok(Service { inner })
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    /// Number of spawned sessions that have not begun closing.
    pub fn session_count(&self) -> usize {
        self.inner
            .sessions
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .count()
    }

    /// A [`Shutdown`] handle connected to this service's accept loop,
    /// for embedders coordinating several endpoints.
    pub fn shutdown(&self) -> Shutdown {
        self.inner.shutdown.clone()
    }

    /// Cancels the accept loop and closes every spawned session.
    pub async fn stop(&self, mode: StopMode) {
        self.inner.shutdown.shut_down();
        let sessions: Vec<Session> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for session in &sessions {
            session.close();
        }
        if mode == StopMode::AfterLastSession {
            for session in &sessions {
                session.closed().await;
            }
        }
        self.inner.sessions.clear();
    }
}

async fn accept_loop(listener: TcpListener, inner: Arc<ServiceInner>, acceptor: Arc<dyn Acceptor>) {
    loop {
        let result = tokio::select! {
            _ = inner.shutdown.wait_for_shutdown() => break,
            result = listener.accept() => result,
        };
        match result {
            Ok((stream, peer)) => {
                let session = match Session::new(stream) {
                    Ok(session) => session,
                    Err(error) => {
                        tracing::warn!(%peer, %error, "failed to set up accepted connection");
                        continue;
                    }
                };
                tracing::debug!(%peer, "accepted connection");
                // Sweep sessions that have since closed; the map only
                // needs to cover live ones for stop().
                inner.sessions.retain(|_, session| !session.is_closed());
                let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
                inner.sessions.insert(id, session.clone());
                let handler = acceptor.on_accept(&session).await;
                session.start(handler).await;
            }
            // One bad accept must not kill the listener.
            Err(error) => {
                tracing::warn!(%error, "accept failed, continuing to listen");
            }
        }
    }
    tracing::info!(local_addr = %inner.local_addr, "accept loop stopped");
}
