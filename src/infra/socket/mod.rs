//! Non-blocking socket manager.
//!
//! A [`SocketManager`] binds one listening socket and runs a configurable
//! number of selector loops over it, each on its own OS thread with a
//! current-thread tokio runtime. Every loop accepts connections itself and
//! drives only the connections it accepted, so connections are sharded by
//! accept thread and never migrate.
//!
//! Decoded requests go to a [`ConnectionHandler`]; [`EngineDispatch`] is
//! the handler that turns each request into a new engine process.

mod connection;
mod dispatch;
mod outbound;
pub mod tls;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::config::ListenerConfig;
use crate::core::KernelError;
use crate::infra::buffer_pool::BufferPool;
use crate::infra::protocol::CommunicationProtocol;

pub use connection::ConnectionState;
pub use dispatch::EngineDispatch;
pub use outbound::{ConnectionId, Inbound, Refused, ResponseWriter};
pub use tls::load_server_config;

/// Receives each decoded request together with the writer for its response.
pub trait ConnectionHandler<P: CommunicationProtocol>: Send + Sync + 'static {
    /// Handle one request. Runs on the selector thread; hand long work off.
    fn on_request(&self, request: P::Request, writer: ResponseWriter<P>);
}

impl<P, F> ConnectionHandler<P> for F
where
    P: CommunicationProtocol,
    F: Fn(P::Request, ResponseWriter<P>) + Send + Sync + 'static,
{
    fn on_request(&self, request: P::Request, writer: ResponseWriter<P>) {
        self(request, writer);
    }
}

/// Snapshot of listener activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketStats {
    /// Connections accepted.
    pub accepted: u64,
    /// Connections currently open.
    pub active: u64,
    /// Connections closed for any reason.
    pub closed: u64,
    /// Connections closed for inactivity.
    pub idle_evicted: u64,
    /// TLS handshakes that failed.
    pub handshake_failures: u64,
    /// Connections closed for undecodable input.
    pub protocol_errors: u64,
    /// Requests decoded.
    pub requests: u64,
    /// Bytes read from sockets.
    pub bytes_read: u64,
    /// Bytes written to sockets.
    pub bytes_written: u64,
}

#[derive(Debug, Default)]
pub(crate) struct SocketCounters {
    pub accepted: AtomicU64,
    pub active: AtomicU64,
    pub closed: AtomicU64,
    pub idle_evicted: AtomicU64,
    pub handshake_failures: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub requests: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl SocketCounters {
    fn snapshot(&self) -> SocketStats {
        SocketStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            idle_evicted: self.idle_evicted.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// State shared by all selector loops of one listener.
pub(crate) struct ListenerShared<P: CommunicationProtocol, H: ConnectionHandler<P>> {
    pub name: String,
    pub config: ListenerConfig,
    pub protocol: Arc<P>,
    pub handler: H,
    pub tls: Option<Arc<ServerConfig>>,
    pub buffers: BufferPool,
    pub counters: Arc<SocketCounters>,
    pub next_id: AtomicU64,
}

/// A bound listener and its selector loops.
pub struct SocketManager {
    name: String,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<SocketCounters>,
    buffers: BufferPool,
}

impl SocketManager {
    /// Bind `config.bind` and start `config.selector_loops` selector loops.
    ///
    /// # Errors
    ///
    /// - `KernelError::InvalidConfig` for invalid settings or PEM files
    /// - `KernelError::Tls` when the TLS context is rejected
    /// - `KernelError::Io` when binding or spawning a loop thread fails
    pub fn bind<P, H>(
        name: impl Into<String>,
        config: ListenerConfig,
        protocol: P,
        handler: H,
    ) -> Result<Self, KernelError>
    where
        P: CommunicationProtocol,
        H: ConnectionHandler<P>,
    {
        let name = name.into();
        config.validate().map_err(KernelError::InvalidConfig)?;
        let addr = config.bind_addr().map_err(KernelError::InvalidConfig)?;
        let tls = config.tls.as_ref().map(load_server_config).transpose()?;

        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let counters = Arc::new(SocketCounters::default());
        let buffers = BufferPool::new(config.read_buffer_size, crate::infra::buffer_pool::DEFAULT_MAX_PER_BUCKET);
        let loop_count = config.selector_loops;
        let tls_enabled = tls.is_some();
        let shared = Arc::new(ListenerShared {
            name: name.clone(),
            config,
            protocol: Arc::new(protocol),
            handler,
            tls,
            buffers: buffers.clone(),
            counters: Arc::clone(&counters),
            next_id: AtomicU64::new(1),
        });

        let (shutdown, stop_rx) = watch::channel(false);
        let manager = Self {
            name,
            local_addr,
            shutdown,
            loops: Mutex::new(Vec::with_capacity(loop_count)),
            counters,
            buffers,
        };
        for index in 0..loop_count {
            let spawned = listener.try_clone().and_then(|listener| {
                let shared = Arc::clone(&shared);
                let stop_rx = stop_rx.clone();
                thread::Builder::new()
                    .name(format!("{}-selector-{index}", manager.name))
                    .spawn(move || selector_loop(index, listener, &shared, stop_rx))
            });
            match spawned {
                Ok(handle) => manager.loops.lock().push(handle),
                Err(e) => {
                    manager.shutdown();
                    return Err(e.into());
                }
            }
        }

        info!(
            listener = %manager.name,
            addr = %local_addr,
            loops = loop_count,
            tls = tls_enabled,
            "listener bound"
        );
        Ok(manager)
    }

    /// Listener name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address actually bound (useful with port 0).
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connection statistics.
    #[must_use]
    pub fn stats(&self) -> SocketStats {
        self.counters.snapshot()
    }

    /// Read buffer pool used by this listener.
    #[must_use]
    pub const fn buffers(&self) -> &BufferPool {
        &self.buffers
    }

    /// Whether the selector loops are still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !*self.shutdown.borrow() && !self.loops.lock().is_empty()
    }

    /// Stop accepting, close every connection and join the loop threads.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let loops = std::mem::take(&mut *self.loops.lock());
        if loops.is_empty() {
            return;
        }
        let current = thread::current().id();
        for handle in loops {
            if handle.thread().id() == current {
                warn!(listener = %self.name, "shutdown called from a selector loop; not joining itself");
                continue;
            }
            if handle.join().is_err() {
                error!(listener = %self.name, "selector loop panicked");
            }
        }
        info!(listener = %self.name, stats = ?self.stats(), "listener stopped");
    }
}

impl Drop for SocketManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SocketManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketManager")
            .field("name", &self.name)
            .field("local_addr", &self.local_addr)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn selector_loop<P, H>(
    index: usize,
    listener: std::net::TcpListener,
    shared: &Arc<ListenerShared<P, H>>,
    stop_rx: watch::Receiver<bool>,
) where
    P: CommunicationProtocol,
    H: ConnectionHandler<P>,
{
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(listener = %shared.name, selector = index, error = %e, "selector runtime failed");
            return;
        }
    };
    let connections = tokio::task::LocalSet::new();
    connections.block_on(&runtime, accept_loop(index, listener, Arc::clone(shared), stop_rx));
    // Connections observe the same stop signal; wait for them to close.
    runtime.block_on(connections);
    debug!(listener = %shared.name, selector = index, "selector loop exited");
}

async fn accept_loop<P, H>(
    index: usize,
    listener: std::net::TcpListener,
    shared: Arc<ListenerShared<P, H>>,
    mut stop_rx: watch::Receiver<bool>,
) where
    P: CommunicationProtocol,
    H: ConnectionHandler<P>,
{
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!(listener = %shared.name, selector = index, error = %e, "listener registration failed");
            return;
        }
    };
    let connection_stop = stop_rx.clone();
    let mut housekeeping = tokio::time::interval(shared.config.housekeeping_interval());
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "set_nodelay failed");
                    }
                    tokio::task::spawn_local(connection::drive(
                        Arc::clone(&shared),
                        stream,
                        peer,
                        connection_stop.clone(),
                    ));
                }
                Err(e) => warn!(listener = %shared.name, error = %e, "accept failed"),
            },
            _ = housekeeping.tick() => {
                trace!(
                    listener = %shared.name,
                    selector = index,
                    active = shared.counters.active.load(Ordering::Relaxed),
                    "selector housekeeping"
                );
            }
            _ = stop_rx.wait_for(|stopped| *stopped) => break,
        }
    }
}
