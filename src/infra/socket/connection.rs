//! Per-connection driver running inside a selector loop.
//!
//! States: `Accepting -> [Handshaking ->] Established -> Closing -> Closed`.
//! Reading and writing alternate within `Established` as readiness allows.
//! The driver never blocks: every wait is a readiness wait bounded by the
//! housekeeping interval, after which idle eviction is checked.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Buf, Bytes, BytesMut};
use rustls::ServerConnection;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::core::KernelError;
use crate::infra::protocol::{CommunicationProtocol, ProtocolDecoder};
use crate::infra::socket::outbound::{Outbound, ResponseWriter};
use crate::infra::socket::tls::NonBlocking;
use crate::infra::socket::{ConnectionHandler, ListenerShared};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted, not yet set up.
    Accepting,
    /// TLS handshake in progress.
    Handshaking,
    /// Application data may flow.
    Established,
    /// Flushing and releasing resources.
    Closing,
    /// Socket released.
    Closed,
}

/// Reads taken per readiness event before the input is decoded. Unread
/// bytes keep the socket readable, so the next loop turn continues.
const MAX_READS_PER_PASS: usize = 16;

#[derive(Debug)]
enum CloseReason {
    PeerClosed,
    Idle,
    Shutdown,
    Io(io::Error),
    Tls(rustls::Error),
    Protocol(KernelError),
}

struct Connection<P: CommunicationProtocol, H: ConnectionHandler<P>> {
    id: u64,
    peer: SocketAddr,
    stream: TcpStream,
    tls: Option<Box<ServerConnection>>,
    state: ConnectionState,
    decoder: P::Decoder,
    input: BytesMut,
    writing: VecDeque<Bytes>,
    outbound: Arc<Outbound>,
    read_closed: bool,
    last_activity: Instant,
    shared: Arc<ListenerShared<P, H>>,
}

/// Run one accepted connection to completion.
pub(crate) async fn drive<P, H>(
    shared: Arc<ListenerShared<P, H>>,
    stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) where
    P: CommunicationProtocol,
    H: ConnectionHandler<P>,
{
    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    shared.counters.accepted.fetch_add(1, Ordering::Relaxed);
    shared.counters.active.fetch_add(1, Ordering::Relaxed);

    let tls = match &shared.tls {
        Some(config) => match ServerConnection::new(Arc::clone(config)) {
            Ok(session) => Some(Box::new(session)),
            Err(e) => {
                warn!(connection = id, error = %e, "tls session setup failed");
                shared.counters.active.fetch_sub(1, Ordering::Relaxed);
                shared.counters.closed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        },
        None => None,
    };
    let state = if tls.is_some() {
        ConnectionState::Handshaking
    } else {
        ConnectionState::Established
    };
    debug!(connection = id, peer = %peer, state = ?state, "connection accepted");

    let mut connection = Connection {
        id,
        peer,
        stream,
        tls,
        state,
        decoder: shared.protocol.new_decoder(),
        input: BytesMut::new(),
        writing: VecDeque::new(),
        outbound: Outbound::new(id, shared.config.backpressure_threshold),
        read_closed: false,
        last_activity: Instant::now(),
        shared,
    };
    let reason = connection.run(&mut shutdown).await;
    connection.close(reason);
}

impl<P, H> Connection<P, H>
where
    P: CommunicationProtocol,
    H: ConnectionHandler<P>,
{
    async fn run(&mut self, shutdown: &mut watch::Receiver<bool>) -> CloseReason {
        let idle_timeout = self.shared.config.idle_timeout();
        let housekeeping = self.shared.config.housekeeping_interval();
        loop {
            if let Err(reason) = self.flush() {
                return reason;
            }
            if self.read_closed && self.finished_writing() {
                return CloseReason::PeerClosed;
            }

            let interest = self.interest();
            let wait = idle_timeout
                .saturating_sub(self.last_activity.elapsed())
                .min(housekeeping);
            let stream = &self.stream;
            let readiness = async move {
                match interest {
                    Some(interest) => stream.ready(interest).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                ready = readiness => {
                    let ready = match ready {
                        Ok(ready) => ready,
                        Err(e) => return CloseReason::Io(e),
                    };
                    if ready.is_readable() || ready.is_read_closed() {
                        let read = if self.tls.is_some() { self.read_tls() } else { self.read_plain() };
                        if let Err(reason) = read.and_then(|()| self.decode()) {
                            return reason;
                        }
                    }
                }
                () = self.outbound.notify.notified() => {}
                () = tokio::time::sleep(wait) => {
                    if self.last_activity.elapsed() >= idle_timeout {
                        return CloseReason::Idle;
                    }
                }
                _ = shutdown.wait_for(|stopped| *stopped) => return CloseReason::Shutdown,
            }
        }
    }

    /// Readiness to wait for; `None` when only a queued response can
    /// make progress.
    fn interest(&self) -> Option<Interest> {
        let wants_write = match &self.tls {
            Some(tls) => tls.wants_write() || (!tls.is_handshaking() && !self.writing.is_empty()),
            None => !self.writing.is_empty(),
        };
        match (self.read_closed, wants_write) {
            (false, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (false, false) => Some(Interest::READABLE),
            (true, true) => Some(Interest::WRITABLE),
            (true, false) => None,
        }
    }

    fn finished_writing(&self) -> bool {
        self.writing.is_empty()
            && self.outbound.all_responded()
            && self.tls.as_ref().is_none_or(|tls| !tls.wants_write())
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn read_plain(&mut self) -> Result<(), CloseReason> {
        let size = self.shared.config.read_buffer_size;
        for _ in 0..MAX_READS_PER_PASS {
            let mut buf = self.shared.buffers.acquire(size);
            buf.resize(size, 0);
            match self.stream.try_read(&mut buf[..]) {
                Ok(0) => {
                    self.read_closed = true;
                    return Ok(());
                }
                Ok(n) => {
                    self.input.extend_from_slice(&buf[..n]);
                    self.shared.counters.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                    self.touch();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(CloseReason::Io(e)),
            }
        }
        Ok(())
    }

    fn read_tls(&mut self) -> Result<(), CloseReason> {
        let Some(tls) = self.tls.as_mut() else {
            return Ok(());
        };
        for _ in 0..MAX_READS_PER_PASS {
            match tls.read_tls(&mut NonBlocking(&self.stream)) {
                Ok(0) => {
                    self.read_closed = true;
                    break;
                }
                Ok(n) => {
                    self.shared.counters.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                    self.last_activity = Instant::now();
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(CloseReason::Io(e)),
            }

            let io_state = tls.process_new_packets().map_err(CloseReason::Tls)?;
            let available = io_state.plaintext_bytes_to_read();
            if available > 0 {
                let mut buf = self.shared.buffers.acquire(available);
                buf.resize(available, 0);
                tls.reader().read_exact(&mut buf).map_err(CloseReason::Io)?;
                self.input.extend_from_slice(&buf);
            }
            if io_state.peer_has_closed() {
                self.read_closed = true;
                break;
            }
        }

        if self.state == ConnectionState::Handshaking && !tls.is_handshaking() {
            self.state = ConnectionState::Established;
            debug!(connection = self.id, "tls handshake complete");
        }
        Ok(())
    }

    /// Hand every complete request to the handler.
    fn decode(&mut self) -> Result<(), CloseReason> {
        loop {
            match self.decoder.decode(&mut self.input) {
                Ok(Some(request)) => {
                    let writer = ResponseWriter::new(
                        Arc::clone(&self.outbound),
                        Arc::clone(&self.shared.protocol),
                        self.shared.config.write_buffer_size,
                    );
                    self.shared.counters.requests.fetch_add(1, Ordering::Relaxed);
                    debug!(connection = self.id, "request decoded");
                    self.shared.handler.on_request(request, writer);
                }
                Ok(None) => return Ok(()),
                Err(e) => return Err(CloseReason::Protocol(e)),
            }
        }
    }

    /// Write queued responses until the socket would block.
    fn flush(&mut self) -> Result<(), CloseReason> {
        self.writing.extend(self.outbound.take_ready());
        match self.tls.as_mut() {
            None => {
                while let Some(front) = self.writing.front_mut() {
                    match self.stream.try_write(&front[..]) {
                        Ok(0) => break,
                        Ok(n) => {
                            front.advance(n);
                            if front.is_empty() {
                                self.writing.pop_front();
                            }
                            self.outbound.wrote(n);
                            self.shared.counters.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
                            self.last_activity = Instant::now();
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(CloseReason::Io(e)),
                    }
                }
            }
            Some(tls) => {
                if !tls.is_handshaking() {
                    while let Some(front) = self.writing.front_mut() {
                        let n = tls.writer().write(&front[..]).map_err(CloseReason::Io)?;
                        if n == 0 {
                            break;
                        }
                        front.advance(n);
                        if front.is_empty() {
                            self.writing.pop_front();
                        }
                        self.outbound.wrote(n);
                    }
                }
                while tls.wants_write() {
                    match tls.write_tls(&mut NonBlocking(&self.stream)) {
                        Ok(n) => {
                            self.shared.counters.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
                            self.last_activity = Instant::now();
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(CloseReason::Io(e)),
                    }
                }
            }
        }
        Ok(())
    }

    fn close(mut self, reason: CloseReason) {
        let handshaking = self.state == ConnectionState::Handshaking;
        self.state = ConnectionState::Closing;
        let unsent = self.outbound.queued_bytes();
        self.outbound.close();

        if let Some(tls) = self.tls.as_mut() {
            if !matches!(reason, CloseReason::Tls(_) | CloseReason::Io(_)) {
                tls.send_close_notify();
            }
            // Best effort: flush a pending alert or close_notify.
            while tls.wants_write() {
                if tls.write_tls(&mut NonBlocking(&self.stream)).is_err() {
                    break;
                }
            }
        }

        let counters = &self.shared.counters;
        match &reason {
            CloseReason::PeerClosed => {
                if !self.input.is_empty() {
                    debug!(connection = self.id, leftover = self.input.len(), "peer closed mid-request");
                }
            }
            CloseReason::Idle => {
                counters.idle_evicted.fetch_add(1, Ordering::Relaxed);
                debug!(connection = self.id, "idle connection evicted");
            }
            CloseReason::Shutdown => {}
            CloseReason::Io(e) => {
                debug!(connection = self.id, error = %e, "connection i/o failure");
            }
            CloseReason::Tls(e) if handshaking => {
                counters.handshake_failures.fetch_add(1, Ordering::Relaxed);
                warn!(connection = self.id, peer = %self.peer, error = %e, "tls handshake failed");
            }
            CloseReason::Tls(e) => {
                warn!(connection = self.id, error = %e, "tls session failed");
            }
            CloseReason::Protocol(e) => {
                counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!(connection = self.id, error = %e, "undecodable input");
            }
        }
        counters.active.fetch_sub(1, Ordering::Relaxed);
        counters.closed.fetch_add(1, Ordering::Relaxed);
        self.state = ConnectionState::Closed;
        debug!(connection = self.id, reason = ?reason, unsent, state = ?self.state, "connection closed");
    }
}
