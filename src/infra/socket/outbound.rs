//! Per-connection outbound queue and the writer handed to tasks.
//!
//! Every decoded request reserves a sequence number. Responses may complete
//! in any order; they are parked until every earlier sequence has been
//! queued, so the peer always sees responses in request order.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::core::KernelError;
use crate::infra::protocol::CommunicationProtocol;

/// Connection identifier, unique per socket manager.
pub type ConnectionId = u64;

#[derive(Debug, Default)]
struct OutboundState {
    next_seq: u64,
    next_write: u64,
    pending: BTreeMap<u64, Vec<Bytes>>,
    ready: VecDeque<Bytes>,
    queued_bytes: usize,
    closed: bool,
}

/// Ordered byte queue shared by a connection and its response writers.
#[derive(Debug)]
pub(crate) struct Outbound {
    id: ConnectionId,
    threshold: usize,
    state: Mutex<OutboundState>,
    pub(crate) notify: Notify,
}

impl Outbound {
    pub(crate) fn new(id: ConnectionId, threshold: usize) -> Arc<Self> {
        Arc::new(Self {
            id,
            threshold,
            state: Mutex::new(OutboundState::default()),
            notify: Notify::new(),
        })
    }

    pub(crate) const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Reserve the sequence number for the next decoded request.
    pub(crate) fn reserve(&self) -> u64 {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        seq
    }

    /// Queue the encoded response for `seq`.
    ///
    /// Without `force`, a queue already over the threshold refuses with
    /// `KernelError::Backpressure`.
    pub(crate) fn submit(&self, seq: u64, chunks: Vec<Bytes>, force: bool) -> Result<(), KernelError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(KernelError::ConnectionClosed(self.id));
            }
            if !force && state.queued_bytes > self.threshold {
                warn!(connection = self.id, queued = state.queued_bytes, "outbound backpressure");
                return Err(KernelError::Backpressure(self.id));
            }
            if seq < state.next_write || state.pending.contains_key(&seq) {
                return Err(KernelError::Protocol(format!("duplicate response for request {seq}")));
            }
            state.queued_bytes += chunks.iter().map(Bytes::len).sum::<usize>();
            state.pending.insert(seq, chunks);
            loop {
                let next = state.next_write;
                let Some(chunks) = state.pending.remove(&next) else { break };
                state.ready.extend(chunks);
                state.next_write += 1;
            }
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Move every in-order chunk to the caller.
    pub(crate) fn take_ready(&self) -> VecDeque<Bytes> {
        std::mem::take(&mut self.state.lock().ready)
    }

    /// Account for `n` bytes handed to the socket.
    pub(crate) fn wrote(&self, n: usize) {
        let mut state = self.state.lock();
        state.queued_bytes = state.queued_bytes.saturating_sub(n);
    }

    /// Whether every reserved request has had its response queued.
    pub(crate) fn all_responded(&self) -> bool {
        let state = self.state.lock();
        state.next_write == state.next_seq && state.ready.is_empty()
    }

    pub(crate) fn queued_bytes(&self) -> usize {
        self.state.lock().queued_bytes
    }

    /// Refuse all further writes and drop anything queued.
    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.pending.clear();
        state.ready.clear();
        state.queued_bytes = 0;
    }
}

/// A response the connection would not take, handed back to the task.
#[derive(Debug)]
pub struct Refused<R> {
    /// Why the write was refused.
    pub reason: KernelError,
    /// The response, unchanged.
    pub response: R,
}

struct ResponseSlot {
    outbound: Arc<Outbound>,
    seq: u64,
    responded: Mutex<bool>,
}

/// Writes the single response for one decoded request.
pub struct ResponseWriter<P: CommunicationProtocol> {
    slot: Arc<ResponseSlot>,
    protocol: Arc<P>,
    write_buffer_size: usize,
}

impl<P: CommunicationProtocol> ResponseWriter<P> {
    pub(crate) fn new(
        outbound: Arc<Outbound>,
        protocol: Arc<P>,
        write_buffer_size: usize,
    ) -> Self {
        let seq = outbound.reserve();
        Self {
            slot: Arc::new(ResponseSlot {
                outbound,
                seq,
                responded: Mutex::new(false),
            }),
            protocol,
            write_buffer_size,
        }
    }

    /// Connection this response belongs to.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.slot.outbound.id()
    }

    /// Whether a response has been accepted.
    #[must_use]
    pub fn is_responded(&self) -> bool {
        *self.slot.responded.lock()
    }

    /// Encode and queue `response`.
    ///
    /// # Errors
    ///
    /// Hands the response back when the connection is over its
    /// backpressure threshold, already closed, or already answered.
    pub fn send(&self, response: P::Response) -> Result<(), Refused<P::Response>> {
        let mut responded = self.slot.responded.lock();
        if *responded {
            return Err(Refused {
                reason: KernelError::Protocol("response already sent".into()),
                response,
            });
        }
        let chunks = self.protocol.encode(&response, self.write_buffer_size);
        match self.slot.outbound.submit(self.slot.seq, chunks, false) {
            Ok(()) => {
                *responded = true;
                Ok(())
            }
            Err(reason) => Err(Refused { reason, response }),
        }
    }

    pub(crate) fn completion(&self) -> ResponseCompletion<P> {
        ResponseCompletion {
            slot: Arc::clone(&self.slot),
            protocol: Arc::clone(&self.protocol),
            write_buffer_size: self.write_buffer_size,
        }
    }
}

impl<P: CommunicationProtocol> fmt::Debug for ResponseWriter<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseWriter")
            .field("connection", &self.slot.outbound.id())
            .field("seq", &self.slot.seq)
            .field("responded", &self.is_responded())
            .finish()
    }
}

/// Fills the response slot when the process ends without answering.
pub(crate) struct ResponseCompletion<P: CommunicationProtocol> {
    slot: Arc<ResponseSlot>,
    protocol: Arc<P>,
    write_buffer_size: usize,
}

impl<P: CommunicationProtocol> ResponseCompletion<P> {
    pub(crate) fn finish(&self, failure: Option<&anyhow::Error>) {
        let mut responded = self.slot.responded.lock();
        if *responded {
            return;
        }
        *responded = true;
        let response = self.protocol.failure_response(failure);
        let chunks = self.protocol.encode(&response, self.write_buffer_size);
        if let Err(e) = self.slot.outbound.submit(self.slot.seq, chunks, true) {
            debug!(connection = self.slot.outbound.id(), error = %e, "failure response dropped");
        }
    }
}

/// Argument handed to the task bound to a listener.
pub struct Inbound<P: CommunicationProtocol> {
    /// The decoded request.
    pub request: P::Request,
    /// Writer for its response.
    pub writer: ResponseWriter<P>,
}

impl<P: CommunicationProtocol> fmt::Debug for Inbound<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbound")
            .field("writer", &self.writer)
            .finish_non_exhaustive()
    }
}
