//! Pluggable wire protocols sitting between the socket layer and the engine.
//!
//! A [`CommunicationProtocol`] creates one [`ProtocolDecoder`] per
//! connection. Decoders may keep partial parse state between reads, but that
//! state lives and dies with the connection.

pub mod http;
pub mod line;

use bytes::{Bytes, BytesMut};

use crate::core::KernelError;

pub use http::{HttpProtocol, HttpRequest, HttpResponse, HttpResponseDecoder};
pub use line::LineProtocol;

/// Per-connection incremental decoder.
pub trait ProtocolDecoder: Send + 'static {
    /// Decoded application unit.
    type Request;

    /// Decode one request from the front of `input`.
    ///
    /// Consumed bytes are removed from `input`. `Ok(None)` means more bytes
    /// are needed.
    ///
    /// # Errors
    ///
    /// `KernelError::Protocol` if the bytes can never form a valid request;
    /// the connection is closed.
    fn decode(&mut self, input: &mut BytesMut) -> Result<Option<Self::Request>, KernelError>;

    /// Decode every complete request currently buffered.
    ///
    /// # Errors
    ///
    /// Propagates the first decode failure.
    fn decode_all(&mut self, input: &mut BytesMut) -> Result<Vec<Self::Request>, KernelError> {
        let mut requests = Vec::new();
        while let Some(request) = self.decode(input)? {
            requests.push(request);
        }
        Ok(requests)
    }
}

/// Wire format bound to a listener.
pub trait CommunicationProtocol: Send + Sync + 'static {
    /// Decoded inbound unit.
    type Request: Send + 'static;
    /// Outbound unit produced by tasks.
    type Response: Send + 'static;
    /// Decoder type, one per connection.
    type Decoder: ProtocolDecoder<Request = Self::Request>;

    /// Fresh decoder for a new connection.
    fn new_decoder(&self) -> Self::Decoder;

    /// Encode `response` into buffers of at most `write_buffer_size` bytes.
    fn encode(&self, response: &Self::Response, write_buffer_size: usize) -> Vec<Bytes>;

    /// Response sent when a process fails or finishes without responding.
    fn failure_response(&self, failure: Option<&anyhow::Error>) -> Self::Response;
}

/// Split `bytes` into chunks of at most `size` bytes without copying.
pub(crate) fn chunk(mut bytes: Bytes, size: usize) -> Vec<Bytes> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(bytes.len().div_ceil(size));
    while bytes.len() > size {
        chunks.push(bytes.split_to(size));
    }
    if !bytes.is_empty() {
        chunks.push(bytes);
    }
    chunks
}
