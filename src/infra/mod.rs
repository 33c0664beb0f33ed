//! Network-facing infrastructure: buffers, wire protocols and sockets.

pub mod buffer_pool;
pub mod protocol;
pub mod socket;

pub use buffer_pool::{BufferPool, BufferPoolStats, PooledBuffer};
pub use protocol::{
    CommunicationProtocol, HttpProtocol, HttpRequest, HttpResponse, LineProtocol, ProtocolDecoder,
};
pub use socket::{
    ConnectionHandler, EngineDispatch, Inbound, Refused, ResponseWriter, SocketManager, SocketStats,
};
