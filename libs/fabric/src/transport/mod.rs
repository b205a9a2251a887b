use crate::error::Result;

pub mod framing;
pub mod memory;
pub mod tcp;
pub mod udp;
pub mod unix;

pub use self::memory::MemoryTransport;
pub use self::tcp::{TcpTransport, TcpTransportBuilder, TcpTransportListener};
pub use self::udp::{Delivery, UdpConfig, UdpTransport, UdpTransportBuilder, UdpTransportListener};
pub use self::unix::{UnixTransport, UnixTransportBuilder, UnixTransportListener};

/// Transport trait for sending and receiving raw bytes
///
/// Each transport instance represents a single connection.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send bytes over the transport
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Receive bytes from the transport
    async fn receive(&mut self) -> Result<Vec<u8>>;

    /// Close the transport connection
    async fn close(&mut self) -> Result<()>;

    /// Split into halves that can be driven from different tasks
    fn into_split(self: Box<Self>) -> (Box<dyn TransportSender>, Box<dyn TransportReceiver>);
}

/// Write half of a split transport
#[async_trait::async_trait]
pub trait TransportSender: Send + Sync {
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Read half of a split transport
#[async_trait::async_trait]
pub trait TransportReceiver: Send + Sync {
    async fn receive(&mut self) -> Result<Vec<u8>>;

    /// Whether the next `receive` can still yield a good frame after an
    /// `InvalidFrame` error. Byte streams lose their framing, message
    /// oriented transports do not.
    fn resynchronizes(&self) -> bool {
        false
    }
}

/// Listener for accepting incoming transport connections
#[async_trait::async_trait]
pub trait TransportListener: Send + Sync {
    type Transport: Transport + 'static;

    /// Accept the next incoming connection
    async fn accept(&self) -> Result<Self::Transport>;

    /// Stop accepting connections
    async fn close(&mut self) -> Result<()>;
}
