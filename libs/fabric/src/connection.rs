use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::error::Result;
use crate::transport::{
    TcpTransport, Transport, TransportReceiver, TransportSender, UdpConfig, UdpTransport,
    UnixTransport,
};

/// Typed connection for bidirectional communication
///
/// Combines a transport and codec for persistent connections
pub struct Connection<C> {
    transport: Box<dyn Transport>,
    codec: C,
}

impl<C: Codec> Connection<C> {
    /// Create a connection from an existing transport
    pub fn from_transport(transport: impl Transport + 'static, codec: C) -> Self {
        Self::from_boxed(Box::new(transport), codec)
    }

    /// Create a connection from an already boxed transport
    pub fn from_boxed(transport: Box<dyn Transport>, codec: C) -> Self {
        Self { transport, codec }
    }

    /// Open a TCP connection
    pub async fn tcp(addr: SocketAddr, codec: C) -> Result<Self> {
        let transport = TcpTransport::connect(addr).await?;
        Ok(Self::from_transport(transport, codec))
    }

    /// Open a Unix socket connection
    pub async fn unix(path: impl AsRef<Path>, codec: C) -> Result<Self> {
        let transport = UnixTransport::connect(path).await?;
        Ok(Self::from_transport(transport, codec))
    }

    /// Open a UDP connection
    pub async fn udp(addr: SocketAddr, config: UdpConfig, codec: C) -> Result<Self> {
        let transport = UdpTransport::builder()
            .config(config)
            .address(addr)
            .connect()
            .await?;
        Ok(Self::from_transport(transport, codec))
    }

    /// Send a message over the connection
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let bytes = self.codec.encode(message)?;
        self.transport.send(&bytes).await
    }

    /// Receive a message from the connection
    pub async fn receive<T: for<'de> Deserialize<'de>>(&mut self) -> Result<T> {
        let bytes = self.transport.receive().await?;
        self.codec.decode(&bytes)
    }

    /// Close the connection
    pub async fn close(mut self) -> Result<()> {
        self.transport.close().await
    }

    /// Split into a sending and a receiving half, each with its own codec
    pub fn into_split(self) -> (ConnectionSender<C>, ConnectionReceiver<C>)
    where
        C: Clone,
    {
        let (sender, receiver) = self.transport.into_split();
        (
            ConnectionSender {
                sender,
                codec: self.codec.clone(),
            },
            ConnectionReceiver {
                receiver,
                codec: self.codec,
            },
        )
    }
}

/// Sending half of a split [`Connection`]
pub struct ConnectionSender<C> {
    sender: Box<dyn TransportSender>,
    codec: C,
}

impl<C: Codec> ConnectionSender<C> {
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let bytes = self.codec.encode(message)?;
        self.sender.send(&bytes).await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.sender.close().await
    }
}

/// Receiving half of a split [`Connection`]
pub struct ConnectionReceiver<C> {
    receiver: Box<dyn TransportReceiver>,
    codec: C,
}

impl<C: Codec> ConnectionReceiver<C> {
    /// Receive and decode the next frame
    ///
    /// A [`Error::Codec`](crate::Error::Codec) only concerns this frame;
    /// the next call reads the following one.
    pub async fn receive<T: for<'de> Deserialize<'de>>(&mut self) -> Result<T> {
        let bytes = self.receiver.receive().await?;
        self.codec.decode(&bytes)
    }

    /// See [`TransportReceiver::resynchronizes`]
    pub fn resynchronizes(&self) -> bool {
        self.receiver.resynchronizes()
    }
}
