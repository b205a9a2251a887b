use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_fabric::codec::Codec;
use tether_fabric::transport::framing::MAX_FRAME_SIZE;
use tether_fabric::transport::{TcpTransport, Transport, UdpConfig, UdpTransport, UnixTransport};
use tokio::net::lookup_host;
use tokio::runtime::Handle;

use crate::channel::Role;
use crate::driver::{spawn_channel, ChannelOptions, Connector, Handshake};
use crate::envelope::Hello;
use crate::error::{Error, Result};
use crate::handle::ChannelHandle;
use crate::payload::Payload;

/// Transport a factory connects with
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Udp,
    Unix,
}

/// Everything needed to open a client channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub transport: TransportKind,
    /// `host:port` for TCP and UDP, a socket path for Unix
    pub endpoint: String,
    /// Sent in the hello frame
    pub connect_token: Option<String>,
    pub name: String,
    pub inbox_capacity: usize,
    pub request_timeout_ms: Option<u64>,
    pub connect_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub close_timeout_ms: u64,
    /// Largest frame accepted on stream transports
    pub max_frame_size: usize,
    pub udp: UdpConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        let options = ChannelOptions::default();
        Self {
            transport: TransportKind::default(),
            endpoint: String::new(),
            connect_token: None,
            name: options.name,
            inbox_capacity: options.inbox_capacity,
            request_timeout_ms: None,
            connect_timeout_ms: Some(10_000),
            handshake_timeout_ms: options.handshake_timeout.map(millis),
            close_timeout_ms: millis(options.close_timeout),
            max_frame_size: MAX_FRAME_SIZE,
            udp: UdpConfig::default(),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl ChannelConfig {
    pub fn tcp(endpoint: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Tcp,
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn udp(endpoint: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Udp,
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    pub fn unix(path: impl Into<String>) -> Self {
        Self {
            transport: TransportKind::Unix,
            endpoint: path.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(Error::Config("endpoint is empty".into()));
        }
        if self.max_frame_size == 0 {
            return Err(Error::Config("max_frame_size must be nonzero".into()));
        }
        if self.transport == TransportKind::Udp {
            self.udp
                .validate()
                .map_err(|e| Error::Config(e.to_string()))?;
        }
        Ok(())
    }

    /// The per-channel runtime settings
    pub fn options(&self) -> ChannelOptions {
        ChannelOptions {
            name: self.name.clone(),
            inbox_capacity: self.inbox_capacity,
            request_timeout: self.request_timeout_ms.map(Duration::from_millis),
            handshake_timeout: self.handshake_timeout_ms.map(Duration::from_millis),
            close_timeout: Duration::from_millis(self.close_timeout_ms),
        }
    }
}

/// Opens client channels of one configured kind
///
/// Transport selection happens here and nowhere else; every channel it
/// creates runs the same protocol core.
pub struct ChannelFactory<C> {
    config: ChannelConfig,
    codec: C,
    runtime: Option<Handle>,
}

impl<C> ChannelFactory<C>
where
    C: Codec + Clone + 'static,
{
    pub fn new(config: ChannelConfig, codec: C) -> Self {
        Self {
            config,
            codec,
            runtime: None,
        }
    }

    /// Spawn channel tasks on `runtime` instead of the caller's runtime
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Start a channel; it connects in the background
    ///
    /// Operations posted before the connection is up are queued. A failed
    /// connect closes the channel, failing whatever was queued.
    pub fn create<P: Payload>(&self) -> Result<ChannelHandle<P>> {
        self.config.validate()?;
        Ok(spawn_channel(
            self.connector(),
            self.codec.clone(),
            Role::Client,
            Handshake::Hello(Hello {
                token: self.config.connect_token.clone(),
            }),
            self.config.options(),
            self.runtime.as_ref(),
        ))
    }

    fn connector(&self) -> Connector {
        let endpoint = self.config.endpoint.clone();
        let connect_timeout = self.config.connect_timeout_ms.map(Duration::from_millis);
        let max_frame_size = self.config.max_frame_size;
        match self.config.transport {
            TransportKind::Tcp => Box::pin(async move {
                let mut builder = TcpTransport::builder()
                    .address(resolve(&endpoint).await?)
                    .max_frame_size(max_frame_size);
                if let Some(timeout) = connect_timeout {
                    builder = builder.connect_timeout(timeout);
                }
                let transport: Box<dyn Transport> = Box::new(builder.connect().await?);
                Ok::<_, tether_fabric::Error>(transport)
            }),
            TransportKind::Unix => Box::pin(async move {
                let mut builder = UnixTransport::builder()
                    .path(&endpoint)
                    .max_frame_size(max_frame_size);
                if let Some(timeout) = connect_timeout {
                    builder = builder.connect_timeout(timeout);
                }
                let transport: Box<dyn Transport> = Box::new(builder.connect().await?);
                Ok::<_, tether_fabric::Error>(transport)
            }),
            TransportKind::Udp => {
                let config = self.config.udp.clone();
                Box::pin(async move {
                    let connect = async {
                        UdpTransport::builder()
                            .config(config)
                            .address(resolve(&endpoint).await?)
                            .connect()
                            .await
                    };
                    let transport = match connect_timeout {
                        Some(timeout) => tokio::time::timeout(timeout, connect)
                            .await
                            .map_err(|_| tether_fabric::Error::Timeout("Connect"))??,
                        None => connect.await?,
                    };
                    let transport: Box<dyn Transport> = Box::new(transport);
                    Ok::<_, tether_fabric::Error>(transport)
                })
            }
        }
    }
}

async fn resolve(endpoint: &str) -> tether_fabric::Result<std::net::SocketAddr> {
    lookup_host(endpoint).await?.next().ok_or_else(|| {
        tether_fabric::Error::Config(format!("{endpoint} did not resolve to an address"))
    })
}
