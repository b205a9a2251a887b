//! The task that runs one channel
//!
//! The driver owns the [`ChannelCore`] and is the only place it is touched.
//! A reader task decodes frames and hands them over through a bounded queue,
//! a writer task encodes whatever the core queued for sending. Local callers
//! reach the core through the unbounded command queue behind
//! [`ChannelHandle`].

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tether_fabric::codec::Codec;
use tether_fabric::transport::Transport;
use tether_fabric::{Connection, ConnectionReceiver, ConnectionSender};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::channel::{ChannelCore, ChannelState, Outgoing, Role, Unsent};
use crate::envelope::{Envelope, Hello};
use crate::error::{Error, Result};
use crate::handle::{ChannelHandle, Command};
use crate::payload::Payload;

/// Runtime knobs of a single channel
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Recorded on the channel's tracing span
    pub name: String,
    /// Decoded envelopes buffered between the reader and the channel task
    pub inbox_capacity: usize,
    /// Default bound for [`ChannelHandle::call`]
    pub request_timeout: Option<Duration>,
    pub handshake_timeout: Option<Duration>,
    /// How long a closing channel waits for queued envelopes to be written
    pub close_timeout: Duration,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            name: "channel".to_string(),
            inbox_capacity: 1024,
            request_timeout: None,
            handshake_timeout: Some(Duration::from_secs(10)),
            close_timeout: Duration::from_secs(5),
        }
    }
}

pub(crate) type Connector =
    Pin<Box<dyn Future<Output = tether_fabric::Result<Box<dyn Transport>>> + Send>>;

pub(crate) type AcceptHook<P> = Box<dyn FnOnce(Hello, &mut ChannelCore<P>) -> Result<()> + Send>;

/// First exchange on a fresh connection
pub(crate) enum Handshake<P: Payload> {
    /// Send this hello
    Hello(Hello),
    /// Wait for the peer's hello and let the hook prepare the core
    Accept(AcceptHook<P>),
}

/// Open a client channel over an already connected transport
pub fn spawn_client<P, C>(
    transport: impl Transport + 'static,
    codec: C,
    token: Option<String>,
    options: ChannelOptions,
) -> ChannelHandle<P>
where
    P: Payload,
    C: Codec + Clone + 'static,
{
    let transport: Box<dyn Transport> = Box::new(transport);
    spawn_channel(
        Box::pin(async move { Ok::<_, tether_fabric::Error>(transport) }),
        codec,
        Role::Client,
        Handshake::Hello(Hello { token }),
        options,
        None,
    )
}

pub(crate) fn spawn_channel<P, C>(
    connector: Connector,
    codec: C,
    role: Role,
    handshake: Handshake<P>,
    options: ChannelOptions,
    runtime: Option<&Handle>,
) -> ChannelHandle<P>
where
    P: Payload,
    C: Codec + Clone + 'static,
{
    let (commands_tx, commands) = mpsc::unbounded_channel();
    let core = ChannelCore::new(role, commands_tx, options.request_timeout);
    let handle = core.handle().clone();
    let span = info_span!("channel", name = %options.name, %role);
    let driver = Driver {
        core,
        commands,
        codec,
        options,
    };
    let task = driver.run(connector, handshake).instrument(span);
    match runtime {
        Some(runtime) => drop(runtime.spawn(task)),
        None => drop(tokio::spawn(task)),
    }
    handle
}

enum Inbound<P> {
    Envelope(Envelope<P>),
    /// The writer could not send this one, the connection is still up
    Unsent(Unsent),
    Lost(tether_fabric::Error),
}

struct Driver<P: Payload, C> {
    core: ChannelCore<P>,
    commands: mpsc::UnboundedReceiver<Command<P>>,
    codec: C,
    options: ChannelOptions,
}

impl<P, C> Driver<P, C>
where
    P: Payload,
    C: Codec + Clone + 'static,
{
    async fn run(mut self, connector: Connector, handshake: Handshake<P>) {
        let Some(transport) = self.connect(connector).await else {
            self.finish();
            info!("channel closed before connecting");
            return;
        };

        let mut connection = Connection::from_boxed(transport, self.codec.clone());
        if let Err(error) = self.handshake(&mut connection, handshake).await {
            warn!(%error, "handshake failed");
            if let Err(error) = connection.close().await {
                debug!(%error, "closing transport");
            }
            self.finish();
            return;
        }
        self.core.open();
        info!("channel open");

        let (sender, receiver) = connection.into_split();
        let (frames_tx, frames) = mpsc::channel(self.options.inbox_capacity.max(1));
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(receiver, frames_tx.clone()).in_current_span());
        let mut writer = tokio::spawn(write_loop(sender, outgoing_rx, frames_tx).in_current_span());

        self.serve(frames, &outgoing).await;

        drop(outgoing);
        if tokio::time::timeout(self.options.close_timeout, &mut writer)
            .await
            .is_err()
        {
            debug!("writer did not drain in time");
            writer.abort();
        }
        reader.abort();
        self.finish();
        info!("channel closed");
    }

    /// Refuse further commands, then enter `Closed`
    fn finish(&mut self) {
        self.commands.close();
        self.core.mark_closed();
    }

    async fn connect(&mut self, mut connector: Connector) -> Option<Box<dyn Transport>> {
        loop {
            tokio::select! {
                result = &mut connector => {
                    return match result {
                        Ok(transport) => Some(transport),
                        Err(error) => {
                            warn!(%error, "connect failed");
                            None
                        }
                    };
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        return None;
                    };
                    self.core.apply(command);
                    if self.core.state() != ChannelState::Connecting {
                        return None;
                    }
                }
            }
        }
    }

    async fn handshake(
        &mut self,
        connection: &mut Connection<C>,
        handshake: Handshake<P>,
    ) -> Result<()> {
        let timeout = self.options.handshake_timeout;
        let core = &mut self.core;
        let exchange = async {
            match handshake {
                Handshake::Hello(hello) => connection.send(&hello).await?,
                Handshake::Accept(accept) => {
                    let hello: Hello = connection.receive().await?;
                    debug!(token = hello.token.is_some(), "hello received");
                    accept(hello, core)?;
                }
            }
            Ok::<(), Error>(())
        };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, exchange)
                .await
                .map_err(|_| Error::Transport(tether_fabric::Error::Timeout("Handshake")))?,
            None => exchange.await,
        }
    }

    /// Main loop; returns once the core has left `Open`
    async fn serve(
        &mut self,
        mut frames: mpsc::Receiver<Inbound<P>>,
        outgoing: &mpsc::UnboundedSender<Outgoing<P>>,
    ) {
        loop {
            for queued in self.core.drain_outbox() {
                // a gone writer reports the loss through `frames`
                let _ = outgoing.send(queued);
            }
            if self.core.state() != ChannelState::Open {
                return;
            }

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.core.apply(command),
                    None => self.core.close(),
                },
                inbound = frames.recv() => match inbound {
                    Some(Inbound::Envelope(envelope)) => self.core.on_envelope(envelope),
                    Some(Inbound::Unsent(unsent)) => self.core.on_unsent(unsent),
                    Some(Inbound::Lost(error)) => {
                        info!(%error, "connection lost");
                        self.core.close();
                    }
                    None => self.core.close(),
                },
            }
        }
    }
}

async fn read_loop<P, C>(mut receiver: ConnectionReceiver<C>, frames: mpsc::Sender<Inbound<P>>)
where
    P: Payload,
    C: Codec,
{
    loop {
        let inbound = match receiver.receive::<Envelope<P>>().await {
            Ok(envelope) => Inbound::Envelope(envelope),
            Err(tether_fabric::Error::Codec(reason)) => {
                warn!(%reason, "undecodable envelope skipped");
                continue;
            }
            Err(tether_fabric::Error::InvalidFrame(reason)) if receiver.resynchronizes() => {
                warn!(%reason, "invalid frame skipped");
                continue;
            }
            Err(error) => Inbound::Lost(error),
        };
        let lost = matches!(inbound, Inbound::Lost(_));
        if frames.send(inbound).await.is_err() || lost {
            return;
        }
    }
}

async fn write_loop<P, C>(
    mut sender: ConnectionSender<C>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing<P>>,
    frames: mpsc::Sender<Inbound<P>>,
) where
    P: Payload,
    C: Codec,
{
    while let Some(Outgoing { envelope, report }) = outgoing.recv().await {
        match sender.send(&envelope).await {
            Ok(()) => {
                if let Some(report) = report {
                    let _ = report.send(Ok(()));
                }
            }
            Err(error) if error.is_connection_loss() => {
                // the channel task may already be gone
                let _ = frames.try_send(Inbound::Lost(error));
                return;
            }
            Err(error) => {
                warn!(
                    %error,
                    kind = ?envelope.kind,
                    actor_id = envelope.actor_id,
                    correlation_id = envelope.correlation_id,
                    "envelope not sent"
                );
                let unsent = Unsent::of(&envelope, error.to_string());
                if let Some(report) = report {
                    let _ = report.send(Err(Error::Transport(error)));
                }
                // fails only once the channel task stopped listening
                let _ = frames.send(Inbound::Unsent(unsent)).await;
            }
        }
    }
    if let Err(error) = sender.close().await {
        debug!(%error, "closing transport");
    }
}
