//! UDP transport with per-send delivery quality
//!
//! Every datagram starts with a 6-byte header: kind, delivery, and a
//! big-endian sequence number. Reliable deliveries are acknowledged by the
//! receiver and resent until acknowledged or until the resend budget runs
//! out, at which point the peer is considered lost. Both ends ping each
//! other while idle; a peer that stays silent past the idle timeout is lost
//! as well. A close travels in the ordered stream, after everything sent
//! before it.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportReceiver, TransportSender};

const HEADER_LEN: usize = 6;

const KIND_DATA: u8 = 0;
const KIND_ACK: u8 = 1;
const KIND_CLOSE: u8 = 2;
const KIND_PING: u8 = 3;

/// Largest payload that fits a single IPv4 UDP datagram
pub const MAX_DATAGRAM_SIZE: usize = 65_507 - HEADER_LEN;

/// How far back unordered duplicates are remembered
const DEDUP_WINDOW: u32 = 4096;

/// How far ahead of the next expected sequence an ordered datagram may be
/// buffered; later ones are left unacknowledged for the sender to resend
const REORDER_WINDOW: u32 = 1024;

/// Datagrams queued per peer on a listener before new ones are dropped
const PEER_QUEUE: usize = 1024;

/// Delivery quality of a single send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Delivery {
    /// Fire and forget; may be lost, duplicated or reordered
    Unreliable,
    /// Resent until acknowledged, handed over in arrival order
    ReliableUnordered,
    /// Resent until acknowledged, handed over in send order
    #[default]
    ReliableOrdered,
}

impl Delivery {
    fn to_byte(self) -> u8 {
        match self {
            Self::Unreliable => 0,
            Self::ReliableUnordered => 1,
            Self::ReliableOrdered => 2,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Unreliable),
            1 => Some(Self::ReliableUnordered),
            2 => Some(Self::ReliableOrdered),
            _ => None,
        }
    }

    pub fn is_reliable(self) -> bool {
        self != Self::Unreliable
    }
}

/// UDP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Local address to bind when connecting
    pub bind_address: SocketAddr,
    /// Delivery used by `Transport::send`
    pub delivery: Delivery,
    /// Largest payload accepted per datagram
    pub max_datagram_size: usize,
    /// How long an unacknowledged datagram waits before it is resent
    pub resend_interval_ms: u64,
    /// Resends allowed per datagram before the peer is declared lost
    pub max_resends: u32,
    /// How often a ping goes out to keep the peer informed
    pub keepalive_interval_ms: u64,
    /// Silence after which the peer is declared lost, 0 to never give up.
    /// Only datagrams read through `receive` count as heard.
    pub idle_timeout_ms: u64,
    /// How long `close` waits for outstanding reliable datagrams to be
    /// acknowledged
    pub close_linger_ms: u64,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 0)),
            delivery: Delivery::default(),
            max_datagram_size: MAX_DATAGRAM_SIZE,
            resend_interval_ms: 100,
            max_resends: 50,
            keepalive_interval_ms: 1_000,
            idle_timeout_ms: 10_000,
            close_linger_ms: 1_000,
        }
    }
}

impl UdpConfig {
    /// Reject settings the transport cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_datagram_size == 0 || self.max_datagram_size > MAX_DATAGRAM_SIZE {
            return Err(Error::Config(format!(
                "max_datagram_size must be within 1..={}",
                MAX_DATAGRAM_SIZE
            )));
        }
        if self.resend_interval_ms == 0 {
            return Err(Error::Config("resend_interval_ms must be nonzero".into()));
        }
        if self.keepalive_interval_ms == 0 {
            return Err(Error::Config("keepalive_interval_ms must be nonzero".into()));
        }
        if self.idle_timeout_ms != 0 && self.idle_timeout_ms <= self.keepalive_interval_ms {
            return Err(Error::Config(
                "idle_timeout_ms must exceed keepalive_interval_ms".into(),
            ));
        }
        Ok(())
    }
}

fn header(kind: u8, delivery: Delivery, seq: u32) -> [u8; HEADER_LEN] {
    let seq = seq.to_be_bytes();
    [kind, delivery.to_byte(), seq[0], seq[1], seq[2], seq[3]]
}

fn map_recv_error(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::ConnectionRefused {
        Error::ConnectionClosed
    } else {
        e.into()
    }
}

/// Where outgoing datagrams go
struct Link {
    socket: Arc<UdpSocket>,
    /// Set for connections accepted on a shared listener socket
    peer: Option<SocketAddr>,
}

impl Link {
    async fn send_raw(&self, datagram: &[u8]) -> Result<()> {
        match self.peer {
            Some(peer) => self.socket.send_to(datagram, peer).await?,
            None => self.socket.send(datagram).await?,
        };
        Ok(())
    }

    fn peer_addr(&self) -> Result<SocketAddr> {
        match self.peer {
            Some(peer) => Ok(peer),
            None => self.socket.peer_addr().map_err(Into::into),
        }
    }
}

struct Outstanding {
    datagram: Vec<u8>,
    sent_at: Instant,
    resends: u32,
}

#[derive(Default)]
struct SendState {
    next_unordered: u32,
    next_ordered: u32,
    unacked: HashMap<(Delivery, u32), Outstanding>,
}

/// State shared by both halves and the resend task
struct Shared {
    link: Link,
    config: UdpConfig,
    state: Mutex<SendState>,
    /// Last time anything arrived from the peer
    last_heard: Mutex<Instant>,
    /// Woken when `unacked` empties or the link goes down
    drained: Notify,
    down: watch::Sender<bool>,
}

impl Shared {
    fn is_down(&self) -> bool {
        *self.down.borrow()
    }

    fn mark_down(&self) {
        self.down.send_replace(true);
        self.drained.notify_waiters();
    }

    fn heard(&self) {
        *self.last_heard.lock() = Instant::now();
    }

    fn is_silent(&self, now: Instant) -> bool {
        self.config.idle_timeout_ms != 0
            && now.duration_since(*self.last_heard.lock())
                >= Duration::from_millis(self.config.idle_timeout_ms)
    }

    /// Build a data datagram, registering it for resends when reliable
    fn frame(&self, body: &[u8], delivery: Delivery) -> Result<Vec<u8>> {
        if body.len() > self.config.max_datagram_size {
            return Err(Error::InvalidFrame(format!(
                "Message too large: {} bytes (max {})",
                body.len(),
                self.config.max_datagram_size
            )));
        }

        let mut state = self.state.lock();
        let seq = match delivery {
            Delivery::Unreliable => 0,
            Delivery::ReliableUnordered => {
                let seq = state.next_unordered;
                state.next_unordered = seq.wrapping_add(1);
                seq
            }
            Delivery::ReliableOrdered => {
                let seq = state.next_ordered;
                state.next_ordered = seq.wrapping_add(1);
                seq
            }
        };

        let mut datagram = Vec::with_capacity(HEADER_LEN + body.len());
        datagram.extend_from_slice(&header(KIND_DATA, delivery, seq));
        datagram.extend_from_slice(body);

        if delivery.is_reliable() {
            state.unacked.insert(
                (delivery, seq),
                Outstanding {
                    datagram: datagram.clone(),
                    sent_at: Instant::now(),
                    resends: 0,
                },
            );
        }
        Ok(datagram)
    }

    async fn send_data(&self, body: &[u8], delivery: Delivery) -> Result<()> {
        if self.is_down() {
            return Err(Error::ConnectionClosed);
        }
        let datagram = self.frame(body, delivery)?;
        self.link.send_raw(&datagram).await
    }

    fn acknowledge(&self, delivery: Delivery, seq: u32) {
        let mut state = self.state.lock();
        if state.unacked.remove(&(delivery, seq)).is_some() {
            trace!(?delivery, seq, "datagram acknowledged");
            if state.unacked.is_empty() {
                self.drained.notify_waiters();
            }
        }
    }

    /// Wait, up to the close linger, until every reliable datagram is
    /// acknowledged or the link is down
    async fn linger(&self) {
        let drained = async {
            loop {
                let notified = self.drained.notified();
                let empty = self.state.lock().unacked.is_empty();
                if empty || self.is_down() {
                    return;
                }
                notified.await;
            }
        };
        let linger = Duration::from_millis(self.config.close_linger_ms);
        if tokio::time::timeout(linger, drained).await.is_err() {
            let unacked = self.state.lock().unacked.len();
            debug!(unacked, "closing with unacknowledged datagrams");
        }
    }

    /// Sequence number for the close, taken from the ordered stream
    fn close_sequence(&self) -> u32 {
        let mut state = self.state.lock();
        let seq = state.next_ordered;
        state.next_ordered = seq.wrapping_add(1);
        seq
    }

    /// Datagrams whose resend is due, or `None` once one ran out of resends
    fn due_resends(&self, now: Instant) -> Option<Vec<Vec<u8>>> {
        let interval = Duration::from_millis(self.config.resend_interval_ms);
        let mut state = self.state.lock();
        let mut due = Vec::new();
        for outstanding in state.unacked.values_mut() {
            if now.duration_since(outstanding.sent_at) < interval {
                continue;
            }
            if outstanding.resends >= self.config.max_resends {
                return None;
            }
            outstanding.resends += 1;
            outstanding.sent_at = now;
            due.push(outstanding.datagram.clone());
        }
        Some(due)
    }

    /// Resends, keepalive pings and the idle check, on one timer
    fn spawn_resender(shared: &Arc<Shared>) {
        let weak: Weak<Shared> = Arc::downgrade(shared);
        let keepalive = Duration::from_millis(shared.config.keepalive_interval_ms);
        let interval = Duration::from_millis(shared.config.resend_interval_ms).min(keepalive);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_ping = Instant::now();
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                if shared.is_down() {
                    break;
                }
                let now = Instant::now();
                if shared.is_silent(now) {
                    warn!("nothing heard within the idle timeout, peer lost");
                    shared.mark_down();
                    break;
                }
                let Some(due) = shared.due_resends(now) else {
                    warn!("reliable datagram exceeded its resend budget, peer lost");
                    shared.mark_down();
                    break;
                };
                for datagram in due {
                    if let Err(e) = shared.link.send_raw(&datagram).await {
                        debug!(error = %e, "resend failed");
                    }
                }
                if now.duration_since(last_ping) >= keepalive {
                    last_ping = now;
                    let ping = header(KIND_PING, Delivery::Unreliable, 0);
                    if let Err(e) = shared.link.send_raw(&ping).await {
                        debug!(error = %e, "ping failed");
                    }
                }
            }
        });
    }
}

/// Something held in the ordered stream until its turn
enum Arrival {
    Data(Vec<u8>),
    Close,
}

/// Reassembly state of the receiving side
#[derive(Default)]
struct InboundState {
    unordered_seen: HashSet<u32>,
    unordered_floor: u32,
    ordered_next: u32,
    ordered_pending: BTreeMap<u32, Arrival>,
    ready: VecDeque<Vec<u8>>,
    /// The peer's close was reached; nothing after it is delivered
    closed: bool,
}

impl InboundState {
    /// Take in a data datagram. False when it was refused and must not be
    /// acknowledged.
    fn admit(&mut self, delivery: Delivery, seq: u32, body: Vec<u8>) -> bool {
        if self.closed {
            trace!(seq, "datagram after the peer's close");
            return true;
        }
        match delivery {
            Delivery::Unreliable => {
                self.ready.push_back(body);
                true
            }
            Delivery::ReliableUnordered => {
                if seq < self.unordered_floor || !self.unordered_seen.insert(seq) {
                    trace!(seq, "duplicate unordered datagram");
                    return true;
                }
                if self.unordered_seen.len() > DEDUP_WINDOW as usize {
                    self.unordered_floor = seq.saturating_sub(DEDUP_WINDOW);
                    let floor = self.unordered_floor;
                    self.unordered_seen.retain(|s| *s >= floor);
                }
                self.ready.push_back(body);
                true
            }
            Delivery::ReliableOrdered => self.admit_ordered(seq, Arrival::Data(body)),
        }
    }

    fn admit_ordered(&mut self, seq: u32, arrival: Arrival) -> bool {
        let ahead = seq.wrapping_sub(self.ordered_next);
        if ahead > u32::MAX / 2 || self.ordered_pending.contains_key(&seq) {
            trace!(seq, "duplicate ordered datagram");
            return true;
        }
        if ahead >= REORDER_WINDOW {
            trace!(seq, next = self.ordered_next, "ordered datagram beyond the reorder window");
            return false;
        }
        self.ordered_pending.insert(seq, arrival);
        while let Some(next) = self.ordered_pending.remove(&self.ordered_next) {
            self.ordered_next = self.ordered_next.wrapping_add(1);
            match next {
                Arrival::Data(body) => self.ready.push_back(body),
                Arrival::Close => {
                    self.closed = true;
                    self.ordered_pending.clear();
                }
            }
        }
        true
    }
}

enum Source {
    /// Connected socket owned by this transport
    Socket(Arc<UdpSocket>, Vec<u8>),
    /// Datagrams routed here by a listener's demultiplexer
    Demux(mpsc::Receiver<Vec<u8>>),
}

impl Source {
    async fn recv(&mut self) -> Result<Vec<u8>> {
        match self {
            Self::Socket(socket, buf) => {
                let n = socket.recv(buf).await.map_err(map_recv_error)?;
                Ok(buf[..n].to_vec())
            }
            Self::Demux(rx) => rx.recv().await.ok_or(Error::ConnectionClosed),
        }
    }
}

/// Write half of a UDP transport
pub struct UdpSender {
    shared: Arc<Shared>,
}

impl UdpSender {
    pub async fn send_with(&self, bytes: &[u8], delivery: Delivery) -> Result<()> {
        self.shared.send_data(bytes, delivery).await
    }
}

#[async_trait::async_trait]
impl TransportSender for UdpSender {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.send_with(bytes, self.shared.config.delivery).await
    }

    async fn close(&mut self) -> Result<()> {
        if self.shared.is_down() {
            return Ok(());
        }
        self.shared.linger().await;
        if self.shared.is_down() {
            return Ok(());
        }
        let seq = self.shared.close_sequence();
        self.shared.mark_down();
        self.shared
            .link
            .send_raw(&header(KIND_CLOSE, Delivery::ReliableOrdered, seq))
            .await
    }
}

/// Read half of a UDP transport
pub struct UdpReceiver {
    shared: Arc<Shared>,
    source: Source,
    inbound: InboundState,
    down: watch::Receiver<bool>,
}

impl UdpReceiver {
    async fn accept(&mut self, datagram: &[u8]) -> Result<()> {
        if datagram.len() < HEADER_LEN {
            return Err(Error::InvalidFrame(format!(
                "Datagram shorter than header: {} bytes",
                datagram.len()
            )));
        }
        let delivery = Delivery::from_byte(datagram[1]).ok_or_else(|| {
            Error::InvalidFrame(format!("Unknown delivery byte {}", datagram[1]))
        })?;
        let seq = u32::from_be_bytes([datagram[2], datagram[3], datagram[4], datagram[5]]);

        match datagram[0] {
            KIND_DATA => {
                self.shared.heard();
                let admitted = self
                    .inbound
                    .admit(delivery, seq, datagram[HEADER_LEN..].to_vec());
                if delivery.is_reliable() && admitted {
                    self.shared
                        .link
                        .send_raw(&header(KIND_ACK, delivery, seq))
                        .await?;
                }
                Ok(())
            }
            KIND_ACK => {
                self.shared.heard();
                self.shared.acknowledge(delivery, seq);
                Ok(())
            }
            KIND_PING => {
                self.shared.heard();
                Ok(())
            }
            KIND_CLOSE => {
                self.shared.heard();
                if delivery == Delivery::ReliableOrdered {
                    self.inbound.admit_ordered(seq, Arrival::Close);
                } else {
                    self.inbound.closed = true;
                }
                if self.inbound.closed {
                    debug!("peer closed UDP connection");
                } else {
                    debug!(seq, "peer close waits for earlier datagrams");
                }
                Ok(())
            }
            other => Err(Error::InvalidFrame(format!("Unknown datagram kind {}", other))),
        }
    }
}

#[async_trait::async_trait]
impl TransportReceiver for UdpReceiver {
    async fn receive(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(frame) = self.inbound.ready.pop_front() {
                return Ok(frame);
            }
            if self.inbound.closed {
                self.shared.mark_down();
                return Err(Error::ConnectionClosed);
            }
            if self.shared.is_down() {
                return Err(Error::ConnectionClosed);
            }
            let datagram = tokio::select! {
                datagram = self.source.recv() => datagram?,
                _ = self.down.changed() => continue,
            };
            self.accept(&datagram).await?;
        }
    }

    fn resynchronizes(&self) -> bool {
        true
    }
}

/// UDP transport for a single peer
pub struct UdpTransport {
    sender: UdpSender,
    receiver: UdpReceiver,
}

impl UdpTransport {
    /// Connect to a remote UDP address with the default configuration
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::builder().address(addr).connect().await
    }

    /// Create a builder for configuring the transport
    pub fn builder() -> UdpTransportBuilder {
        UdpTransportBuilder::new()
    }

    fn from_parts(link: Link, source: Source, config: UdpConfig) -> Self {
        let (down, down_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            link,
            config,
            state: Mutex::new(SendState::default()),
            last_heard: Mutex::new(Instant::now()),
            drained: Notify::new(),
            down,
        });
        Shared::spawn_resender(&shared);
        Self {
            sender: UdpSender {
                shared: shared.clone(),
            },
            receiver: UdpReceiver {
                shared,
                source,
                inbound: InboundState::default(),
                down: down_rx,
            },
        }
    }

    /// Send with an explicit delivery quality
    pub async fn send_with(&mut self, bytes: &[u8], delivery: Delivery) -> Result<()> {
        self.sender.send_with(bytes, delivery).await
    }

    /// Get the remote address of this connection
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.sender.shared.link.peer_addr()
    }

    /// Get the local address of this connection
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.sender.shared.link.socket.local_addr().map_err(Into::into)
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        TransportSender::send(&mut self.sender, bytes).await
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        self.receiver.receive().await
    }

    async fn close(&mut self) -> Result<()> {
        TransportSender::close(&mut self.sender).await
    }

    fn into_split(self: Box<Self>) -> (Box<dyn TransportSender>, Box<dyn TransportReceiver>) {
        let this = *self;
        (Box::new(this.sender), Box::new(this.receiver))
    }
}

/// Builder for configuring UDP transport
#[derive(Default)]
pub struct UdpTransportBuilder {
    address: Option<SocketAddr>,
    config: UdpConfig,
}

impl UdpTransportBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: UdpConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the address to connect to
    pub fn address(mut self, addr: SocketAddr) -> Self {
        self.address = Some(addr);
        self
    }

    /// Set the local address to bind
    pub fn bind_address(mut self, addr: SocketAddr) -> Self {
        self.config.bind_address = addr;
        self
    }

    /// Set the delivery used by plain `send`
    pub fn delivery(mut self, delivery: Delivery) -> Self {
        self.config.delivery = delivery;
        self
    }

    /// Set the largest payload per datagram
    pub fn max_datagram_size(mut self, bytes: usize) -> Self {
        self.config.max_datagram_size = bytes;
        self
    }

    /// Set how long to wait for an acknowledgement before resending
    pub fn resend_interval(mut self, interval: Duration) -> Self {
        self.config.resend_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    /// Set how many resends a datagram gets before the peer is lost
    pub fn max_resends(mut self, resends: u32) -> Self {
        self.config.max_resends = resends;
        self
    }

    /// Set how often an idle connection pings its peer
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    /// Set how long the peer may stay silent before it is lost
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set how long `close` waits for acknowledgements
    pub fn close_linger(mut self, linger: Duration) -> Self {
        self.config.close_linger_ms = linger.as_millis() as u64;
        self
    }

    /// Bind and connect with the configured settings
    pub async fn connect(mut self) -> Result<UdpTransport> {
        let addr = self
            .address
            .ok_or_else(|| Error::Config("Address not set".to_string()))?;
        self.config.validate()?;

        if addr.is_ipv6() && self.config.bind_address.is_ipv4() {
            self.config.bind_address = SocketAddr::from(([0u16; 8], 0));
        }

        let socket = UdpSocket::bind(self.config.bind_address).await?;
        socket.connect(addr).await?;
        debug!(peer = %addr, "UDP socket connected");

        let socket = Arc::new(socket);
        let buf = vec![0u8; self.config.max_datagram_size + HEADER_LEN];
        Ok(UdpTransport::from_parts(
            Link {
                socket: socket.clone(),
                peer: None,
            },
            Source::Socket(socket, buf),
            self.config,
        ))
    }
}

/// UDP listener that turns each new peer address into a connection
pub struct UdpTransportListener {
    socket: Arc<UdpSocket>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<UdpTransport>>,
    demux: JoinHandle<()>,
}

impl UdpTransportListener {
    /// Bind to a local address with the default configuration
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind_with(addr, UdpConfig::default()).await
    }

    /// Bind to a local address; `config` applies to every accepted peer
    pub async fn bind_with(addr: SocketAddr, config: UdpConfig) -> Result<Self> {
        config.validate()?;
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        debug!(%addr, "UDP listener bound");

        let (accept_tx, incoming) = mpsc::channel(64);
        let demux = tokio::spawn(demultiplex(socket.clone(), config, accept_tx));

        Ok(Self {
            socket,
            incoming: tokio::sync::Mutex::new(incoming),
            demux,
        })
    }

    /// Accept the next peer
    pub async fn accept(&self) -> Result<UdpTransport> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ConnectionClosed)
    }

    /// Get the local address this listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Into::into)
    }

    /// Stop routing datagrams; accepted connections stop receiving too
    pub async fn close(&mut self) -> Result<()> {
        self.demux.abort();
        Ok(())
    }
}

impl Drop for UdpTransportListener {
    fn drop(&mut self) {
        self.demux.abort();
    }
}

#[async_trait::async_trait]
impl crate::transport::TransportListener for UdpTransportListener {
    type Transport = UdpTransport;

    async fn accept(&self) -> Result<Self::Transport> {
        UdpTransportListener::accept(self).await
    }

    async fn close(&mut self) -> Result<()> {
        UdpTransportListener::close(self).await
    }
}

async fn demultiplex(
    socket: Arc<UdpSocket>,
    config: UdpConfig,
    accept_tx: mpsc::Sender<UdpTransport>,
) {
    let mut peers: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
    let mut buf = vec![0u8; config.max_datagram_size + HEADER_LEN];

    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                debug!(error = %e, "UDP listener receive failed");
                continue;
            }
        };
        let datagram = buf[..n].to_vec();
        let kind = datagram.first().copied();

        if let Some(tx) = peers.get(&peer) {
            match tx.try_send(datagram) {
                Ok(()) => continue,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(%peer, "peer queue full, dropping datagram");
                    continue;
                }
                Err(mpsc::error::TrySendError::Closed(returned)) => {
                    peers.remove(&peer);
                    if kind != Some(KIND_DATA) {
                        continue;
                    }
                    // the old connection is gone; this datagram opens a new one
                    if !open_peer(&socket, &config, &accept_tx, &mut peers, peer, returned).await {
                        break;
                    }
                    continue;
                }
            }
        }

        // only data opens a connection, stray acks and closes do not
        if kind != Some(KIND_DATA) {
            continue;
        }
        if !open_peer(&socket, &config, &accept_tx, &mut peers, peer, datagram).await {
            break;
        }
    }
}

/// Register a new peer and hand its transport to `accept`. Returns false
/// once the listener is gone.
async fn open_peer(
    socket: &Arc<UdpSocket>,
    config: &UdpConfig,
    accept_tx: &mpsc::Sender<UdpTransport>,
    peers: &mut HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>,
    peer: SocketAddr,
    first: Vec<u8>,
) -> bool {
    // connections whose receiving half is gone, including silent peers
    // that timed out, are forgotten here
    peers.retain(|_, tx| !tx.is_closed());

    let (tx, rx) = mpsc::channel(PEER_QUEUE);
    // cannot fail: the queue is fresh and the receiver is alive
    let _ = tx.try_send(first);
    let transport = UdpTransport::from_parts(
        Link {
            socket: socket.clone(),
            peer: Some(peer),
        },
        Source::Demux(rx),
        config.clone(),
    );
    peers.insert(peer, tx);
    debug!(%peer, "new UDP peer");
    accept_tx.send(transport).await.is_ok()
}
