use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportReceiver, TransportSender};

/// In-process transport backed by a pair of bounded queues
///
/// Each queued message is one frame, so a bad frame never affects the next.
pub struct MemoryTransport {
    sender: MemorySender,
    receiver: MemoryReceiver,
}

impl MemoryTransport {
    /// Create two connected ends
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            Self {
                sender: MemorySender { tx: Some(a_tx) },
                receiver: MemoryReceiver { rx: a_rx },
            },
            Self {
                sender: MemorySender { tx: Some(b_tx) },
                receiver: MemoryReceiver { rx: b_rx },
            },
        )
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.sender.send(bytes).await
    }

    async fn receive(&mut self) -> Result<Vec<u8>> {
        self.receiver.receive().await
    }

    async fn close(&mut self) -> Result<()> {
        TransportSender::close(&mut self.sender).await
    }

    fn into_split(self: Box<Self>) -> (Box<dyn TransportSender>, Box<dyn TransportReceiver>) {
        (Box::new(self.sender), Box::new(self.receiver))
    }
}

struct MemorySender {
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

#[async_trait::async_trait]
impl TransportSender for MemorySender {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(Error::ConnectionClosed)?;
        tx.send(bytes.to_vec())
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

struct MemoryReceiver {
    rx: mpsc::Receiver<Vec<u8>>,
}

#[async_trait::async_trait]
impl TransportReceiver for MemoryReceiver {
    async fn receive(&mut self) -> Result<Vec<u8>> {
        self.rx.recv().await.ok_or(Error::ConnectionClosed)
    }

    fn resynchronizes(&self) -> bool {
        true
    }
}
