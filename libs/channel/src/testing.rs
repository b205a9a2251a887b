//! Payload and mailbox doubles shared by the unit tests

use serde::{Deserialize, Serialize};
use tether_core::Tag;
use tokio::sync::mpsc;

use crate::payload::{NotificationChannel, ObserverRef, Payload};
use crate::runtime::{ActorHandle, Mailbox, RequestMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Iface {
    Greeter,
    Tagged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Msg {
    Greet(String),
    Reply(String),
    Count,
    Tagged { tag: Tag },
    Subscribe(ObserverRef<Msg>),
    Event(String),
}

impl Payload for Msg {
    type Interface = Iface;

    fn interface(&self) -> Option<Iface> {
        match self {
            Self::Greet(_) | Self::Count | Self::Subscribe(_) => Some(Iface::Greeter),
            Self::Tagged { .. } => Some(Iface::Tagged),
            Self::Reply(_) | Self::Event(_) => None,
        }
    }

    fn with_tag(self, tag: Tag) -> Self {
        match self {
            Self::Tagged { .. } => Self::Tagged { tag },
            other => other,
        }
    }

    fn bind_observers(self, channel: &NotificationChannel<Self>) -> Self {
        match self {
            Self::Subscribe(observer) => Self::Subscribe(observer.bound_to(channel)),
            other => other,
        }
    }
}

/// Mailbox that queues every request for the test to inspect
pub struct RecordingMailbox {
    tx: mpsc::UnboundedSender<RequestMessage<Msg>>,
}

impl RecordingMailbox {
    pub fn new() -> (ActorHandle<Msg>, mpsc::UnboundedReceiver<RequestMessage<Msg>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ActorHandle::from_mailbox(Self { tx }), rx)
    }
}

impl Mailbox<Msg> for RecordingMailbox {
    fn tell(&self, message: RequestMessage<Msg>) {
        let _ = self.tx.send(message);
    }
}
