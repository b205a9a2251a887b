//! What a payload type must provide to travel through a channel
//!
//! Payloads are closed enums. Each request variant names the interface it
//! belongs to, and a binding lists the interfaces its actor accepts. Two
//! optional transforms run on a decoded request right before dispatch:
//! stamping the binding's tag into it, and binding embedded observer
//! references to the channel the request arrived on.

use std::fmt;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tether_core::{NotificationId, ObserverId, Tag};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::handle::Command;

/// A value that can travel in an envelope
///
/// Queued envelopes are borrowed by the writer task while they are encoded,
/// so payloads must be `Sync` as well as `Send`.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Capability marker a request is addressed to
    type Interface: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// The interface this value is a request for, `None` for values that
    /// only travel as results or notifications
    fn interface(&self) -> Option<Self::Interface>;

    /// Stamp a binding's override tag into the value
    fn with_tag(self, tag: Tag) -> Self {
        let _ = tag;
        self
    }

    /// Route every embedded [`ObserverRef`] back through `channel`
    fn bind_observers(self, channel: &NotificationChannel<Self>) -> Self {
        let _ = channel;
        self
    }
}

/// Outbound notification path of one channel
///
/// Handed to payloads during dispatch so actors can notify observers living
/// on the far side of that channel.
pub struct NotificationChannel<P: Payload> {
    commands: mpsc::UnboundedSender<Command<P>>,
}

impl<P: Payload> NotificationChannel<P> {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command<P>>) -> Self {
        Self { commands }
    }

    pub fn notify(
        &self,
        observer_id: ObserverId,
        notification_id: NotificationId,
        payload: P,
    ) -> Result<()> {
        self.commands
            .send(Command::Notify {
                observer_id,
                notification_id,
                payload,
                report: None,
            })
            .map_err(|_| Error::Closed)
    }

    /// Like [`notify`](Self::notify), but wait for the transport's verdict
    pub async fn deliver(
        &self,
        observer_id: ObserverId,
        notification_id: NotificationId,
        payload: P,
    ) -> Result<()> {
        let (report, rx) = oneshot::channel();
        self.commands
            .send(Command::Notify {
                observer_id,
                notification_id,
                payload,
                report: Some(report),
            })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// True once the channel behind this path has shut down
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

impl<P: Payload> Clone for NotificationChannel<P> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
        }
    }
}

/// Reference to a client-side observer, carried inside payloads
///
/// Only the id crosses the wire. On the receiving side the reference starts
/// out unbound and is bound to the arrival channel before dispatch.
pub struct ObserverRef<P: Payload> {
    id: ObserverId,
    channel: Option<NotificationChannel<P>>,
}

impl<P: Payload> ObserverRef<P> {
    pub fn new(id: ObserverId) -> Self {
        Self { id, channel: None }
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }

    pub fn is_bound(&self) -> bool {
        self.channel.is_some()
    }

    /// The same reference, routed through `channel`
    pub fn bound_to(self, channel: &NotificationChannel<P>) -> Self {
        Self {
            id: self.id,
            channel: Some(channel.clone()),
        }
    }

    /// Send a notification to the observer
    pub fn notify(&self, notification_id: NotificationId, payload: P) -> Result<()> {
        match &self.channel {
            Some(channel) => channel.notify(self.id, notification_id, payload),
            None => Err(Error::ObserverUnbound(self.id)),
        }
    }

    /// Send a notification and wait until the transport took it
    pub async fn deliver(&self, notification_id: NotificationId, payload: P) -> Result<()> {
        match &self.channel {
            Some(channel) => channel.deliver(self.id, notification_id, payload).await,
            None => Err(Error::ObserverUnbound(self.id)),
        }
    }
}

impl<P: Payload> Clone for ObserverRef<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            channel: self.channel.clone(),
        }
    }
}

impl<P: Payload> fmt::Debug for ObserverRef<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverRef")
            .field("id", &self.id)
            .field("bound", &self.is_bound())
            .finish()
    }
}

impl<P: Payload> PartialEq for ObserverRef<P> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<P: Payload> Eq for ObserverRef<P> {}

impl<P: Payload> Serialize for ObserverRef<P> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.id.serialize(serializer)
    }
}

impl<'de, P: Payload> Deserialize<'de> for ObserverRef<P> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        ObserverId::deserialize(deserializer).map(Self::new)
    }
}
