use std::collections::HashMap;

use tether_core::{IdAllocator, NotificationId, ObserverId};
use tokio::sync::mpsc;
use tracing::trace;

/// A notification as handed to an observer sink
#[derive(Debug, Clone, PartialEq)]
pub struct Notification<P> {
    pub observer_id: ObserverId,
    pub notification_id: NotificationId,
    pub payload: P,
}

/// Receiver of notifications for one observer id
///
/// Runs on the channel's task, so implementations must not block.
pub trait ObserverSink<P>: Send {
    fn on_notification(&mut self, notification: Notification<P>);
}

impl<P, F> ObserverSink<P> for F
where
    F: FnMut(Notification<P>) + Send,
{
    fn on_notification(&mut self, notification: Notification<P>) {
        self(notification)
    }
}

impl<P: Send> ObserverSink<P> for mpsc::UnboundedSender<Notification<P>> {
    fn on_notification(&mut self, notification: Notification<P>) {
        // a dropped receiver just means nobody is listening any more
        let _ = self.send(notification);
    }
}

/// Observer id to sink routing for one channel
pub struct ObserverRegistry<P> {
    sinks: HashMap<ObserverId, Box<dyn ObserverSink<P>>>,
    ids: IdAllocator,
}

impl<P> Default for ObserverRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> ObserverRegistry<P> {
    pub fn new() -> Self {
        Self {
            sinks: HashMap::new(),
            ids: IdAllocator::new("observer"),
        }
    }

    pub fn subscribe(&mut self, sink: Box<dyn ObserverSink<P>>) -> tether_core::Result<ObserverId> {
        let id = self.ids.next_id()?;
        self.sinks.insert(id, sink);
        Ok(id)
    }

    /// False when `observer_id` was not subscribed
    pub fn unsubscribe(&mut self, observer_id: ObserverId) -> bool {
        self.sinks.remove(&observer_id).is_some()
    }

    /// Hand a notification to its sink. A miss is not an error.
    pub fn dispatch(
        &mut self,
        observer_id: ObserverId,
        notification_id: NotificationId,
        payload: P,
    ) -> bool {
        match self.sinks.get_mut(&observer_id) {
            Some(sink) => {
                sink.on_notification(Notification {
                    observer_id,
                    notification_id,
                    payload,
                });
                true
            }
            None => {
                trace!(observer_id, notification_id, "no observer, notification dropped");
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Drop every sink, returning how many there were
    pub fn clear(&mut self) -> usize {
        let count = self.sinks.len();
        self.sinks.clear();
        count
    }
}
