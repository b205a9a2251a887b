use std::fmt;
use std::time::Duration;

use tether_core::{ActorId, NotificationId, ObserverId, RemoteError, RequestId};
use tokio::sync::{mpsc, oneshot, watch};

use crate::binding::BoundType;
use crate::channel::ChannelState;
use crate::error::{CallError, Error, Result};
use crate::observer::ObserverSink;
use crate::payload::{NotificationChannel, ObserverRef, Payload};
use crate::pending::Outcome;
use crate::runtime::ActorHandle;

/// Work posted to a channel's task
pub(crate) enum Command<P: Payload> {
    Request {
        actor_id: ActorId,
        payload: P,
        waiter: oneshot::Sender<Outcome<P>>,
        assigned: oneshot::Sender<Result<RequestId>>,
    },
    Tell {
        actor_id: ActorId,
        payload: P,
    },
    Cancel {
        correlation_id: RequestId,
    },
    Respond {
        sender: ActorHandle<P>,
        correlation_id: RequestId,
        outcome: std::result::Result<Option<P>, RemoteError>,
    },
    Notify {
        observer_id: ObserverId,
        notification_id: NotificationId,
        payload: P,
        report: Option<oneshot::Sender<Result<()>>>,
    },
    Bind {
        handle: ActorHandle<P>,
        types: Vec<BoundType<P::Interface>>,
        reply: oneshot::Sender<Result<ActorId>>,
    },
    Unbind {
        actor_id: ActorId,
        reply: oneshot::Sender<bool>,
    },
    Subscribe {
        sink: Box<dyn ObserverSink<P>>,
        reply: oneshot::Sender<Result<ObserverId>>,
    },
    Unsubscribe {
        observer_id: ObserverId,
    },
    Close,
}

/// Cloneable front of a running channel
///
/// Every operation is posted to the channel's task; nothing here touches the
/// channel's tables directly.
pub struct ChannelHandle<P: Payload> {
    commands: mpsc::UnboundedSender<Command<P>>,
    state: watch::Receiver<ChannelState>,
    default_timeout: Option<Duration>,
}

impl<P: Payload> ChannelHandle<P> {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command<P>>,
        state: watch::Receiver<ChannelState>,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            commands,
            state,
            default_timeout,
        }
    }

    fn post(&self, command: Command<P>) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::Closed)
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Resolves once the channel is `Closed`
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        // a dropped sender means the channel task is gone
        let _ = state.wait_for(|s| *s == ChannelState::Closed).await;
    }

    /// Resolves when the channel is `Open`, or fails if it closed first
    pub async fn opened(&self) -> Result<()> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| *s != ChannelState::Connecting)
            .await
            .map(|s| *s);
        match reached {
            Ok(ChannelState::Open) => Ok(()),
            _ => Err(Error::Closed),
        }
    }

    /// Issue a request and get back the call to wait on
    pub async fn send_request(&self, actor_id: ActorId, payload: P) -> Result<PendingCall<P>> {
        let (waiter, rx) = oneshot::channel();
        let (assigned, assigned_rx) = oneshot::channel();
        self.post(Command::Request {
            actor_id,
            payload,
            waiter,
            assigned,
        })?;
        let correlation_id = assigned_rx.await.map_err(|_| Error::Closed)??;
        Ok(PendingCall {
            correlation_id,
            rx,
            commands: self.commands.clone(),
            finished: false,
        })
    }

    /// Request and wait for the answer, bounded by the channel's default
    /// request timeout when one is configured
    pub async fn call(&self, actor_id: ActorId, payload: P) -> Result<Option<P>> {
        let pending = self.send_request(actor_id, payload).await?;
        let outcome = match self.default_timeout {
            Some(timeout) => pending.wait_timeout(timeout).await,
            None => pending.wait().await,
        };
        Ok(outcome?)
    }

    /// Request without wanting a response
    pub fn tell(&self, actor_id: ActorId, payload: P) -> Result<()> {
        self.post(Command::Tell { actor_id, payload })
    }

    /// Answer a request on behalf of `sender`
    ///
    /// Dropped with a warning when `sender` is no longer bound here.
    pub fn send_response(
        &self,
        sender: &ActorHandle<P>,
        correlation_id: RequestId,
        outcome: std::result::Result<Option<P>, RemoteError>,
    ) -> Result<()> {
        self.post(Command::Respond {
            sender: sender.clone(),
            correlation_id,
            outcome,
        })
    }

    /// Queue a notification; only a closed channel is reported
    pub fn send_notification(
        &self,
        observer_id: ObserverId,
        notification_id: NotificationId,
        payload: P,
    ) -> Result<()> {
        self.post(Command::Notify {
            observer_id,
            notification_id,
            payload,
            report: None,
        })
    }

    /// Send a notification and wait until the transport took it
    ///
    /// Fails with [`Error::Transport`] when the transport refused it, for
    /// instance because it exceeds the frame size.
    pub async fn deliver_notification(
        &self,
        observer_id: ObserverId,
        notification_id: NotificationId,
        payload: P,
    ) -> Result<()> {
        let (report, rx) = oneshot::channel();
        self.post(Command::Notify {
            observer_id,
            notification_id,
            payload,
            report: Some(report),
        })?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub fn notification_channel(&self) -> NotificationChannel<P> {
        NotificationChannel::new(self.commands.clone())
    }

    pub async fn bind<T>(&self, handle: ActorHandle<P>, types: T) -> Result<ActorId>
    where
        T: IntoIterator,
        T::Item: Into<BoundType<P::Interface>>,
    {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Bind {
            handle,
            types: types.into_iter().map(Into::into).collect(),
            reply,
        })?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// True if `actor_id` was bound
    pub async fn unbind(&self, actor_id: ActorId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Unbind { actor_id, reply })?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Register a sink and get the reference to hand to the remote side
    pub async fn subscribe(&self, sink: impl ObserverSink<P> + 'static) -> Result<ObserverRef<P>> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Subscribe {
            sink: Box::new(sink),
            reply,
        })?;
        let observer_id = rx.await.map_err(|_| Error::Closed)??;
        Ok(ObserverRef::new(observer_id))
    }

    pub fn unsubscribe(&self, observer_id: ObserverId) -> Result<()> {
        self.post(Command::Unsubscribe { observer_id })
    }

    /// Close the channel and wait until it is `Closed`
    pub async fn close(&self) {
        // already gone if the post fails
        let _ = self.post(Command::Close);
        self.closed().await;
    }
}

impl<P: Payload> Clone for ChannelHandle<P> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            state: self.state.clone(),
            default_timeout: self.default_timeout,
        }
    }
}

impl<P: Payload> fmt::Debug for ChannelHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// An issued request waiting for its response
///
/// Dropping it before the outcome arrives cancels the request locally; a
/// response arriving afterwards is discarded as stale.
pub struct PendingCall<P: Payload> {
    correlation_id: RequestId,
    rx: oneshot::Receiver<Outcome<P>>,
    commands: mpsc::UnboundedSender<Command<P>>,
    finished: bool,
}

impl<P: Payload> PendingCall<P> {
    pub fn correlation_id(&self) -> RequestId {
        self.correlation_id
    }

    pub async fn wait(mut self) -> Outcome<P> {
        let outcome = (&mut self.rx).await;
        self.finished = true;
        outcome.unwrap_or(Err(CallError::ChannelClosed))
    }

    pub async fn wait_timeout(mut self, timeout: Duration) -> Outcome<P> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(outcome) => {
                self.finished = true;
                outcome.unwrap_or(Err(CallError::ChannelClosed))
            }
            Err(_) => {
                self.abandon();
                Err(CallError::Timeout)
            }
        }
    }

    /// Give up on the response
    pub fn cancel(mut self) {
        self.abandon();
    }

    fn abandon(&mut self) {
        if !self.finished {
            self.finished = true;
            let _ = self.commands.send(Command::Cancel {
                correlation_id: self.correlation_id,
            });
        }
    }
}

impl<P: Payload> Drop for PendingCall<P> {
    fn drop(&mut self) {
        self.abandon();
    }
}

impl<P: Payload> fmt::Debug for PendingCall<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("correlation_id", &self.correlation_id)
            .field("finished", &self.finished)
            .finish()
    }
}
