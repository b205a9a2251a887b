//! Actor runtime contract and a tokio task implementation of it
//!
//! A channel only ever `tell`s a bound actor: it posts a [`RequestMessage`]
//! and moves on. Answers come back through the channel's outbound API.

use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tether_core::{ActorId, RemoteError, RequestId};
use tokio::sync::mpsc;
use tracing::{debug, Instrument};

use crate::binding::BoundType;
use crate::error::Result;
use crate::handle::ChannelHandle;
use crate::payload::Payload;

/// A request delivered to a bound actor
pub struct RequestMessage<P: Payload> {
    /// 0 when the caller wants no response
    pub correlation_id: RequestId,
    pub payload: P,
    /// Channel the request arrived on
    pub reply_to: ChannelHandle<P>,
}

impl<P: Payload> RequestMessage<P> {
    pub fn expects_reply(&self) -> bool {
        self.correlation_id != 0
    }
}

impl<P: Payload + fmt::Debug> fmt::Debug for RequestMessage<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestMessage")
            .field("correlation_id", &self.correlation_id)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Where an actor receives its requests
pub trait Mailbox<P: Payload>: Send + Sync + 'static {
    /// Post without waiting. A stopped actor silently discards.
    fn tell(&self, message: RequestMessage<P>);
}

/// Non-owning reference to a runtime actor
///
/// Two handles are the same actor when they share a mailbox.
pub struct ActorHandle<P: Payload>(Arc<dyn Mailbox<P>>);

impl<P: Payload> ActorHandle<P> {
    pub fn from_mailbox(mailbox: impl Mailbox<P>) -> Self {
        Self(Arc::new(mailbox))
    }

    pub fn tell(&self, message: RequestMessage<P>) {
        self.0.tell(message)
    }

    pub fn same_actor(&self, other: &Self) -> bool {
        Arc::as_ptr(&self.0) as *const () == Arc::as_ptr(&other.0) as *const ()
    }
}

impl<P: Payload> Clone for ActorHandle<P> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<P: Payload> fmt::Debug for ActorHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ActorHandle")
            .field(&(Arc::as_ptr(&self.0) as *const ()))
            .finish()
    }
}

/// Behaviour of an actor run by [`spawn_actor`]
#[async_trait]
pub trait Actor<P: Payload>: Send + 'static {
    async fn on_start(&mut self, _ctx: &ActorContext<P>) {}

    /// Handle one request; the result becomes the response when the caller
    /// asked for one
    async fn handle(
        &mut self,
        payload: P,
        ctx: &ActorContext<P>,
    ) -> std::result::Result<Option<P>, RemoteError>;

    async fn on_stop(&mut self) {}
}

/// What a running actor knows about itself and its channel
pub struct ActorContext<P: Payload> {
    myself: Weak<dyn Mailbox<P>>,
    channel: ChannelHandle<P>,
}

impl<P: Payload> ActorContext<P> {
    /// `None` once every handle to this actor is gone
    pub fn myself(&self) -> Option<ActorHandle<P>> {
        self.myself.upgrade().map(ActorHandle)
    }

    pub fn channel(&self) -> &ChannelHandle<P> {
        &self.channel
    }

    /// Start another actor on the same channel
    pub fn spawn(&self, actor: impl Actor<P>) -> ActorHandle<P> {
        spawn_actor(actor, self.channel.clone())
    }

    /// Start a child actor and bind it on this actor's channel
    pub async fn bind_child<T>(&self, actor: impl Actor<P>, types: T) -> Result<ActorId>
    where
        T: IntoIterator,
        T::Item: Into<BoundType<P::Interface>>,
    {
        let handle = self.spawn(actor);
        self.channel.bind(handle, types).await
    }
}

struct TaskMailbox<P: Payload> {
    tx: mpsc::UnboundedSender<RequestMessage<P>>,
}

impl<P: Payload> Mailbox<P> for TaskMailbox<P> {
    fn tell(&self, message: RequestMessage<P>) {
        let _ = self.tx.send(message);
    }
}

/// Run `actor` on its own task, serving requests one at a time
///
/// The actor stops when `channel` closes or when every handle to it is
/// dropped, running `on_stop` either way.
pub fn spawn_actor<P: Payload>(actor: impl Actor<P>, channel: ChannelHandle<P>) -> ActorHandle<P> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mailbox: Arc<dyn Mailbox<P>> = Arc::new(TaskMailbox { tx });
    let ctx = ActorContext {
        myself: Arc::downgrade(&mailbox),
        channel,
    };
    tokio::spawn(run_actor(actor, rx, ctx).in_current_span());
    ActorHandle(mailbox)
}

async fn run_actor<P: Payload, A: Actor<P>>(
    mut actor: A,
    mut inbox: mpsc::UnboundedReceiver<RequestMessage<P>>,
    ctx: ActorContext<P>,
) {
    actor.on_start(&ctx).await;

    loop {
        let message = tokio::select! {
            message = inbox.recv() => message,
            _ = ctx.channel.closed() => None,
        };
        let Some(RequestMessage {
            correlation_id,
            payload,
            reply_to,
        }) = message
        else {
            break;
        };

        let outcome = actor.handle(payload, &ctx).await;
        if correlation_id == 0 {
            if let Err(error) = outcome {
                debug!(%error, "one-way request failed");
            }
            continue;
        }
        match ctx.myself() {
            Some(me) => {
                if let Err(error) = reply_to.send_response(&me, correlation_id, outcome) {
                    debug!(%error, correlation_id, "response not sent");
                }
            }
            None => debug!(correlation_id, "actor released, response not sent"),
        }
    }

    actor.on_stop().await;
}
