//! The protocol core of one channel
//!
//! [`ChannelCore`] owns the binding table, the correlation table and the
//! observer registry. It is driven from a single task: inbound envelopes go
//! through [`ChannelCore::on_envelope`], local operations arrive as commands,
//! and everything to be written is queued in the outbox for the driver to
//! flush. Nothing here performs I/O.

use std::collections::VecDeque;
use std::time::Duration;

use tether_core::{ActorId, NotificationId, ObserverId, RemoteError, RequestId, Tag};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::binding::{BindingTable, BoundType};
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::{CallError, Error, Result};
use crate::handle::{ChannelHandle, Command};
use crate::observer::{ObserverRegistry, ObserverSink};
use crate::payload::Payload;
use crate::pending::{Outcome, PendingTable};
use crate::runtime::{ActorHandle, RequestMessage};

/// Lifecycle of a channel; `Closed` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Which end of the handshake a channel plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Connects out and sends the hello frame
    Client,
    /// Accepted by a listener, waits for the hello frame
    Server,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

/// An envelope queued for the writer
pub(crate) struct Outgoing<P> {
    pub(crate) envelope: Envelope<P>,
    /// Told whether the envelope reached the transport
    pub(crate) report: Option<oneshot::Sender<Result<()>>>,
}

impl<P> Outgoing<P> {
    fn new(envelope: Envelope<P>) -> Self {
        Self {
            envelope,
            report: None,
        }
    }
}

/// What the writer knows about an envelope it failed to send
#[derive(Debug, Clone)]
pub(crate) struct Unsent {
    pub(crate) kind: EnvelopeKind,
    pub(crate) actor_id: ActorId,
    pub(crate) correlation_id: RequestId,
    /// The envelope already carried a [`RemoteError`]
    pub(crate) was_error: bool,
    pub(crate) reason: String,
}

impl Unsent {
    pub(crate) fn of<P>(envelope: &Envelope<P>, reason: String) -> Self {
        Self {
            kind: envelope.kind,
            actor_id: envelope.actor_id,
            correlation_id: envelope.correlation_id,
            was_error: envelope.error.is_some(),
            reason,
        }
    }
}

pub struct ChannelCore<P: Payload> {
    role: Role,
    state: watch::Sender<ChannelState>,
    bindings: BindingTable<P>,
    pending: PendingTable<P>,
    observers: ObserverRegistry<P>,
    outbox: VecDeque<Outgoing<P>>,
    handle: ChannelHandle<P>,
}

impl<P: Payload> ChannelCore<P> {
    pub(crate) fn new(
        role: Role,
        commands: mpsc::UnboundedSender<Command<P>>,
        default_timeout: Option<Duration>,
    ) -> Self {
        let (state, state_rx) = watch::channel(ChannelState::Connecting);
        Self {
            role,
            state,
            bindings: BindingTable::new(),
            pending: PendingTable::new(),
            observers: ObserverRegistry::new(),
            outbox: VecDeque::new(),
            handle: ChannelHandle::new(commands, state_rx, default_timeout),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Handle that posts back into this core
    pub fn handle(&self) -> &ChannelHandle<P> {
        &self.handle
    }

    pub fn bindings(&self) -> &BindingTable<P> {
        &self.bindings
    }

    pub fn pending(&self) -> &PendingTable<P> {
        &self.pending
    }

    pub fn observers(&self) -> &ObserverRegistry<P> {
        &self.observers
    }

    /// Envelopes queued for the transport, oldest first
    pub(crate) fn drain_outbox(&mut self) -> impl Iterator<Item = Outgoing<P>> + '_ {
        self.outbox.drain(..)
    }

    fn queue(&mut self, envelope: Envelope<P>) {
        self.outbox.push_back(Outgoing::new(envelope));
    }

    /// `Connecting` to `Open`; no effect in any other state
    pub(crate) fn open(&mut self) {
        self.state.send_if_modified(|state| {
            if *state == ChannelState::Connecting {
                *state = ChannelState::Open;
                true
            } else {
                false
            }
        });
    }

    fn ensure_accepting(&self) -> Result<()> {
        match self.state() {
            ChannelState::Connecting | ChannelState::Open => Ok(()),
            ChannelState::Closing | ChannelState::Closed => Err(Error::Closed),
        }
    }

    pub(crate) fn apply(&mut self, command: Command<P>) {
        match command {
            Command::Request {
                actor_id,
                payload,
                waiter,
                assigned,
            } => {
                let _ = assigned.send(self.send_request(actor_id, payload, waiter));
            }
            Command::Tell { actor_id, payload } => {
                if let Err(error) = self.tell(actor_id, payload) {
                    debug!(%error, actor_id, "one-way request not sent");
                }
            }
            Command::Cancel { correlation_id } => self.cancel(correlation_id),
            Command::Respond {
                sender,
                correlation_id,
                outcome,
            } => self.send_response(&sender, correlation_id, outcome),
            Command::Notify {
                observer_id,
                notification_id,
                payload,
                report,
            } => match self.ensure_accepting() {
                Ok(()) => self.outbox.push_back(Outgoing {
                    envelope: Envelope::notification(observer_id, notification_id, payload),
                    report,
                }),
                Err(error) => {
                    debug!(%error, observer_id, notification_id, "notification not sent");
                    if let Some(report) = report {
                        let _ = report.send(Err(error));
                    }
                }
            },
            Command::Bind {
                handle,
                types,
                reply,
            } => {
                let _ = reply.send(self.bind(handle, types));
            }
            Command::Unbind { actor_id, reply } => {
                let _ = reply.send(self.unbind(actor_id));
            }
            Command::Subscribe { sink, reply } => {
                let _ = reply.send(self.subscribe(sink));
            }
            Command::Unsubscribe { observer_id } => {
                self.unsubscribe(observer_id);
            }
            Command::Close => self.close(),
        }
    }

    /// Process one decoded inbound envelope
    pub fn on_envelope(&mut self, envelope: Envelope<P>) {
        if self.state() != ChannelState::Open {
            debug!(kind = ?envelope.kind, state = ?self.state(), "channel not open, envelope dropped");
            return;
        }
        if let Err(violation) = envelope.validate() {
            warn!(
                kind = ?envelope.kind,
                actor_id = envelope.actor_id,
                correlation_id = envelope.correlation_id,
                %violation,
                "malformed envelope"
            );
            if envelope.expects_reply() {
                self.reject(
                    envelope.actor_id,
                    envelope.correlation_id,
                    RemoteError::BadRequest(violation.to_string()),
                );
            }
            return;
        }

        let Envelope {
            kind,
            actor_id,
            correlation_id,
            payload,
            error,
        } = envelope;
        match (kind, payload) {
            (EnvelopeKind::Request, Some(payload)) => {
                self.on_request(actor_id, correlation_id, payload)
            }
            (EnvelopeKind::Notification, Some(payload)) => {
                self.observers.dispatch(actor_id, correlation_id, payload);
            }
            (EnvelopeKind::Response, payload) => {
                let outcome = match error {
                    Some(error) => Err(CallError::Remote(error)),
                    None => Ok(payload),
                };
                self.on_response(actor_id, correlation_id, outcome)
            }
            // validate() rules out payload-less requests and notifications
            (_, None) => {}
        }
    }

    fn on_request(&mut self, actor_id: ActorId, correlation_id: RequestId, payload: P) {
        let (handle, tag) = match self.route(actor_id, &payload) {
            Ok(route) => route,
            Err(error) => return self.reject(actor_id, correlation_id, error),
        };

        let payload = match tag {
            Some(tag) => payload.with_tag(tag),
            None => payload,
        };
        let payload = payload.bind_observers(&self.handle.notification_channel());

        trace!(actor_id, correlation_id, "request dispatched");
        handle.tell(RequestMessage {
            correlation_id,
            payload,
            reply_to: self.handle.clone(),
        });
    }

    /// Bound actor and tag override for a request, or why there is none
    fn route(
        &self,
        actor_id: ActorId,
        payload: &P,
    ) -> std::result::Result<(ActorHandle<P>, Option<Tag>), RemoteError> {
        let entry = match actor_id {
            0 => None,
            id => self.bindings.lookup(id),
        }
        .ok_or(RemoteError::TargetNotFound)?;
        let interface = payload
            .interface()
            .ok_or_else(|| RemoteError::BadRequest("payload is not a request".to_string()))?;
        let bound = entry
            .find_capability(interface)
            .ok_or(RemoteError::HandlerNotFound)?;
        Ok((entry.handle().clone(), bound.tag))
    }

    fn reject(&mut self, actor_id: ActorId, correlation_id: RequestId, error: RemoteError) {
        // routing misses are ordinary traffic; anything else is a misbehaving peer
        if error.is_routing() {
            debug!(actor_id, correlation_id, %error, "request rejected");
        } else {
            warn!(actor_id, correlation_id, %error, "request rejected");
        }
        if correlation_id != 0 {
            self.queue(Envelope::response(actor_id, correlation_id, Err(error)));
        }
    }

    fn on_response(&mut self, actor_id: ActorId, correlation_id: RequestId, outcome: Outcome<P>) {
        if !self.pending.resolve(correlation_id, outcome) {
            warn!(actor_id, correlation_id, "response without a pending request dropped");
        }
    }

    /// Queue a request and park `waiter` for its response
    pub fn send_request(
        &mut self,
        actor_id: ActorId,
        payload: P,
        waiter: oneshot::Sender<Outcome<P>>,
    ) -> Result<RequestId> {
        self.ensure_accepting()?;
        let correlation_id = self.pending.register(waiter)?;
        self.queue(Envelope::request(actor_id, correlation_id, payload));
        Ok(correlation_id)
    }

    /// Queue a request that wants no response
    pub fn tell(&mut self, actor_id: ActorId, payload: P) -> Result<()> {
        self.ensure_accepting()?;
        self.queue(Envelope::request(actor_id, 0, payload));
        Ok(())
    }

    /// Resolve a pending request locally as cancelled
    pub fn cancel(&mut self, correlation_id: RequestId) {
        if self
            .pending
            .resolve(correlation_id, Err(CallError::Cancelled))
        {
            debug!(correlation_id, "request cancelled");
        }
    }

    /// Queue a response from `sender`, addressed by its bound id
    pub fn send_response(
        &mut self,
        sender: &ActorHandle<P>,
        correlation_id: RequestId,
        outcome: std::result::Result<Option<P>, RemoteError>,
    ) {
        if self.ensure_accepting().is_err() {
            debug!(correlation_id, "channel closing, response dropped");
            return;
        }
        match self.bindings.actor_id_of(sender) {
            Some(actor_id) => self.queue(Envelope::response(actor_id, correlation_id, outcome)),
            None => warn!(correlation_id, "response from an unbound actor dropped"),
        }
    }

    pub fn send_notification(
        &mut self,
        observer_id: ObserverId,
        notification_id: NotificationId,
        payload: P,
    ) -> Result<()> {
        self.ensure_accepting()?;
        self.queue(Envelope::notification(observer_id, notification_id, payload));
        Ok(())
    }

    /// React to an envelope the transport refused without losing the
    /// connection
    ///
    /// A correlated request fails its waiter with [`CallError::NotSent`]. A
    /// response is replaced by an error response so the remote caller is not
    /// left waiting; a failed error response is only logged.
    pub(crate) fn on_unsent(&mut self, unsent: Unsent) {
        let Unsent {
            kind,
            actor_id,
            correlation_id,
            was_error,
            reason,
        } = unsent;
        match kind {
            EnvelopeKind::Request if correlation_id != 0 => {
                self.pending
                    .resolve(correlation_id, Err(CallError::NotSent(reason)));
            }
            EnvelopeKind::Response if !was_error && self.state() == ChannelState::Open => {
                self.queue(Envelope::response(
                    actor_id,
                    correlation_id,
                    Err(RemoteError::application(format!("response not sent: {reason}"))),
                ));
            }
            _ => {}
        }
    }

    pub fn bind<T>(&mut self, handle: ActorHandle<P>, types: T) -> Result<ActorId>
    where
        T: IntoIterator,
        T::Item: Into<BoundType<P::Interface>>,
    {
        self.ensure_accepting()?;
        let actor_id = self.bindings.bind(handle, types)?;
        debug!(actor_id, "actor bound");
        Ok(actor_id)
    }

    pub fn unbind(&mut self, actor_id: ActorId) -> bool {
        let removed = self.bindings.unbind(actor_id).is_some();
        if removed {
            debug!(actor_id, "actor unbound");
        }
        removed
    }

    pub fn subscribe(&mut self, sink: Box<dyn ObserverSink<P>>) -> Result<ObserverId> {
        self.ensure_accepting()?;
        let observer_id = self.observers.subscribe(sink)?;
        debug!(observer_id, "observer subscribed");
        Ok(observer_id)
    }

    pub fn unsubscribe(&mut self, observer_id: ObserverId) -> bool {
        self.observers.unsubscribe(observer_id)
    }

    /// Enter `Closing`: fail every pending request, drop observers and
    /// bindings. Calling it again has no further effect.
    pub fn close(&mut self) {
        let entered = self.state.send_if_modified(|state| match state {
            ChannelState::Connecting | ChannelState::Open => {
                *state = ChannelState::Closing;
                true
            }
            ChannelState::Closing | ChannelState::Closed => false,
        });
        if !entered {
            return;
        }
        let failed = self.pending.fail_all(CallError::ChannelClosed);
        let observers = self.observers.clear();
        let bindings = self.bindings.clear();
        info!(failed, observers, bindings, "channel closing");
    }

    /// Terminal transition, closing first if needed
    pub(crate) fn mark_closed(&mut self) {
        self.close();
        self.outbox.clear();
        self.state.send_replace(ChannelState::Closed);
    }
}

#[cfg(test)]
impl<P: Payload> ChannelCore<P> {
    /// A core with no driver; commands posted through its handle queue up
    /// on the returned receiver
    pub(crate) fn detached(role: Role) -> (Self, mpsc::UnboundedReceiver<Command<P>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(role, tx, None), rx)
    }

    /// Apply everything posted through handles so far
    pub(crate) fn pump(&mut self, commands: &mut mpsc::UnboundedReceiver<Command<P>>) {
        while let Ok(command) = commands.try_recv() {
            self.apply(command);
        }
    }
}
