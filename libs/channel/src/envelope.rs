//! The unit of protocol traffic and its codec contract

use serde::{Deserialize, Serialize};
use tether_core::{ActorId, NotificationId, ObserverId, RemoteError, RequestId};
use tether_fabric::codec::Codec;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    Request,
    Response,
    Notification,
}

/// One protocol message
///
/// `actor_id` is the target of a Request, the answering actor of a Response
/// and the observer of a Notification. `correlation_id` pairs a Request
/// with its Response (0 on a Request means no reply is wanted); on a
/// Notification it carries the notification id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<P> {
    pub kind: EnvelopeKind,
    pub actor_id: ActorId,
    pub correlation_id: RequestId,
    pub payload: Option<P>,
    pub error: Option<RemoteError>,
}

/// Why an envelope breaks the protocol's shape rules
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    #[error("request or notification without payload")]
    MissingPayload,

    #[error("error set on a request or notification")]
    UnexpectedError,

    #[error("response carries both payload and error")]
    PayloadAndError,
}

impl<P> Envelope<P> {
    pub fn request(actor_id: ActorId, correlation_id: RequestId, payload: P) -> Self {
        Self {
            kind: EnvelopeKind::Request,
            actor_id,
            correlation_id,
            payload: Some(payload),
            error: None,
        }
    }

    /// A response; `Ok(None)` answers a call with no return value
    pub fn response(
        actor_id: ActorId,
        correlation_id: RequestId,
        outcome: Result<Option<P>, RemoteError>,
    ) -> Self {
        let (payload, error) = match outcome {
            Ok(payload) => (payload, None),
            Err(error) => (None, Some(error)),
        };
        Self {
            kind: EnvelopeKind::Response,
            actor_id,
            correlation_id,
            payload,
            error,
        }
    }

    pub fn notification(
        observer_id: ObserverId,
        notification_id: NotificationId,
        payload: P,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Notification,
            actor_id: observer_id,
            correlation_id: notification_id,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn expects_reply(&self) -> bool {
        self.kind == EnvelopeKind::Request && self.correlation_id != 0
    }

    /// Check the shape rules: requests and notifications carry a payload
    /// and never an error, responses carry at most one of the two
    pub fn validate(&self) -> Result<(), Violation> {
        match self.kind {
            EnvelopeKind::Request | EnvelopeKind::Notification => {
                if self.error.is_some() {
                    Err(Violation::UnexpectedError)
                } else if self.payload.is_none() {
                    Err(Violation::MissingPayload)
                } else {
                    Ok(())
                }
            }
            EnvelopeKind::Response => {
                if self.payload.is_some() && self.error.is_some() {
                    Err(Violation::PayloadAndError)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// What a waiting caller gets out of a response
    pub fn into_outcome(self) -> Result<Option<P>, RemoteError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.payload),
        }
    }
}

impl<P: Serialize> Envelope<P> {
    pub fn encode<C: Codec>(&self, codec: &C) -> tether_fabric::Result<Vec<u8>> {
        codec.encode(self)
    }
}

impl<P: for<'de> Deserialize<'de>> Envelope<P> {
    pub fn decode<C: Codec>(codec: &C, bytes: &[u8]) -> tether_fabric::Result<Self> {
        codec.decode(bytes)
    }
}

/// First frame a client sends after the transport connects
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Token identifying an actor registered ahead of the connection
    pub token: Option<String>,
}
