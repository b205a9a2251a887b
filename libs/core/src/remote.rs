use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error carried back to the caller inside a Response envelope
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteError {
    /// The request named an actor id that is not bound on the channel
    #[error("request target not found")]
    TargetNotFound,

    /// The bound actor does not accept the payload's interface
    #[error("request handler not found")]
    HandlerNotFound,

    #[error("bad request: {0}")]
    BadRequest(String),

    /// Failure raised by the actor while handling the request
    #[error("{0}")]
    Application(String),
}

impl RemoteError {
    pub fn application(msg: impl Into<String>) -> Self {
        Self::Application(msg.into())
    }

    /// Routing errors are produced by the channel itself, never by an actor
    pub fn is_routing(&self) -> bool {
        matches!(self, Self::TargetNotFound | Self::HandlerNotFound)
    }
}
