use tether_core::{ObserverId, RemoteError};
use thiserror::Error;

/// Channel-local failure
#[derive(Error, Debug)]
pub enum Error {
    #[error("Channel closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(#[from] tether_fabric::Error),

    #[error(transparent)]
    Core(#[from] tether_core::Error),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Observer {0} is not bound to a channel")]
    ObserverUnbound(ObserverId),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Call failed: {0}")]
    Call(#[from] CallError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure delivered to a caller waiting on a request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The remote side answered with an error
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("channel closed")]
    ChannelClosed,

    #[error("request cancelled")]
    Cancelled,

    #[error("request timed out")]
    Timeout,

    /// The transport refused the request without losing the connection
    #[error("request not sent: {0}")]
    NotSent(String),
}

