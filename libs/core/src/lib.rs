//! Tether Core - identifiers and errors shared by every tether crate

pub mod error;
pub mod ids;
pub mod remote;

pub use error::{Error, Result};
pub use ids::{ActorId, IdAllocator, NotificationId, ObserverId, RequestId, Tag};
pub use remote::RemoteError;
