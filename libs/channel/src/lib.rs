//! Tether Channel - binds remote peers to actors over any fabric transport
//!
//! A channel carries three kinds of envelopes over one connection: requests
//! addressed to actors bound on the receiving side, the responses that
//! answer them, and notifications for observers that live on the side that
//! subscribed them. Each channel owns its own binding table, correlation
//! table and observer registry, and runs on a single task.
//!
//! # Example
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use tether_channel::{ChannelConfig, ChannelFactory, Payload};
//! use tether_fabric::codec::BincodeCodec;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum Interface { Greeter }
//!
//! #[derive(Serialize, Deserialize)]
//! enum Message { Greet(String), Greeting(String) }
//!
//! impl Payload for Message {
//!     type Interface = Interface;
//!
//!     fn interface(&self) -> Option<Interface> {
//!         match self {
//!             Message::Greet(_) => Some(Interface::Greeter),
//!             Message::Greeting(_) => None,
//!         }
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let factory = ChannelFactory::new(ChannelConfig::tcp("127.0.0.1:9000"), BincodeCodec);
//! let channel = factory.create::<Message>()?;
//! channel.opened().await?;
//! let _reply = channel.call(1, Message::Greet("World".to_string())).await?;
//! # Ok(())
//! # }
//! ```

pub mod binding;
pub mod channel;
pub mod driver;
pub mod envelope;
pub mod error;
pub mod factory;
pub mod gateway;
pub mod handle;
pub mod observer;
pub mod payload;
pub mod pending;
pub mod runtime;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use binding::{BindingEntry, BindingTable, BoundType};
pub use channel::{ChannelCore, ChannelState, Role};
pub use driver::{spawn_client, ChannelOptions};
pub use envelope::{Envelope, EnvelopeKind, Hello};
pub use error::{CallError, Error, Result};
pub use factory::{ChannelConfig, ChannelFactory, TransportKind};
pub use gateway::{Binding, Gateway};
pub use handle::{ChannelHandle, PendingCall};
pub use observer::{Notification, ObserverRegistry, ObserverSink};
pub use payload::{NotificationChannel, ObserverRef, Payload};
pub use pending::{Outcome, PendingTable};
pub use runtime::{spawn_actor, Actor, ActorContext, ActorHandle, Mailbox, RequestMessage};
pub use tether_core::{ActorId, NotificationId, ObserverId, RemoteError, RequestId, Tag};
