//! Tether Fabric - Low-level transport and codec layer
//!
//! Provides transport abstractions (TCP, Unix sockets, UDP, in-memory) and
//! codec support (bincode, JSON) underneath tether channels.
//!
//! # Example
//!
//! ```no_run
//! use tether_fabric::{Connection, codec::BincodeCodec};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct MyRequest { data: String }
//!
//! #[derive(Serialize, Deserialize)]
//! struct MyResponse { result: i32 }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let addr = "127.0.0.1:8080".parse()?;
//! let mut connection = Connection::tcp(addr, BincodeCodec).await?;
//! connection.send(&MyRequest { data: "hello".to_string() }).await?;
//! let resp: MyResponse = connection.receive().await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod connection;
pub mod error;
pub mod transport;

// Re-exports for convenience
pub use connection::{Connection, ConnectionReceiver, ConnectionSender};
pub use error::{Error, Result};
