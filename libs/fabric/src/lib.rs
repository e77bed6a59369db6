//! Switchboard Fabric - wire framing and socket transports
//!
//! Provides the [`Message`] envelope with its fixed 32-byte frame header,
//! payload codecs (bincode) and transports (TCP, Unix sockets) that can be
//! split into independent receive and send halves.
//!
//! # Example
//!
//! ```no_run
//! use switchboard_fabric::{Message, MessageId, transport::{TcpTransport, Transport}};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let addr = "127.0.0.1:8181".parse()?;
//! let mut transport = TcpTransport::connect(addr).await?;
//!
//! let msg = Message::new(MessageId::ServiceNotify, 0, u64::MAX, 0, b"hello".to_vec());
//! transport.send(&msg).await?;
//! let reply = transport.receive().await?;
//! println!("{:?}", reply.id);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod error;
pub mod message;
pub mod transport;

// Re-exports for convenience
pub use error::{Error, Result};
pub use message::{FrameHeader, Message, MessageClass, MessageId};
pub use transport::PeerInfo;
