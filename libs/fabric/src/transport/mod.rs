use std::fmt;

use crate::error::Result;
use crate::message::Message;

pub mod framed;
pub mod tcp;
pub mod unix;

pub use self::framed::{FramedReader, FramedWriter};
pub use self::tcp::{TcpTransport, TcpTransportBuilder, TcpTransportListener};
pub use self::unix::{UnixTransport, UnixTransportBuilder, UnixTransportListener};

/// Remote side of a connection, as seen by the accept policy
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerInfo {
    pub label: String,
}

impl PeerInfo {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Receive half of a connection
#[async_trait::async_trait]
pub trait MessageReader: Send {
    /// Read the next complete message
    async fn read_message(&mut self) -> Result<Message>;
}

/// Send half of a connection
#[async_trait::async_trait]
pub trait MessageWriter: Send {
    /// Write one message and flush it
    async fn write_message(&mut self, message: &Message) -> Result<()>;

    /// Shut down the write direction
    async fn shutdown(&mut self) -> Result<()>;
}

/// Transport trait for sending and receiving framed messages
///
/// Each transport instance represents a single connection.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send a message over the transport
    async fn send(&mut self, message: &Message) -> Result<()>;

    /// Receive a message from the transport
    async fn receive(&mut self) -> Result<Message>;

    /// Close the transport connection
    async fn close(&mut self) -> Result<()>;

    /// Describe the remote end
    fn peer_info(&self) -> PeerInfo;

    /// Split into independently driven receive and send halves
    fn into_split(self: Box<Self>) -> (Box<dyn MessageReader>, Box<dyn MessageWriter>);
}

/// Listener producing one transport per accepted connection
#[async_trait::async_trait]
pub trait TransportListener: Send + Sync {
    type Transport: Transport + 'static;

    /// Accept an incoming connection
    async fn accept(&self) -> Result<(Self::Transport, PeerInfo)>;

    /// Describe the local endpoint
    fn local_label(&self) -> String;

    /// Close the listener
    async fn close(&mut self) -> Result<()>;
}
