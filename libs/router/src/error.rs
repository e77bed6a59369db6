use switchboard_core::Id;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Fabric error: {0}")]
    Fabric(#[from] switchboard_fabric::Error),

    #[error("Runtime error: {0}")]
    Runtime(#[from] switchboard_runtime::Error),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Not connected to the router")]
    NotConnected,

    #[error("Connection closed")]
    Closed,

    #[error("Outbox of connection {0} is full")]
    Backpressure(Id),

    #[error("No dispatcher named `{0}`")]
    UnknownDispatcher(String),
}

pub type Result<T> = std::result::Result<T, Error>;
