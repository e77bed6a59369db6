use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to spawn thread `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{0}` is stopped")]
    Stopped(String),

    #[error("dispatcher `{0}` already exists")]
    DuplicateDispatcher(String),

    #[error("invalid timer `{name}`: {reason}")]
    InvalidTimer { name: String, reason: &'static str },

    #[error("service proxy is not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by an [`EventConsumer`](crate::EventConsumer) for one event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ConsumerError(pub String);

impl From<String> for ConsumerError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

impl From<&str> for ConsumerError {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

pub type ConsumerResult = std::result::Result<(), ConsumerError>;
