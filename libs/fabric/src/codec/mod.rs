use serde::{de::DeserializeOwned, Serialize};

use crate::error::Result;

pub mod bincode;

pub use self::bincode::BincodeCodec;

/// Codec for the structured payloads carried inside a [`Message`](crate::Message)
pub trait Codec: Send + Sync {
    /// Encode a value into payload bytes
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode payload bytes into a value
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}
