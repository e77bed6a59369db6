use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use switchboard_core::{cookie, Address, Id};

use crate::codec::Codec;
use crate::error::{Error, Result};

/// Wire protocol version announced in the router handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default upper bound on a single payload (16 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Routing class of a message id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    System,
    Request,
    Response,
    Notification,
    Invalid,
}

/// Closed enumeration of message ids understood on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageId {
    RouterConnect = 0x0000_0101,
    RouterConnected = 0x0000_0102,
    RouterDisconnect = 0x0000_0103,
    TargetNotFound = 0x0000_0104,

    ServiceRequest = 0x0001_0001,
    ServiceResponse = 0x0001_0002,

    ServiceNotify = 0x0002_0001,
    ServiceAvailable = 0x0002_0002,
    ServiceUnavailable = 0x0002_0003,

    Invalid = 0xFFFF_FFFF,
}

impl MessageId {
    /// Map a raw id, unknown values become [`MessageId::Invalid`].
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0x0000_0101 => Self::RouterConnect,
            0x0000_0102 => Self::RouterConnected,
            0x0000_0103 => Self::RouterDisconnect,
            0x0000_0104 => Self::TargetNotFound,
            0x0001_0001 => Self::ServiceRequest,
            0x0001_0002 => Self::ServiceResponse,
            0x0002_0001 => Self::ServiceNotify,
            0x0002_0002 => Self::ServiceAvailable,
            0x0002_0003 => Self::ServiceUnavailable,
            _ => Self::Invalid,
        }
    }

    pub fn as_raw(self) -> u32 {
        self as u32
    }

    pub fn class(self) -> MessageClass {
        match self {
            Self::RouterConnect
            | Self::RouterConnected
            | Self::RouterDisconnect
            | Self::TargetNotFound => MessageClass::System,
            Self::ServiceRequest => MessageClass::Request,
            Self::ServiceResponse => MessageClass::Response,
            Self::ServiceNotify | Self::ServiceAvailable | Self::ServiceUnavailable => {
                MessageClass::Notification
            }
            Self::Invalid => MessageClass::Invalid,
        }
    }

    /// Request and response messages expect a `TargetNotFound` reply when
    /// their target is gone.
    pub fn expects_reply_on_failure(self) -> bool {
        matches!(self.class(), MessageClass::Request | MessageClass::Response)
    }
}

/// Framed message routed between processes.
///
/// `source` and `target` are connection cookies, `cookie` is the session
/// scope carried end to end and never interpreted by the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub source: Id,
    pub target: Id,
    pub cookie: Id,
    pub payload: Bytes,
}

impl Message {
    pub fn new(id: MessageId, source: Id, target: Id, cookie: Id, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            source,
            target,
            cookie,
            payload: payload.into(),
        }
    }

    /// Message without payload
    pub fn empty(id: MessageId, source: Id, target: Id, cookie: Id) -> Self {
        Self::new(id, source, target, cookie, Bytes::new())
    }

    /// Build a message whose payload is `body` encoded with `codec`.
    pub fn with_body<T, C>(
        id: MessageId,
        source: Id,
        target: Id,
        cookie: Id,
        body: &T,
        codec: &C,
    ) -> Result<Self>
    where
        T: Serialize,
        C: Codec,
    {
        let bytes = codec.encode(body)?;
        Ok(Self::new(id, source, target, cookie, bytes))
    }

    /// Decode the payload as `T`
    pub fn decode_body<T, C>(&self, codec: &C) -> Result<T>
    where
        T: DeserializeOwned,
        C: Codec,
    {
        codec.decode(&self.payload)
    }

    /// Empty message of kind `id` addressed back to this message's sender.
    pub fn reply(&self, id: MessageId, from: Id) -> Self {
        Self::empty(id, from, self.source, self.cookie)
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_broadcast(&self) -> bool {
        self.target == cookie::BROADCAST
    }

    pub fn address(&self) -> Address {
        Address::new(self.source, self.target, self.cookie)
    }

    /// Encode header and payload into one contiguous frame
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + self.payload.len());
        FrameHeader::of(self).write_to(&mut buf);
        buf.put_slice(&self.payload);
        buf
    }
}

/// Fixed-size frame header preceding every payload on the wire.
///
/// Layout: `[id: u32][source: u64][target: u64][cookie: u64][len: u32]`,
/// little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub id: MessageId,
    pub source: Id,
    pub target: Id,
    pub cookie: Id,
    pub payload_len: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 32;

    pub fn of(message: &Message) -> Self {
        Self {
            id: message.id,
            source: message.source,
            target: message.target,
            cookie: message.cookie,
            payload_len: message.payload.len() as u32,
        }
    }

    pub fn write_to<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.id.as_raw());
        buf.put_u64_le(self.source);
        buf.put_u64_le(self.target);
        buf.put_u64_le(self.cookie);
        buf.put_u32_le(self.payload_len);
    }

    pub fn decode(raw: &[u8; Self::SIZE]) -> Self {
        let mut buf = &raw[..];
        Self {
            id: MessageId::from_raw(buf.get_u32_le()),
            source: buf.get_u64_le(),
            target: buf.get_u64_le(),
            cookie: buf.get_u64_le(),
            payload_len: buf.get_u32_le(),
        }
    }

    /// Reject declared lengths above `max_payload` before allocating.
    pub fn check_len(&self, max_payload: usize) -> Result<usize> {
        let len = self.payload_len as usize;
        if len > max_payload {
            return Err(Error::InvalidFrame(format!(
                "Message too large: {} bytes",
                len
            )));
        }
        Ok(len)
    }

    pub fn into_message(self, payload: Bytes) -> Message {
        Message {
            id: self.id,
            source: self.source,
            target: self.target,
            cookie: self.cookie,
            payload,
        }
    }
}

/// Payload length as carried by the `u32` header field.
pub fn wire_payload_len(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| Error::InvalidFrame(format!("Payload does not fit a frame: {} bytes", len)))
}

/// Decode one complete frame from `bytes`.
///
/// Returns `None` when the buffer does not yet hold a full frame.
pub fn decode_frame(bytes: &mut BytesMut, max_payload: usize) -> Result<Option<Message>> {
    if bytes.len() < FrameHeader::SIZE {
        return Ok(None);
    }

    let mut raw = [0u8; FrameHeader::SIZE];
    raw.copy_from_slice(&bytes[..FrameHeader::SIZE]);
    let header = FrameHeader::decode(&raw);
    let len = header.check_len(max_payload)?;

    if bytes.len() < FrameHeader::SIZE + len {
        return Ok(None);
    }

    bytes.advance(FrameHeader::SIZE);
    let payload = bytes.split_to(len).freeze();
    Ok(Some(header.into_message(payload)))
}
