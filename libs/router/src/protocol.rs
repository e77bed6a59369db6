//! Payload bodies of router and service messages, bincode encoded.

use serde::{Deserialize, Serialize};
use switchboard_core::{Address, Id};
use switchboard_runtime::{RequestResult, StubAddress};

/// Body of `RouterConnect`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub nick_name: String,
    pub protocol_version: u32,
}

/// Body of `RouterConnected`; the assigned cookie travels in `target`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectAccepted {
    pub protocol_version: u32,
}

/// Body of `TargetNotFound`: the undeliverable message, handed back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDelivery {
    pub message_id: u32,
    pub target: Id,
    pub payload: Vec<u8>,
}

/// Body of `ServiceRequest`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRequest {
    pub request_id: u32,
    pub proxy: Address,
    pub stub: Address,
    pub data: Vec<u8>,
}

/// Body of `ServiceResponse`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireResponse {
    pub request_id: u32,
    pub proxy: Address,
    pub stub: Address,
    pub result: RequestResult,
    pub data: Vec<u8>,
}

/// Body of `ServiceNotify`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireNotification {
    pub stub: StubAddress,
    pub notify_id: u32,
    pub data: Vec<u8>,
}
