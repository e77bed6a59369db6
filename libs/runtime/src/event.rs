//! Event objects exchanged between dispatchers.
//!
//! Every interaction with an active entity is turned into an [`Event`] and
//! posted into the owning dispatcher's queue through an [`EventSink`].

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use switchboard_core::Address;

use crate::service::{ConnectionStatus, ProxyAddress, StubAddress};
use crate::timer::{Timer, TimerId};

/// Anything that accepts events: local dispatchers, remote router links.
pub trait EventSink: Send + Sync {
    /// Enqueue an event. `false` means the receiver is gone and the event was
    /// not accepted; callers must not assume delivery.
    fn post(&self, event: Event) -> bool;
}

/// Runtime type of an event, used as the consumer-registration key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ServiceConnect,
    Request,
    Response,
    Notification,
    Timer,
    Shutdown,
    Custom(TypeId),
}

impl EventKind {
    pub fn custom<T: Any>() -> Self {
        EventKind::Custom(TypeId::of::<T>())
    }
}

#[derive(Debug)]
pub enum EventPayload {
    ServiceConnect(ServiceConnectEvent),
    Request(RequestEvent),
    Response(ResponseEvent),
    Notification(NotificationEvent),
    Timer(TimerEvent),
    Custom(CustomEvent),
    Shutdown,
}

#[derive(Debug)]
pub struct Event {
    pub payload: EventPayload,
    pub timestamp: Instant,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            timestamp: Instant::now(),
        }
    }

    pub fn custom<T: Any + Send + Sync>(value: T) -> Self {
        Self::new(EventPayload::Custom(CustomEvent::new(value)))
    }

    pub fn shutdown() -> Self {
        Self::new(EventPayload::Shutdown)
    }

    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::ServiceConnect(_) => EventKind::ServiceConnect,
            EventPayload::Request(_) => EventKind::Request,
            EventPayload::Response(_) => EventKind::Response,
            EventPayload::Notification(_) => EventKind::Notification,
            EventPayload::Timer(_) => EventKind::Timer,
            EventPayload::Custom(custom) => EventKind::Custom(custom.type_id),
            EventPayload::Shutdown => EventKind::Shutdown,
        }
    }
}

impl From<RequestEvent> for Event {
    fn from(event: RequestEvent) -> Self {
        Self::new(EventPayload::Request(event))
    }
}

impl From<ResponseEvent> for Event {
    fn from(event: ResponseEvent) -> Self {
        Self::new(EventPayload::Response(event))
    }
}

impl From<NotificationEvent> for Event {
    fn from(event: NotificationEvent) -> Self {
        Self::new(EventPayload::Notification(event))
    }
}

impl From<ServiceConnectEvent> for Event {
    fn from(event: ServiceConnectEvent) -> Self {
        Self::new(EventPayload::ServiceConnect(event))
    }
}

impl From<TimerEvent> for Event {
    fn from(event: TimerEvent) -> Self {
        Self::new(EventPayload::Timer(event))
    }
}

/// Status change of a proxy/stub binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConnectEvent {
    pub proxy: ProxyAddress,
    pub stub: Option<StubAddress>,
    pub status: ConnectionStatus,
}

/// Outcome carried by a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestResult {
    Ok,
    NotConnected,
    TargetNotFound,
    Failed,
}

/// Request travelling from a proxy to its stub
pub struct RequestEvent {
    pub request_id: u32,
    pub proxy: Address,
    pub stub: Address,
    pub data: Bytes,
    pub reply: Option<Arc<dyn EventSink>>,
}

impl RequestEvent {
    /// Build the matching response without sending it
    pub fn response(&self, result: RequestResult, data: impl Into<Bytes>) -> ResponseEvent {
        ResponseEvent {
            request_id: self.request_id,
            proxy: self.proxy,
            stub: self.stub,
            result,
            data: data.into(),
        }
    }

    /// Post a response to whoever issued the request
    pub fn respond(&self, result: RequestResult, data: impl Into<Bytes>) -> bool {
        match &self.reply {
            Some(sink) => sink.post(self.response(result, data).into()),
            None => false,
        }
    }
}

impl fmt::Debug for RequestEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestEvent")
            .field("request_id", &self.request_id)
            .field("proxy", &self.proxy)
            .field("stub", &self.stub)
            .field("data_len", &self.data.len())
            .field("has_reply", &self.reply.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEvent {
    pub request_id: u32,
    pub proxy: Address,
    pub stub: Address,
    pub result: RequestResult,
    pub data: Bytes,
}

/// Broadcast from a stub to its connected proxies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub notify_id: u32,
    pub source: Address,
    pub data: Bytes,
}

/// Posted by the timer service each time a timer expires
#[derive(Debug, Clone)]
pub struct TimerEvent {
    pub timer: Timer,
    pub generation: u64,
    pub sequence: u64,
    pub fired_at: Instant,
}

impl TimerEvent {
    pub fn timer_id(&self) -> TimerId {
        self.timer.id()
    }

    /// False once the timer was stopped or restarted after this firing was
    /// queued. Consumers drop inactive firings.
    pub fn is_active(&self) -> bool {
        self.timer.generation() == self.generation
    }
}

/// Application-defined event, dispatched by its concrete type
pub struct CustomEvent {
    type_id: TypeId,
    type_name: &'static str,
    value: Box<dyn Any + Send + Sync>,
}

impl CustomEvent {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            value: Box::new(value),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for CustomEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomEvent")
            .field("type", &self.type_name)
            .finish()
    }
}
