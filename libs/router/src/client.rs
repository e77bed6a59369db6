//! Router client: the remote service handler of a client process.
//!
//! Outbound, a [`RemoteSink`] turns request and response events into framed
//! messages addressed to a peer cookie. Inbound, messages from the router are
//! decoded into events for local dispatchers, and stub announcements update
//! the local [`ServiceRegistry`].

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use switchboard_core::{cookie, Id, UNKNOWN_ID};
use switchboard_fabric::codec::{BincodeCodec, Codec};
use switchboard_fabric::message::PROTOCOL_VERSION;
use switchboard_fabric::transport::{MessageReader, MessageWriter, Transport};
use switchboard_fabric::{Message, MessageId};
use switchboard_runtime::{
    Event, EventPayload, EventSink, RequestEvent, RequestResult, ResponseEvent, Runtime,
    ServiceRegistry, StubAddress,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::{
    ConnectAccepted, ConnectRequest, FailedDelivery, WireNotification, WireRequest, WireResponse,
};

#[derive(Clone)]
struct Attachment {
    registry: Arc<ServiceRegistry>,
    /// Receives responses whose proxy is no longer registered.
    fallback: Arc<dyn EventSink>,
}

struct ClientShared {
    cookie: Id,
    nick_name: String,
    config: ClientConfig,
    outbox: mpsc::Sender<Message>,
    cancel: CancellationToken,
    attachment: RwLock<Option<Attachment>>,
    /// Stubs announced by peers, with the cookie of the announcing peer.
    remote_stubs: Mutex<Vec<(Id, StubAddress)>>,
}

impl ClientShared {
    fn enqueue(&self, message: Message) -> bool {
        match self.outbox.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(cookie = self.cookie, "outbound message dropped: {e}");
                false
            }
        }
    }

    fn remote_sink(self: &Arc<Self>, target: Id) -> Arc<dyn EventSink> {
        Arc::new(RemoteSink {
            client: Arc::downgrade(self),
            target,
        })
    }

    /// Withdraw stubs announced by `peer`, or by every peer when `None`
    fn withdraw_remote_stubs(&self, peer: Option<Id>) {
        let withdrawn: Vec<StubAddress> = {
            let mut stubs = self.remote_stubs.lock();
            let (gone, kept): (Vec<_>, Vec<_>) = stubs
                .drain(..)
                .partition(|(owner, _)| peer.map_or(true, |peer| *owner == peer));
            *stubs = kept;
            gone.into_iter().map(|(_, stub)| stub).collect()
        };

        if let Some(attachment) = self.attachment.read().clone() {
            for stub in &withdrawn {
                attachment.registry.stub_unavailable(stub);
            }
        }
    }
}

/// Connection of one process to the router
pub struct RouterClient {
    shared: Arc<ClientShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RouterClient {
    /// Perform the `RouterConnect` handshake over `transport` and start the
    /// receive and send tasks.
    pub async fn connect<T>(
        mut transport: T,
        nick_name: impl Into<String>,
        config: ClientConfig,
    ) -> Result<Self>
    where
        T: Transport + 'static,
    {
        let nick_name = nick_name.into();
        let request = Message::with_body(
            MessageId::RouterConnect,
            UNKNOWN_ID,
            cookie::ROUTER,
            UNKNOWN_ID,
            &ConnectRequest {
                nick_name: nick_name.clone(),
                protocol_version: PROTOCOL_VERSION,
            },
            &BincodeCodec,
        )?;

        let handshake = async {
            transport.send(&request).await?;
            transport.receive().await
        };
        let reply = match config.connect_timeout.as_duration() {
            Some(limit) => tokio::time::timeout(limit, handshake)
                .await
                .map_err(|_| Error::Handshake("no RouterConnected in time".to_string()))??,
            None => handshake.await?,
        };

        if reply.id != MessageId::RouterConnected || cookie::is_reserved(reply.target) {
            return Err(Error::Handshake(format!(
                "unexpected reply {:?} for cookie {}",
                reply.id, reply.target
            )));
        }
        let accepted: ConnectAccepted = reply.decode_body(&BincodeCodec)?;
        if accepted.protocol_version != PROTOCOL_VERSION {
            return Err(Error::Handshake(format!(
                "router speaks protocol {}",
                accepted.protocol_version
            )));
        }

        let cookie = reply.target;
        tracing::info!(cookie, %nick_name, "connected to router");

        let (reader, writer) = Box::new(transport).into_split();
        let (outbox_tx, outbox_rx) = mpsc::channel(config.outbox_capacity.max(1));
        let shared = Arc::new(ClientShared {
            cookie,
            nick_name,
            config,
            outbox: outbox_tx,
            cancel: CancellationToken::new(),
            attachment: RwLock::new(None),
            remote_stubs: Mutex::new(Vec::new()),
        });

        let tasks = vec![
            tokio::spawn(receive_loop(reader, shared.clone())),
            tokio::spawn(send_loop(writer, outbox_rx, shared.cancel.clone())),
        ];

        Ok(Self {
            shared,
            tasks: Mutex::new(tasks),
        })
    }

    /// Cookie assigned by the router
    pub fn cookie(&self) -> Id {
        self.shared.cookie
    }

    pub fn nick_name(&self) -> &str {
        &self.shared.nick_name
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.cancel.is_cancelled()
    }

    /// Route inbound traffic into `runtime`; responses for unknown proxies go
    /// to the dispatcher named `default_dispatcher`.
    pub fn attach(&self, runtime: &Runtime, default_dispatcher: &str) -> Result<()> {
        let fallback = runtime
            .dispatcher(default_dispatcher)
            .ok_or_else(|| Error::UnknownDispatcher(default_dispatcher.to_string()))?;

        *self.shared.attachment.write() = Some(Attachment {
            registry: runtime.registry().clone(),
            fallback: fallback.sink(),
        });

        let known = self.shared.remote_stubs.lock().clone();
        for (peer, stub) in known {
            runtime
                .registry()
                .stub_available(stub, self.shared.remote_sink(peer));
        }
        Ok(())
    }

    /// Queue a message for the router, stamped with this client's cookie
    pub async fn send(&self, mut message: Message) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        message.source = self.shared.cookie;

        let send = self.shared.outbox.send(message);
        match self.shared.config.send_timeout.as_duration() {
            Some(limit) => match tokio::time::timeout(limit, send).await {
                Ok(sent) => sent.map_err(|_| Error::Closed),
                Err(_) => Err(Error::Backpressure(self.shared.cookie)),
            },
            None => send.await.map_err(|_| Error::Closed),
        }
    }

    /// Event sink forwarding requests and responses to the peer `target`
    pub fn remote_sink(&self, target: Id) -> Arc<dyn EventSink> {
        self.shared.remote_sink(target)
    }

    /// Announce a local stub to every peer
    pub async fn publish_stub(&self, stub: &StubAddress) -> Result<()> {
        self.broadcast(MessageId::ServiceAvailable, stub.channel.cookie, stub)
            .await
    }

    pub async fn withdraw_stub(&self, stub: &StubAddress) -> Result<()> {
        self.broadcast(MessageId::ServiceUnavailable, stub.channel.cookie, stub)
            .await
    }

    /// Send a notification from a local stub to connected remote proxies
    pub async fn notify(
        &self,
        stub: &StubAddress,
        notify_id: u32,
        data: impl Into<Bytes>,
    ) -> Result<()> {
        let body = WireNotification {
            stub: stub.clone(),
            notify_id,
            data: data.into().to_vec(),
        };
        self.broadcast(MessageId::ServiceNotify, stub.channel.cookie, &body)
            .await
    }

    /// Send `RouterDisconnect` and wait for both tasks to finish
    pub async fn disconnect(&self) {
        if self.is_connected() {
            let bye = Message::empty(
                MessageId::RouterDisconnect,
                self.shared.cookie,
                cookie::ROUTER,
                UNKNOWN_ID,
            );
            if self.shared.outbox.send(bye).await.is_err() {
                self.shared.cancel.cancel();
            }
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "client task failed");
            }
        }
        tracing::info!(cookie = self.shared.cookie, "disconnected from router");
    }

    async fn broadcast<T: serde::Serialize>(
        &self,
        id: MessageId,
        scope: Id,
        body: &T,
    ) -> Result<()> {
        let message = Message::with_body(
            id,
            self.shared.cookie,
            cookie::BROADCAST,
            scope,
            body,
            &BincodeCodec,
        )?;
        self.send(message).await
    }
}

impl Drop for RouterClient {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl fmt::Debug for RouterClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterClient")
            .field("cookie", &self.shared.cookie)
            .field("nick_name", &self.shared.nick_name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Forwards events to a peer process through the router
pub struct RemoteSink {
    client: Weak<ClientShared>,
    target: Id,
}

impl RemoteSink {
    pub fn target(&self) -> Id {
        self.target
    }
}

impl EventSink for RemoteSink {
    fn post(&self, event: Event) -> bool {
        let Some(client) = self.client.upgrade() else {
            return false;
        };

        let message = match event.payload {
            EventPayload::Request(request) => Message::with_body(
                MessageId::ServiceRequest,
                client.cookie,
                self.target,
                request.proxy.cookie,
                &WireRequest {
                    request_id: request.request_id,
                    proxy: request.proxy,
                    stub: request.stub,
                    data: request.data.to_vec(),
                },
                &BincodeCodec,
            ),
            EventPayload::Response(response) => Message::with_body(
                MessageId::ServiceResponse,
                client.cookie,
                self.target,
                response.proxy.cookie,
                &WireResponse {
                    request_id: response.request_id,
                    proxy: response.proxy,
                    stub: response.stub,
                    result: response.result,
                    data: response.data.to_vec(),
                },
                &BincodeCodec,
            ),
            // Connection bookkeeping stays with the peer's own registry.
            EventPayload::ServiceConnect(_) => return true,
            _ => {
                tracing::trace!(target = self.target, "event kind is not forwarded");
                return false;
            }
        };

        match message {
            Ok(message) => client.enqueue(message),
            Err(e) => {
                tracing::warn!(target = self.target, error = %e, "failed to encode event");
                false
            }
        }
    }
}

impl fmt::Debug for RemoteSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSink")
            .field("target", &self.target)
            .finish()
    }
}

#[tracing::instrument(name = "client_receive", skip_all, fields(cookie = shared.cookie))]
async fn receive_loop(mut reader: Box<dyn MessageReader>, shared: Arc<ClientShared>) {
    loop {
        let result = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            result = reader.read_message() => result,
        };

        match result {
            Ok(message) => handle_inbound(&shared, message),
            Err(switchboard_fabric::Error::ConnectionClosed) => {
                tracing::info!("router closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "receive failed");
                break;
            }
        }
    }

    shared.cancel.cancel();
    shared.withdraw_remote_stubs(None);
}

async fn send_loop(
    mut writer: Box<dyn MessageWriter>,
    mut outbox: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = outbox.recv() => next,
        };
        let Some(message) = next else {
            break;
        };

        if let Err(e) = writer.write_message(&message).await {
            tracing::warn!(id = ?message.id, error = %e, "send failed");
            break;
        }
        if message.id == MessageId::RouterDisconnect {
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        tracing::trace!(error = %e, "shutdown after send loop");
    }
    cancel.cancel();
}

fn handle_inbound(shared: &Arc<ClientShared>, message: Message) {
    // Stub bookkeeping also runs unattached; `attach` registers what was seen.
    let handled = match message.id {
        MessageId::ServiceAvailable => on_available(shared, &message),
        MessageId::ServiceUnavailable => on_unavailable(shared, &message),
        MessageId::RouterDisconnect => {
            tracing::debug!(peer = message.source, "peer left");
            shared.withdraw_remote_stubs(Some(message.source));
            Ok(())
        }
        id => {
            let Some(attachment) = shared.attachment.read().clone() else {
                tracing::debug!(?id, "not attached to a runtime, message dropped");
                return;
            };
            match id {
                MessageId::ServiceRequest => on_request(shared, &attachment, &message),
                MessageId::ServiceResponse => on_response(&attachment, &message),
                MessageId::ServiceNotify => on_notify(&attachment, &message),
                MessageId::TargetNotFound => on_target_not_found(&attachment, &message),
                other => {
                    tracing::debug!(id = ?other, source = message.source, "unexpected message");
                    Ok(())
                }
            }
        }
    };

    if let Err(e) = handled {
        tracing::warn!(id = ?message.id, source = message.source, error = %e, "malformed message");
    }
}

fn on_request(
    shared: &Arc<ClientShared>,
    attachment: &Attachment,
    message: &Message,
) -> Result<()> {
    let wire: WireRequest = message.decode_body(&BincodeCodec)?;
    let reply = shared.remote_sink(message.source);
    let request = RequestEvent {
        request_id: wire.request_id,
        proxy: wire.proxy,
        stub: wire.stub,
        data: Bytes::from(wire.data),
        reply: Some(reply.clone()),
    };

    match attachment.registry.stub_sink(&wire.stub) {
        Some(sink) => {
            if !sink.post(request.into()) {
                tracing::debug!(stub = %wire.stub, "stub dispatcher stopped");
            }
        }
        None => {
            tracing::debug!(stub = %wire.stub, "request for unknown stub");
            reply.post(request.response(RequestResult::TargetNotFound, Bytes::new()).into());
        }
    }
    Ok(())
}

fn on_response(attachment: &Attachment, message: &Message) -> Result<()> {
    let wire: WireResponse = message.decode_body(&BincodeCodec)?;
    let response = ResponseEvent {
        request_id: wire.request_id,
        proxy: wire.proxy,
        stub: wire.stub,
        result: wire.result,
        data: Bytes::from(wire.data),
    };
    deliver_response(attachment, response);
    Ok(())
}

fn on_notify(attachment: &Attachment, message: &Message) -> Result<()> {
    let wire: WireNotification = message.decode_body(&BincodeCodec)?;
    let delivered = attachment
        .registry
        .broadcast(&wire.stub, wire.notify_id, wire.data);
    tracing::trace!(stub = %wire.stub, delivered, "notification delivered");
    Ok(())
}

fn on_available(shared: &Arc<ClientShared>, message: &Message) -> Result<()> {
    let stub: StubAddress = message.decode_body(&BincodeCodec)?;
    if !remember_stub(&mut shared.remote_stubs.lock(), message.source, &stub) {
        tracing::trace!(peer = message.source, stub = %stub, "stub announced again");
    }

    let Some(attachment) = shared.attachment.read().clone() else {
        tracing::debug!(peer = message.source, %stub, "remote stub recorded until attach");
        return Ok(());
    };
    let connected = attachment
        .registry
        .stub_available(stub, shared.remote_sink(message.source));
    tracing::debug!(peer = message.source, connected, "remote stub available");
    Ok(())
}

fn on_unavailable(shared: &Arc<ClientShared>, message: &Message) -> Result<()> {
    let stub: StubAddress = message.decode_body(&BincodeCodec)?;
    shared
        .remote_stubs
        .lock()
        .retain(|(owner, known)| !(*owner == message.source && *known == stub));

    if let Some(attachment) = shared.attachment.read().clone() {
        let waiting = attachment.registry.stub_unavailable(&stub);
        tracing::debug!(peer = message.source, waiting, "remote stub withdrawn");
    }
    Ok(())
}

/// Record `stub` as announced by `peer`, `false` when it already was
fn remember_stub(stubs: &mut Vec<(Id, StubAddress)>, peer: Id, stub: &StubAddress) -> bool {
    if stubs.iter().any(|(owner, known)| *owner == peer && known == stub) {
        return false;
    }
    stubs.push((peer, stub.clone()));
    true
}

/// A request this process sent never reached its stub
fn on_target_not_found(attachment: &Attachment, message: &Message) -> Result<()> {
    let failed: FailedDelivery = message.decode_body(&BincodeCodec)?;
    if MessageId::from_raw(failed.message_id) != MessageId::ServiceRequest {
        tracing::debug!(target = failed.target, "undeliverable response dropped");
        return Ok(());
    }

    let wire: WireRequest = BincodeCodec.decode(&failed.payload)?;
    deliver_response(
        attachment,
        ResponseEvent {
            request_id: wire.request_id,
            proxy: wire.proxy,
            stub: wire.stub,
            result: RequestResult::TargetNotFound,
            data: Bytes::new(),
        },
    );
    Ok(())
}

fn deliver_response(attachment: &Attachment, response: ResponseEvent) {
    let sink = attachment
        .registry
        .proxy_sink(&response.proxy)
        .unwrap_or_else(|| attachment.fallback.clone());
    if !sink.post(response.into()) {
        tracing::debug!("response dropped, dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::Address;
    use switchboard_runtime::{ServiceAddress, Version};

    fn stub(channel: u32) -> StubAddress {
        StubAddress::new(
            ServiceAddress::new("calc", "Calculator", Version::new(1, 0, 0)),
            "worker",
            Address::new(0, 0, channel.into()),
        )
    }

    #[test]
    fn repeated_announcement_is_recorded_once() {
        let mut stubs = Vec::new();
        assert!(remember_stub(&mut stubs, 7, &stub(1)));
        assert!(!remember_stub(&mut stubs, 7, &stub(1)));
        assert!(remember_stub(&mut stubs, 8, &stub(1)));
        assert!(remember_stub(&mut stubs, 7, &stub(2)));

        assert_eq!(stubs.len(), 3);
        assert_eq!(stubs.iter().filter(|(owner, _)| *owner == 7).count(), 2);
    }
}
