//! The router service.
//!
//! Every accepted connection gets a receive task and a send task of its own,
//! so a peer that stops reading only fills its own outbox. Receive tasks feed
//! one processing task, which owns every routing decision.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use switchboard_core::{cookie, Id, Timeout, UNKNOWN_ID};
use switchboard_fabric::codec::BincodeCodec;
use switchboard_fabric::message::PROTOCOL_VERSION;
use switchboard_fabric::transport::{
    MessageReader, MessageWriter, TcpTransportListener, Transport, TransportListener,
};
use switchboard_fabric::{Message, MessageClass, MessageId, PeerInfo};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RouterConfig;
use crate::error::{Error, Result};
use crate::policy::{AcceptAll, AcceptPolicy, LoggingHandler, RemoteServiceHandler};
use crate::protocol::{ConnectAccepted, ConnectRequest, FailedDelivery};
use crate::table::{ConnectionState, ConnectionTable};

const INBOUND_CAPACITY: usize = 1024;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

enum Inbound {
    Frame(Message),
    Closed(Id),
}

struct Shared {
    config: RouterConfig,
    table: Mutex<ConnectionTable>,
    policy: Arc<dyn AcceptPolicy>,
    handler: Arc<dyn RemoteServiceHandler>,
}

/// Builder for a [`Router`]
pub struct RouterBuilder {
    config: RouterConfig,
    policy: Arc<dyn AcceptPolicy>,
    handler: Arc<dyn RemoteServiceHandler>,
}

impl RouterBuilder {
    pub fn config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn accept_policy(mut self, policy: impl AcceptPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn handler(mut self, handler: impl RemoteServiceHandler + 'static) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    pub fn build(self) -> Router {
        Router {
            shared: Arc::new(Shared {
                config: self.config,
                table: Mutex::new(ConnectionTable::new()),
                policy: self.policy,
                handler: self.handler,
            }),
        }
    }
}

/// Message router between connected processes
pub struct Router {
    shared: Arc<Shared>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder {
            config: RouterConfig::default(),
            policy: Arc::new(AcceptAll),
            handler: Arc::new(LoggingHandler),
        }
    }

    pub fn new(config: RouterConfig) -> Self {
        Self::builder().config(config).build()
    }

    /// Bind the configured TCP address and start serving.
    ///
    /// A bind failure is returned to the caller; the router never starts
    /// half-way.
    pub async fn serve_tcp(self) -> Result<RouterHandle> {
        let config = &self.shared.config;
        let listener = TcpTransportListener::bind(config.listen)
            .await?
            .max_payload(config.max_payload)
            .timeouts(config.send_timeout, config.receive_timeout);
        Ok(self.serve(listener))
    }

    /// Start serving connections from `listener`
    pub fn serve<L>(self, listener: L) -> RouterHandle
    where
        L: TransportListener + 'static,
    {
        let cancel = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let local_label = listener.local_label();
        tracing::info!(listen = %local_label, "router serving");

        let processing = tokio::spawn(process(self.shared.clone(), inbound_rx, cancel.clone()));
        let acceptor = tokio::spawn(accept_loop(
            self.shared.clone(),
            listener,
            inbound_tx,
            cancel.clone(),
        ));

        RouterHandle {
            local_label,
            shared: self.shared,
            cancel,
            tasks: vec![acceptor, processing],
        }
    }
}

/// Control handle of a running router
pub struct RouterHandle {
    local_label: String,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RouterHandle {
    /// Address or path the router listens on
    pub fn local_label(&self) -> &str {
        &self.local_label
    }

    /// Listening socket address, for TCP routers
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_label.parse().ok()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.table.lock().len()
    }

    pub fn cookies(&self) -> Vec<Id> {
        self.shared.table.lock().cookies()
    }

    pub fn nick_name(&self, cookie: Id) -> Option<String> {
        self.shared
            .table
            .lock()
            .get(cookie)
            .and_then(|record| record.nick_name.clone())
    }

    pub fn connection_state(&self, cookie: Id) -> Option<ConnectionState> {
        self.shared.table.lock().get(cookie).map(|record| record.state)
    }

    /// Stop accepting, close every connection and wait for the router tasks
    pub async fn stop(mut self) {
        self.cancel.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "router task failed");
            }
        }
        tracing::info!(listen = %self.local_label, "router stopped");
    }
}

impl Drop for RouterHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop<L>(
    shared: Arc<Shared>,
    mut listener: L,
    inbound: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
) where
    L: TransportListener,
{
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((transport, peer)) => admit(&shared, transport, peer, &inbound, &cancel).await,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    if let Err(e) = listener.close().await {
        tracing::warn!(error = %e, "failed to close listener");
    }
}

/// Run the accept policy and, on success, mint a cookie and spawn the
/// connection tasks
async fn admit<T>(
    shared: &Arc<Shared>,
    mut transport: T,
    peer: PeerInfo,
    inbound: &mpsc::Sender<Inbound>,
    cancel: &CancellationToken,
) where
    T: Transport + 'static,
{
    tracing::trace!(%peer, state = ?ConnectionState::Accepting, "connection offered");
    let active = shared.table.lock().len();
    if !shared.policy.can_accept_connection(&peer, active) {
        tracing::info!(%peer, active, "connection rejected");
        if let Err(e) = transport.close().await {
            tracing::debug!(%peer, error = %e, "closing rejected connection failed");
        }
        return;
    }

    let (reader, writer) = Box::new(transport).into_split();
    let (outbox_tx, outbox_rx) = mpsc::channel(shared.config.outbox_capacity.max(1));
    let token = cancel.child_token();
    let cookie = shared
        .table
        .lock()
        .insert(peer.clone(), outbox_tx, token.clone());
    tracing::info!(%peer, cookie, "connection accepted");

    tokio::spawn(receive_loop(
        cookie,
        reader,
        inbound.clone(),
        token.clone(),
        shared.config.connect_timeout,
    ));
    tokio::spawn(send_loop(cookie, writer, outbox_rx, shared.clone(), token));
}

#[tracing::instrument(name = "receive", skip_all, fields(cookie = cookie))]
async fn receive_loop(
    cookie: Id,
    mut reader: Box<dyn MessageReader>,
    inbound: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
    handshake_timeout: Timeout,
) {
    // Until RouterConnect arrives every read shares one handshake deadline.
    let mut deadline = handshake_timeout
        .as_duration()
        .filter(|limit| !limit.is_zero())
        .and_then(|limit| tokio::time::Instant::now().checked_add(limit));

    loop {
        let read = async {
            match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, reader.read_message())
                    .await
                    .unwrap_or(Err(switchboard_fabric::Error::Timeout("Handshake"))),
                None => reader.read_message().await,
            }
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = read => result,
        };

        match result {
            Ok(mut message) => {
                if message.id == MessageId::RouterConnect {
                    deadline = None;
                }
                message.source = cookie;
                if inbound.send(Inbound::Frame(message)).await.is_err() {
                    break;
                }
            }
            Err(switchboard_fabric::Error::ConnectionClosed) => {
                tracing::debug!("peer closed connection");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "receive failed");
                break;
            }
        }
    }

    cancel.cancel();
    let _ = inbound.send(Inbound::Closed(cookie)).await;
}

#[tracing::instrument(name = "send", skip_all, fields(cookie = cookie))]
async fn send_loop(
    cookie: Id,
    mut writer: Box<dyn MessageWriter>,
    mut outbox: mpsc::Receiver<Message>,
    shared: Arc<Shared>,
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
            shared.handler.failed_send_message(&message, &Error::Fabric(e));
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        tracing::trace!(error = %e, "shutdown after send loop");
    }
    cancel.cancel();
}

async fn process(
    shared: Arc<Shared>,
    mut inbound: mpsc::Receiver<Inbound>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = inbound.recv() => next,
        };

        match next {
            Some(Inbound::Frame(message)) => route(&shared, message),
            Some(Inbound::Closed(cookie)) => disconnect(&shared, cookie),
            None => break,
        }
    }

    let cookies = shared.table.lock().cookies();
    for cookie in cookies {
        disconnect(&shared, cookie);
    }
}

/// Routing decision for one inbound frame; `source` is already stamped
fn route(shared: &Shared, message: Message) {
    let source = message.source;
    let state = {
        let mut table = shared.table.lock();
        table.touch(source);
        table.get(source).map(|record| record.state)
    };
    let Some(state) = state else {
        tracing::trace!(source, "message from a removed connection");
        return;
    };

    match message.id {
        MessageId::RouterConnect => return handshake(shared, message, state),
        MessageId::RouterDisconnect => {
            if let Some(record) = shared.table.lock().get_mut(source) {
                tracing::debug!(cookie = source, "peer requested disconnect");
                record.close();
            }
            return;
        }
        _ => {}
    }

    if state != ConnectionState::Active {
        tracing::debug!(source, ?state, id = ?message.id, "dropping message from inactive connection");
        return;
    }

    let class = message.id.class();
    if matches!(class, MessageClass::System | MessageClass::Invalid) {
        tracing::warn!(source, id = ?message.id, "unexpected message id from peer");
        return;
    }

    if message.is_broadcast() && class == MessageClass::Notification {
        if let Some(record) = shared.table.lock().get_mut(source) {
            record.record_announcement(&message);
        }
        fan_out(shared, message);
        return;
    }

    let outbox = shared
        .table
        .lock()
        .get(message.target)
        .filter(|record| record.is_active())
        .map(|record| record.outbox.clone());

    match outbox {
        Some(outbox) => deliver(shared, message.target, &outbox, message),
        None if message.id.expects_reply_on_failure() => target_not_found(shared, message),
        None => tracing::trace!(source, target = message.target, "notification for absent target dropped"),
    }
}

fn handshake(shared: &Shared, message: Message, state: ConnectionState) {
    let source = message.source;
    if state != ConnectionState::Accepted {
        tracing::debug!(cookie = source, ?state, "repeated RouterConnect ignored");
        return;
    }

    let request = match message.decode_body::<ConnectRequest, _>(&BincodeCodec) {
        Ok(request) if request.protocol_version == PROTOCOL_VERSION => request,
        Ok(request) => {
            tracing::warn!(cookie = source, version = request.protocol_version, "protocol mismatch");
            close(shared, source);
            return;
        }
        Err(e) => {
            tracing::warn!(cookie = source, error = %e, "malformed RouterConnect");
            close(shared, source);
            return;
        }
    };

    let outbox = {
        let mut table = shared.table.lock();
        let Some(record) = table.get_mut(source) else {
            return;
        };
        record.nick_name = Some(request.nick_name.clone());
        record.state = ConnectionState::Active;
        record.outbox.clone()
    };
    tracing::info!(cookie = source, nick_name = %request.nick_name, "connection active");

    let accepted = ConnectAccepted {
        protocol_version: PROTOCOL_VERSION,
    };
    match Message::with_body(
        MessageId::RouterConnected,
        cookie::ROUTER,
        source,
        message.cookie,
        &accepted,
        &BincodeCodec,
    ) {
        Ok(reply) => deliver(shared, source, &outbox, reply),
        Err(e) => {
            tracing::error!(cookie = source, error = %e, "failed to encode RouterConnected");
            return;
        }
    }

    // Stubs published before this peer joined.
    let announced: Vec<Message> = shared
        .table
        .lock()
        .active()
        .filter(|record| record.cookie != source)
        .flat_map(|record| record.announcements.iter().cloned())
        .collect();
    if !announced.is_empty() {
        tracing::debug!(cookie = source, count = announced.len(), "replaying stub announcements");
    }
    for announcement in announced {
        deliver(shared, source, &outbox, announcement);
    }
}

/// Hand an undeliverable request or response back to its sender
fn target_not_found(shared: &Shared, message: Message) {
    let source = message.source;
    let Some(outbox) = shared
        .table
        .lock()
        .get(source)
        .map(|record| record.outbox.clone())
    else {
        return;
    };

    tracing::debug!(source, target = message.target, id = ?message.id, "target not found");
    let failed = FailedDelivery {
        message_id: message.id.as_raw(),
        target: message.target,
        payload: message.payload.to_vec(),
    };
    match Message::with_body(
        MessageId::TargetNotFound,
        cookie::ROUTER,
        source,
        message.cookie,
        &failed,
        &BincodeCodec,
    ) {
        Ok(reply) => deliver(shared, source, &outbox, reply),
        Err(e) => tracing::error!(source, error = %e, "failed to encode TargetNotFound"),
    }
}

/// Copy a broadcast notification to every other active connection
fn fan_out(shared: &Shared, message: Message) {
    let targets: Vec<_> = shared
        .table
        .lock()
        .active()
        .filter(|record| record.cookie != message.source)
        .map(|record| (record.cookie, record.outbox.clone()))
        .collect();

    for (cookie, outbox) in targets {
        deliver(shared, cookie, &outbox, message.clone());
    }
}

fn deliver(shared: &Shared, target: Id, outbox: &mpsc::Sender<Message>, message: Message) {
    match outbox.try_send(message) {
        Ok(()) => {}
        Err(TrySendError::Full(message)) => shared
            .handler
            .failed_send_message(&message, &Error::Backpressure(target)),
        Err(TrySendError::Closed(message)) => {
            shared.handler.failed_send_message(&message, &Error::Closed)
        }
    }
}

fn close(shared: &Shared, cookie: Id) {
    if let Some(record) = shared.table.lock().get_mut(cookie) {
        record.close();
    }
}

/// Remove a connection and tell the remaining peers it is gone
fn disconnect(shared: &Shared, cookie: Id) {
    let Some(record) = shared.table.lock().remove(cookie) else {
        return;
    };
    record.cancel.cancel();
    tracing::info!(cookie, peer = %record.peer, nick_name = ?record.nick_name, "connection closed");
    shared.policy.connection_lost(&record.peer);

    if record.nick_name.is_some() {
        let departed = Message::empty(
            MessageId::RouterDisconnect,
            cookie,
            cookie::BROADCAST,
            UNKNOWN_ID,
        );
        let targets: Vec<_> = shared
            .table
            .lock()
            .active()
            .map(|record| (record.cookie, record.outbox.clone()))
            .collect();
        for (target, outbox) in targets {
            deliver(shared, target, &outbox, departed.clone());
        }
    }
}
