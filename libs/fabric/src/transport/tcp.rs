use std::net::SocketAddr;
use std::time::Duration;

use switchboard_core::Timeout;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{Error, Result};
use crate::message::{Message, DEFAULT_MAX_PAYLOAD};
use crate::transport::{
    FramedReader, FramedWriter, MessageReader, MessageWriter, PeerInfo, Transport,
    TransportListener,
};

/// TCP transport carrying switchboard frames
///
/// Every message is a 32-byte little-endian header followed by its payload
pub struct TcpTransport {
    reader: FramedReader<OwnedReadHalf>,
    writer: FramedWriter<OwnedWriteHalf>,
    peer: PeerInfo,
}

impl TcpTransport {
    /// Connect to a remote TCP address with no timeouts
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::builder().address(addr).connect().await
    }

    /// Connect with a connect timeout
    pub async fn connect_timeout(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        Self::builder()
            .address(addr)
            .connect_timeout(timeout)
            .connect()
            .await
    }

    /// Create a builder for configuring the transport
    pub fn builder() -> TcpTransportBuilder {
        TcpTransportBuilder::new()
    }

    /// Create from an existing TcpStream
    pub fn from_stream(stream: TcpStream) -> Self {
        Self::from_parts(stream, DEFAULT_MAX_PAYLOAD, None, None)
    }

    fn from_parts(
        stream: TcpStream,
        max_payload: usize,
        send_timeout: Option<Duration>,
        receive_timeout: Option<Duration>,
    ) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| PeerInfo::new(addr.to_string()))
            .unwrap_or_else(|_| PeerInfo::new("tcp:unknown"));
        let (read_half, write_half) = stream.into_split();

        Self {
            reader: FramedReader::new(read_half).with_limits(max_payload, receive_timeout),
            writer: FramedWriter::new(write_half).with_timeout(send_timeout),
            peer,
        }
    }

    /// Get the remote address of this connection
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.reader.get_ref().peer_addr().map_err(Into::into)
    }

    /// Get the local address of this connection
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.reader.get_ref().local_addr().map_err(Into::into)
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, message: &Message) -> Result<()> {
        self.writer.write_message(message).await
    }

    async fn receive(&mut self) -> Result<Message> {
        self.reader.read_message().await
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await
    }

    fn peer_info(&self) -> PeerInfo {
        self.peer.clone()
    }

    fn into_split(self: Box<Self>) -> (Box<dyn MessageReader>, Box<dyn MessageWriter>) {
        let this = *self;
        (Box::new(this.reader), Box::new(this.writer))
    }
}

/// TCP listener for accepting incoming connections
pub struct TcpTransportListener {
    listener: TcpListener,
    max_payload: usize,
    send_timeout: Option<Duration>,
    receive_timeout: Option<Duration>,
}

impl TcpTransportListener {
    /// Bind to a local address
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::debug!(%addr, "tcp listener bound");
        Ok(Self {
            listener,
            max_payload: DEFAULT_MAX_PAYLOAD,
            send_timeout: None,
            receive_timeout: None,
        })
    }

    /// Limit the payload size accepted from peers
    pub fn max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Timeouts applied to every accepted connection
    pub fn timeouts(mut self, send: impl Into<Timeout>, receive: impl Into<Timeout>) -> Self {
        self.send_timeout = send.into().as_duration();
        self.receive_timeout = receive.into().as_duration();
        self
    }

    /// Get the local address this listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Into::into)
    }
}

#[async_trait::async_trait]
impl TransportListener for TcpTransportListener {
    type Transport = TcpTransport;

    async fn accept(&self) -> Result<(Self::Transport, PeerInfo)> {
        let (stream, addr) = self.listener.accept().await?;
        let transport = TcpTransport::from_parts(
            stream,
            self.max_payload,
            self.send_timeout,
            self.receive_timeout,
        );
        Ok((transport, PeerInfo::new(addr.to_string())))
    }

    fn local_label(&self) -> String {
        self.listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "tcp:unbound".to_string())
    }

    /// Tokio's TcpListener has no explicit close; cleanup happens on drop.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Builder for configuring TCP transport
pub struct TcpTransportBuilder {
    address: Option<SocketAddr>,
    connect_timeout: Timeout,
    send_timeout: Timeout,
    receive_timeout: Timeout,
    max_payload: usize,
}

impl Default for TcpTransportBuilder {
    fn default() -> Self {
        Self {
            address: None,
            connect_timeout: Timeout::Infinite,
            send_timeout: Timeout::Infinite,
            receive_timeout: Timeout::Infinite,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl TcpTransportBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address to connect to
    pub fn address(mut self, addr: SocketAddr) -> Self {
        self.address = Some(addr);
        self
    }

    /// Set the connection timeout
    pub fn connect_timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.connect_timeout = timeout.into();
        self
    }

    /// Set the send timeout
    pub fn send_timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.send_timeout = timeout.into();
        self
    }

    /// Set the receive timeout
    pub fn receive_timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.receive_timeout = timeout.into();
        self
    }

    /// Limit the payload size accepted from the peer
    pub fn max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Connect with the configured settings
    pub async fn connect(self) -> Result<TcpTransport> {
        let addr = self
            .address
            .ok_or_else(|| Error::Custom("Address not set".to_string()))?;

        let connect_op = TcpStream::connect(addr);

        let stream = if let Some(timeout) = self.connect_timeout.as_duration() {
            tokio::time::timeout(timeout, connect_op)
                .await
                .map_err(|_| Error::Timeout("Connect"))??
        } else {
            connect_op.await?
        };
        stream.set_nodelay(true)?;

        Ok(TcpTransport::from_parts(
            stream,
            self.max_payload,
            self.send_timeout.as_duration(),
            self.receive_timeout.as_duration(),
        ))
    }
}
