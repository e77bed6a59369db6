use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use switchboard_core::Timeout;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};

use crate::error::{Error, Result};
use crate::message::{Message, DEFAULT_MAX_PAYLOAD};
use crate::transport::{
    FramedReader, FramedWriter, MessageReader, MessageWriter, PeerInfo, Transport,
    TransportListener,
};

/// Unix domain socket transport carrying switchboard frames
pub struct UnixTransport {
    reader: FramedReader<OwnedReadHalf>,
    writer: FramedWriter<OwnedWriteHalf>,
    peer: PeerInfo,
}

impl UnixTransport {
    /// Connect to a Unix socket with no timeouts
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        Self::builder().path(path).connect().await
    }

    /// Connect with a connect timeout
    pub async fn connect_timeout(path: impl AsRef<Path>, timeout: Duration) -> Result<Self> {
        Self::builder()
            .path(path)
            .connect_timeout(timeout)
            .connect()
            .await
    }

    /// Create a builder for configuring the transport
    pub fn builder() -> UnixTransportBuilder {
        UnixTransportBuilder::new()
    }

    /// Create from an existing UnixStream
    pub fn from_stream(stream: UnixStream) -> Self {
        Self::from_parts(stream, PeerInfo::new("unix:peer"), DEFAULT_MAX_PAYLOAD, None, None)
    }

    fn from_parts(
        stream: UnixStream,
        peer: PeerInfo,
        max_payload: usize,
        send_timeout: Option<Duration>,
        receive_timeout: Option<Duration>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FramedReader::new(read_half).with_limits(max_payload, receive_timeout),
            writer: FramedWriter::new(write_half).with_timeout(send_timeout),
            peer,
        }
    }
}

#[async_trait::async_trait]
impl Transport for UnixTransport {
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

/// Unix socket listener for accepting incoming connections
pub struct UnixTransportListener {
    listener: UnixListener,
    path: PathBuf,
    max_payload: usize,
    send_timeout: Option<Duration>,
    receive_timeout: Option<Duration>,
    accepted: AtomicU64,
}

impl UnixTransportListener {
    /// Bind to a Unix socket path
    pub async fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Remove existing socket file if it exists
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        tracing::debug!(path = %path.display(), "unix listener bound");
        Ok(Self {
            listener,
            path,
            max_payload: DEFAULT_MAX_PAYLOAD,
            send_timeout: None,
            receive_timeout: None,
            accepted: AtomicU64::new(0),
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

    /// Get the path this listener is bound to
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn remove_socket_file(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for UnixTransportListener {
    fn drop(&mut self) {
        // Clean up socket file on drop
        let _ = self.remove_socket_file();
    }
}

#[async_trait::async_trait]
impl TransportListener for UnixTransportListener {
    type Transport = UnixTransport;

    async fn accept(&self) -> Result<(Self::Transport, PeerInfo)> {
        let (stream, _) = self.listener.accept().await?;
        // Unix peers are unnamed; number them per listener so labels stay distinct.
        let seq = self.accepted.fetch_add(1, Ordering::Relaxed);
        let peer = PeerInfo::new(format!("unix:{}#{}", self.path.display(), seq));
        let transport = UnixTransport::from_parts(
            stream,
            peer.clone(),
            self.max_payload,
            self.send_timeout,
            self.receive_timeout,
        );
        Ok((transport, peer))
    }

    fn local_label(&self) -> String {
        format!("unix:{}", self.path.display())
    }

    /// Close the listener and remove the socket file
    async fn close(&mut self) -> Result<()> {
        self.remove_socket_file()
    }
}

/// Builder for configuring Unix socket transport
pub struct UnixTransportBuilder {
    path: Option<PathBuf>,
    connect_timeout: Timeout,
    send_timeout: Timeout,
    receive_timeout: Timeout,
    max_payload: usize,
}

impl Default for UnixTransportBuilder {
    fn default() -> Self {
        Self {
            path: None,
            connect_timeout: Timeout::Infinite,
            send_timeout: Timeout::Infinite,
            receive_timeout: Timeout::Infinite,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl UnixTransportBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the path to connect to
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
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
    pub async fn connect(self) -> Result<UnixTransport> {
        let path = self
            .path
            .ok_or_else(|| Error::Custom("Path not set".to_string()))?;

        let connect_op = UnixStream::connect(&path);

        let stream = if let Some(timeout) = self.connect_timeout.as_duration() {
            tokio::time::timeout(timeout, connect_op)
                .await
                .map_err(|_| Error::Timeout("Connect"))??
        } else {
            connect_op.await?
        };

        Ok(UnixTransport::from_parts(
            stream,
            PeerInfo::new(format!("unix:{}", path.display())),
            self.max_payload,
            self.send_timeout.as_duration(),
            self.receive_timeout.as_duration(),
        ))
    }
}
