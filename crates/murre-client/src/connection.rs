//! A single broker connection: duplex framed transport, request/response
//! correlation, keep-alive, and dispatch to registered producers/consumers.
//!
//! One reader task and one writer task run per connection. Every outbound
//! frame funnels through the writer channel, which serializes writes and
//! preserves FIFO order across producers sharing the connection. The reader
//! task decodes frames incrementally and dispatches them; it never executes
//! user code directly; producer callbacks are oneshot completions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use murre_protocol::{
    decode_frame, encode_command, encode_payload_command, frame_bytes_needed, Command,
    CommandError, Frame, LookupType, MessageIdData, MessageMetadata, SchemaInfo, ServerError,
    TopicsMode, DEFAULT_MAX_MESSAGE_SIZE, MIN_VERSION_CONSUMER_STATS, MIN_VERSION_KEEP_ALIVE,
    MIN_VERSION_SEND_CHECKSUM, PROTOCOL_VERSION,
};

use crate::config::{ClientConfig, ServiceUrl};
use crate::error::{Error, Result};

const DEFAULT_READ_BUFFER: usize = 64 * 1024;

// ============================================================================
// Process-wide negotiated limits
// ============================================================================

static MAX_MESSAGE_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_MAX_MESSAGE_SIZE);

/// The per-message size limit advertised by the most generous broker this
/// process has talked to. Shared by all connections; only ever grows.
pub fn max_message_size() -> usize {
    MAX_MESSAGE_SIZE.load(Ordering::Acquire)
}

fn update_max_message_size(advertised: usize) {
    MAX_MESSAGE_SIZE.fetch_max(advertised, Ordering::AcqRel);
}

static CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

// ============================================================================
// Dispatch interfaces
// ============================================================================

/// Connection-side view of a producer. Implemented by the producer runtime;
/// the connection holds only weak references.
pub(crate) trait ProducerDispatch: Send + Sync {
    /// Handle a send receipt. Returns `false` on an unrecoverable
    /// de-synchronization, which makes the connection close.
    fn ack_received(&self, sequence_id: u64, message_id: MessageIdData) -> bool;

    /// Handle a checksum send-error. Returns `false` when the corrupt message
    /// is not at the head of the queue, which makes the connection close to
    /// force a full resend.
    fn remove_corrupt_message(&self, sequence_id: u64) -> bool;

    /// The broker unilaterally closed the producer session.
    fn closed_by_broker(&self);

    /// The connection identified by `cnx_id` went away. Invoked exactly once
    /// per connection; the id lets the producer ignore events from a
    /// connection it already replaced.
    fn connection_closed(&self, reason: &Error, cnx_id: u64);
}

/// Connection-side view of a consumer. The consumer runtime lives outside
/// this crate; the connection only routes events to it.
pub trait ConsumerDispatch: Send + Sync {
    fn connection_closed(&self, reason: &Error);

    fn closed_by_broker(&self);

    fn active_consumer_change(&self, _is_active: bool) {}

    fn message_received(
        &self,
        message_id: MessageIdData,
        redelivery_count: u32,
        metadata: MessageMetadata,
        payload: Bytes,
        checksum_valid: bool,
    );
}

// ============================================================================
// Request plumbing
// ============================================================================

/// Arguments of one `Send` frame, kept alive in the producer's pending queue
/// for retransmission after a reconnect.
#[derive(Debug, Clone)]
pub(crate) struct SendArgs {
    pub producer_id: u64,
    pub sequence_id: u64,
    pub num_messages: i32,
    pub highest_sequence_id: Option<u64>,
    pub metadata: MessageMetadata,
    pub payload: Bytes,
}

/// Typed payloads of completed RPCs.
#[derive(Debug)]
pub(crate) enum ResponseData {
    ProducerSuccess {
        producer_name: String,
        last_sequence_id: i64,
        schema_version: Vec<u8>,
        topic_epoch: Option<u64>,
    },
    Success {
        schema_version: Option<Vec<u8>>,
    },
    Lookup(LookupResult),
    PartitionedMetadata {
        partitions: u32,
    },
    ConsumerStats {
        msg_rate_out: f64,
        msg_backlog: u64,
    },
    LastMessageId {
        last_message_id: MessageIdData,
        consumer_mark_delete_position: Option<MessageIdData>,
    },
    TopicsOfNamespace {
        topics: Vec<String>,
    },
    Schema {
        schema: Option<SchemaInfo>,
    },
    AckResponse,
}

/// Result of a topic lookup.
#[derive(Debug, Clone)]
pub struct LookupResult {
    pub response: LookupType,
    pub broker_service_url: String,
    pub broker_service_url_tls: Option<String>,
    pub authoritative: bool,
    pub proxy_through_service_url: bool,
}

struct PendingRequest {
    tx: oneshot::Sender<Result<ResponseData>>,
    /// Set by interim notifications ("queued at broker") so the deadline
    /// timer stops counting against this request.
    has_response: bool,
    is_lookup: bool,
}

#[derive(Default)]
struct Registry {
    pending: HashMap<u64, PendingRequest>,
    producers: HashMap<u64, Weak<dyn ProducerDispatch>>,
    consumers: HashMap<u64, Weak<dyn ConsumerDispatch>>,
    lookups_in_flight: usize,
}

// ============================================================================
// Connection state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Pending = 0,
    TcpConnected = 1,
    Ready = 2,
    Disconnected = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Pending,
            1 => ConnectionState::TcpConnected,
            2 => ConnectionState::Ready,
            _ => ConnectionState::Disconnected,
        }
    }
}

// ============================================================================
// Stream wrapper
// ============================================================================

/// Either a plaintext or a TLS stream.
#[allow(clippy::large_enum_variant)]
enum ConnectionStream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for ConnectionStream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ConnectionStream::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            ConnectionStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ConnectionStream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ConnectionStream::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            ConnectionStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ConnectionStream::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            ConnectionStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            ConnectionStream::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            ConnectionStream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One logical broker connection.
pub struct Connection {
    id: u64,
    weak_self: Weak<Connection>,
    url: ServiceUrl,
    config: Arc<ClientConfig>,
    state: AtomicU8,
    server_protocol_version: AtomicI32,
    request_id: AtomicU64,
    have_pending_ping: AtomicBool,
    writer_tx: mpsc::UnboundedSender<Bytes>,
    registry: Mutex<Registry>,
    shutdown: watch::Sender<bool>,
    /// Log prefix, `[id -> host:port]`.
    cnx_string: String,
}

impl Connection {
    /// Establish a connection: TCP (+ TLS), `Connect`/`Connected` handshake,
    /// then spawn the reader, writer and keep-alive tasks.
    ///
    /// The whole sequence runs under `connection_timeout`; hitting the
    /// deadline abandons the half-open socket.
    pub async fn connect(config: Arc<ClientConfig>, url: ServiceUrl) -> Result<Arc<Connection>> {
        let timeout = config.connection_timeout;
        match tokio::time::timeout(timeout, Self::connect_inner(config, url.clone())).await {
            Ok(result) => result,
            Err(_) => {
                warn!("connection to {} timed out after {:?}", url, timeout);
                Err(Error::Timeout)
            }
        }
    }

    async fn connect_inner(config: Arc<ClientConfig>, url: ServiceUrl) -> Result<Arc<Connection>> {
        let id = CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let cnx_string = format!("[{} -> {}]", id, url.authority());
        debug!("{} resolving {}", cnx_string, url.authority());

        let addrs: Vec<_> = tokio::net::lookup_host(url.authority())
            .await
            .map_err(|e| Error::ConnectError(format!("failed to resolve {}: {e}", url.authority())))?
            .collect();

        let mut tcp = None;
        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => {
                    debug!("{} connect to {} failed: {}", cnx_string, addr, e);
                    last_error = Some(e);
                }
            }
        }
        let tcp = tcp.ok_or_else(|| {
            Error::ConnectError(match last_error {
                Some(e) => format!("no reachable endpoint for {}: {e}", url),
                None => format!("no addresses resolved for {}", url),
            })
        })?;

        tcp.set_nodelay(true)?;
        configure_tcp_keepalive(&tcp);

        let mut stream = if url.tls {
            let connector = build_tls_connector(&config)?;
            let server_name = rustls::pki_types::ServerName::try_from(url.host.clone())
                .map_err(|e| Error::ConnectError(format!("invalid TLS server name: {e}")))?;
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| Error::ConnectError(format!("TLS handshake failed: {e}")))?;
            ConnectionStream::Tls(Box::new(tls))
        } else {
            ConnectionStream::Plain(tcp)
        };

        // Handshake: Connect out, Connected back. Nothing else is legal here.
        let connect = connect_command(&config)?;
        stream.write_all(&encode_command(&connect)?).await?;
        stream.flush().await?;

        let mut buf = BytesMut::with_capacity(DEFAULT_READ_BUFFER);
        let (server_version, protocol_version, advertised_max) = loop {
            match decode_frame(&mut buf)? {
                Some(Frame::Command(Command::Connected {
                    server_version,
                    protocol_version,
                    max_message_size,
                })) => break (server_version, protocol_version, max_message_size),
                Some(other) => {
                    let name = match &other {
                        Frame::Command(c) => c.name(),
                        Frame::Payload { command, .. } => command.name(),
                    };
                    return Err(Error::Protocol(format!(
                        "unexpected {name} before CONNECTED"
                    )));
                }
                None => {
                    buf.reserve(frame_bytes_needed(&buf).max(DEFAULT_READ_BUFFER));
                    if stream.read_buf(&mut buf).await? == 0 {
                        return Err(Error::ConnectError(
                            "connection closed during handshake".into(),
                        ));
                    }
                }
            }
        };

        if let Some(size) = advertised_max {
            update_max_message_size(size as usize);
        }
        info!(
            "{} connected to {} (server: {}, protocol v{})",
            cnx_string, url, server_version, protocol_version
        );

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let connection = Arc::new_cyclic(|weak_self| Connection {
            id,
            weak_self: weak_self.clone(),
            url,
            config,
            state: AtomicU8::new(ConnectionState::Ready as u8),
            server_protocol_version: AtomicI32::new(protocol_version),
            request_id: AtomicU64::new(1),
            have_pending_ping: AtomicBool::new(false),
            writer_tx,
            registry: Mutex::new(Registry::default()),
            shutdown,
            cnx_string,
        });

        let (read_half, write_half) = tokio::io::split(stream);
        tokio::spawn(reader_task(Arc::downgrade(&connection), read_half, buf, shutdown_rx.clone()));
        tokio::spawn(writer_task(write_half, writer_rx, shutdown_rx.clone()));
        if protocol_version >= MIN_VERSION_KEEP_ALIVE {
            tokio::spawn(keep_alive_task(Arc::downgrade(&connection), shutdown_rx));
        }

        Ok(connection)
    }

    /// Process-unique connection id, used to discriminate stale
    /// disconnection events.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn url(&self) -> &ServiceUrl {
        &self.url
    }

    pub fn server_protocol_version(&self) -> i32 {
        self.server_protocol_version.load(Ordering::Acquire)
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Enqueue a pre-framed buffer on the writer. FIFO with every other write
    /// on this connection.
    fn write(&self, frame: Bytes) -> Result<()> {
        if self.state() == ConnectionState::Disconnected {
            return Err(Error::NotConnected);
        }
        self.writer_tx.send(frame).map_err(|_| Error::NotConnected)
    }

    fn write_command(&self, cmd: &Command) -> Result<()> {
        self.write(encode_command(cmd)?)
    }

    /// Serialize and send one `Send` frame. A checksum is included when the
    /// server protocol supports it.
    pub(crate) fn send_message(&self, args: &SendArgs) -> Result<()> {
        let with_checksum = self.server_protocol_version() >= MIN_VERSION_SEND_CHECKSUM;
        let cmd = Command::Send {
            producer_id: args.producer_id,
            sequence_id: args.sequence_id,
            num_messages: args.num_messages,
            highest_sequence_id: args.highest_sequence_id,
        };
        let frame = encode_payload_command(&cmd, &args.metadata, &args.payload, with_checksum)?;
        trace!("{} SEND seq {} ({} bytes)", self.cnx_string, args.sequence_id, frame.len());
        self.write(frame)
    }

    // ------------------------------------------------------------------
    // Request/response
    // ------------------------------------------------------------------

    /// Send a correlated request and await its response under
    /// `operation_timeout`.
    pub(crate) async fn send_request(&self, request_id: u64, cmd: Command) -> Result<ResponseData> {
        self.send_request_inner(request_id, cmd, false).await
    }

    async fn send_request_inner(
        &self,
        request_id: u64,
        cmd: Command,
        is_lookup: bool,
    ) -> Result<ResponseData> {
        let (tx, rx) = oneshot::channel();
        {
            let mut registry = self.registry.lock();
            if self.state() == ConnectionState::Disconnected {
                return Err(Error::NotConnected);
            }
            if is_lookup {
                if registry.lookups_in_flight >= self.config.concurrent_lookup_limit {
                    return Err(Error::TooManyLookupRequests);
                }
                registry.lookups_in_flight += 1;
            }
            registry.pending.insert(request_id, PendingRequest { tx, has_response: false, is_lookup });
        }

        if let Err(e) = self.write_command(&cmd) {
            self.take_pending(request_id);
            return Err(e);
        }

        // Deadline timer: fires only while no interim response arrived.
        let weak = self.weak_self.clone();
        let deadline = self.config.operation_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some(conn) = weak.upgrade() {
                let expired = {
                    let mut registry = conn.registry.lock();
                    match registry.pending.get(&request_id) {
                        Some(entry) if !entry.has_response => {
                            let entry = registry.pending.remove(&request_id);
                            if let Some(ref e) = entry {
                                if e.is_lookup {
                                    registry.lookups_in_flight -= 1;
                                }
                            }
                            entry
                        }
                        _ => None,
                    }
                };
                if let Some(entry) = expired {
                    let _ = entry.tx.send(Err(Error::Timeout));
                }
            }
        });

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::NotConnected),
        }
    }

    fn take_pending(&self, request_id: u64) -> Option<PendingRequest> {
        let mut registry = self.registry.lock();
        let entry = registry.pending.remove(&request_id);
        if let Some(ref e) = entry {
            if e.is_lookup {
                registry.lookups_in_flight -= 1;
            }
        }
        entry
    }

    fn complete_pending(&self, request_id: u64, result: Result<ResponseData>) {
        if let Some(entry) = self.take_pending(request_id) {
            let _ = entry.tx.send(result);
        } else {
            debug!("{} response for unknown request id {}", self.cnx_string, request_id);
        }
    }

    // ------------------------------------------------------------------
    // Lookup-style and plain RPCs
    // ------------------------------------------------------------------

    /// Resolve the broker owning `topic`.
    pub async fn topic_lookup(
        &self,
        topic: &str,
        authoritative: bool,
    ) -> Result<LookupResult> {
        let request_id = self.next_request_id();
        let cmd = Command::Lookup { topic: topic.to_string(), request_id, authoritative };
        match self.send_request_inner(request_id, cmd, true).await? {
            ResponseData::Lookup(result) => Ok(result),
            other => Err(unexpected_response("LOOKUP_RESPONSE", &other)),
        }
    }

    /// Number of partitions of `topic` (0 for non-partitioned topics).
    pub async fn partitioned_metadata(&self, topic: &str) -> Result<u32> {
        let request_id = self.next_request_id();
        let cmd = Command::PartitionedMetadata { topic: topic.to_string(), request_id };
        match self.send_request_inner(request_id, cmd, true).await? {
            ResponseData::PartitionedMetadata { partitions } => Ok(partitions),
            other => Err(unexpected_response("PARTITIONED_METADATA_RESPONSE", &other)),
        }
    }

    pub async fn consumer_stats(&self, consumer_id: u64) -> Result<(f64, u64)> {
        if self.server_protocol_version() < MIN_VERSION_CONSUMER_STATS {
            return Err(Error::UnknownError(format!(
                "broker protocol v{} does not serve consumer stats",
                self.server_protocol_version()
            )));
        }
        let request_id = self.next_request_id();
        let cmd = Command::ConsumerStats { consumer_id, request_id };
        match self.send_request(request_id, cmd).await? {
            ResponseData::ConsumerStats { msg_rate_out, msg_backlog } => {
                Ok((msg_rate_out, msg_backlog))
            }
            other => Err(unexpected_response("CONSUMER_STATS_RESPONSE", &other)),
        }
    }

    pub async fn get_last_message_id(
        &self,
        consumer_id: u64,
    ) -> Result<(MessageIdData, Option<MessageIdData>)> {
        let request_id = self.next_request_id();
        let cmd = Command::GetLastMessageId { consumer_id, request_id };
        match self.send_request(request_id, cmd).await? {
            ResponseData::LastMessageId { last_message_id, consumer_mark_delete_position } => {
                Ok((last_message_id, consumer_mark_delete_position))
            }
            other => Err(unexpected_response("GET_LAST_MESSAGE_ID_RESPONSE", &other)),
        }
    }

    pub async fn get_topics_of_namespace(
        &self,
        namespace: &str,
        mode: TopicsMode,
    ) -> Result<Vec<String>> {
        let request_id = self.next_request_id();
        let cmd =
            Command::GetTopicsOfNamespace { namespace: namespace.to_string(), request_id, mode };
        match self.send_request(request_id, cmd).await? {
            ResponseData::TopicsOfNamespace { topics } => Ok(topics),
            other => Err(unexpected_response("GET_TOPICS_OF_NAMESPACE_RESPONSE", &other)),
        }
    }

    pub async fn get_schema(
        &self,
        topic: &str,
        schema_version: Option<Vec<u8>>,
    ) -> Result<Option<SchemaInfo>> {
        let request_id = self.next_request_id();
        let cmd = Command::GetSchema { topic: topic.to_string(), request_id, schema_version };
        match self.send_request(request_id, cmd).await? {
            ResponseData::Schema { schema } => Ok(schema),
            other => Err(unexpected_response("GET_SCHEMA_RESPONSE", &other)),
        }
    }

    // ------------------------------------------------------------------
    // Registries
    // ------------------------------------------------------------------

    pub(crate) fn register_producer(&self, producer_id: u64, producer: Weak<dyn ProducerDispatch>) {
        self.registry.lock().producers.insert(producer_id, producer);
    }

    pub(crate) fn remove_producer(&self, producer_id: u64) {
        self.registry.lock().producers.remove(&producer_id);
    }

    pub fn register_consumer(&self, consumer_id: u64, consumer: Weak<dyn ConsumerDispatch>) {
        self.registry.lock().consumers.insert(consumer_id, consumer);
    }

    pub fn remove_consumer(&self, consumer_id: u64) {
        self.registry.lock().consumers.remove(&consumer_id);
    }

    fn producer(&self, producer_id: u64) -> Option<Arc<dyn ProducerDispatch>> {
        let mut registry = self.registry.lock();
        match registry.producers.get(&producer_id).and_then(Weak::upgrade) {
            Some(producer) => Some(producer),
            None => {
                // The owner is gone; drop the stale entry.
                registry.producers.remove(&producer_id);
                None
            }
        }
    }

    fn consumer(&self, consumer_id: u64) -> Option<Arc<dyn ConsumerDispatch>> {
        let mut registry = self.registry.lock();
        match registry.consumers.get(&consumer_id).and_then(Weak::upgrade) {
            Some(consumer) => Some(consumer),
            None => {
                registry.consumers.remove(&consumer_id);
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Close
    // ------------------------------------------------------------------

    /// Tear down the connection. Idempotent: the first caller wins, all
    /// registered parties are notified exactly once.
    pub(crate) fn close(&self, reason: Error) {
        let previous = self.state.swap(ConnectionState::Disconnected as u8, Ordering::AcqRel);
        if ConnectionState::from_u8(previous) == ConnectionState::Disconnected {
            return;
        }

        let _ = self.shutdown.send(true);

        let (pending, producers, consumers) = {
            let mut registry = self.registry.lock();
            registry.lookups_in_flight = 0;
            (
                std::mem::take(&mut registry.pending),
                std::mem::take(&mut registry.producers),
                std::mem::take(&mut registry.consumers),
            )
        };

        match &reason {
            Error::NotConnected | Error::Retryable(_) => {
                info!("{} disconnected", self.cnx_string)
            }
            other => warn!("{} closed: {}", self.cnx_string, other),
        }

        for (_, entry) in pending {
            let _ = entry.tx.send(Err(reason.clone()));
        }
        for (_, weak) in producers {
            if let Some(producer) = weak.upgrade() {
                producer.connection_closed(&reason, self.id);
            }
        }
        for (_, weak) in consumers {
            if let Some(consumer) = weak.upgrade() {
                consumer.connection_closed(&reason);
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    fn handle_frame(&self, frame: Frame) {
        if self.state() == ConnectionState::Ready {
            // Inbound traffic proves the peer is alive.
            self.have_pending_ping.store(false, Ordering::Release);
        }

        match frame {
            Frame::Command(cmd) => self.handle_command(cmd),
            Frame::Payload { command, checksum_valid, metadata, payload, .. } => {
                if let Command::Message { consumer_id, message_id, redelivery_count } = command {
                    match self.consumer(consumer_id) {
                        Some(consumer) => consumer.message_received(
                            message_id,
                            redelivery_count,
                            metadata,
                            payload,
                            checksum_valid,
                        ),
                        None => debug!(
                            "{} message for unknown consumer {}",
                            self.cnx_string, consumer_id
                        ),
                    }
                } else {
                    warn!("{} unexpected payload frame {}", self.cnx_string, command.name());
                    self.close(Error::Protocol("unexpected payload frame".into()));
                }
            }
        }
    }

    fn handle_command(&self, cmd: Command) {
        trace!("{} handling {}", self.cnx_string, cmd.name());
        match cmd {
            Command::Ping => {
                if let Err(e) = self.write_command(&Command::Pong) {
                    debug!("{} failed to answer ping: {}", self.cnx_string, e);
                }
            }
            Command::Pong => {}

            Command::AuthChallenge { challenge, .. } => self.handle_auth_challenge(&challenge),

            Command::SendReceipt { producer_id, sequence_id, message_id, .. } => {
                if let Some(producer) = self.producer(producer_id) {
                    if !producer.ack_received(sequence_id, message_id) {
                        self.close(Error::Protocol(format!(
                            "de-synchronized ack stream for producer {producer_id}"
                        )));
                    }
                } else {
                    debug!("{} receipt for unknown producer {}", self.cnx_string, producer_id);
                }
            }

            Command::SendError { producer_id, sequence_id, error, message } => {
                if error == ServerError::ChecksumError {
                    let recovered = self
                        .producer(producer_id)
                        .map(|p| p.remove_corrupt_message(sequence_id))
                        .unwrap_or(true);
                    if !recovered {
                        self.close(Error::ChecksumError);
                    }
                } else {
                    // Anything else leaves the session in doubt; reconnect and
                    // resend from the pending queue.
                    warn!(
                        "{} send error for producer {} seq {}: {}",
                        self.cnx_string, producer_id, sequence_id, message
                    );
                    self.close(Error::from_server_error(error, &message));
                }
            }

            Command::ProducerSuccess {
                request_id,
                producer_name,
                last_sequence_id,
                schema_version,
                topic_epoch,
                producer_ready,
            } => {
                if producer_ready {
                    self.complete_pending(
                        request_id,
                        Ok(ResponseData::ProducerSuccess {
                            producer_name,
                            last_sequence_id,
                            schema_version,
                            topic_epoch,
                        }),
                    );
                } else {
                    // Queued behind an exclusive owner: keep the entry alive
                    // but stop its deadline timer.
                    let mut registry = self.registry.lock();
                    if let Some(entry) = registry.pending.get_mut(&request_id) {
                        entry.has_response = true;
                        debug!(
                            "{} producer request {} queued at broker, awaiting ready",
                            self.cnx_string, request_id
                        );
                    }
                }
            }

            Command::Success { request_id, schema_version } => {
                self.complete_pending(request_id, Ok(ResponseData::Success { schema_version }));
            }

            Command::Error(CommandError { request_id, error, message }) => {
                let mapped = Error::from_server_error(error, &message);
                self.complete_pending(request_id, Err(mapped));
                if matches!(error, ServerError::ServiceNotReady | ServerError::TooManyRequests) {
                    // Force a reconnect rather than hammering a broker that
                    // told us it cannot serve.
                    self.close(Error::from_server_error(error, &message));
                }
            }

            Command::LookupResponse {
                request_id,
                response,
                broker_service_url,
                broker_service_url_tls,
                authoritative,
                proxy_through_service_url,
                error,
                message,
            } => {
                let result = if response == LookupType::Failed {
                    let error = error.unwrap_or(ServerError::UnknownError);
                    Err(Error::from_server_error(error, message.as_deref().unwrap_or("")))
                } else {
                    Ok(ResponseData::Lookup(LookupResult {
                        response,
                        broker_service_url,
                        broker_service_url_tls,
                        authoritative,
                        proxy_through_service_url,
                    }))
                };
                self.complete_pending(request_id, result);
            }

            Command::PartitionedMetadataResponse { request_id, partitions, error, message } => {
                let result = match error {
                    Some(error) => {
                        Err(Error::from_server_error(error, message.as_deref().unwrap_or("")))
                    }
                    None => Ok(ResponseData::PartitionedMetadata { partitions }),
                };
                self.complete_pending(request_id, result);
            }

            Command::ConsumerStatsResponse { request_id, error, message, msg_rate_out, msg_backlog } => {
                let result = match error {
                    Some(error) => {
                        Err(Error::from_server_error(error, message.as_deref().unwrap_or("")))
                    }
                    None => Ok(ResponseData::ConsumerStats { msg_rate_out, msg_backlog }),
                };
                self.complete_pending(request_id, result);
            }

            Command::GetLastMessageIdResponse {
                request_id,
                last_message_id,
                consumer_mark_delete_position,
            } => {
                self.complete_pending(
                    request_id,
                    Ok(ResponseData::LastMessageId { last_message_id, consumer_mark_delete_position }),
                );
            }

            Command::GetTopicsOfNamespaceResponse { request_id, topics } => {
                self.complete_pending(request_id, Ok(ResponseData::TopicsOfNamespace { topics }));
            }

            Command::GetSchemaResponse { request_id, error, message, schema } => {
                let result = match error {
                    Some(error) => {
                        Err(Error::from_server_error(error, message.as_deref().unwrap_or("")))
                    }
                    None => Ok(ResponseData::Schema { schema }),
                };
                self.complete_pending(request_id, result);
            }

            Command::AckResponse { request_id, error, message, .. } => {
                let result = match error {
                    Some(error) => {
                        Err(Error::from_server_error(error, message.as_deref().unwrap_or("")))
                    }
                    None => Ok(ResponseData::AckResponse),
                };
                self.complete_pending(request_id, result);
            }

            Command::CloseProducer { producer_id, .. } => {
                debug!("{} broker closed producer {}", self.cnx_string, producer_id);
                if let Some(producer) = self.producer(producer_id) {
                    producer.closed_by_broker();
                }
                self.remove_producer(producer_id);
            }

            Command::CloseConsumer { consumer_id, .. } => {
                if let Some(consumer) = self.consumer(consumer_id) {
                    consumer.closed_by_broker();
                }
                self.remove_consumer(consumer_id);
            }

            Command::ActiveConsumerChange { consumer_id, is_active } => {
                if let Some(consumer) = self.consumer(consumer_id) {
                    consumer.active_consumer_change(is_active);
                }
            }

            other => {
                warn!("{} unexpected {} from broker", self.cnx_string, other.name());
                self.close(Error::Protocol(format!("unexpected {} from broker", other.name())));
            }
        }
    }

    fn handle_auth_challenge(&self, challenge: &[u8]) {
        let Some(auth) = self.config.auth.as_ref() else {
            self.close(Error::AuthenticationError(
                "broker sent a challenge but no authentication is configured".into(),
            ));
            return;
        };
        match auth.challenge_response(challenge) {
            Ok(data) => {
                let response = Command::AuthResponse {
                    client_version: client_version_string(),
                    protocol_version: PROTOCOL_VERSION,
                    auth_method_name: auth.auth_method_name(),
                    auth_data: data,
                };
                if let Err(e) = self.write_command(&response) {
                    self.close(Error::AuthenticationError(format!(
                        "failed to send auth response: {e}"
                    )));
                }
            }
            Err(e) => {
                self.close(Error::AuthenticationError(format!("challenge handling failed: {e}")));
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn unexpected_response(expected: &str, got: &ResponseData) -> Error {
    Error::Protocol(format!("expected {expected}, got {got:?}"))
}

fn client_version_string() -> String {
    format!("murre-client-{}", env!("CARGO_PKG_VERSION"))
}

fn connect_command(config: &ClientConfig) -> Result<Command> {
    let (auth_method_name, auth_data) = match &config.auth {
        Some(auth) => (Some(auth.auth_method_name()), Some(auth.auth_data()?)),
        None => (None, None),
    };
    Ok(Command::Connect {
        client_version: client_version_string(),
        protocol_version: PROTOCOL_VERSION,
        auth_method_name,
        auth_data,
    })
}

/// SO_KEEPALIVE with aggressive probing so dead peers are noticed well before
/// the OS defaults would.
fn configure_tcp_keepalive(stream: &TcpStream) {
    use std::time::Duration;
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(6));
    #[cfg(not(windows))]
    let keepalive = keepalive.with_retries(10);
    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        debug!("failed to configure TCP keepalive: {}", e);
    }
}

fn build_tls_connector(config: &ClientConfig) -> Result<tokio_rustls::TlsConnector> {
    use rustls::RootCertStore;

    let tls = &config.tls;

    // Pick the server-certificate policy: full verification, chain-only
    // (hostname validation off), or none at all.
    let builder = if tls.allow_insecure_connection {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
    } else {
        let mut root_store = RootCertStore::empty();
        if let Some(path) = &tls.trust_certs_file {
            let pem = std::fs::read(path)
                .map_err(|e| Error::ConnectError(format!("cannot read {}: {e}", path.display())))?;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                let cert =
                    cert.map_err(|e| Error::ConnectError(format!("invalid trust cert: {e}")))?;
                root_store
                    .add(cert)
                    .map_err(|e| Error::ConnectError(format!("invalid trust cert: {e}")))?;
            }
        } else {
            for cert in rustls_native_certs::load_native_certs().certs {
                let _ = root_store.add(cert);
            }
        }
        let root_store = Arc::new(root_store);
        if tls.validate_hostname {
            rustls::ClientConfig::builder().with_root_certificates(root_store)
        } else {
            let inner = rustls::client::WebPkiServerVerifier::builder(root_store)
                .build()
                .map_err(|e| Error::ConnectError(format!("invalid trust store: {e}")))?;
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipHostnameVerification { inner }))
        }
    };

    let client_config = match (&tls.certificate_file, &tls.private_key_file) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = std::fs::read(cert_path).map_err(|e| {
                Error::ConnectError(format!("cannot read {}: {e}", cert_path.display()))
            })?;
            let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::ConnectError(format!("invalid client cert: {e}")))?;
            let key_pem = std::fs::read(key_path).map_err(|e| {
                Error::ConnectError(format!("cannot read {}: {e}", key_path.display()))
            })?;
            let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
                .map_err(|e| Error::ConnectError(format!("invalid client key: {e}")))?
                .ok_or_else(|| Error::ConnectError("no private key found".into()))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::ConnectError(format!("invalid client cert/key: {e}")))?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(tokio_rustls::TlsConnector::from(Arc::new(client_config)))
}

/// Verifies the certificate chain but tolerates a hostname mismatch, for
/// deployments that dial brokers by IP or through proxies.
#[derive(Debug)]
struct SkipHostnameVerification {
    inner: Arc<rustls::client::WebPkiServerVerifier>,
}

impl rustls::client::danger::ServerCertVerifier for SkipHostnameVerification {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::pki_types::CertificateDer<'_>,
        intermediates: &[rustls::pki_types::CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        ocsp_response: &[u8],
        now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForName
                | rustls::CertificateError::NotValidForNameContext { .. },
            )) => Ok(rustls::client::danger::ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Certificate verifier that accepts anything. Development only.
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

// ============================================================================
// Background tasks
// ============================================================================

async fn reader_task(
    connection: Weak<Connection>,
    mut read_half: ReadHalf<ConnectionStream>,
    mut buf: BytesMut,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        // Drain every complete frame before reading again.
        loop {
            let Some(conn) = connection.upgrade() else { return };
            match decode_frame(&mut buf) {
                Ok(Some(frame)) => conn.handle_frame(frame),
                Ok(None) => break,
                Err(e) => {
                    warn!("frame decode failed: {}", e);
                    conn.close(Error::Protocol(e.to_string()));
                    return;
                }
            }
        }

        // Grow the buffer by exactly what the pending frame still needs (with
        // a floor so small frames don't cause tiny reads).
        buf.reserve(frame_bytes_needed(&buf).max(DEFAULT_READ_BUFFER));

        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            read = read_half.read_buf(&mut buf) => {
                match read {
                    Ok(0) => {
                        if let Some(conn) = connection.upgrade() {
                            debug!("{} server closed the connection", conn.cnx_string);
                            conn.close(Error::NotConnected);
                        }
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if let Some(conn) = connection.upgrade() {
                            conn.close(Error::Io(e.to_string()));
                        }
                        return;
                    }
                }
            }
        }
    }
}

async fn writer_task(
    mut write_half: WriteHalf<ConnectionStream>,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if write_half.write_all(&frame).await.is_err() {
            break;
        }
        // Coalesce whatever queued up behind this frame into one flush.
        while let Ok(next) = rx.try_recv() {
            if write_half.write_all(&next).await.is_err() {
                return;
            }
        }
        if write_half.flush().await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

async fn keep_alive_task(connection: Weak<Connection>, mut shutdown: watch::Receiver<bool>) {
    let interval = match connection.upgrade() {
        Some(conn) => conn.config.keep_alive_interval,
        None => return,
    };
    if interval.is_zero() {
        return;
    }
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let Some(conn) = connection.upgrade() else { return };
                if conn.have_pending_ping.load(Ordering::Acquire) {
                    warn!("{} no traffic since last ping, closing", conn.cnx_string);
                    conn.close(Error::Retryable("keep-alive timeout".into()));
                    return;
                }
                conn.have_pending_ping.store(true, Ordering::Release);
                if conn.write_command(&Command::Ping).is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_message_size_only_grows() {
        let before = max_message_size();
        update_max_message_size(before.saturating_sub(1));
        assert_eq!(max_message_size(), before);
        update_max_message_size(before + 17);
        assert_eq!(max_message_size(), before + 17);
    }

    #[test]
    fn connection_state_decodes_from_u8() {
        assert_eq!(ConnectionState::from_u8(0), ConnectionState::Pending);
        assert_eq!(ConnectionState::from_u8(2), ConnectionState::Ready);
        assert_eq!(ConnectionState::from_u8(3), ConnectionState::Disconnected);
        assert_eq!(ConnectionState::from_u8(200), ConnectionState::Disconnected);
    }
}
