//! The sequenced publish pipeline: admission, metadata stamping, batching,
//! chunking, encryption, the in-flight queue, send timeouts and reconnect
//! resend.
//!
//! Every accepted message holds one semaphore permit per protocol-level op
//! and a memory reservation for its uncompressed size; both are released
//! exactly once: on ack, timeout, failure, or close. The pending queue is
//! strictly increasing by sequence id, and receipts complete callers in that
//! same order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, Semaphore};
use tracing::{debug, info, trace, warn};

use murre_protocol::{
    Command, KeyValue, MessageIdData, MessageMetadata, ProducerAccessMode, SingleMessageMetadata,
};

use crate::batch::{serialize_batch, BatchContainer, BatchEntry, BatchGroup};
use crate::compression::{codec_for, wire_compression};
use crate::config::{ClientConfig, CompressionType, ProducerConfig};
use crate::connection::{self, Connection, ProducerDispatch, ResponseData, SendArgs};
use crate::error::{Error, Result};
use crate::handler::{
    self, ConnectionPool, HandlerState, HandlerStatus, ReconnectableHandler,
};
use crate::memory::MemoryLimitController;
use crate::message::{Message, MessageId};

/// Public-key ciphers are re-imported on this cadence so key rotation is
/// picked up by long-lived producers.
const DATA_KEY_REFRESH_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

fn is_persistent_topic(topic: &str) -> bool {
    !topic.starts_with("non-persistent://")
}

/// `ceil(size / chunk_size)`, with sub-limit sizes staying a single chunk.
fn num_chunks(size: usize, chunk_size: usize) -> usize {
    if chunk_size == 0 || size <= chunk_size {
        1
    } else {
        size.div_ceil(chunk_size)
    }
}

// ============================================================================
// Send future
// ============================================================================

/// Resolves once the broker acknowledges the message (or the op fails).
///
/// Futures complete in sequence-id order for sends accepted by the same
/// producer.
#[derive(Debug)]
pub struct SendFuture(oneshot::Receiver<Result<MessageId>>);

impl std::future::Future for SendFuture {
    type Output = Result<MessageId>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        match std::pin::Pin::new(&mut self.0).poll(cx) {
            std::task::Poll::Ready(Ok(result)) => std::task::Poll::Ready(result),
            std::task::Poll::Ready(Err(_)) => std::task::Poll::Ready(Err(Error::AlreadyClosed)),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

// ============================================================================
// In-flight ops
// ============================================================================

/// Chunk bookkeeping shared by the ops of one chunked message.
struct ChunkRef {
    chunk_id: i32,
    num_chunks: i32,
    /// First chunk's message id, filled when its receipt arrives.
    assembly: Arc<Mutex<Option<MessageId>>>,
}

/// One op in the pending queue: a `Send` frame awaiting its receipt.
struct OpSendMsg {
    args: SendArgs,
    messages_count: usize,
    /// Bytes released against the memory budget when this op completes.
    messages_size: u64,
    deadline: Option<Instant>,
    /// `(batch_index, completion)`; batch index `-1` outside batches.
    completions: Vec<(i32, oneshot::Sender<Result<MessageId>>)>,
    flush_waiters: Vec<oneshot::Sender<Result<()>>>,
    chunk: Option<ChunkRef>,
}

struct ProducerShared {
    producer_name: String,
    schema_version: Vec<u8>,
    topic_epoch: Option<u64>,
    last_sequence_id_published: i64,
    sequence_generator: u64,
    pending: VecDeque<OpSendMsg>,
    batch: Option<BatchContainer>,
    /// Bumped to cancel an armed batch timer.
    batch_timer_epoch: u64,
}

// ============================================================================
// Producer inner
// ============================================================================

struct ProducerInner {
    weak_self: Weak<ProducerInner>,
    topic: String,
    producer_id: u64,
    partition: i32,
    config: ProducerConfig,
    pool: Arc<ConnectionPool>,
    memory: Arc<MemoryLimitController>,
    /// Chunking requires a persistent topic and batching off.
    chunking_enabled: bool,
    user_provided_name: bool,
    handler: HandlerState,
    semaphore: Option<Arc<Semaphore>>,
    shared: Mutex<ProducerShared>,
    created_tx: Mutex<Option<oneshot::Sender<Result<()>>>>,
    /// The create promise has been settled (successfully or not).
    created_done: AtomicBool,
    send_timer_started: AtomicBool,
    key_refresh_started: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Drop for ProducerInner {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

// ============================================================================
// Producer (public handle)
// ============================================================================

/// A producer bound to one topic (or one partition of a partitioned topic).
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

impl Producer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn create(
        client_config: Arc<ClientConfig>,
        pool: Arc<ConnectionPool>,
        memory: Arc<MemoryLimitController>,
        producer_id: u64,
        topic: String,
        partition: i32,
        config: ProducerConfig,
    ) -> Result<Producer> {
        let chunking_enabled =
            config.chunking_enabled && is_persistent_topic(&topic) && !config.batching_enabled;
        let user_provided_name = config.producer_name.is_some();

        let mandatory_stop = config
            .send_timeout
            .saturating_sub(Duration::from_millis(100))
            .max(Duration::from_millis(100));
        let handler = HandlerState::new(
            format!("[{}, {}]", topic, config.producer_name.as_deref().unwrap_or("")),
            client_config.operation_timeout,
            client_config.initial_backoff,
            client_config.max_backoff,
            mandatory_stop,
        );

        let semaphore = (config.max_pending_messages > 0)
            .then(|| Arc::new(Semaphore::new(config.max_pending_messages)));

        let batch = config.batching_enabled.then(|| {
            BatchContainer::new(
                config.batching_type,
                config.batching_max_messages,
                config.batching_max_bytes,
            )
        });

        let (shutdown, _) = watch::channel(false);
        let (created_tx, created_rx) = oneshot::channel();

        let inner = Arc::new_cyclic(|weak_self| ProducerInner {
            weak_self: weak_self.clone(),
            topic,
            producer_id,
            partition,
            shared: Mutex::new(ProducerShared {
                producer_name: config.producer_name.clone().unwrap_or_default(),
                schema_version: config.schema_version.clone().unwrap_or_default(),
                topic_epoch: None,
                last_sequence_id_published: config.initial_sequence_id,
                sequence_generator: config.initial_sequence_id.wrapping_add(1).max(0) as u64,
                pending: VecDeque::new(),
                batch,
                batch_timer_epoch: 0,
            }),
            config,
            pool,
            memory,
            chunking_enabled,
            user_provided_name,
            handler,
            semaphore,
            created_tx: Mutex::new(Some(created_tx)),
            created_done: AtomicBool::new(false),
            send_timer_started: AtomicBool::new(false),
            key_refresh_started: AtomicBool::new(false),
            shutdown,
        });

        // Lazily-started shared producers may take longer than the send
        // timeout to connect; their timer must already be running.
        if inner.config.lazy_start_partitioned_producers
            && inner.config.access_mode == ProducerAccessMode::Shared
        {
            inner.start_send_timeout_task();
        }

        handler::start(&inner).await;

        match created_rx.await {
            Ok(Ok(())) => Ok(Producer { inner }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::AlreadyClosed),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn producer_id(&self) -> u64 {
        self.inner.producer_id
    }

    /// Broker-assigned (or user-chosen) name.
    pub fn producer_name(&self) -> String {
        self.inner.shared.lock().producer_name.clone()
    }

    /// Highest sequence id known to be persisted.
    pub fn last_sequence_id(&self) -> i64 {
        self.inner.shared.lock().last_sequence_id_published
    }

    pub fn is_connected(&self) -> bool {
        self.inner.handler.status() == HandlerStatus::Ready
            && self.inner.handler.connection().is_some()
    }

    /// Publish and await the broker receipt.
    pub async fn send(&self, message: Message) -> Result<MessageId> {
        self.send_async(message).await?.await
    }

    /// Publish without awaiting the receipt. The returned future resolves on
    /// ack; futures resolve in admission order.
    pub async fn send_async(&self, message: Message) -> Result<SendFuture> {
        self.inner.send_async(message).await
    }

    /// Flush any pending batch and await the acknowledgement of the current
    /// queue tail.
    pub async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    /// Fire-and-forget batch flush.
    pub fn trigger_flush(&self) {
        self.inner.trigger_flush();
    }

    /// Fail outstanding work, notify the broker, and transition to Closed.
    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("topic", &self.inner.topic)
            .field("producer_id", &self.inner.producer_id)
            .field("state", &self.inner.handler.status())
            .finish()
    }
}

// ============================================================================
// Send pipeline
// ============================================================================

impl ProducerInner {
    fn arc(&self) -> Arc<ProducerInner> {
        self.weak_self.upgrade().expect("self reference outlives the producer")
    }

    fn dispatch_weak(&self) -> Weak<dyn ProducerDispatch> {
        self.weak_self.clone()
    }

    fn check_producer_state(&self) -> Result<()> {
        match self.handler.status() {
            // Pending is fine: ops queue locally until the connection is up.
            HandlerStatus::Ready | HandlerStatus::Pending => Ok(()),
            HandlerStatus::Closing | HandlerStatus::Closed => Err(Error::AlreadyClosed),
            HandlerStatus::ProducerFenced => Err(Error::ProducerFenced),
            HandlerStatus::NotStarted | HandlerStatus::Failed => Err(Error::NotConnected),
        }
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Acquire `permits` queue slots and `bytes` of the client memory budget.
    /// Blocking admission suspends; both waits abort with `Interrupted` when
    /// the producer (or client) is closed.
    async fn can_enqueue(&self, permits: u32, bytes: u64) -> Result<()> {
        if self.config.block_if_queue_full {
            if let Some(sem) = &self.semaphore {
                match sem.acquire_many(permits).await {
                    Ok(permit) => permit.forget(),
                    Err(_) => return Err(Error::Interrupted),
                }
            }
            if let Err(e) = self.memory.reserve(bytes).await {
                self.release_permits(permits as usize);
                return Err(e);
            }
            Ok(())
        } else {
            if let Some(sem) = &self.semaphore {
                match sem.try_acquire_many(permits) {
                    Ok(permit) => permit.forget(),
                    Err(_) => return Err(Error::ProducerQueueIsFull),
                }
            }
            if !self.memory.try_reserve(bytes) {
                self.release_permits(permits as usize);
                return Err(Error::MemoryBufferIsFull);
            }
            Ok(())
        }
    }

    fn release_permits(&self, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(sem) = &self.semaphore {
            sem.add_permits(count);
        }
    }

    fn release_for_op(&self, op: &OpSendMsg) {
        self.release_permits(op.messages_count);
        if op.messages_size > 0 {
            self.memory.release(op.messages_size);
        }
    }

    // ------------------------------------------------------------------
    // send_async
    // ------------------------------------------------------------------

    async fn send_async(&self, message: Message) -> Result<SendFuture> {
        self.check_producer_state()?;

        let uncompressed_size = message.payload.len();

        // Admission happens before any lock is taken; a blocked send never
        // holds up receipts or timers.
        if let Err(e) = self.can_enqueue(1, uncompressed_size as u64).await {
            // A full queue is the strongest flush trigger there is.
            if self.batching() {
                let failures = {
                    let mut shared = self.shared.lock();
                    self.flush_batches_locked(&mut shared)
                };
                self.fire_batch_failures(failures);
            }
            return Err(e);
        }

        if message.producer_name.is_some() && message.replicated_from.is_none() {
            self.release_permits(1);
            self.memory.release(uncompressed_size as u64);
            return Err(Error::InvalidMessage(
                "producer_name may only be set on replicated messages".into(),
            ));
        }

        if self.batching() && message.deliver_at.is_none() {
            self.send_batched(message, uncompressed_size)
        } else {
            self.send_unbatched(message, uncompressed_size).await
        }
    }

    fn batching(&self) -> bool {
        self.config.batching_enabled
    }

    fn send_batched(&self, message: Message, uncompressed_size: usize) -> Result<SendFuture> {
        let (tx, rx) = oneshot::channel();

        let mut failures = Vec::new();
        {
            let mut shared = self.shared.lock();
            let sequence_id = self.next_sequence_id(&mut shared, message.sequence_id);

            let fits = shared
                .batch
                .as_ref()
                .map(|c| c.has_enough_space(message.payload.len()))
                .unwrap_or(true);
            if !fits {
                failures.extend(self.flush_batches_locked(&mut shared));
            }

            let entry = BatchEntry {
                meta: SingleMessageMetadata {
                    properties: key_values(&message.properties),
                    partition_key: message.partition_key.clone(),
                    ordering_key: message.ordering_key.clone(),
                    event_time: message.event_time,
                    payload_size: message.payload.len() as u32,
                    sequence_id,
                },
                payload: message.payload,
                completion: tx,
                reserved_bytes: uncompressed_size as u64,
            };

            let container = shared.batch.as_mut().expect("batching path requires a container");
            let was_empty = container.is_empty();
            let is_full = container.add(entry);
            if was_empty {
                self.arm_batch_timer(&mut shared);
            }
            if is_full {
                failures.extend(self.flush_batches_locked(&mut shared));
            }
        }
        self.fire_batch_failures(failures);
        Ok(SendFuture(rx))
    }

    async fn send_unbatched(&self, message: Message, uncompressed_size: usize) -> Result<SendFuture> {
        let codec = codec_for(self.config.compression);
        let compressed = codec.encode(&message.payload)?;
        let compressed_size = compressed.len();
        let max_size = connection::max_message_size();

        // Base metadata, minus the fields that need the producer lock.
        let mut metadata = MessageMetadata {
            properties: key_values(&message.properties),
            partition_key: message.partition_key.clone(),
            ordering_key: message.ordering_key.clone(),
            event_time: message.event_time,
            deliver_at_time: message.deliver_at,
            replicated_from: message.replicated_from.clone(),
            ..Default::default()
        };
        if self.config.compression != CompressionType::None {
            metadata.compression = wire_compression(self.config.compression);
            metadata.uncompressed_size = uncompressed_size as u32;
        }

        // Chunk-count estimate with worst-case metadata so the extra permits
        // can be acquired before the producer lock is taken. The estimate
        // never undershoots; surplus permits are returned under the lock.
        let mut estimated_extra = 0u32;
        if self.chunking_enabled {
            let (producer_name, schema_version) = {
                let shared = self.shared.lock();
                (shared.producer_name.clone(), shared.schema_version.clone())
            };
            let mut probe = metadata.clone();
            probe.producer_name = producer_name;
            probe.sequence_id = u64::MAX;
            probe.publish_time = u64::MAX;
            probe.schema_version = Some(schema_version);
            probe.uuid = Some(format!("{}-{}", probe.producer_name, u64::MAX));
            probe.num_chunks_from_msg = Some(i32::MAX);
            probe.total_chunk_msg_size = Some(compressed_size as i32);
            probe.chunk_id = Some(i32::MAX);
            let probe_size = probe.encoded_len()?;
            if probe_size >= max_size {
                self.release_permits(1);
                self.memory.release(uncompressed_size as u64);
                warn!(
                    "{} metadata of {} bytes cannot fit the {} byte limit",
                    self.handler.name(),
                    probe_size,
                    max_size
                );
                return Err(Error::MessageTooBig);
            }
            let estimate = num_chunks(compressed_size, max_size - probe_size);
            estimated_extra = (estimate - 1) as u32;
            if estimated_extra > 0 {
                if let Err(e) = self.can_enqueue(estimated_extra, 0).await {
                    self.release_permits(1);
                    self.memory.release(uncompressed_size as u64);
                    return Err(e);
                }
            }
        }

        let (result, rx) = {
            let mut shared = self.shared.lock();
            self.build_and_enqueue_ops(
                &mut shared,
                message.sequence_id,
                metadata,
                compressed,
                uncompressed_size,
                estimated_extra as usize,
                max_size,
            )
        };
        match result {
            Ok(()) => Ok(SendFuture(rx)),
            Err(e) => Err(e),
        }
    }

    /// Stamp metadata, split into chunks, encrypt and enqueue. Holds the
    /// producer lock; all waits happened beforehand.
    ///
    /// Permit accounting on entry: 1 + `extra_permits` queue slots and the
    /// full `uncompressed_size` memory reservation are held.
    #[allow(clippy::too_many_arguments)]
    fn build_and_enqueue_ops(
        &self,
        shared: &mut ProducerShared,
        explicit_sequence_id: Option<u64>,
        mut metadata: MessageMetadata,
        payload: Bytes,
        uncompressed_size: usize,
        extra_permits: usize,
        max_size: usize,
    ) -> (Result<()>, oneshot::Receiver<Result<MessageId>>) {
        let (tx, rx) = oneshot::channel();

        let sequence_id = self.next_sequence_id(shared, explicit_sequence_id);
        metadata.producer_name = shared.producer_name.clone();
        metadata.publish_time = now_millis();
        metadata.sequence_id = sequence_id;
        if !shared.schema_version.is_empty() {
            metadata.schema_version = Some(shared.schema_version.clone());
        }

        let compressed_size = payload.len();
        let fail = |held_permits: usize, e: Error| -> Result<()> {
            self.release_permits(held_permits);
            self.memory.release(uncompressed_size as u64);
            Err(e)
        };

        let (total_chunks, chunk_payload_size) = if self.chunking_enabled {
            // Worst-case chunk fields so the sizing below is stable across
            // chunk ids.
            metadata.uuid = Some(format!("{}-{}", metadata.producer_name, sequence_id));
            metadata.num_chunks_from_msg = Some(i32::MAX);
            metadata.total_chunk_msg_size = Some(compressed_size as i32);
            metadata.chunk_id = Some(i32::MAX);
            let metadata_size = match metadata.encoded_len() {
                Ok(size) => size,
                Err(e) => return (fail(1 + extra_permits, e.into()), rx),
            };
            if metadata_size >= max_size {
                warn!(
                    "{} metadata of {} bytes cannot fit the {} byte limit",
                    self.handler.name(),
                    metadata_size,
                    max_size
                );
                return (fail(1 + extra_permits, Error::MessageTooBig), rx);
            }
            let chunk_payload_size = max_size - metadata_size;
            (num_chunks(compressed_size, chunk_payload_size), chunk_payload_size)
        } else {
            // One op carries the whole payload; the size gate below rejects
            // anything over the limit.
            (1, compressed_size)
        };

        // Reconcile the pre-lock estimate: return any surplus, and top up
        // (without blocking) in the unlikely case the stamped metadata grew
        // past the probe.
        let actual_extra = total_chunks - 1;
        if extra_permits > actual_extra {
            self.release_permits(extra_permits - actual_extra);
        } else if extra_permits < actual_extra {
            if let Some(sem) = &self.semaphore {
                match sem.try_acquire_many((actual_extra - extra_permits) as u32) {
                    Ok(permit) => permit.forget(),
                    Err(_) => return (fail(1 + extra_permits, Error::ProducerQueueIsFull), rx),
                }
            }
        }

        let send_chunks = total_chunks > 1;
        if send_chunks {
            metadata.num_chunks_from_msg = Some(total_chunks as i32);
        } else {
            metadata.uuid = None;
            metadata.num_chunks_from_msg = None;
            metadata.total_chunk_msg_size = None;
            metadata.chunk_id = None;
        }
        let assembly = send_chunks.then(|| Arc::new(Mutex::new(None)));

        let mut tx = Some(tx);
        let mut begin = 0usize;
        for chunk_id in 0..total_chunks {
            if send_chunks {
                metadata.chunk_id = Some(chunk_id as i32);
            }
            let end = (begin + chunk_payload_size).min(compressed_size);
            let chunk_payload = payload.slice(begin..end);
            begin = end;

            let encrypted = match self.encrypt_payload(&mut metadata, chunk_payload) {
                Ok(encrypted) => encrypted,
                Err(e) => {
                    // Chunks already enqueued keep their permits (their acks
                    // release them); everything not yet enqueued is returned
                    // here, along with the single memory reservation.
                    return (fail(total_chunks - chunk_id, e), rx);
                }
            };

            if !self.chunking_enabled {
                let metadata_size = match metadata.encoded_len() {
                    Ok(size) => size,
                    Err(e) => return (fail(1, e.into()), rx),
                };
                if metadata_size + encrypted.len() > max_size {
                    warn!(
                        "{} message of {} bytes exceeds the {} byte limit; enable chunking \
                         or reduce the payload",
                        self.handler.name(),
                        metadata_size + encrypted.len(),
                        max_size
                    );
                    return (fail(1, Error::MessageTooBig), rx);
                }
            }

            let is_last = chunk_id == total_chunks - 1;
            let op = OpSendMsg {
                args: SendArgs {
                    producer_id: self.producer_id,
                    sequence_id,
                    num_messages: 1,
                    highest_sequence_id: None,
                    metadata: metadata.clone(),
                    payload: encrypted,
                },
                messages_count: 1,
                // The single reservation is tied to the final chunk, the op
                // that also completes the caller.
                messages_size: if is_last { uncompressed_size as u64 } else { 0 },
                deadline: self.op_deadline(),
                completions: if is_last {
                    vec![(-1, tx.take().expect("last chunk consumes the completion"))]
                } else {
                    Vec::new()
                },
                flush_waiters: Vec::new(),
                chunk: assembly.as_ref().map(|assembly| ChunkRef {
                    chunk_id: chunk_id as i32,
                    num_chunks: total_chunks as i32,
                    assembly: Arc::clone(assembly),
                }),
            };
            self.enqueue_op(shared, op);
        }

        (Ok(()), rx)
    }

    fn next_sequence_id(&self, shared: &mut ProducerShared, explicit: Option<u64>) -> u64 {
        match explicit {
            Some(id) => id,
            None => {
                let id = shared.sequence_generator;
                shared.sequence_generator += 1;
                id
            }
        }
    }

    fn op_deadline(&self) -> Option<Instant> {
        (!self.config.send_timeout.is_zero()).then(|| Instant::now() + self.config.send_timeout)
    }

    fn encrypt_payload(&self, metadata: &mut MessageMetadata, payload: Bytes) -> Result<Bytes> {
        match &self.config.encryption {
            None => Ok(payload),
            Some(enc) => enc
                .crypto
                .encrypt(&enc.keys, enc.key_reader.as_ref(), metadata, &payload)
                .map_err(|e| match e {
                    Error::CryptoError(_) => e,
                    other => Error::CryptoError(other.to_string()),
                }),
        }
    }

    /// Append to the pending queue and transmit when a connection is
    /// attached; otherwise the op waits for the reconnect resend.
    fn enqueue_op(&self, shared: &mut ProducerShared, op: OpSendMsg) {
        debug_assert!(
            shared.pending.back().map(|prev| prev.args.sequence_id <= op.args.sequence_id).unwrap_or(true),
            "pending queue must stay ordered by sequence id"
        );
        let transmit = self.handler.connection();
        if let Some(cnx) = &transmit {
            trace!("{} sending seq {} immediately", self.handler.name(), op.args.sequence_id);
            if let Err(e) = cnx.send_message(&op.args) {
                debug!("{} transmit deferred: {}", self.handler.name(), e);
            }
        } else {
            trace!("{} connection not ready, queueing seq {}", self.handler.name(), op.args.sequence_id);
        }
        shared.pending.push_back(op);
    }

    // ------------------------------------------------------------------
    // Batching
    // ------------------------------------------------------------------

    fn arm_batch_timer(&self, shared: &mut ProducerShared) {
        shared.batch_timer_epoch += 1;
        let armed_epoch = shared.batch_timer_epoch;
        let weak = self.weak_self.clone();
        let delay = self.config.batching_max_publish_delay;
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
            let Some(inner) = weak.upgrade() else { return };
            if !inner.handler.status().is_active() {
                return;
            }
            let failures = {
                let mut shared = inner.shared.lock();
                if shared.batch_timer_epoch != armed_epoch {
                    // A flush already ran; this timer was cancelled.
                    return;
                }
                inner.flush_batches_locked(&mut shared)
            };
            inner.fire_batch_failures(failures);
        });
    }

    /// Drain the container into ops. Failed op construction is reported back
    /// so the entries can be completed outside the lock.
    fn flush_batches_locked(&self, shared: &mut ProducerShared) -> Vec<(BatchEntry, Error)> {
        shared.batch_timer_epoch += 1; // cancels any armed timer
        let groups = match shared.batch.as_mut() {
            Some(container) if !container.is_empty() => container.drain(),
            _ => return Vec::new(),
        };

        let mut failures = Vec::new();
        for group in groups {
            match self.build_batch_op(shared, group) {
                Ok(op) => self.enqueue_op(shared, op),
                Err((entries, e)) => {
                    warn!("{} failed to build batch op: {}", self.handler.name(), e);
                    failures.extend(entries.into_iter().map(|entry| (entry, e.clone())));
                }
            }
        }
        failures
    }

    fn build_batch_op(
        &self,
        shared: &mut ProducerShared,
        group: BatchGroup,
    ) -> std::result::Result<OpSendMsg, (Vec<BatchEntry>, Error)> {
        let raw = match serialize_batch(&group.entries) {
            Ok(raw) => raw,
            Err(e) => return Err((group.entries, e)),
        };
        let codec = codec_for(self.config.compression);
        let compressed = match codec.encode(&raw) {
            Ok(compressed) => compressed,
            Err(e) => return Err((group.entries, e)),
        };

        let mut metadata = MessageMetadata {
            producer_name: shared.producer_name.clone(),
            sequence_id: group.first_sequence_id(),
            publish_time: now_millis(),
            num_messages_in_batch: Some(group.entries.len() as i32),
            ..Default::default()
        };
        if self.config.compression != CompressionType::None {
            metadata.compression = wire_compression(self.config.compression);
            metadata.uncompressed_size = raw.len() as u32;
        }
        if !shared.schema_version.is_empty() {
            metadata.schema_version = Some(shared.schema_version.clone());
        }

        let payload = match self.encrypt_payload(&mut metadata, compressed) {
            Ok(payload) => payload,
            Err(e) => return Err((group.entries, e)),
        };

        let metadata_size = match metadata.encoded_len() {
            Ok(size) => size,
            Err(e) => return Err((group.entries, e.into())),
        };
        if metadata_size + payload.len() > connection::max_message_size() {
            return Err((group.entries, Error::MessageTooBig));
        }

        let messages_size: u64 = group.entries.iter().map(|e| e.reserved_bytes).sum();
        let highest_sequence_id = group.last_sequence_id();
        let num_messages = group.entries.len();
        let completions = group
            .entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| (i as i32, entry.completion))
            .collect();

        Ok(OpSendMsg {
            args: SendArgs {
                producer_id: self.producer_id,
                sequence_id: metadata.sequence_id,
                num_messages: num_messages as i32,
                highest_sequence_id: Some(highest_sequence_id),
                metadata,
                payload,
            },
            messages_count: num_messages,
            messages_size,
            deadline: self.op_deadline(),
            completions,
            flush_waiters: Vec::new(),
            chunk: None,
        })
    }

    fn fire_batch_failures(&self, failures: Vec<(BatchEntry, Error)>) {
        for (entry, e) in failures {
            self.release_permits(1);
            if entry.reserved_bytes > 0 {
                self.memory.release(entry.reserved_bytes);
            }
            let _ = entry.completion.send(Err(e));
        }
    }

    // ------------------------------------------------------------------
    // Flush / close
    // ------------------------------------------------------------------

    async fn flush(&self) -> Result<()> {
        if self.handler.status() != HandlerStatus::Ready {
            return Err(Error::AlreadyClosed);
        }

        let (failures, waiter) = {
            let mut shared = self.shared.lock();
            let failures = self.flush_batches_locked(&mut shared);
            let waiter = shared.pending.back_mut().map(|op| {
                let (tx, rx) = oneshot::channel();
                op.flush_waiters.push(tx);
                rx
            });
            (failures, waiter)
        };
        self.fire_batch_failures(failures);

        match waiter {
            Some(rx) => rx.await.map_err(|_| Error::AlreadyClosed)?,
            None => Ok(()),
        }
    }

    fn trigger_flush(&self) {
        if self.handler.status() != HandlerStatus::Ready {
            return;
        }
        let failures = {
            let mut shared = self.shared.lock();
            self.flush_batches_locked(&mut shared)
        };
        self.fire_batch_failures(failures);
    }

    async fn close(&self) -> Result<()> {
        // Never started: nothing to clean up beyond our own tasks.
        if self.handler.cas_status(HandlerStatus::NotStarted, HandlerStatus::Closed) {
            self.finish_shutdown();
            return Ok(());
        }

        let _ = self.shutdown.send(true); // cancels timers and refresh tasks
        if let Some(sem) = &self.semaphore {
            sem.close(); // wakes blocked admissions with Interrupted
        }

        // Remaining send callbacks run before the close completes.
        self.fail_pending(&Error::AlreadyClosed);

        let status = self.handler.status();
        if !status.is_active() {
            return Err(Error::AlreadyClosed);
        }
        info!("{} closing producer {}", self.handler.name(), self.producer_id);
        self.handler.set_status(HandlerStatus::Closing);

        let Some(cnx) = self.handler.connection() else {
            self.finish_shutdown();
            return Ok(());
        };
        // Detach first so nothing else is written from this producer.
        cnx.remove_producer(self.producer_id);
        self.handler.clear_connection();

        let request_id = cnx.next_request_id();
        let cmd = Command::CloseProducer { producer_id: self.producer_id, request_id };
        match cnx.send_request(request_id, cmd).await {
            Ok(_) => {
                self.finish_shutdown();
                Ok(())
            }
            Err(e) => {
                warn!("{} failed to close producer cleanly: {}", self.handler.name(), e);
                self.finish_shutdown();
                Err(e)
            }
        }
    }

    fn finish_shutdown(&self) {
        if let Some(cnx) = self.handler.connection() {
            cnx.remove_producer(self.producer_id);
        }
        self.handler.clear_connection();
        let _ = self.shutdown.send(true);
        self.complete_created(Err(Error::AlreadyClosed));
        self.handler.set_status(HandlerStatus::Closed);
    }

    /// Fail every queued op and batched entry, releasing their permits and
    /// memory exactly once.
    fn fail_pending(&self, e: &Error) {
        let (ops, entries) = {
            let mut shared = self.shared.lock();
            let ops: Vec<_> = shared.pending.drain(..).collect();
            let entries = Self::drain_batch_entries(&mut shared);
            (ops, entries)
        };
        debug!(
            "{} failing {} pending ops and {} batched entries: {}",
            self.handler.name(),
            ops.len(),
            entries.len(),
            e
        );
        for op in ops {
            self.release_for_op(&op);
            self.complete_op_failed(op, e);
        }
        for entry in entries {
            self.release_permits(1);
            if entry.reserved_bytes > 0 {
                self.memory.release(entry.reserved_bytes);
            }
            let _ = entry.completion.send(Err(e.clone()));
        }
    }

    fn drain_batch_entries(shared: &mut ProducerShared) -> Vec<BatchEntry> {
        shared.batch_timer_epoch += 1;
        match shared.batch.as_mut() {
            Some(container) if !container.is_empty() => {
                container.drain().into_iter().flat_map(|g| g.entries).collect()
            }
            _ => Vec::new(),
        }
    }

    fn complete_op_failed(&self, op: OpSendMsg, e: &Error) {
        for (_, tx) in op.completions {
            let _ = tx.send(Err(e.clone()));
        }
        for tx in op.flush_waiters {
            let _ = tx.send(Err(e.clone()));
        }
    }

    fn complete_created(&self, result: Result<()>) -> bool {
        let tx = self.created_tx.lock().take();
        match tx {
            Some(tx) => {
                self.created_done.store(true, Ordering::Release);
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn start_send_timeout_task(&self) {
        if self.config.send_timeout.is_zero() {
            return;
        }
        if self.send_timer_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = self.weak_self.clone();
        let send_timeout = self.config.send_timeout;
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut sleep_for = send_timeout;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(sleep_for) => {}
                    _ = shutdown.changed() => return,
                }
                let Some(inner) = weak.upgrade() else { return };
                if !inner.handler.status().is_active() {
                    return;
                }

                let (ops, entries) = {
                    let mut shared = inner.shared.lock();
                    match shared.pending.front().and_then(|op| op.deadline) {
                        None => {
                            sleep_for = send_timeout;
                            (Vec::new(), Vec::new())
                        }
                        Some(deadline) => {
                            let now = Instant::now();
                            if deadline <= now {
                                debug!(
                                    "{} send timeout expired, failing the queue",
                                    inner.handler.name()
                                );
                                let ops: Vec<_> = shared.pending.drain(..).collect();
                                let entries = Self::drain_batch_entries(&mut shared);
                                sleep_for = send_timeout;
                                (ops, entries)
                            } else {
                                // Head not expired yet; sleep just until it is.
                                sleep_for = deadline - now;
                                (Vec::new(), Vec::new())
                            }
                        }
                    }
                };

                for op in ops {
                    inner.release_for_op(&op);
                    inner.complete_op_failed(op, &Error::Timeout);
                }
                for entry in entries {
                    inner.release_permits(1);
                    if entry.reserved_bytes > 0 {
                        inner.memory.release(entry.reserved_bytes);
                    }
                    let _ = entry.completion.send(Err(Error::Timeout));
                }
            }
        });
    }

    fn start_data_key_refresh_task(&self) {
        let Some(enc) = self.config.encryption.clone() else { return };
        if self.key_refresh_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let name = self.handler.name();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + DATA_KEY_REFRESH_INTERVAL,
                DATA_KEY_REFRESH_INTERVAL,
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = enc.crypto.add_public_key_cipher(&enc.keys, enc.key_reader.as_ref()) {
                            warn!("{} data key refresh failed: {}", name, e);
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Create / reconnect
    // ------------------------------------------------------------------

    fn on_create_success(
        &self,
        cnx: &Arc<Connection>,
        producer_name: String,
        last_sequence_id: i64,
        schema_version: Vec<u8>,
        topic_epoch: Option<u64>,
    ) {
        let status = self.handler.status();
        if !status.is_active() {
            // closeAsync ran while the create RPC was in flight.
            debug!("producer closed while awaiting create response");
            self.fail_pending(&Error::AlreadyClosed);
            self.fire_close_producer(cnx);
            self.complete_created(Err(Error::AlreadyClosed));
            return;
        }

        {
            let mut shared = self.shared.lock();
            shared.producer_name = producer_name.clone();
            shared.schema_version = schema_version;
            shared.topic_epoch = topic_epoch;
            if shared.last_sequence_id_published == -1 && self.config.initial_sequence_id == -1 {
                // Adopt the broker's persisted watermark.
                shared.last_sequence_id_published = last_sequence_id;
                shared.sequence_generator = last_sequence_id.wrapping_add(1).max(0) as u64;
            }
            self.handler.set_name(format!("[{}, {}]", self.topic, producer_name));

            cnx.register_producer(self.producer_id, self.dispatch_weak());
            if !shared.pending.is_empty() {
                debug!(
                    "{} re-sending {} pending messages",
                    self.handler.name(),
                    shared.pending.len()
                );
                for op in &shared.pending {
                    if let Err(e) = cnx.send_message(&op.args) {
                        debug!("{} resend deferred: {}", self.handler.name(), e);
                        break;
                    }
                }
            }
            // New sends only transmit once the connection slot is set, which
            // happens after the resend, so original queue order is preserved.
            self.handler.set_connection(cnx);
            self.handler.set_status(HandlerStatus::Ready);
            self.handler.reset_backoff();
        }

        info!("{} created producer on {}", self.handler.name(), cnx.url());

        if !(self.config.lazy_start_partitioned_producers
            && self.config.access_mode == ProducerAccessMode::Shared)
        {
            self.start_send_timeout_task();
        }
        self.start_data_key_refresh_task();
        self.complete_created(Ok(()));
    }

    fn on_create_failure(&self, cnx: &Arc<Connection>, e: Error) {
        debug!("{} create producer failed: {}", self.handler.name(), e);

        let status = self.handler.status();
        if !status.is_active() {
            self.fail_pending(&Error::AlreadyClosed);
            if e == Error::Timeout {
                self.fire_close_producer(cnx);
            }
            self.complete_created(Err(Error::AlreadyClosed));
            return;
        }

        if e == Error::Timeout {
            // The broker may have created the producer anyway; make sure it
            // is reaped so the session does not stay fenced in.
            self.fire_close_producer(cnx);
        }

        if e == Error::ProducerFenced {
            self.handler.set_status(HandlerStatus::ProducerFenced);
            self.fail_pending(&e);
            self.complete_created(Err(e));
            return;
        }

        if self.created_done.load(Ordering::Acquire) {
            match &e {
                Error::ProducerBlockedQuotaExceededException => {
                    warn!("{} backlog quota exceeded, failing pending messages", self.handler.name());
                    self.fail_pending(&e);
                }
                Error::ProducerBlockedQuotaExceededError => {
                    warn!("{} producer blocked on creation, backlog quota exceeded", self.handler.name());
                }
                _ => {}
            }
            warn!("{} failed to reconnect producer: {}", self.handler.name(), e);
            handler::schedule_reconnection(self.arc());
        } else {
            let e = self.handler.convert_to_timeout_if_necessary(e, self.handler.creation);
            if e.is_retryable() {
                warn!("{} temporary error creating producer: {}", self.handler.name(), e);
                handler::schedule_reconnection(self.arc());
            } else {
                warn!("{} failed to create producer: {}", self.handler.name(), e);
                self.fail_pending(&e);
                self.handler.set_status(HandlerStatus::Failed);
                self.complete_created(Err(e));
            }
        }
    }

    /// Best-effort CLOSE_PRODUCER, detached from the caller.
    fn fire_close_producer(&self, cnx: &Arc<Connection>) {
        let cnx = Arc::clone(cnx);
        let producer_id = self.producer_id;
        tokio::spawn(async move {
            let request_id = cnx.next_request_id();
            let cmd = Command::CloseProducer { producer_id, request_id };
            let _ = cnx.send_request(request_id, cmd).await;
        });
    }
}

// ============================================================================
// Handler integration
// ============================================================================

impl ReconnectableHandler for ProducerInner {
    fn handler_state(&self) -> &HandlerState {
        &self.handler
    }

    fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    async fn connection_opened(self: Arc<Self>, cnx: Arc<Connection>) {
        if self.handler.status() == HandlerStatus::Closed {
            debug!("{} connection opened on a closed producer", self.handler.name());
            return;
        }

        let request_id = cnx.next_request_id();
        let (producer_name, topic_epoch) = {
            let shared = self.shared.lock();
            let name =
                (!shared.producer_name.is_empty()).then(|| shared.producer_name.clone());
            (name, shared.topic_epoch)
        };
        let cmd = Command::Producer {
            topic: self.topic.clone(),
            producer_id: self.producer_id,
            request_id,
            producer_name,
            encrypted: self.config.encryption.is_some(),
            properties: key_values(&self.config.properties),
            schema_version: self.config.schema_version.clone(),
            epoch: self.handler.epoch(),
            user_provided_producer_name: self.user_provided_name,
            access_mode: self.config.access_mode,
            topic_epoch,
            initial_subscription_name: self.config.initial_subscription_name.clone(),
        };

        match cnx.send_request(request_id, cmd).await {
            Ok(ResponseData::ProducerSuccess {
                producer_name,
                last_sequence_id,
                schema_version,
                topic_epoch,
            }) => self.on_create_success(&cnx, producer_name, last_sequence_id, schema_version, topic_epoch),
            Ok(other) => self.on_create_failure(
                &cnx,
                Error::Protocol(format!("expected PRODUCER_SUCCESS, got {other:?}")),
            ),
            Err(e) => self.on_create_failure(&cnx, e),
        }
    }

    fn connection_failed(&self, e: Error) {
        if self.config.lazy_start_partitioned_producers
            && self.config.access_mode == ProducerAccessMode::Shared
        {
            // Lazy producers keep retrying without surfacing dial errors.
            return;
        }
        if !self.created_done.load(Ordering::Acquire) && self.complete_created(Err(e)) {
            self.handler.set_status(HandlerStatus::Failed);
        }
    }
}

// ============================================================================
// Connection dispatch
// ============================================================================

impl ProducerDispatch for ProducerInner {
    fn ack_received(&self, sequence_id: u64, message_id: MessageIdData) -> bool {
        let op = {
            let mut shared = self.shared.lock();
            let Some(head) = shared.pending.front() else {
                debug!(
                    "{} receipt for seq {} after the op expired, ignoring",
                    self.handler.name(),
                    sequence_id
                );
                return true;
            };
            let expected = head.args.sequence_id;
            if sequence_id > expected {
                warn!(
                    "{} receipt for seq {} while expecting {} (queue {})",
                    self.handler.name(),
                    sequence_id,
                    expected,
                    shared.pending.len()
                );
                return false;
            }
            if sequence_id < expected {
                debug!(
                    "{} receipt for timed-out seq {} (expecting {})",
                    self.handler.name(),
                    sequence_id,
                    expected
                );
                return true;
            }
            let op = shared.pending.pop_front().expect("head checked above");
            shared.last_sequence_id_published =
                (sequence_id + op.messages_count as u64 - 1) as i64;
            op
        };

        self.release_for_op(&op);

        let mut message_id = MessageId::from_data(message_id, self.partition);
        if let Some(chunk) = &op.chunk {
            if chunk.chunk_id == 0 {
                *chunk.assembly.lock() = Some(message_id.clone());
            }
            if chunk.chunk_id == chunk.num_chunks - 1 {
                message_id.first_chunk = chunk.assembly.lock().take().map(Box::new);
            }
        }

        trace!("{} receipt for seq {} -> {}", self.handler.name(), sequence_id, message_id);
        for (batch_index, tx) in op.completions {
            let id = if batch_index >= 0 {
                message_id.clone().with_batch_index(batch_index)
            } else {
                message_id.clone()
            };
            let _ = tx.send(Ok(id));
        }
        for tx in op.flush_waiters {
            let _ = tx.send(Ok(()));
        }
        true
    }

    fn remove_corrupt_message(&self, sequence_id: u64) -> bool {
        let op = {
            let mut shared = self.shared.lock();
            let Some(head) = shared.pending.front() else {
                debug!(
                    "{} checksum failure for expired seq {}, ignoring",
                    self.handler.name(),
                    sequence_id
                );
                return true;
            };
            let expected = head.args.sequence_id;
            if sequence_id > expected {
                warn!(
                    "{} checksum failure for seq {} while expecting {}",
                    self.handler.name(),
                    sequence_id,
                    expected
                );
                return false;
            }
            if sequence_id < expected {
                debug!("{} corrupt message already timed out: seq {}", self.handler.name(), sequence_id);
                return true;
            }
            shared.pending.pop_front().expect("head checked above")
        };
        self.release_for_op(&op);
        self.complete_op_failed(op, &Error::ChecksumError);
        true
    }

    fn closed_by_broker(&self) {
        debug!("{} broker closed producer {}", self.handler.name(), self.producer_id);
        if let Some(cnx) = self.handler.connection() {
            cnx.remove_producer(self.producer_id);
        }
        self.handler.clear_connection();
        handler::schedule_reconnection(self.arc());
    }

    fn connection_closed(&self, reason: &Error, cnx_id: u64) {
        handler::handle_disconnection(&self.arc(), reason, cnx_id);
    }
}

fn key_values(pairs: &[(String, String)]) -> Vec<KeyValue> {
    pairs.iter().map(|(k, v)| KeyValue::new(k.clone(), v.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_matches_ceiling_division() {
        assert_eq!(num_chunks(10, 100), 1);
        assert_eq!(num_chunks(100, 100), 1);
        assert_eq!(num_chunks(101, 100), 2);
        assert_eq!(num_chunks(3000, 924), 4);
        assert_eq!(num_chunks(0, 100), 1);
        assert_eq!(num_chunks(10, 0), 1);
    }

    #[test]
    fn persistent_topic_detection() {
        assert!(is_persistent_topic("persistent://tenant/ns/topic"));
        assert!(is_persistent_topic("tenant/ns/topic"));
        assert!(!is_persistent_topic("non-persistent://tenant/ns/topic"));
    }

    #[test]
    fn publish_timestamp_is_epoch_millis() {
        let now = now_millis();
        // 2020-01-01 in epoch millis; sanity-checks the unit.
        assert!(now > 1_577_836_800_000);
    }
}
