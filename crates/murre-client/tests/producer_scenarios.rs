//! End-to-end producer scenarios against a mock broker speaking the real
//! wire protocol over loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use murre_client::{
    Client, ClientConfig, CompressionType, Error, Message, ProducerConfig,
};
use murre_protocol::{
    decode_frame, encode_command, Command, CommandError, Frame, LookupType, MessageIdData,
    MessageMetadata, ServerError, PROTOCOL_VERSION,
};

// ============================================================================
// Mock broker
// ============================================================================

#[derive(Debug)]
enum BrokerEvent {
    Connected { connection: usize },
    ProducerCreated { connection: usize },
    SendReceived {
        connection: usize,
        sequence_id: u64,
        num_messages: i32,
        metadata: MessageMetadata,
        payload: Bytes,
    },
}

enum BrokerCommand {
    /// Emit a receipt for `sequence_id` on the live connection.
    Ack { sequence_id: u64 },
}

#[derive(Clone, Copy)]
struct BrokerOptions {
    auto_ack: bool,
    /// Drop connection 0 after this many `Send` frames, without acking.
    drop_first_connection_after_sends: Option<usize>,
    answer_pings: bool,
    respond_to_producer: bool,
    producer_error: Option<ServerError>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            auto_ack: true,
            drop_first_connection_after_sends: None,
            answer_pings: true,
            respond_to_producer: true,
            producer_error: None,
        }
    }
}

struct MockBroker {
    service_url: String,
    events: mpsc::UnboundedReceiver<BrokerEvent>,
    control: mpsc::UnboundedSender<BrokerCommand>,
}

impl MockBroker {
    async fn start(options: BrokerOptions) -> MockBroker {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (event_tx, events) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let control_rx = Arc::new(tokio::sync::Mutex::new(control_rx));

        tokio::spawn(async move {
            let mut connection = 0usize;
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                tokio::spawn(handle_connection(
                    stream,
                    connection,
                    options,
                    event_tx.clone(),
                    Arc::clone(&control_rx),
                ));
                connection += 1;
            }
        });

        MockBroker {
            service_url: format!("murre://127.0.0.1:{port}"),
            events,
            control: control_tx,
        }
    }

    async fn next_event(&mut self) -> BrokerEvent {
        timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for broker event")
            .expect("broker event stream ended")
    }

    async fn expect_send(&mut self) -> (usize, u64, i32, MessageMetadata, Bytes) {
        loop {
            if let BrokerEvent::SendReceived { connection, sequence_id, num_messages, metadata, payload } =
                self.next_event().await
            {
                return (connection, sequence_id, num_messages, metadata, payload);
            }
        }
    }

    async fn expect_producer_created(&mut self) -> usize {
        loop {
            if let BrokerEvent::ProducerCreated { connection } = self.next_event().await {
                return connection;
            }
        }
    }

    fn ack(&self, sequence_id: u64) {
        self.control.send(BrokerCommand::Ack { sequence_id }).unwrap();
    }
}

async fn write_frame(stream: &mut TcpStream, cmd: &Command) -> std::io::Result<()> {
    let frame = encode_command(cmd).expect("encode");
    stream.write_all(&frame).await?;
    stream.flush().await
}

async fn handle_connection(
    mut stream: TcpStream,
    connection: usize,
    options: BrokerOptions,
    events: mpsc::UnboundedSender<BrokerEvent>,
    control: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<BrokerCommand>>>,
) {
    use tokio::io::AsyncReadExt;

    let mut buf = BytesMut::with_capacity(64 * 1024);
    let mut entry_counter = 0u64;
    let mut sends_seen = 0usize;
    let mut producer_id = 0u64;

    loop {
        tokio::select! {
            cmd = async { control.lock().await.recv().await } => {
                let Some(BrokerCommand::Ack { sequence_id }) = cmd else { return };
                let receipt = Command::SendReceipt {
                    producer_id,
                    sequence_id,
                    message_id: MessageIdData {
                        ledger_id: 1,
                        entry_id: entry_counter,
                        partition: -1,
                        batch_index: -1,
                    },
                    highest_sequence_id: None,
                };
                entry_counter += 1;
                if write_frame(&mut stream, &receipt).await.is_err() {
                    return;
                }
            }
            read = stream.read_buf(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
                loop {
                    let frame = match decode_frame(&mut buf) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(e) => panic!("broker failed to decode frame: {e}"),
                    };
                    match frame {
                        Frame::Command(Command::Connect { protocol_version, .. }) => {
                            assert_eq!(protocol_version, PROTOCOL_VERSION);
                            let connected = Command::Connected {
                                server_version: "mock-broker".into(),
                                protocol_version: PROTOCOL_VERSION,
                                max_message_size: None,
                            };
                            if write_frame(&mut stream, &connected).await.is_err() {
                                return;
                            }
                            let _ = events.send(BrokerEvent::Connected { connection });
                        }
                        Frame::Command(Command::Producer { producer_id: id, request_id, .. }) => {
                            producer_id = id;
                            if let Some(error) = options.producer_error {
                                let err = Command::Error(CommandError {
                                    request_id,
                                    error,
                                    message: "mock rejection".into(),
                                });
                                let _ = write_frame(&mut stream, &err).await;
                                continue;
                            }
                            if !options.respond_to_producer {
                                continue;
                            }
                            let success = Command::ProducerSuccess {
                                request_id,
                                producer_name: "mock-producer".into(),
                                last_sequence_id: -1,
                                schema_version: Vec::new(),
                                topic_epoch: Some(0),
                                producer_ready: true,
                            };
                            if write_frame(&mut stream, &success).await.is_err() {
                                return;
                            }
                            let _ = events.send(BrokerEvent::ProducerCreated { connection });
                        }
                        Frame::Payload { command, metadata, payload, checksum_valid, .. } => {
                            let Command::Send { sequence_id, num_messages, .. } = command else {
                                panic!("unexpected payload frame {}", command.name());
                            };
                            assert!(checksum_valid, "send frame failed checksum validation");
                            sends_seen += 1;
                            let _ = events.send(BrokerEvent::SendReceived {
                                connection,
                                sequence_id,
                                num_messages,
                                metadata,
                                payload,
                            });
                            if connection == 0 {
                                if let Some(limit) = options.drop_first_connection_after_sends {
                                    if sends_seen >= limit {
                                        return; // simulate broker crash
                                    }
                                }
                            }
                            if options.auto_ack {
                                let receipt = Command::SendReceipt {
                                    producer_id,
                                    sequence_id,
                                    message_id: MessageIdData {
                                        ledger_id: 1,
                                        entry_id: entry_counter,
                                        partition: -1,
                                        batch_index: -1,
                                    },
                                    highest_sequence_id: None,
                                };
                                entry_counter += 1;
                                if write_frame(&mut stream, &receipt).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Frame::Command(Command::CloseProducer { request_id, .. }) => {
                            let success = Command::Success { request_id, schema_version: None };
                            if write_frame(&mut stream, &success).await.is_err() {
                                return;
                            }
                        }
                        Frame::Command(Command::Ping) => {
                            if options.answer_pings
                                && write_frame(&mut stream, &Command::Pong).await.is_err()
                            {
                                return;
                            }
                        }
                        Frame::Command(Command::Pong) => {}
                        Frame::Command(Command::Lookup { request_id, topic, .. }) => {
                            let response = Command::LookupResponse {
                                request_id,
                                response: LookupType::Connect,
                                broker_service_url: format!("murre://127.0.0.1:0/{topic}"),
                                broker_service_url_tls: None,
                                authoritative: true,
                                proxy_through_service_url: false,
                                error: None,
                                message: None,
                            };
                            if write_frame(&mut stream, &response).await.is_err() {
                                return;
                            }
                        }
                        Frame::Command(Command::PartitionedMetadata { request_id, .. }) => {
                            let response = Command::PartitionedMetadataResponse {
                                request_id,
                                partitions: 4,
                                error: None,
                                message: None,
                            };
                            if write_frame(&mut stream, &response).await.is_err() {
                                return;
                            }
                        }
                        Frame::Command(other) => {
                            panic!("mock broker got unexpected {}", other.name());
                        }
                    }
                }
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn client_for(broker: &MockBroker) -> Client {
    Client::new(
        ClientConfig::builder()
            .service_url(broker.service_url.clone())
            .initial_backoff(Duration::from_millis(50))
            .max_backoff(Duration::from_secs(1))
            .operation_timeout(Duration::from_secs(5))
            .build(),
    )
    .unwrap()
}

fn unbatched() -> ProducerConfig {
    ProducerConfig::builder().batching_enabled(false).build()
}

// ============================================================================
// Scenarios
// ============================================================================

/// Serial sends are acked in order; the published watermark advances and
/// the queue fully drains.
#[tokio::test]
async fn receipts_complete_in_order() {
    let mut broker = MockBroker::start(BrokerOptions::default()).await;
    let client = client_for(&broker);
    let producer = client.create_producer("persistent://t/ns/s1", unbatched()).await.unwrap();
    assert_eq!(producer.producer_name(), "mock-producer");

    let mut futures = Vec::new();
    for payload in ["a", "b", "c"] {
        futures.push(producer.send_async(Message::new(payload)).await.unwrap());
    }

    let mut entry_ids = Vec::new();
    for future in futures {
        let id = timeout(Duration::from_secs(5), future).await.unwrap().unwrap();
        assert_eq!(id.ledger_id, 1);
        entry_ids.push(id.entry_id);
    }
    assert_eq!(entry_ids, vec![0, 1, 2]);
    assert_eq!(producer.last_sequence_id(), 2);

    // Broker saw the same order.
    for expected_seq in 0..3u64 {
        let (_, seq, n, _, _) = broker.expect_send().await;
        assert_eq!(seq, expected_seq);
        assert_eq!(n, 1);
    }

    producer.close().await.unwrap();
    client.close().await;
}

/// Pipelined sends: callbacks fire in sequence order with no gaps or
/// duplicates.
#[tokio::test]
async fn pipelined_sends_preserve_order() {
    let mut broker = MockBroker::start(BrokerOptions::default()).await;
    let client = client_for(&broker);
    let producer = client.create_producer("persistent://t/ns/pipeline", unbatched()).await.unwrap();

    let mut futures = Vec::new();
    for i in 0..20 {
        futures.push(producer.send_async(Message::new(format!("m{i}"))).await.unwrap());
    }
    for (i, future) in futures.into_iter().enumerate() {
        let id = timeout(Duration::from_secs(5), future).await.unwrap().unwrap();
        assert_eq!(id.entry_id, i as u64);
    }
    assert_eq!(producer.last_sequence_id(), 19);

    for expected_seq in 0..20u64 {
        let (_, seq, _, _, _) = broker.expect_send().await;
        assert_eq!(seq, expected_seq);
    }
    client.close().await;
}

/// The broker dies with two unacked sends in flight; after the
/// reconnect, both are retransmitted in order with their original payloads
/// and only then acked.
#[tokio::test]
async fn reconnect_resends_pending_in_order() {
    let mut broker = MockBroker::start(BrokerOptions {
        drop_first_connection_after_sends: Some(2),
        ..Default::default()
    })
    .await;
    let client = client_for(&broker);
    let producer = client.create_producer("persistent://t/ns/s2", unbatched()).await.unwrap();
    assert_eq!(broker.expect_producer_created().await, 0);

    let f1 = producer.send_async(Message::new("first")).await.unwrap();
    let f2 = producer.send_async(Message::new("second")).await.unwrap();

    // Connection 0 receives both and drops without acking.
    let (c, seq, _, _, payload) = broker.expect_send().await;
    assert_eq!((c, seq, &payload[..]), (0, 0, b"first".as_slice()));
    let (c, seq, _, _, payload) = broker.expect_send().await;
    assert_eq!((c, seq, &payload[..]), (0, 1, b"second".as_slice()));

    // Reconnect re-creates the producer, then replays the queue unchanged.
    assert_eq!(broker.expect_producer_created().await, 1);
    let (c, seq, _, _, payload) = broker.expect_send().await;
    assert_eq!((c, seq, &payload[..]), (1, 0, b"first".as_slice()));
    let (c, seq, _, _, payload) = broker.expect_send().await;
    assert_eq!((c, seq, &payload[..]), (1, 1, b"second".as_slice()));

    let id1 = timeout(Duration::from_secs(5), f1).await.unwrap().unwrap();
    let id2 = timeout(Duration::from_secs(5), f2).await.unwrap().unwrap();
    assert!(id1.entry_id < id2.entry_id);
    client.close().await;
}

/// With a single-slot queue and fail-fast admission, the second send is
/// rejected and the slot reopens after the ack.
#[tokio::test]
async fn queue_full_fails_fast_and_recovers() {
    let mut broker = MockBroker::start(BrokerOptions { auto_ack: false, ..Default::default() }).await;
    let client = client_for(&broker);
    let producer = client
        .create_producer(
            "persistent://t/ns/s3",
            ProducerConfig::builder()
                .batching_enabled(false)
                .max_pending_messages(1)
                .block_if_queue_full(false)
                .build(),
        )
        .await
        .unwrap();

    let f1 = producer.send_async(Message::new("one")).await.unwrap();
    broker.expect_send().await;

    let err = producer.send_async(Message::new("two")).await.unwrap_err();
    assert_eq!(err, Error::ProducerQueueIsFull);

    broker.ack(0);
    timeout(Duration::from_secs(5), f1).await.unwrap().unwrap();

    // The slot is free again.
    let _f3 = producer.send_async(Message::new("three")).await.unwrap();
    client.close().await;
}

/// Blocking admission parks the sender until the ack frees the slot.
#[tokio::test]
async fn blocking_admission_waits_for_capacity() {
    let mut broker = MockBroker::start(BrokerOptions { auto_ack: false, ..Default::default() }).await;
    let client = client_for(&broker);
    let producer = client
        .create_producer(
            "persistent://t/ns/blocking",
            ProducerConfig::builder()
                .batching_enabled(false)
                .max_pending_messages(1)
                .block_if_queue_full(true)
                .build(),
        )
        .await
        .unwrap();

    let f1 = producer.send_async(Message::new("one")).await.unwrap();
    broker.expect_send().await;

    let blocked = {
        let producer = producer.clone();
        tokio::spawn(async move { producer.send_async(Message::new("two")).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!blocked.is_finished(), "send should be parked on admission");

    broker.ack(0);
    timeout(Duration::from_secs(5), f1).await.unwrap().unwrap();
    timeout(Duration::from_secs(5), blocked).await.unwrap().unwrap().unwrap();
    client.close().await;
}

/// An unacked op times out, its callback fires with `Timeout`, the queue
/// drains and new sends are admitted normally.
#[tokio::test]
async fn send_timeout_fails_the_op_and_frees_the_queue() {
    let mut broker = MockBroker::start(BrokerOptions { auto_ack: false, ..Default::default() }).await;
    let client = client_for(&broker);
    let producer = client
        .create_producer(
            "persistent://t/ns/s4",
            ProducerConfig::builder()
                .batching_enabled(false)
                .max_pending_messages(1)
                .send_timeout(Duration::from_millis(300))
                .build(),
        )
        .await
        .unwrap();

    let f1 = producer.send_async(Message::new("doomed")).await.unwrap();
    broker.expect_send().await;

    let result = timeout(Duration::from_secs(2), f1).await.unwrap();
    assert_eq!(result.unwrap_err(), Error::Timeout);

    // Queue slot and memory were released; the next send is admitted.
    let _f2 = producer.send_async(Message::new("fresh")).await.unwrap();
    client.close().await;
}

/// Two quick sends with batching on produce one `Send` frame with two
/// entries, and one receipt completes both callbacks in order.
#[tokio::test]
async fn batching_coalesces_into_one_frame() {
    let mut broker = MockBroker::start(BrokerOptions::default()).await;
    let client = client_for(&broker);
    let producer = client
        .create_producer(
            "persistent://t/ns/s5",
            ProducerConfig::builder()
                .batching_enabled(true)
                .batching_max_publish_delay(Duration::from_millis(50))
                .build(),
        )
        .await
        .unwrap();

    let f1 = producer.send_async(Message::new("left")).await.unwrap();
    let f2 = producer.send_async(Message::new("right")).await.unwrap();

    let (_, seq, num_messages, metadata, payload) = broker.expect_send().await;
    assert_eq!(seq, 0);
    assert_eq!(num_messages, 2);
    assert_eq!(metadata.num_messages_in_batch, Some(2));
    assert!(payload.len() > b"left".len() + b"right".len());

    let id1 = timeout(Duration::from_secs(5), f1).await.unwrap().unwrap();
    let id2 = timeout(Duration::from_secs(5), f2).await.unwrap().unwrap();
    assert_eq!(id1.batch_index, 0);
    assert_eq!(id2.batch_index, 1);
    assert_eq!((id1.ledger_id, id1.entry_id), (id2.ledger_id, id2.entry_id));
    client.close().await;
}

/// `flush` forces the lingering batch out before the publish delay expires.
#[tokio::test]
async fn flush_forces_a_lingering_batch() {
    let mut broker = MockBroker::start(BrokerOptions::default()).await;
    let client = client_for(&broker);
    let producer = client
        .create_producer(
            "persistent://t/ns/flush",
            ProducerConfig::builder()
                .batching_enabled(true)
                .batching_max_publish_delay(Duration::from_secs(30))
                .build(),
        )
        .await
        .unwrap();

    let f1 = producer.send_async(Message::new("lingering")).await.unwrap();
    timeout(Duration::from_secs(5), producer.flush()).await.unwrap().unwrap();
    timeout(Duration::from_secs(5), f1).await.unwrap().unwrap();

    let (_, _, num_messages, _, _) = broker.expect_send().await;
    assert_eq!(num_messages, 1);
    client.close().await;
}

/// An oversized message is split into `ceil(size / chunk)` chunk frames
/// sharing a uuid; only the last chunk resolves the caller, with a composite
/// id spanning the first and last chunks.
#[tokio::test]
async fn chunking_splits_oversized_messages() {
    let mut broker = MockBroker::start(BrokerOptions::default()).await;
    let client = client_for(&broker);
    let producer = client
        .create_producer(
            "persistent://t/ns/s6",
            ProducerConfig::builder()
                .batching_enabled(false)
                .chunking_enabled(true)
                .compression(CompressionType::None)
                .build(),
        )
        .await
        .unwrap();

    // Well past the 5 MiB default limit: expect three chunks.
    let payload_size = 12 * 1024 * 1024;
    let payload = vec![0x5au8; payload_size];
    let future = producer.send_async(Message::new(payload)).await.unwrap();

    let mut uuids = Vec::new();
    let mut chunk_ids = Vec::new();
    let mut total = 0usize;
    for _ in 0..3 {
        let (_, seq, _, metadata, chunk) = broker.expect_send().await;
        assert_eq!(seq, 0, "chunks share the message's sequence id");
        assert_eq!(metadata.num_chunks_from_msg, Some(3));
        assert_eq!(metadata.total_chunk_msg_size, Some(payload_size as i32));
        uuids.push(metadata.uuid.clone().expect("chunks carry a uuid"));
        chunk_ids.push(metadata.chunk_id.expect("chunks carry an id"));
        total += chunk.len();
    }
    assert_eq!(chunk_ids, vec![0, 1, 2]);
    assert_eq!(total, payload_size);
    assert!(uuids.windows(2).all(|w| w[0] == w[1]), "uuid differs across chunks");

    let id = timeout(Duration::from_secs(10), future).await.unwrap().unwrap();
    // Receipts were entries 0, 1, 2: the composite id spans first and last.
    assert_eq!(id.entry_id, 2);
    assert_eq!(id.first_chunk.expect("composite id").entry_id, 0);
    client.close().await;
}

/// A silent broker is detected by the keep-alive probe and the producer
/// transparently reconnects.
#[tokio::test]
async fn keep_alive_detects_a_silent_broker() {
    let mut broker = MockBroker::start(BrokerOptions { answer_pings: false, ..Default::default() }).await;
    let client = Client::new(
        ClientConfig::builder()
            .service_url(broker.service_url.clone())
            .initial_backoff(Duration::from_millis(50))
            .keep_alive_interval(Duration::from_millis(150))
            .build(),
    )
    .unwrap();

    let _producer = client.create_producer("persistent://t/ns/ka", unbatched()).await.unwrap();
    assert_eq!(broker.expect_producer_created().await, 0);

    // Two silent keep-alive intervals force a close and a reconnect.
    let reconnected = broker.expect_producer_created().await;
    assert!(reconnected >= 1);
    client.close().await;
}

/// A broker that rejects the create terminates the producer with the mapped
/// error instead of retrying.
#[tokio::test]
async fn create_failure_surfaces_mapped_error() {
    let broker = MockBroker::start(BrokerOptions {
        producer_error: Some(ServerError::AuthorizationError),
        ..Default::default()
    })
    .await;
    let client = client_for(&broker);
    let err = client.create_producer("persistent://t/ns/denied", unbatched()).await.unwrap_err();
    assert!(matches!(err, Error::AuthorizationError(_)));
    client.close().await;
}

/// A create with no response at all times out at the operation deadline.
#[tokio::test]
async fn unanswered_create_times_out() {
    let broker = MockBroker::start(BrokerOptions {
        respond_to_producer: false,
        ..Default::default()
    })
    .await;
    let client = Client::new(
        ClientConfig::builder()
            .service_url(broker.service_url.clone())
            .operation_timeout(Duration::from_millis(300))
            .build(),
    )
    .unwrap();
    let err = client.create_producer("persistent://t/ns/silent", unbatched()).await.unwrap_err();
    assert_eq!(err, Error::Timeout);
    client.close().await;
}

/// Lookup-style RPCs resolve through the shared connection.
#[tokio::test]
async fn lookups_resolve_through_the_connection() {
    let broker = MockBroker::start(BrokerOptions::default()).await;
    let client = client_for(&broker);

    let lookup = client.lookup_topic("persistent://t/ns/topic").await.unwrap();
    assert!(lookup.broker_service_url.contains("persistent://t/ns/topic"));
    assert!(lookup.authoritative);

    let partitions = client.partitioned_metadata("persistent://t/ns/topic").await.unwrap();
    assert_eq!(partitions, 4);
    client.close().await;
}

/// Closing a producer fails nothing that was already acked and rejects
/// further sends.
#[tokio::test]
async fn close_rejects_new_sends() {
    let broker = MockBroker::start(BrokerOptions::default()).await;
    let client = client_for(&broker);
    let producer = client.create_producer("persistent://t/ns/close", unbatched()).await.unwrap();

    producer.send(Message::new("ok")).await.unwrap();
    producer.close().await.unwrap();

    let err = producer.send_async(Message::new("late")).await.unwrap_err();
    assert_eq!(err, Error::AlreadyClosed);
    client.close().await;
}
