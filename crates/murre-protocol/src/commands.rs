//! Protocol command and metadata types.

use serde::{Deserialize, Serialize};

/// A string key/value pair carried in metadata and producer properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }
}

/// Error codes returned by the broker.
///
/// # Stability
///
/// Variant order is wire-significant (postcard); append only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerError {
    UnknownError,
    MetadataError,
    PersistenceError,
    AuthenticationError,
    AuthorizationError,
    ConsumerBusy,
    ServiceNotReady,
    ProducerBlockedQuotaExceededError,
    ProducerBlockedQuotaExceededException,
    ChecksumError,
    UnsupportedVersionError,
    TopicNotFound,
    SubscriptionNotFound,
    ConsumerNotFound,
    TooManyRequests,
    TopicTerminatedError,
    ProducerBusy,
    InvalidTopicName,
    IncompatibleSchema,
    ConsumerAssignError,
    NotAllowedError,
    ProducerFenced,
}

/// Identifier of a persisted message within a partition's log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageIdData {
    pub ledger_id: u64,
    pub entry_id: u64,
    /// Partition index, `-1` for non-partitioned topics.
    pub partition: i32,
    /// Index within a batch, `-1` for unbatched messages.
    pub batch_index: i32,
}

/// Compression applied to a message payload, recorded in its metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireCompression {
    #[default]
    None,
    Lz4,
    Zlib,
    Zstd,
    Snappy,
}

/// An encrypted data key attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKey {
    pub key: String,
    pub value: Vec<u8>,
    pub metadata: Vec<KeyValue>,
}

/// Per-message metadata, serialized into payload-bearing frames ahead of the
/// payload itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub producer_name: String,
    pub sequence_id: u64,
    /// Publish timestamp, epoch milliseconds.
    pub publish_time: u64,
    pub properties: Vec<KeyValue>,
    /// Set when the message was mirrored from another cluster.
    pub replicated_from: Option<String>,
    pub partition_key: Option<String>,
    pub ordering_key: Option<Vec<u8>>,
    pub event_time: Option<u64>,
    pub compression: WireCompression,
    /// Size before compression; only meaningful when `compression != None`.
    pub uncompressed_size: u32,
    /// Present on batch frames; the count of entries in the payload.
    pub num_messages_in_batch: Option<i32>,
    pub schema_version: Option<Vec<u8>>,
    /// Epoch milliseconds at which the message becomes deliverable.
    pub deliver_at_time: Option<i64>,
    pub encryption_keys: Vec<EncryptionKey>,
    pub encryption_algo: Option<String>,
    pub encryption_param: Option<Vec<u8>>,
    // Chunking: large messages are split into several frames sharing a uuid.
    pub uuid: Option<String>,
    pub num_chunks_from_msg: Option<i32>,
    pub total_chunk_msg_size: Option<i32>,
    pub chunk_id: Option<i32>,
}

impl MessageMetadata {
    /// Size of this metadata once serialized.
    pub fn encoded_len(&self) -> crate::Result<usize> {
        postcard::to_allocvec(self)
            .map(|v| v.len())
            .map_err(crate::ProtocolError::Serialize)
    }
}

/// Metadata of a single entry inside a batched payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SingleMessageMetadata {
    pub properties: Vec<KeyValue>,
    pub partition_key: Option<String>,
    pub ordering_key: Option<Vec<u8>>,
    pub event_time: Option<u64>,
    pub payload_size: u32,
    pub sequence_id: u64,
}

/// Metadata stamped by the broker on dispatched entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerEntryMetadata {
    pub broker_timestamp: Option<u64>,
    pub index: Option<u64>,
}

/// Producer session exclusivity negotiated at creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProducerAccessMode {
    #[default]
    Shared,
    Exclusive,
    WaitForExclusive,
    ExclusiveWithFencing,
}

/// Outcome of a topic lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupType {
    Redirect,
    Connect,
    Failed,
}

/// Filter for `GetTopicsOfNamespace`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicsMode {
    #[default]
    Persistent,
    NonPersistent,
    All,
}

/// Schema payload returned by `GetSchemaResponse`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub name: String,
    pub schema_data: Vec<u8>,
    pub schema_type: u32,
    pub properties: Vec<KeyValue>,
}

/// Payload of `Error` frames and of error-bearing responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandError {
    pub request_id: u64,
    pub error: ServerError,
    pub message: String,
}

/// The protocol command set.
///
/// One command per frame. Request/response pairs correlate on `request_id`;
/// data-path commands (`Send`, `SendReceipt`, `SendError`, `Message`)
/// correlate on producer/consumer id and sequence id instead.
///
/// # Stability
///
/// Variant order is wire-significant (postcard); append only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// First frame on every connection, client to broker.
    Connect {
        client_version: String,
        protocol_version: i32,
        auth_method_name: Option<String>,
        auth_data: Option<Vec<u8>>,
    },
    /// Broker response completing the handshake.
    Connected {
        server_version: String,
        protocol_version: i32,
        /// Advertised per-message size limit; absent on old brokers.
        max_message_size: Option<u32>,
    },
    /// Broker-initiated re-authentication.
    AuthChallenge { auth_method_name: String, challenge: Vec<u8> },
    AuthResponse {
        client_version: String,
        protocol_version: i32,
        auth_method_name: String,
        auth_data: Vec<u8>,
    },
    Ping,
    Pong,

    /// Create (or re-attach) a producer session on a topic.
    Producer {
        topic: String,
        producer_id: u64,
        request_id: u64,
        /// Client-chosen name; the broker assigns one when absent.
        producer_name: Option<String>,
        encrypted: bool,
        properties: Vec<KeyValue>,
        schema_version: Option<Vec<u8>>,
        /// Reconnection counter of the owning handler.
        epoch: u64,
        user_provided_producer_name: bool,
        access_mode: ProducerAccessMode,
        topic_epoch: Option<u64>,
        initial_subscription_name: Option<String>,
    },
    ProducerSuccess {
        request_id: u64,
        producer_name: String,
        /// Highest sequence id the broker has persisted for this producer.
        last_sequence_id: i64,
        schema_version: Vec<u8>,
        topic_epoch: Option<u64>,
        /// `false` means "queued behind an exclusive owner"; a second
        /// `ProducerSuccess` with `true` follows when the session is live.
        producer_ready: bool,
    },
    /// Client request or broker notification ending a producer session.
    CloseProducer { producer_id: u64, request_id: u64 },

    /// Publish one message (or one batch, or one chunk). Payload frame.
    Send {
        producer_id: u64,
        sequence_id: u64,
        num_messages: i32,
        highest_sequence_id: Option<u64>,
    },
    SendReceipt {
        producer_id: u64,
        sequence_id: u64,
        message_id: MessageIdData,
        highest_sequence_id: Option<u64>,
    },
    SendError { producer_id: u64, sequence_id: u64, error: ServerError, message: String },

    Subscribe {
        topic: String,
        subscription: String,
        consumer_id: u64,
        request_id: u64,
        consumer_name: Option<String>,
    },
    CloseConsumer { consumer_id: u64, request_id: u64 },

    Lookup { topic: String, request_id: u64, authoritative: bool },
    LookupResponse {
        request_id: u64,
        response: LookupType,
        broker_service_url: String,
        broker_service_url_tls: Option<String>,
        authoritative: bool,
        proxy_through_service_url: bool,
        error: Option<ServerError>,
        message: Option<String>,
    },
    PartitionedMetadata { topic: String, request_id: u64 },
    PartitionedMetadataResponse {
        request_id: u64,
        partitions: u32,
        error: Option<ServerError>,
        message: Option<String>,
    },

    ConsumerStats { consumer_id: u64, request_id: u64 },
    ConsumerStatsResponse {
        request_id: u64,
        error: Option<ServerError>,
        message: Option<String>,
        msg_rate_out: f64,
        msg_backlog: u64,
    },

    GetLastMessageId { consumer_id: u64, request_id: u64 },
    GetLastMessageIdResponse {
        request_id: u64,
        last_message_id: MessageIdData,
        consumer_mark_delete_position: Option<MessageIdData>,
    },

    GetTopicsOfNamespace { namespace: String, request_id: u64, mode: TopicsMode },
    GetTopicsOfNamespaceResponse { request_id: u64, topics: Vec<String> },

    GetSchema { topic: String, request_id: u64, schema_version: Option<Vec<u8>> },
    GetSchemaResponse {
        request_id: u64,
        error: Option<ServerError>,
        message: Option<String>,
        schema: Option<SchemaInfo>,
    },

    AckResponse { consumer_id: u64, request_id: u64, error: Option<ServerError>, message: Option<String> },
    ActiveConsumerChange { consumer_id: u64, is_active: bool },

    /// Broker-to-consumer delivery. Payload frame.
    Message { consumer_id: u64, message_id: MessageIdData, redelivery_count: u32 },

    Error(CommandError),
    Success { request_id: u64, schema_version: Option<Vec<u8>> },
}

impl Command {
    /// Short command name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "CONNECT",
            Command::Connected { .. } => "CONNECTED",
            Command::AuthChallenge { .. } => "AUTH_CHALLENGE",
            Command::AuthResponse { .. } => "AUTH_RESPONSE",
            Command::Ping => "PING",
            Command::Pong => "PONG",
            Command::Producer { .. } => "PRODUCER",
            Command::ProducerSuccess { .. } => "PRODUCER_SUCCESS",
            Command::CloseProducer { .. } => "CLOSE_PRODUCER",
            Command::Send { .. } => "SEND",
            Command::SendReceipt { .. } => "SEND_RECEIPT",
            Command::SendError { .. } => "SEND_ERROR",
            Command::Subscribe { .. } => "SUBSCRIBE",
            Command::CloseConsumer { .. } => "CLOSE_CONSUMER",
            Command::Lookup { .. } => "LOOKUP",
            Command::LookupResponse { .. } => "LOOKUP_RESPONSE",
            Command::PartitionedMetadata { .. } => "PARTITIONED_METADATA",
            Command::PartitionedMetadataResponse { .. } => "PARTITIONED_METADATA_RESPONSE",
            Command::ConsumerStats { .. } => "CONSUMER_STATS",
            Command::ConsumerStatsResponse { .. } => "CONSUMER_STATS_RESPONSE",
            Command::GetLastMessageId { .. } => "GET_LAST_MESSAGE_ID",
            Command::GetLastMessageIdResponse { .. } => "GET_LAST_MESSAGE_ID_RESPONSE",
            Command::GetTopicsOfNamespace { .. } => "GET_TOPICS_OF_NAMESPACE",
            Command::GetTopicsOfNamespaceResponse { .. } => "GET_TOPICS_OF_NAMESPACE_RESPONSE",
            Command::GetSchema { .. } => "GET_SCHEMA",
            Command::GetSchemaResponse { .. } => "GET_SCHEMA_RESPONSE",
            Command::AckResponse { .. } => "ACK_RESPONSE",
            Command::ActiveConsumerChange { .. } => "ACTIVE_CONSUMER_CHANGE",
            Command::Message { .. } => "MESSAGE",
            Command::Error(_) => "ERROR",
            Command::Success { .. } => "SUCCESS",
        }
    }

    /// Whether this command is followed by metadata + payload sections in its
    /// frame.
    pub fn carries_payload(&self) -> bool {
        matches!(self, Command::Send { .. } | Command::Message { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_encoded_len_matches_serialization() {
        let mut md = MessageMetadata {
            producer_name: "standalone-0".into(),
            sequence_id: 42,
            publish_time: 1_700_000_000_000,
            ..Default::default()
        };
        md.properties.push(KeyValue::new("k", "v"));

        let bytes = postcard::to_allocvec(&md).unwrap();
        assert_eq!(md.encoded_len().unwrap(), bytes.len());
    }

    #[test]
    fn command_roundtrip() {
        let cmd = Command::SendReceipt {
            producer_id: 7,
            sequence_id: 3,
            message_id: MessageIdData { ledger_id: 1, entry_id: 2, partition: -1, batch_index: -1 },
            highest_sequence_id: None,
        };
        let bytes = postcard::to_allocvec(&cmd).unwrap();
        let back: Command = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, cmd);
        assert_eq!(back.name(), "SEND_RECEIPT");
    }

    #[test]
    fn payload_commands_are_flagged() {
        let send = Command::Send { producer_id: 0, sequence_id: 0, num_messages: 1, highest_sequence_id: None };
        assert!(send.carries_payload());
        assert!(!Command::Ping.carries_payload());
    }
}
