//! User-facing message type and the identifier assigned on persistence.

use bytes::Bytes;
use murre_protocol::MessageIdData;

/// Identifier of a persisted message, as returned through send receipts.
///
/// For chunked messages the coordinates are those of the last chunk, with the
/// first chunk's id attached so consumers can address the full range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageId {
    pub ledger_id: u64,
    pub entry_id: u64,
    pub partition: i32,
    pub batch_index: i32,
    pub first_chunk: Option<Box<MessageId>>,
}

impl MessageId {
    pub(crate) fn from_data(data: MessageIdData, partition: i32) -> Self {
        Self {
            ledger_id: data.ledger_id,
            entry_id: data.entry_id,
            // The broker-side id does not know the client's partition routing.
            partition: if data.partition >= 0 { data.partition } else { partition },
            batch_index: data.batch_index,
            first_chunk: None,
        }
    }

    pub(crate) fn with_batch_index(mut self, batch_index: i32) -> Self {
        self.batch_index = batch_index;
        self
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}:{}:{}:{})", self.ledger_id, self.entry_id, self.partition, self.batch_index)
    }
}

/// A message to publish.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub payload: Bytes,
    /// Routing/compaction key.
    pub partition_key: Option<String>,
    pub ordering_key: Option<Vec<u8>>,
    pub properties: Vec<(String, String)>,
    /// Application event timestamp, epoch milliseconds.
    pub event_time: Option<u64>,
    /// Earliest delivery time, epoch milliseconds. Delayed messages bypass
    /// batching.
    pub deliver_at: Option<i64>,
    /// Caller-chosen sequence id; assigned by the producer when unset.
    pub sequence_id: Option<u64>,
    /// Set by geo-replicators; ordinary publishes leave both unset.
    pub producer_name: Option<String>,
    pub replicated_from: Option<String>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self { payload: payload.into(), ..Default::default() }
    }

    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }
}

/// Builder for [`Message`].
#[derive(Default)]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.message.payload = payload.into();
        self
    }

    pub fn partition_key(mut self, key: impl Into<String>) -> Self {
        self.message.partition_key = Some(key.into());
        self
    }

    pub fn ordering_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.message.ordering_key = Some(key.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.message.properties.push((key.into(), value.into()));
        self
    }

    pub fn event_time(mut self, epoch_ms: u64) -> Self {
        self.message.event_time = Some(epoch_ms);
        self
    }

    pub fn deliver_at(mut self, epoch_ms: i64) -> Self {
        self.message.deliver_at = Some(epoch_ms);
        self
    }

    pub fn sequence_id(mut self, id: u64) -> Self {
        self.message.sequence_id = Some(id);
        self
    }

    pub fn build(self) -> Message {
        self.message
    }
}
