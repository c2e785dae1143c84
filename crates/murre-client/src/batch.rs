//! Batch accumulation containers.
//!
//! Entries are collected between flushes; a flush drains the container into
//! one batch group (default batching) or one group per partition key
//! (key-based batching). Each group becomes a single `Send` frame whose
//! payload is the concatenation of `[entry_metadata_size][entry_metadata]
//! [entry_payload]` records.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use murre_protocol::SingleMessageMetadata;
use tokio::sync::oneshot;

use crate::config::BatchingType;
use crate::error::Result;
use crate::message::MessageId;

/// One admitted message waiting in a batch.
pub(crate) struct BatchEntry {
    pub meta: SingleMessageMetadata,
    pub payload: Bytes,
    pub completion: oneshot::Sender<crate::error::Result<MessageId>>,
    /// Uncompressed size reserved against the memory budget.
    pub reserved_bytes: u64,
}

/// A drained group destined for one `Send` frame. Entries are in admission
/// order; `entries[0]` carries the batch's sequence id.
pub(crate) struct BatchGroup {
    pub entries: Vec<BatchEntry>,
}

impl BatchGroup {
    pub fn first_sequence_id(&self) -> u64 {
        self.entries[0].meta.sequence_id
    }

    pub fn last_sequence_id(&self) -> u64 {
        self.entries[self.entries.len() - 1].meta.sequence_id
    }
}

/// Serialize a group's entries into a batch payload.
pub(crate) fn serialize_batch(entries: &[BatchEntry]) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    for entry in entries {
        let meta = postcard::to_allocvec(&entry.meta)
            .map_err(murre_protocol::ProtocolError::Serialize)
            .map_err(crate::error::Error::from)?;
        buf.put_u32(meta.len() as u32);
        buf.put_slice(&meta);
        buf.put_slice(&entry.payload);
    }
    Ok(buf.freeze())
}

enum Grouping {
    /// Single group, admission order.
    Default(Vec<BatchEntry>),
    /// One group per partition key. Insertion order of keys is not
    /// meaningful; drained groups are sorted by first sequence id.
    KeyBased(HashMap<String, Vec<BatchEntry>>),
}

/// Accumulates messages between flushes.
pub(crate) struct BatchContainer {
    grouping: Grouping,
    max_messages: usize,
    max_bytes: usize,
    num_entries: usize,
    current_bytes: usize,
}

impl BatchContainer {
    pub fn new(kind: BatchingType, max_messages: usize, max_bytes: usize) -> Self {
        let grouping = match kind {
            BatchingType::Default => Grouping::Default(Vec::new()),
            BatchingType::KeyBased => Grouping::KeyBased(HashMap::new()),
        };
        Self { grouping, max_messages, max_bytes, num_entries: 0, current_bytes: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    /// Whether `payload_len` more bytes fit without breaching the byte cap.
    pub fn has_enough_space(&self, payload_len: usize) -> bool {
        self.is_empty() || self.current_bytes + payload_len <= self.max_bytes
    }

    /// Append an entry. Returns `true` when the container is now full and
    /// must be flushed.
    pub fn add(&mut self, entry: BatchEntry) -> bool {
        self.num_entries += 1;
        self.current_bytes += entry.payload.len();
        match &mut self.grouping {
            Grouping::Default(entries) => entries.push(entry),
            Grouping::KeyBased(groups) => {
                let key = entry.meta.partition_key.clone().unwrap_or_default();
                groups.entry(key).or_default().push(entry);
            }
        }
        self.num_entries >= self.max_messages || self.current_bytes >= self.max_bytes
    }

    /// Drain all entries into send groups.
    pub fn drain(&mut self) -> Vec<BatchGroup> {
        self.num_entries = 0;
        self.current_bytes = 0;
        match &mut self.grouping {
            Grouping::Default(entries) => {
                if entries.is_empty() {
                    Vec::new()
                } else {
                    vec![BatchGroup { entries: std::mem::take(entries) }]
                }
            }
            Grouping::KeyBased(groups) => {
                let mut out: Vec<BatchGroup> = std::mem::take(groups)
                    .into_values()
                    .map(|entries| BatchGroup { entries })
                    .collect();
                // Keep the pending queue ordered by sequence id.
                out.sort_by_key(|g| g.first_sequence_id());
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: u64, key: Option<&str>, payload: &[u8]) -> BatchEntry {
        let (tx, _rx) = oneshot::channel();
        BatchEntry {
            meta: SingleMessageMetadata {
                sequence_id: seq,
                payload_size: payload.len() as u32,
                partition_key: key.map(|k| k.to_string()),
                ..Default::default()
            },
            payload: Bytes::copy_from_slice(payload),
            completion: tx,
            reserved_bytes: payload.len() as u64,
        }
    }

    #[test]
    fn default_container_flushes_in_admission_order() {
        let mut container = BatchContainer::new(BatchingType::Default, 100, 1 << 20);
        assert!(container.is_empty());
        assert!(!container.add(entry(1, None, b"a")));
        assert!(!container.add(entry(2, None, b"b")));

        let groups = container.drain();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].first_sequence_id(), 1);
        assert_eq!(groups[0].last_sequence_id(), 2);
        assert!(container.is_empty());
    }

    #[test]
    fn message_count_cap_marks_full() {
        let mut container = BatchContainer::new(BatchingType::Default, 2, 1 << 20);
        assert!(!container.add(entry(1, None, b"a")));
        assert!(container.add(entry(2, None, b"b")));
    }

    #[test]
    fn byte_cap_marks_full_and_gates_space() {
        let mut container = BatchContainer::new(BatchingType::Default, 100, 4);
        assert!(container.has_enough_space(100)); // first entry always fits
        assert!(container.add(entry(1, None, b"abcd")));
        assert!(!container.has_enough_space(1));
    }

    #[test]
    fn key_based_container_groups_by_key_sorted_by_sequence() {
        let mut container = BatchContainer::new(BatchingType::KeyBased, 100, 1 << 20);
        container.add(entry(1, Some("b"), b"x"));
        container.add(entry(2, Some("a"), b"y"));
        container.add(entry(3, Some("b"), b"z"));

        let groups = container.drain();
        assert_eq!(groups.len(), 2);
        // Sorted by the lowest sequence id in each group.
        assert_eq!(groups[0].first_sequence_id(), 1);
        assert_eq!(groups[0].entries.len(), 2);
        assert_eq!(groups[1].first_sequence_id(), 2);
        assert_eq!(groups[1].entries.len(), 1);
    }

    #[test]
    fn batch_payload_layout() {
        let entries = vec![entry(1, None, b"aa"), entry(2, None, b"bbb")];
        let payload = serialize_batch(&entries).unwrap();

        // Each record: u32 metadata size, metadata, payload bytes.
        let mut offset = 0;
        for entry in &entries {
            let meta_len = u32::from_be_bytes(payload[offset..offset + 4].try_into().unwrap()) as usize;
            offset += 4;
            let meta: SingleMessageMetadata =
                postcard::from_bytes(&payload[offset..offset + meta_len]).unwrap();
            assert_eq!(meta.sequence_id, entry.meta.sequence_id);
            offset += meta_len;
            assert_eq!(&payload[offset..offset + entry.payload.len()], &entry.payload[..]);
            offset += entry.payload.len();
        }
        assert_eq!(offset, payload.len());
    }
}
