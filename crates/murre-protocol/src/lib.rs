//! Murre Wire Protocol
//!
//! This crate defines the binary protocol spoken between murre clients and
//! brokers: the [`Command`] set, message metadata, server error codes and the
//! frame codec.
//!
//! # Wire Format
//!
//! Every frame is length-prefixed. Simple command frames look like:
//!
//! ```text
//! ┌──────────────────┬──────────────────┬─────────────────────┐
//! │ total_size (u32) │ cmd_size (u32)   │ command (postcard)  │
//! │ big-endian       │ big-endian       │                     │
//! └──────────────────┴──────────────────┴─────────────────────┘
//! ```
//!
//! Payload-bearing frames (`Send` from producers, `Message` from brokers)
//! append optional broker entry metadata, an optional CRC32C checksum, the
//! message metadata and the raw payload:
//!
//! ```text
//! [total_size][cmd_size][command]
//!     [0x0e01 (u16) + meta_size (u32) + broker entry metadata]   optional
//!     [0x0e02 (u16) + crc32c (u32)]                              optional
//!     [metadata_size (u32)][metadata][payload]
//! ```
//!
//! The checksum covers everything from `metadata_size` to the end of the
//! payload and uses the Castagnoli polynomial (CRC32C).
//!
//! # Protocol Stability
//!
//! Command bodies are serialized with postcard; the enum variant order is
//! significant and must remain stable. New variants are only added at the end.

mod commands;
mod error;
pub mod frame;

pub use commands::{
    BrokerEntryMetadata, Command, CommandError, EncryptionKey, KeyValue, LookupType,
    MessageIdData, MessageMetadata, ProducerAccessMode, SchemaInfo, ServerError,
    SingleMessageMetadata, TopicsMode, WireCompression,
};
pub use error::{ProtocolError, Result};
pub use frame::{decode_frame, encode_command, encode_payload_command, frame_bytes_needed, Frame};

/// Protocol revision implemented by this crate.
pub const PROTOCOL_VERSION: i32 = 10;

/// Minimum server protocol version that supports keep-alive probes.
pub const MIN_VERSION_KEEP_ALIVE: i32 = 1;

/// Minimum server protocol version that accepts checksums on `Send` frames.
pub const MIN_VERSION_SEND_CHECKSUM: i32 = 6;

/// Minimum server protocol version that serves broker-side consumer stats.
pub const MIN_VERSION_CONSUMER_STATS: i32 = 8;

/// Maximum message size assumed until the broker advertises its own limit in
/// `Connected`.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 5 * 1024 * 1024;

/// Magic number preceding broker entry metadata in payload frames.
pub const MAGIC_BROKER_ENTRY_METADATA: u16 = 0x0e01;

/// Magic number preceding the CRC32C checksum in payload frames.
pub const MAGIC_CRC32C: u16 = 0x0e02;
