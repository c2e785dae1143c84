//! # murre-client
//!
//! Native async Rust client for [Murre], the partitioned, log-structured
//! pub/sub broker. This crate implements the connection-bound producer
//! runtime: framed-protocol connections that multiplex concurrent requests,
//! and producers that maintain monotonic sequenced publish with batching,
//! chunking, encryption hooks, backpressure, send timeouts and automatic
//! reconnection.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use murre_client::{Client, ClientConfig, Message, ProducerConfig};
//!
//! # async fn example() -> murre_client::Result<()> {
//! let client = Client::new(
//!     ClientConfig::builder()
//!         .service_url("murre://localhost:6650")
//!         .build(),
//! )?;
//!
//! let producer = client
//!     .create_producer("persistent://tenant/ns/orders", ProducerConfig::default())
//!     .await?;
//!
//! let id = producer.send(Message::new("hello")).await?;
//! println!("persisted at {id}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Delivery semantics
//!
//! Publishes are at-least-once, deduplicated broker-side by sequence id.
//! Per producer, receipts (and therefore [`SendFuture`] completions) arrive
//! in strictly increasing sequence-id order, and a reconnect retransmits
//! every unacknowledged message in its original order before anything new.
//!
//! ## Backpressure
//!
//! Admission is bounded twice over: `max_pending_messages` caps in-flight
//! ops per producer, and the client-wide `memory_limit` caps the bytes held
//! across all producers. With `block_if_queue_full`, `send` suspends until
//! capacity frees up; otherwise it fails fast with
//! [`Error::ProducerQueueIsFull`] or [`Error::MemoryBufferIsFull`].
//!
//! ## TLS
//!
//! Use a `murre+ssl://` service URL; trust roots, client certificates and
//! the (development-only) insecure mode are configured on
//! [`ClientConfig`].
//!
//! [Murre]: https://github.com/murre-io/murre

pub mod client;
pub mod compression;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod memory;
pub mod message;
pub mod producer;

mod backoff;
mod batch;
mod handler;

pub use client::Client;
pub use config::{
    Authentication, BatchingType, ClientConfig, ClientConfigBuilder, CompressionType,
    EncryptionConfig, ProducerConfig, ProducerConfigBuilder, ServiceUrl, TlsOptions,
};
pub use connection::{max_message_size, ConnectionState, LookupResult};
pub use crypto::{CryptoKeyReader, EncryptionKeyInfo, MessageCrypto};
pub use error::{Error, Result};
pub use memory::MemoryLimitController;
pub use message::{Message, MessageBuilder, MessageId};
pub use producer::{Producer, SendFuture};

// Protocol types that surface through the public API.
pub use murre_protocol::{ProducerAccessMode, SchemaInfo, TopicsMode};
