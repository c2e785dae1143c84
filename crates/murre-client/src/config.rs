//! Client and producer configuration.
//!
//! Both configs follow the builder idiom: `ClientConfig::builder()…build()`.
//! Defaults are chosen to match the broker's out-of-the-box limits.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use murre_protocol::ProducerAccessMode;

use crate::crypto::{CryptoKeyReader, MessageCrypto};
use crate::error::{Error, Result};

/// Default broker port for plaintext connections.
pub const DEFAULT_PLAIN_PORT: u16 = 6650;
/// Default broker port for TLS connections.
pub const DEFAULT_TLS_PORT: u16 = 6651;

// ============================================================================
// Service URL
// ============================================================================

/// A parsed broker service URL.
///
/// Accepted schemes: `murre://host[:port]` (plaintext) and
/// `murre+ssl://host[:port]` (TLS). Anything else is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUrl {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl ServiceUrl {
    /// Parse a service URL string.
    pub fn parse(url: &str) -> Result<Self> {
        let (tls, rest) = if let Some(rest) = url.strip_prefix("murre+ssl://") {
            (true, rest)
        } else if let Some(rest) = url.strip_prefix("murre://") {
            (false, rest)
        } else {
            return Err(Error::InvalidUrl(format!("unsupported scheme in '{url}'")));
        };

        let rest = rest.trim_end_matches('/');
        if rest.is_empty() {
            return Err(Error::InvalidUrl(format!("missing host in '{url}'")));
        }

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::InvalidUrl(format!("invalid port in '{url}'")))?;
                (host.to_string(), port)
            }
            None => {
                let port = if tls { DEFAULT_TLS_PORT } else { DEFAULT_PLAIN_PORT };
                (rest.to_string(), port)
            }
        };

        if host.is_empty() {
            return Err(Error::InvalidUrl(format!("missing host in '{url}'")));
        }

        Ok(Self { host, port, tls })
    }

    /// `host:port` form used for socket connects.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for ServiceUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.tls { "murre+ssl" } else { "murre" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

// ============================================================================
// Authentication
// ============================================================================

/// Pluggable authentication provider.
///
/// Supplies the initial credentials for `Connect` and answers broker
/// `AuthChallenge` frames. Implementations live outside this crate.
pub trait Authentication: Send + Sync {
    /// Name of the method, e.g. `"token"`.
    fn auth_method_name(&self) -> String;

    /// Credentials for the initial handshake.
    fn auth_data(&self) -> Result<Vec<u8>>;

    /// Answer a broker challenge. Defaults to re-sending the static
    /// credentials, which suits token-style methods.
    fn challenge_response(&self, _challenge: &[u8]) -> Result<Vec<u8>> {
        self.auth_data()
    }
}

// ============================================================================
// Client configuration
// ============================================================================

/// TLS knobs. Only consulted when the service URL uses `murre+ssl://`.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// PEM file with trusted CA certificates. Falls back to the system roots.
    pub trust_certs_file: Option<PathBuf>,
    /// Client certificate chain (PEM) for mTLS.
    pub certificate_file: Option<PathBuf>,
    /// Client private key (PEM) for mTLS.
    pub private_key_file: Option<PathBuf>,
    /// Skip server certificate verification. Development only.
    pub allow_insecure_connection: bool,
    /// Verify that the certificate matches the hostname being dialed.
    pub validate_hostname: bool,
}

/// Client-wide configuration shared by all producers.
#[derive(Clone)]
pub struct ClientConfig {
    /// Broker service URL.
    pub service_url: String,
    /// Deadline for each broker RPC.
    pub operation_timeout: Duration,
    /// Deadline for TCP connect plus TLS handshake plus `Connected`.
    pub connection_timeout: Duration,
    /// Interval between keep-alive probes.
    pub keep_alive_interval: Duration,
    /// Cap on in-flight lookup-style requests per connection.
    pub concurrent_lookup_limit: usize,
    /// First reconnection backoff delay.
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Client-wide byte budget for outstanding messages; 0 disables the cap.
    pub memory_limit: u64,
    /// Interval for stats publication; 0 disables.
    pub stats_interval: Duration,
    pub tls: TlsOptions,
    pub auth: Option<Arc<dyn Authentication>>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("service_url", &self.service_url)
            .field("operation_timeout", &self.operation_timeout)
            .field("connection_timeout", &self.connection_timeout)
            .field("memory_limit", &self.memory_limit)
            .finish_non_exhaustive()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service_url: format!("murre://localhost:{DEFAULT_PLAIN_PORT}"),
            operation_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(30),
            concurrent_lookup_limit: 50_000,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(60),
            memory_limit: 0,
            stats_interval: Duration::ZERO,
            tls: TlsOptions::default(),
            auth: None,
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn service_url(mut self, url: impl Into<String>) -> Self {
        self.config.service_url = url.into();
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout = timeout;
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = interval;
        self
    }

    pub fn concurrent_lookup_limit(mut self, limit: usize) -> Self {
        self.config.concurrent_lookup_limit = limit;
        self
    }

    pub fn initial_backoff(mut self, delay: Duration) -> Self {
        self.config.initial_backoff = delay;
        self
    }

    pub fn max_backoff(mut self, delay: Duration) -> Self {
        self.config.max_backoff = delay;
        self
    }

    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.config.memory_limit = bytes;
        self
    }

    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.config.stats_interval = interval;
        self
    }

    pub fn tls_trust_certs_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.tls.trust_certs_file = Some(path.into());
        self
    }

    pub fn tls_client_cert(
        mut self,
        cert: impl Into<PathBuf>,
        key: impl Into<PathBuf>,
    ) -> Self {
        self.config.tls.certificate_file = Some(cert.into());
        self.config.tls.private_key_file = Some(key.into());
        self
    }

    pub fn tls_allow_insecure_connection(mut self, allow: bool) -> Self {
        self.config.tls.allow_insecure_connection = allow;
        self
    }

    pub fn tls_validate_hostname(mut self, validate: bool) -> Self {
        self.config.tls.validate_hostname = validate;
        self
    }

    pub fn auth(mut self, auth: Arc<dyn Authentication>) -> Self {
        self.config.auth = Some(auth);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

// ============================================================================
// Producer configuration
// ============================================================================

/// Payload compression applied by the producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompressionType {
    #[default]
    None,
    Lz4,
    Zlib,
    Zstd,
    Snappy,
}

/// Batch grouping strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchingType {
    /// All messages share one batch per flush.
    #[default]
    Default,
    /// Messages are grouped into per-key sub-batches.
    KeyBased,
}

/// Message encryption wiring: key names plus the interfaces that provide key
/// material and perform the encryption.
#[derive(Clone)]
pub struct EncryptionConfig {
    pub keys: Vec<String>,
    pub key_reader: Arc<dyn CryptoKeyReader>,
    pub crypto: Arc<dyn MessageCrypto>,
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig").field("keys", &self.keys).finish_non_exhaustive()
    }
}

/// Per-producer configuration.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Producer name; the broker assigns one when unset.
    pub producer_name: Option<String>,
    /// Seed for the sequence-id generator. `-1` lets the broker's persisted
    /// watermark win on the first connect.
    pub initial_sequence_id: i64,
    /// Per-message publish deadline; `Duration::ZERO` disables it.
    pub send_timeout: Duration,
    /// Cap on unacknowledged messages; 0 removes the cap.
    pub max_pending_messages: usize,
    /// Block `send` on a full queue instead of failing fast.
    pub block_if_queue_full: bool,
    pub batching_enabled: bool,
    pub batching_type: BatchingType,
    /// Longest a batch may linger before it is flushed.
    pub batching_max_publish_delay: Duration,
    pub batching_max_messages: usize,
    pub batching_max_bytes: usize,
    pub compression: CompressionType,
    /// Split oversized messages into chunks. Only effective on persistent
    /// topics with batching disabled.
    pub chunking_enabled: bool,
    pub encryption: Option<EncryptionConfig>,
    pub access_mode: ProducerAccessMode,
    /// Defer partition-producer creation until first use.
    pub lazy_start_partitioned_producers: bool,
    /// Subscription created together with the producer, if any.
    pub initial_subscription_name: Option<String>,
    /// Application-defined properties attached to the producer session.
    pub properties: Vec<(String, String)>,
    pub schema_version: Option<Vec<u8>>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            producer_name: None,
            initial_sequence_id: -1,
            send_timeout: Duration::from_secs(30),
            max_pending_messages: 1000,
            block_if_queue_full: false,
            batching_enabled: true,
            batching_type: BatchingType::Default,
            batching_max_publish_delay: Duration::from_millis(10),
            batching_max_messages: 1000,
            batching_max_bytes: 128 * 1024,
            compression: CompressionType::None,
            chunking_enabled: false,
            encryption: None,
            access_mode: ProducerAccessMode::Shared,
            lazy_start_partitioned_producers: false,
            initial_subscription_name: None,
            properties: Vec::new(),
            schema_version: None,
        }
    }
}

impl ProducerConfig {
    pub fn builder() -> ProducerConfigBuilder {
        ProducerConfigBuilder::default()
    }
}

/// Builder for [`ProducerConfig`].
#[derive(Default)]
pub struct ProducerConfigBuilder {
    config: ProducerConfig,
}

impl ProducerConfigBuilder {
    pub fn producer_name(mut self, name: impl Into<String>) -> Self {
        self.config.producer_name = Some(name.into());
        self
    }

    pub fn initial_sequence_id(mut self, id: i64) -> Self {
        self.config.initial_sequence_id = id;
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_timeout = timeout;
        self
    }

    pub fn max_pending_messages(mut self, max: usize) -> Self {
        self.config.max_pending_messages = max;
        self
    }

    pub fn block_if_queue_full(mut self, block: bool) -> Self {
        self.config.block_if_queue_full = block;
        self
    }

    pub fn batching_enabled(mut self, enabled: bool) -> Self {
        self.config.batching_enabled = enabled;
        self
    }

    pub fn batching_type(mut self, kind: BatchingType) -> Self {
        self.config.batching_type = kind;
        self
    }

    pub fn batching_max_publish_delay(mut self, delay: Duration) -> Self {
        self.config.batching_max_publish_delay = delay;
        self
    }

    pub fn batching_max_messages(mut self, max: usize) -> Self {
        self.config.batching_max_messages = max;
        self
    }

    pub fn batching_max_bytes(mut self, max: usize) -> Self {
        self.config.batching_max_bytes = max;
        self
    }

    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn chunking_enabled(mut self, enabled: bool) -> Self {
        self.config.chunking_enabled = enabled;
        self
    }

    pub fn encryption(mut self, encryption: EncryptionConfig) -> Self {
        self.config.encryption = Some(encryption);
        self
    }

    pub fn access_mode(mut self, mode: ProducerAccessMode) -> Self {
        self.config.access_mode = mode;
        self
    }

    pub fn lazy_start_partitioned_producers(mut self, lazy: bool) -> Self {
        self.config.lazy_start_partitioned_producers = lazy;
        self
    }

    pub fn initial_subscription_name(mut self, name: impl Into<String>) -> Self {
        self.config.initial_subscription_name = Some(name.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.properties.push((key.into(), value.into()));
        self
    }

    pub fn schema_version(mut self, version: Vec<u8>) -> Self {
        self.config.schema_version = Some(version);
        self
    }

    pub fn build(self) -> ProducerConfig {
        self.config
    }
}
