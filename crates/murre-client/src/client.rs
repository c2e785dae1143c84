//! The client entry point: owns the connection pool, the client-wide memory
//! budget, and producer-id allocation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use murre_protocol::{SchemaInfo, TopicsMode};
use tracing::info;

use crate::config::{ClientConfig, ProducerConfig, ServiceUrl};
use crate::connection::LookupResult;
use crate::error::{Error, Result};
use crate::handler::ConnectionPool;
use crate::memory::MemoryLimitController;
use crate::producer::Producer;

/// A murre client. Cheap to clone; all clones share the same pool and
/// memory budget.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: Arc<ClientConfig>,
    pool: Arc<ConnectionPool>,
    memory: Arc<MemoryLimitController>,
    next_producer_id: AtomicU64,
    closed: AtomicBool,
}

impl Client {
    /// Validate the configuration and build a client. No connection is made
    /// until the first producer or lookup needs one.
    pub fn new(config: ClientConfig) -> Result<Self> {
        ServiceUrl::parse(&config.service_url)?;
        let config = Arc::new(config);
        let pool = Arc::new(ConnectionPool::new(Arc::clone(&config))?);
        let memory = Arc::new(MemoryLimitController::new(config.memory_limit));
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                pool,
                memory,
                next_producer_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Create a producer on `topic` and wait until its session is live.
    pub async fn create_producer(
        &self,
        topic: impl Into<String>,
        config: ProducerConfig,
    ) -> Result<Producer> {
        self.check_open()?;
        let producer_id = self.inner.next_producer_id.fetch_add(1, Ordering::Relaxed);
        Producer::create(
            Arc::clone(&self.inner.config),
            Arc::clone(&self.inner.pool),
            Arc::clone(&self.inner.memory),
            producer_id,
            topic.into(),
            -1,
            config,
        )
        .await
    }

    /// Resolve the broker serving `topic`.
    pub async fn lookup_topic(&self, topic: &str) -> Result<LookupResult> {
        self.check_open()?;
        let cnx = self.inner.pool.get_connection().await?;
        cnx.topic_lookup(topic, false).await
    }

    /// Partition count of `topic` (0 for non-partitioned topics).
    pub async fn partitioned_metadata(&self, topic: &str) -> Result<u32> {
        self.check_open()?;
        let cnx = self.inner.pool.get_connection().await?;
        cnx.partitioned_metadata(topic).await
    }

    pub async fn topics_of_namespace(
        &self,
        namespace: &str,
        mode: TopicsMode,
    ) -> Result<Vec<String>> {
        self.check_open()?;
        let cnx = self.inner.pool.get_connection().await?;
        cnx.get_topics_of_namespace(namespace, mode).await
    }

    pub async fn schema(
        &self,
        topic: &str,
        schema_version: Option<Vec<u8>>,
    ) -> Result<Option<SchemaInfo>> {
        self.check_open()?;
        let cnx = self.inner.pool.get_connection().await?;
        cnx.get_schema(topic, schema_version).await
    }

    /// Bytes of the memory budget currently reserved by outstanding messages.
    pub fn memory_usage(&self) -> u64 {
        self.inner.memory.current_usage()
    }

    /// Shut down the client: wake blocked admissions, drop the pooled
    /// connection. Producers should be closed first; any still alive see
    /// their sends fail.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing client for {}", self.inner.config.service_url);
        self.inner.memory.close();
        self.inner.pool.shutdown().await;
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(Error::AlreadyClosed)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("service_url", &self.inner.config.service_url)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_service_url() {
        let config = ClientConfig::builder().service_url("amqp://nope").build();
        assert!(matches!(Client::new(config), Err(Error::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn closed_client_refuses_work() {
        let config = ClientConfig::default();
        let client = Client::new(config).unwrap();
        client.close().await;
        let err = client.create_producer("t", ProducerConfig::default()).await.unwrap_err();
        assert_eq!(err, Error::AlreadyClosed);
    }
}
