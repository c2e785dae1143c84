//! Shared producer/consumer handler machinery: connection acquisition,
//! reconnection with backoff, and the epoch counter that invalidates stale
//! callbacks.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::{ClientConfig, ServiceUrl};
use crate::connection::Connection;
use crate::error::{Error, Result};

// ============================================================================
// Connection pool
// ============================================================================

/// Owns the client's broker connections and re-dials on demand.
///
/// Service-URL lookup policy lives outside this crate; the pool keys
/// connections by the configured URL only and shares one connection across
/// all handlers.
pub struct ConnectionPool {
    config: Arc<ClientConfig>,
    url: ServiceUrl,
    current: tokio::sync::Mutex<Option<Arc<Connection>>>,
}

impl ConnectionPool {
    pub fn new(config: Arc<ClientConfig>) -> Result<Self> {
        let url = ServiceUrl::parse(&config.service_url)?;
        Ok(Self { config, url, current: tokio::sync::Mutex::new(None) })
    }

    /// The shared connection, dialing a fresh one when none is live.
    pub async fn get_connection(&self) -> Result<Arc<Connection>> {
        let mut current = self.current.lock().await;
        if let Some(conn) = current.as_ref() {
            if conn.is_ready() {
                return Ok(Arc::clone(conn));
            }
        }
        let conn = Connection::connect(Arc::clone(&self.config), self.url.clone()).await?;
        *current = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Drop the pooled connection, closing it if still live.
    pub async fn shutdown(&self) {
        if let Some(conn) = self.current.lock().await.take() {
            conn.close(Error::AlreadyClosed);
        }
    }
}

// ============================================================================
// Handler state
// ============================================================================

/// Lifecycle of a producer (or consumer) handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandlerStatus {
    NotStarted = 0,
    Pending = 1,
    Ready = 2,
    Closing = 3,
    Closed = 4,
    Failed = 5,
    ProducerFenced = 6,
}

impl HandlerStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => HandlerStatus::NotStarted,
            1 => HandlerStatus::Pending,
            2 => HandlerStatus::Ready,
            3 => HandlerStatus::Closing,
            4 => HandlerStatus::Closed,
            5 => HandlerStatus::Failed,
            _ => HandlerStatus::ProducerFenced,
        }
    }

    /// Whether the handler is still doing (or trying to do) useful work.
    pub fn is_active(&self) -> bool {
        matches!(self, HandlerStatus::Pending | HandlerStatus::Ready)
    }
}

/// State shared by everything that maintains a session over a [`Connection`].
pub(crate) struct HandlerState {
    /// Log prefix, `[topic, name]`.
    name: Mutex<String>,
    status: AtomicU8,
    /// Bumped on every reconnection attempt; callbacks from an older epoch
    /// must no-op.
    epoch: AtomicU64,
    pub(crate) creation: Instant,
    pub(crate) operation_timeout: Duration,
    backoff: Mutex<Backoff>,
    /// Single-flights concurrent reconnect attempts.
    reconnection_pending: AtomicBool,
    connection: Mutex<Weak<Connection>>,
}

impl HandlerState {
    pub(crate) fn new(
        name: String,
        operation_timeout: Duration,
        initial_backoff: Duration,
        max_backoff: Duration,
        mandatory_stop: Duration,
    ) -> Self {
        Self {
            name: Mutex::new(name),
            status: AtomicU8::new(HandlerStatus::NotStarted as u8),
            epoch: AtomicU64::new(0),
            creation: Instant::now(),
            operation_timeout,
            backoff: Mutex::new(Backoff::new(initial_backoff, max_backoff, mandatory_stop)),
            reconnection_pending: AtomicBool::new(false),
            connection: Mutex::new(Weak::new()),
        }
    }

    pub(crate) fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub(crate) fn set_name(&self, name: String) {
        *self.name.lock() = name;
    }

    pub(crate) fn status(&self) -> HandlerStatus {
        HandlerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: HandlerStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn cas_status(&self, from: HandlerStatus, to: HandlerStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.lock().upgrade()
    }

    pub(crate) fn set_connection(&self, cnx: &Arc<Connection>) {
        *self.connection.lock() = Arc::downgrade(cnx);
    }

    pub(crate) fn clear_connection(&self) {
        *self.connection.lock() = Weak::new();
    }

    pub(crate) fn reset_backoff(&self) {
        self.backoff.lock().reset();
    }

    fn next_backoff(&self) -> Duration {
        self.backoff.lock().next()
    }

    /// Upgrade a retryable result to `Timeout` once the operation deadline
    /// (measured from `start`) has passed.
    pub(crate) fn convert_to_timeout_if_necessary(&self, err: Error, start: Instant) -> Error {
        if err.is_retryable() && start.elapsed() >= self.operation_timeout {
            Error::Timeout
        } else {
            err
        }
    }
}

// ============================================================================
// Reconnection driver
// ============================================================================

/// A handler that maintains a session over a pooled connection.
pub(crate) trait ReconnectableHandler: Send + Sync + 'static {
    fn handler_state(&self) -> &HandlerState;

    fn pool(&self) -> &Arc<ConnectionPool>;

    /// A connection is available; (re-)establish the session on it.
    fn connection_opened(self: Arc<Self>, cnx: Arc<Connection>) -> impl Future<Output = ()> + Send;

    /// The pool could not produce a connection.
    fn connection_failed(&self, err: Error);
}

/// NotStarted → Pending, then acquire the first connection.
pub(crate) async fn start<H: ReconnectableHandler>(handler: &Arc<H>) {
    if handler.handler_state().cas_status(HandlerStatus::NotStarted, HandlerStatus::Pending) {
        grab_connection(Arc::clone(handler)).await;
    }
}

/// Acquire a connection from the pool, single-flighted.
pub(crate) async fn grab_connection<H: ReconnectableHandler>(handler: Arc<H>) {
    let state = handler.handler_state();
    if state.connection().is_some() {
        info!("{} ignoring reconnection request, already connected", state.name());
        return;
    }
    if state
        .reconnection_pending
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        debug!("{} reconnection already pending", state.name());
        return;
    }

    debug!("{} getting connection from pool", state.name());
    let result = handler.pool().get_connection().await;
    handler.handler_state().reconnection_pending.store(false, Ordering::Release);

    match result {
        Ok(cnx) => handler.connection_opened(cnx).await,
        Err(err) => {
            warn!("{} failed to get connection: {}", handler.handler_state().name(), err);
            handler.connection_failed(err);
            schedule_reconnection(handler);
        }
    }
}

/// Arm a one-shot backoff timer; on expiry bump the epoch and try again.
/// Only active handlers reconnect.
pub(crate) fn schedule_reconnection<H: ReconnectableHandler>(handler: Arc<H>) {
    let state = handler.handler_state();
    if !state.status().is_active() {
        return;
    }
    let delay = state.next_backoff();
    info!("{} scheduling reconnection in {:?}", state.name(), delay);

    let armed_epoch = state.epoch();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let state = handler.handler_state();
        if state.epoch() != armed_epoch {
            // A newer reconnection already ran; this timer is stale.
            debug!("{} dropping stale reconnection timer", state.name());
            return;
        }
        if !state.status().is_active() {
            return;
        }
        state.bump_epoch();
        grab_connection(handler).await;
    });
}

/// React to a connection loss reported by `cnx_id`.
///
/// Disconnections from a connection we already replaced are ignored; active
/// handlers (or any handler hit by a retryable error) reconnect; terminal
/// handlers drop the event.
pub(crate) fn handle_disconnection<H: ReconnectableHandler>(
    handler: &Arc<H>,
    reason: &Error,
    cnx_id: u64,
) {
    let state = handler.handler_state();
    if let Some(current) = state.connection() {
        if current.id() != cnx_id {
            warn!("{} ignoring close of a superseded connection", state.name());
            return;
        }
    }
    state.clear_connection();

    let status = state.status();
    if reason.is_retryable() || status.is_active() {
        schedule_reconnection(Arc::clone(handler));
    } else {
        debug!("{} dropping disconnection event in state {:?}", state.name(), status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> HandlerState {
        HandlerState::new(
            "[test]".into(),
            Duration::from_secs(30),
            Duration::from_millis(100),
            Duration::from_secs(60),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn status_transitions() {
        let s = state();
        assert_eq!(s.status(), HandlerStatus::NotStarted);
        assert!(s.cas_status(HandlerStatus::NotStarted, HandlerStatus::Pending));
        assert!(!s.cas_status(HandlerStatus::NotStarted, HandlerStatus::Pending));
        s.set_status(HandlerStatus::Ready);
        assert!(s.status().is_active());
        s.set_status(HandlerStatus::Closed);
        assert!(!s.status().is_active());
    }

    #[test]
    fn epoch_is_monotonic() {
        let s = state();
        assert_eq!(s.epoch(), 0);
        assert_eq!(s.bump_epoch(), 1);
        assert_eq!(s.bump_epoch(), 2);
        assert_eq!(s.epoch(), 2);
    }

    #[test]
    fn retryable_upgrades_to_timeout_past_deadline() {
        let s = HandlerState::new(
            "[test]".into(),
            Duration::ZERO,
            Duration::from_millis(100),
            Duration::from_secs(60),
            Duration::from_secs(30),
        );
        let err = s.convert_to_timeout_if_necessary(Error::Retryable("x".into()), Instant::now());
        assert_eq!(err, Error::Timeout);

        // Non-retryable errors pass through untouched.
        let err = s.convert_to_timeout_if_necessary(Error::ProducerFenced, Instant::now());
        assert_eq!(err, Error::ProducerFenced);
    }
}
