//! Client-wide memory budget shared by every producer.
//!
//! Reservations are made at admission time for the uncompressed message size
//! and released exactly once when the message is acknowledged, timed out,
//! failed, or dropped at close.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Notify;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct MemoryLimitController {
    /// Byte budget; 0 disables enforcement (usage is still tracked).
    limit: u64,
    current: AtomicU64,
    released: Notify,
    closed: AtomicBool,
}

impl MemoryLimitController {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            current: AtomicU64::new(0),
            released: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Reserve without blocking. Returns `false` when the budget is exhausted.
    pub fn try_reserve(&self, bytes: u64) -> bool {
        let mut current = self.current.load(Ordering::Acquire);
        loop {
            if self.limit != 0 && current + bytes > self.limit {
                return false;
            }
            match self.current.compare_exchange_weak(
                current,
                current + bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Reserve, suspending until space frees up. Fails with
    /// [`Error::Interrupted`] once the controller is closed.
    pub async fn reserve(&self, bytes: u64) -> Result<()> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Interrupted);
            }
            // Register interest before re-checking so a concurrent release
            // cannot slip between the check and the wait.
            let notified = self.released.notified();
            if self.try_reserve(bytes) {
                return Ok(());
            }
            notified.await;
        }
    }

    pub fn release(&self, bytes: u64) {
        let previous = self.current.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(previous >= bytes, "memory release underflow");
        self.released.notify_waiters();
    }

    /// Wake all blocked reservations with an interrupted result.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.released.notify_waiters();
    }

    pub fn current_usage(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn unlimited_controller_tracks_usage() {
        let controller = MemoryLimitController::new(0);
        assert!(controller.try_reserve(1 << 40));
        assert_eq!(controller.current_usage(), 1 << 40);
        controller.release(1 << 40);
        assert_eq!(controller.current_usage(), 0);
    }

    #[test]
    fn try_reserve_respects_the_limit() {
        let controller = MemoryLimitController::new(100);
        assert!(controller.try_reserve(60));
        assert!(!controller.try_reserve(50));
        assert!(controller.try_reserve(40));
        controller.release(60);
        assert!(controller.try_reserve(10));
    }

    #[tokio::test]
    async fn reserve_blocks_until_release() {
        let controller = Arc::new(MemoryLimitController::new(100));
        assert!(controller.try_reserve(100));

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.reserve(50).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        controller.release(60);
        waiter.await.unwrap().unwrap();
        assert_eq!(controller.current_usage(), 90);
    }

    #[tokio::test]
    async fn close_interrupts_blocked_reservations() {
        let controller = Arc::new(MemoryLimitController::new(10));
        assert!(controller.try_reserve(10));

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.reserve(1).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.close();
        assert_eq!(waiter.await.unwrap(), Err(Error::Interrupted));
    }
}
