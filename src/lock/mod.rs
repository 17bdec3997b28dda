//! Monitoring lock: a database-row lease giving one live monitor per chain
//!
//! Handles:
//! - Acquisition and takeover of expired leases
//! - Jittered wait-and-poll start-up with a liveness heuristic
//! - Heartbeat pings and compare-and-clear release

use crate::config::MonitorConfig;
use crate::error::EngineResult;
use crate::state::{ChainType, LockAttempt, LockStore};

use rand::Rng;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// Source of lease timestamps, milliseconds since the Unix epoch
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock moved by hand
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Lease timings
#[derive(Debug, Clone, Copy)]
pub struct LockTimings {
    pub ping_interval: Duration,
    pub expiration_interval: Duration,
    pub poll_delay: Duration,
    pub max_start_jitter: Duration,
}

impl From<&MonitorConfig> for LockTimings {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            ping_interval: Duration::from_millis(config.ping_interval_ms),
            expiration_interval: Duration::from_millis(config.expiration_interval_ms),
            poll_delay: Duration::from_millis(config.lock_poll_delay_ms),
            max_start_jitter: Duration::from_millis(config.max_start_jitter_ms),
        }
    }
}

pub struct MonitoringLock {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    timings: LockTimings,
}

impl MonitoringLock {
    pub fn new(store: Arc<dyn LockStore>, clock: Arc<dyn Clock>, timings: LockTimings) -> Self {
        Self {
            store,
            clock,
            timings,
        }
    }

    pub fn timings(&self) -> &LockTimings {
        &self.timings
    }

    fn expiration_ms(&self) -> i64 {
        self.timings.expiration_interval.as_millis() as i64
    }

    /// Single attempt: create, take over an expired lease, or report the
    /// current holder's last ping.
    pub async fn acquire(&self, chain: ChainType, owner: &str) -> EngineResult<LockAttempt> {
        let attempt = self
            .store
            .try_acquire_lock(chain, owner, self.clock.now_ms(), self.expiration_ms())
            .await?;

        if attempt.acquired {
            info!("Monitoring lock for chain {} acquired by {}", chain, owner);
            crate::metrics::record_lock_acquired(chain);
        }
        Ok(attempt)
    }

    /// Jittered acquisition with polling. Gives up as soon as the holder is
    /// seen pinging, or after `expiration + 2 x ping` without success.
    pub async fn wait_and_acquire(&self, chain: ChainType, owner: &str) -> EngineResult<bool> {
        let max_jitter = self.timings.max_start_jitter.as_millis() as u64;
        if max_jitter > 0 {
            let jitter = rand::thread_rng().gen_range(0..=max_jitter);
            sleep(Duration::from_millis(jitter)).await;
        }

        let first = self.acquire(chain, owner).await?;
        if first.acquired {
            return Ok(true);
        }

        let give_up_at = Instant::now()
            + self.timings.expiration_interval
            + self.timings.ping_interval * 2;

        loop {
            sleep(self.timings.poll_delay).await;

            let attempt = self.acquire(chain, owner).await?;
            if attempt.acquired {
                return Ok(true);
            }

            if attempt.last_ping > first.last_ping {
                debug!(
                    "Lock holder for chain {} is alive (ping advanced to {:?}), standing by",
                    chain, attempt.last_ping
                );
                return Ok(false);
            }

            if Instant::now() >= give_up_at {
                debug!("Gave up waiting for lock on chain {}", chain);
                return Ok(false);
            }
        }
    }

    /// Refresh the lease; false when `owner` no longer holds it
    pub async fn ping(&self, chain: ChainType, owner: &str) -> EngineResult<bool> {
        self.store
            .ping_lock(chain, owner, self.clock.now_ms())
            .await
    }

    /// True iff `owner` is recorded and the lease has not expired
    pub async fn holds(&self, chain: ChainType, owner: &str) -> EngineResult<bool> {
        let now = self.clock.now_ms();
        Ok(self
            .store
            .get_lock(chain)
            .await?
            .map(|lock| lock.process_owner == owner && now <= lock.last_ping + self.expiration_ms())
            .unwrap_or(false))
    }

    /// Compare-and-clear
    pub async fn release(&self, chain: ChainType, owner: &str) -> EngineResult<bool> {
        let released = self.store.release_lock(chain, owner).await?;
        if released {
            info!("Monitoring lock for chain {} released by {}", chain, owner);
        }
        Ok(released)
    }
}
