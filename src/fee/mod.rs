//! Fee service: moving average of recent per-block fee rates
//!
//! The UTXO wallet prefers this smoothed rate over the node's instantaneous
//! estimate, which swings with short mempool spikes.

use crate::error::EngineResult;
use crate::monitor::{sleep_while_running, RunningFlag};
use crate::state::ChainType;

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Per-block fee rates, per kB
#[async_trait]
pub trait FeeHistorySource: Send + Sync {
    async fn latest_block_number(&self) -> EngineResult<u64>;

    /// `None` when the block carries no fee statistics
    async fn block_fee_rate(&self, height: u64) -> EngineResult<Option<u64>>;
}

#[derive(Debug, Default)]
struct FeeHistory {
    last_height: Option<u64>,
    /// (height, rate) oldest first
    rates: VecDeque<(u64, u64)>,
}

pub struct FeeService {
    chain: ChainType,
    source: Arc<dyn FeeHistorySource>,
    depth: usize,
    history: RwLock<FeeHistory>,
}

impl FeeService {
    pub fn new(chain: ChainType, source: Arc<dyn FeeHistorySource>, depth: usize) -> Self {
        Self {
            chain,
            source,
            depth: depth.max(1),
            history: RwLock::new(FeeHistory::default()),
        }
    }

    /// True once `depth` blocks have been sampled
    pub async fn has_enough_history(&self) -> bool {
        self.history.read().await.rates.len() >= self.depth
    }

    /// Average of the sampled rates
    pub async fn fee_per_kb(&self) -> Option<u64> {
        let history = self.history.read().await;
        if history.rates.is_empty() {
            return None;
        }
        let total: u64 = history.rates.iter().map(|(_, rate)| rate).sum();
        Some(total / history.rates.len() as u64)
    }

    /// Sample blocks produced since the last refresh
    pub async fn refresh(&self) -> EngineResult<()> {
        let latest = self.source.latest_block_number().await?;
        let last_seen = self.history.read().await.last_height;

        let first = match last_seen {
            Some(h) if h >= latest => return Ok(()),
            Some(h) => (h + 1).max(latest.saturating_sub(self.depth as u64 - 1)),
            None => latest.saturating_sub(self.depth as u64 - 1),
        };

        let mut sampled = Vec::new();
        for height in first..=latest {
            if let Some(rate) = self.source.block_fee_rate(height).await? {
                sampled.push((height, rate));
            }
        }

        let mut history = self.history.write().await;
        history.last_height = Some(latest);
        history.rates.extend(sampled);
        while history.rates.len() > self.depth {
            history.rates.pop_front();
        }

        debug!(
            "Fee history for chain {} refreshed to block {} ({} samples)",
            self.chain,
            latest,
            history.rates.len()
        );
        Ok(())
    }

    /// Refresh until enough history is collected, `timeout` elapses or the
    /// monitor stops. Returns whether the history is complete.
    pub async fn wait_for_history(
        &self,
        running: &RunningFlag,
        timeout: Duration,
        retry_delay: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;

        while running.is_running() {
            if let Err(e) = self.refresh().await {
                warn!("Fee history refresh failed for chain {}: {}", self.chain, e);
            }
            if self.has_enough_history().await {
                info!("Fee history ready for chain {}", self.chain);
                return true;
            }
            if Instant::now() >= deadline {
                warn!(
                    "Fee history for chain {} incomplete after {:?}; continuing with node estimates",
                    self.chain, timeout
                );
                return false;
            }
            sleep_while_running(running, retry_delay).await;
        }

        false
    }

    /// Refresh loop, exits when `running` clears
    pub async fn run(&self, running: RunningFlag, interval: Duration) {
        while running.is_running() {
            sleep_while_running(&running, interval).await;
            if !running.is_running() {
                break;
            }
            if let Err(e) = self.refresh().await {
                warn!("Fee history refresh failed for chain {}: {}", self.chain, e);
            }
        }
        debug!("Fee service for chain {} stopped", self.chain);
    }
}
