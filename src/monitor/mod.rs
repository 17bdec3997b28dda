//! Transaction monitor: one background driver per chain
//!
//! Handles:
//! - Lock acquisition and the heartbeat keeping the lease alive
//! - Fee history warm-up before the first iteration
//! - The main loop moving every record bucket forward
//! - Standby instances retrying until a lease frees up

use crate::config::MonitorConfig;
use crate::error::{EngineError, EngineResult};
use crate::lock::MonitoringLock;
use crate::state::{ChainType, TransactionRecord, TransactionStatus};
use crate::wallet::{lifecycle, ChainWallet};

use dashmap::DashMap;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Granularity of interruptible sleeps
const SLEEP_STEP: Duration = Duration::from_millis(100);

/// Shared stop flag of one monitor and its tasks
#[derive(Debug, Clone, Default)]
pub struct RunningFlag(Arc<AtomicBool>);

impl RunningFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, running: bool) {
        self.0.store(running, Ordering::SeqCst);
    }
}

/// Sleep up to `duration`, returning early once `running` clears
pub async fn sleep_while_running(running: &RunningFlag, duration: Duration) {
    let until = Instant::now() + duration;
    while running.is_running() {
        let now = Instant::now();
        if now >= until {
            break;
        }
        sleep(SLEEP_STEP.min(until - now)).await;
    }
}

/// Buckets processed on every iteration, in order
const EVERY_ITERATION: [TransactionStatus; 4] = [
    TransactionStatus::Prepared,
    TransactionStatus::SubmissionFailed,
    TransactionStatus::Pending,
    TransactionStatus::Created,
];

/// Buckets only checked every `confirmation_check_every` iterations
const PERIODIC: [TransactionStatus; 2] = [
    TransactionStatus::Submitted,
    TransactionStatus::ReplacedPending,
];

/// The main loop of one monitor, owned by a lease holder
pub struct MonitorLoop {
    wallet: Arc<dyn ChainWallet>,
    lock: Arc<MonitoringLock>,
    config: MonitorConfig,
    running: RunningFlag,
    owner: String,
}

impl MonitorLoop {
    pub fn new(
        wallet: Arc<dyn ChainWallet>,
        lock: Arc<MonitoringLock>,
        config: MonitorConfig,
        running: RunningFlag,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            wallet,
            lock,
            config,
            running,
            owner: owner.into(),
        }
    }

    fn chain(&self) -> ChainType {
        self.wallet.chain()
    }

    async fn ensure_owner(&self) -> EngineResult<()> {
        if self.running.is_running() && self.lock.holds(self.chain(), &self.owner).await? {
            Ok(())
        } else {
            Err(EngineError::MonitorStopped { chain: self.chain() })
        }
    }

    /// Run iterations until stopped or the lease is lost
    pub async fn run(&self) {
        info!("Monitor loop for chain {} started by {}", self.chain(), self.owner);
        let mut iteration: u64 = 0;

        while self.running.is_running() {
            match self.run_iteration(iteration).await {
                Ok(true) => sleep_while_running(&self.running, self.config.loop_delay()).await,
                Ok(false) => {
                    sleep_while_running(&self.running, self.config.network_down_delay()).await
                }
                Err(EngineError::MonitorStopped { .. }) => {
                    warn!(
                        "Monitor for chain {} no longer holds the lock, stopping",
                        self.chain()
                    );
                    self.running.set(false);
                    break;
                }
                Err(e) => {
                    error!("Monitor iteration failed for chain {}: {}", self.chain(), e);
                    sleep_while_running(&self.running, self.config.loop_delay()).await;
                }
            }
            iteration += 1;
        }

        info!("Monitor loop for chain {} stopped", self.chain());
    }

    /// One pass over every bucket. Returns false when the network is down
    /// and nothing was touched.
    pub async fn run_iteration(&self, iteration: u64) -> EngineResult<bool> {
        self.ensure_owner().await?;
        crate::metrics::record_loop_iteration(self.chain());

        if !self.wallet.check_network_status().await {
            warn!(
                "Network for chain {} is down, retrying in {:?}",
                self.chain(),
                self.config.network_down_delay()
            );
            crate::metrics::record_network_down(self.chain());
            return Ok(false);
        }

        for status in EVERY_ITERATION {
            if status == TransactionStatus::SubmissionFailed
                && !self.wallet.supports_submission_failed_resubmit()
            {
                continue;
            }
            self.process_bucket(status).await?;
        }

        let every = self.config.confirmation_check_every.max(1);
        if iteration % every == 0 {
            for status in PERIODIC {
                self.process_bucket(status).await?;
            }
        }

        Ok(true)
    }

    async fn process_bucket(&self, status: TransactionStatus) -> EngineResult<()> {
        let records = self
            .wallet
            .store()
            .transactions_in_status(self.chain(), status)
            .await?;
        if !records.is_empty() {
            debug!(
                "Processing {} {} records on chain {}",
                records.len(),
                status,
                self.chain()
            );
        }

        for record in records {
            self.ensure_owner().await?;
            let id = record.id;
            match self.process_record(status, record).await {
                Ok(()) => {}
                Err(e @ EngineError::MonitorStopped { .. }) => return Err(e),
                Err(e) if e.should_alert() => error!(
                    "Transaction {} on chain {} needs attention: {}",
                    id,
                    self.chain(),
                    e
                ),
                Err(e) => warn!(
                    "Processing transaction {} on chain {} failed: {}",
                    id,
                    self.chain(),
                    e
                ),
            }
        }
        Ok(())
    }

    async fn process_record(
        &self,
        status: TransactionStatus,
        record: TransactionRecord,
    ) -> EngineResult<()> {
        let wallet = self.wallet.as_ref();
        match status {
            TransactionStatus::Created => lifecycle::process_created(wallet, record).await,
            TransactionStatus::Prepared => lifecycle::submit_prepared(wallet, record).await,
            TransactionStatus::SubmissionFailed => {
                lifecycle::resubmit(wallet, record, TransactionStatus::Replaced).await
            }
            TransactionStatus::Pending => wallet.check_pending(record).await,
            TransactionStatus::Submitted => lifecycle::check_submitted(wallet, record).await,
            TransactionStatus::ReplacedPending => {
                lifecycle::check_replaced_pending(wallet, record).await
            }
            TransactionStatus::Replaced | TransactionStatus::Success | TransactionStatus::Failed => {
                Ok(())
            }
        }
    }
}

/// Lifecycle of the background tasks of one chain
pub struct TransactionMonitor {
    wallet: Arc<dyn ChainWallet>,
    lock: Arc<MonitoringLock>,
    config: MonitorConfig,
    running: RunningFlag,
    owner: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TransactionMonitor {
    pub fn new(
        wallet: Arc<dyn ChainWallet>,
        lock: Arc<MonitoringLock>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            wallet,
            lock,
            config,
            running: RunningFlag::new(),
            owner: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn chain(&self) -> ChainType {
        self.wallet.chain()
    }

    pub fn is_monitoring(&self) -> bool {
        self.running.is_running()
    }

    /// Acquire the chain lock and spawn the monitor tasks. Returns false
    /// when another instance holds the lock or this one is already running.
    pub async fn start_monitoring(&self) -> EngineResult<bool> {
        let chain = self.chain();
        if self.running.is_running() {
            warn!("Monitor for chain {} is already running", chain);
            return Ok(false);
        }
        // Tasks of a run that lost its lease
        self.join_tasks().await;

        let owner = Uuid::new_v4().to_string();
        if !self.lock.wait_and_acquire(chain, &owner).await? {
            info!("Monitor for chain {} on standby, lock held elsewhere", chain);
            return Ok(false);
        }

        self.running.set(true);
        *self.owner.lock().await = Some(owner.clone());
        crate::metrics::record_monitoring(chain, true);

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.spawn_heartbeat(owner.clone()));

        let (ready_tx, ready_rx) = watch::channel(false);
        match self.wallet.fee_service() {
            Some(fee_service) => {
                let running = self.running.clone();
                let config = self.config.clone();
                tasks.push(tokio::spawn(async move {
                    fee_service
                        .wait_for_history(&running, config.fee_warmup_timeout(), config.loop_delay())
                        .await;
                    let _ = ready_tx.send(true);
                    fee_service.run(running, config.fee_refresh_interval()).await;
                }));
            }
            None => {
                let _ = ready_tx.send(true);
            }
        }

        let main_loop = MonitorLoop::new(
            self.wallet.clone(),
            self.lock.clone(),
            self.config.clone(),
            self.running.clone(),
            owner,
        );
        tasks.push(tokio::spawn(async move {
            let mut ready_rx = ready_rx;
            // A dropped sender also ends the wait
            while !*ready_rx.borrow() {
                if ready_rx.changed().await.is_err() {
                    break;
                }
            }
            main_loop.run().await;
        }));

        info!("Monitor for chain {} started", chain);
        Ok(true)
    }

    fn spawn_heartbeat(&self, owner: String) -> JoinHandle<()> {
        let lock = self.lock.clone();
        let running = self.running.clone();
        let chain = self.chain();
        let interval = lock.timings().ping_interval;

        tokio::spawn(async move {
            while running.is_running() {
                sleep_while_running(&running, interval).await;
                if !running.is_running() {
                    break;
                }
                match lock.ping(chain, &owner).await {
                    Ok(true) => debug!("Lock for chain {} refreshed", chain),
                    Ok(false) => {
                        warn!("Lock for chain {} lost by {}, stopping monitor", chain, owner);
                        running.set(false);
                        crate::metrics::record_lock_lost(chain);
                        crate::metrics::record_monitoring(chain, false);
                    }
                    Err(e) => warn!("Lock ping failed for chain {}: {}", chain, e),
                }
            }
        })
    }

    async fn join_tasks(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Monitor task for chain {} panicked: {}", self.chain(), e);
            }
        }
    }

    /// Stop and join all tasks, then release the lock if this instance still
    /// owns it. Tasks of a run whose lease was taken over are joined as well;
    /// only the release is skipped, leaving the new owner's lease intact.
    pub async fn stop_monitoring(&self) -> EngineResult<()> {
        let chain = self.chain();
        let owner = self.owner.lock().await.take();
        let still_owner = match &owner {
            Some(owner) => self.lock.holds(chain, owner).await.unwrap_or(false),
            None => false,
        };

        self.running.set(false);
        self.join_tasks().await;
        crate::metrics::record_monitoring(chain, false);

        match owner {
            Some(owner) if still_owner => {
                self.lock.release(chain, &owner).await?;
            }
            Some(_) => info!("Monitor for chain {} had lost its lock, nothing to release", chain),
            None => {}
        }

        info!("Monitor for chain {} stopped", chain);
        Ok(())
    }
}

/// One monitor per enabled chain
#[derive(Default)]
pub struct MonitorRegistry {
    monitors: DashMap<ChainType, Arc<TransactionMonitor>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, monitor: TransactionMonitor) {
        self.monitors.insert(monitor.chain(), Arc::new(monitor));
    }

    fn snapshot(&self) -> Vec<Arc<TransactionMonitor>> {
        self.monitors.iter().map(|m| m.value().clone()).collect()
    }

    /// Try to start every idle monitor; returns the chains now monitored
    pub async fn start_all(&self) -> Vec<ChainType> {
        let mut started = Vec::new();
        for monitor in self.snapshot() {
            if monitor.is_monitoring() {
                started.push(monitor.chain());
                continue;
            }
            match monitor.start_monitoring().await {
                Ok(true) => started.push(monitor.chain()),
                Ok(false) => {}
                Err(e) => error!("Failed to start monitor for chain {}: {}", monitor.chain(), e),
            }
        }
        started
    }

    /// Keep retrying idle monitors until `shutdown` clears
    pub async fn run_standby(&self, shutdown: RunningFlag, retry: Duration) {
        while shutdown.is_running() {
            let started = self.start_all().await;
            debug!("Monitoring {} of {} chains", started.len(), self.monitors.len());
            sleep_while_running(&shutdown, retry).await;
        }
    }

    pub async fn stop_all(&self) {
        let monitors = self.snapshot();
        let results = join_all(monitors.iter().map(|m| m.stop_monitoring())).await;
        for (monitor, result) in monitors.iter().zip(results) {
            if let Err(e) = result {
                error!("Failed to stop monitor for chain {}: {}", monitor.chain(), e);
            }
        }
    }
}
