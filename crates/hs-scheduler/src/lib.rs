//! Hearing Sync Escalation Scheduler
//!
//! Periodic maintenance of the pending request ledger. Each run executes, in order:
//! - [`PendingRequestRedriver`]: re-drives the oldest eligible PENDING request
//! - escalation of requests outstanding past the escalation window
//! - cleanup of COMPLETED requests past the retention window
//! - reclaim of requests stuck in PROCESSING
//!
//! A failing step is logged and recorded in the [`RunSummary`]; later steps still run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hs_config::AppConfig;
use hs_router::{DispatchError, HearingDelivery};
use hs_store::{PendingRequestRepository, StoreError};
use metrics::counter;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

pub mod housekeeping;
pub mod redrive;

pub use housekeeping::Housekeeper;
pub use redrive::{PendingRequestRedriver, RedriveOutcome};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Delivery error: {0}")]
    Delivery(#[from] DispatchError),
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub run_interval: Duration,
    /// Minimum gap between attempts on the same PENDING row
    pub pending_wait: Duration,
    /// Age after which a re-driven row is given up on
    pub exception_limit: Duration,
    pub escalation_threshold: Duration,
    pub retention: Duration,
    pub processing_timeout: Duration,
    pub deployment_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            run_interval: Duration::from_secs(120),
            pending_wait: Duration::from_secs(15 * 60),
            exception_limit: Duration::from_secs(4 * 60 * 60),
            escalation_threshold: Duration::from_secs(24 * 60 * 60),
            retention: Duration::from_secs(30 * 24 * 60 * 60),
            processing_timeout: Duration::from_secs(30 * 60),
            deployment_id: "local".to_string(),
        }
    }
}

impl From<&AppConfig> for SchedulerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            enabled: config.scheduler.enabled,
            run_interval: config.scheduler.run_interval(),
            pending_wait: config.pending.pending_wait_interval(),
            exception_limit: config.pending.exception_limit(),
            escalation_threshold: config.pending.escalation_wait_interval(),
            retention: config.pending.deletion_wait_interval(),
            processing_timeout: config.pending.processing_reclaim_interval(),
            deployment_id: config.deployment_id.clone(),
        }
    }
}

/// What one scheduler run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// None when the re-drive step failed
    pub redrive: Option<RedriveOutcome>,
    pub escalated: u64,
    pub deleted: u64,
    pub reclaimed: u64,
    /// Steps that failed, in run order
    pub failed_steps: Vec<&'static str>,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.failed_steps.is_empty()
    }
}

pub struct EscalationScheduler {
    config: SchedulerConfig,
    redriver: PendingRequestRedriver,
    housekeeper: Housekeeper,
    running: AtomicBool,
}

impl EscalationScheduler {
    pub fn new(
        config: SchedulerConfig,
        repository: Arc<dyn PendingRequestRepository>,
        delivery: Arc<HearingDelivery>,
    ) -> Self {
        let redriver = PendingRequestRedriver::new(config.clone(), repository.clone(), delivery);
        let housekeeper = Housekeeper::new(config.clone(), repository);
        Self {
            config,
            redriver,
            housekeeper,
            running: AtomicBool::new(false),
        }
    }

    /// Run every step once
    pub async fn run_once(&self) -> RunSummary {
        let mut summary = RunSummary::default();

        match self.redriver.redrive_next().await {
            Ok(outcome) => summary.redrive = Some(outcome),
            Err(e) => {
                error!(error = %e, "Error re-driving pending request");
                summary.failed_steps.push("redrive");
            }
        }

        match self.housekeeper.escalate().await {
            Ok(count) => summary.escalated = count,
            Err(e) => {
                error!(error = %e, "Error escalating pending requests");
                summary.failed_steps.push("escalate");
            }
        }

        match self.housekeeper.delete_completed().await {
            Ok(count) => summary.deleted = count,
            Err(e) => {
                error!(error = %e, "Error deleting completed pending requests");
                summary.failed_steps.push("cleanup");
            }
        }

        match self.housekeeper.reclaim_stuck().await {
            Ok(count) => summary.reclaimed = count,
            Err(e) => {
                error!(error = %e, "Error reclaiming stuck pending requests");
                summary.failed_steps.push("reclaim");
            }
        }

        counter!("scheduler.runs_total").increment(1);
        if !summary.is_clean() {
            counter!("scheduler.failed_runs_total").increment(1);
        }

        summary
    }

    /// Spawn the run loop. Returns None when the scheduler is disabled or already started.
    pub fn start(self: &Arc<Self>, shutdown: broadcast::Receiver<()>) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            info!("Escalation scheduler is disabled");
            return None;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already running");
            return None;
        }

        let scheduler = Arc::clone(self);
        Some(tokio::spawn(async move { scheduler.run(shutdown).await }))
    }

    async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            run_interval_secs = self.config.run_interval.as_secs(),
            deployment_id = %self.config.deployment_id,
            "Starting escalation scheduler"
        );

        let mut ticker = interval(self.config.run_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    let summary = self.run_once().await;
                    info!(
                        redrive = ?summary.redrive,
                        escalated = summary.escalated,
                        deleted = summary.deleted,
                        reclaimed = summary.reclaimed,
                        failed_steps = ?summary.failed_steps,
                        "Scheduler run finished"
                    );
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("Escalation scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_app_config() {
        let mut app = AppConfig::default();
        app.deployment_id = "hs-adapter-1".to_string();
        app.pending.exception_limit_in_hours = 6;
        app.scheduler.run_interval_secs = 30;

        let config = SchedulerConfig::from(&app);

        assert_eq!(config.exception_limit, Duration::from_secs(6 * 3600));
        assert_eq!(config.run_interval, Duration::from_secs(30));
        assert_eq!(config.pending_wait, Duration::from_secs(15 * 60));
        assert_eq!(config.deployment_id, "hs-adapter-1");
    }

    #[test]
    fn test_defaults_match_app_defaults() {
        let from_app = SchedulerConfig::from(&AppConfig::default());
        let default = SchedulerConfig::default();

        assert_eq!(from_app.run_interval, default.run_interval);
        assert_eq!(from_app.escalation_threshold, default.escalation_threshold);
        assert_eq!(from_app.retention, default.retention);
        assert_eq!(from_app.processing_timeout, default.processing_timeout);
    }
}
