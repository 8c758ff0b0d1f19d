//! Reconciliation loop for the node ledger.
//!
//! The reconciler:
//! - Periodically lists the node's tracked volumes (ground truth)
//! - Rebuilds `required` and `diskInfo` from scratch
//! - Overwrites the ledger when it has drifted
//!
//! Accountant writes are incremental and can be lost between a directory
//! operation and the ledger write; this loop is what makes the ledger
//! eventually exact. Failures are logged and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use hostcap_quantity::Quantity;
use hostcap_reconcile::{retry_on_conflict, FailureStreak, RetryPolicy, DEFAULT_RECONCILE_INTERVAL};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::bootstrap::LedgerBootstrapper;
use crate::error::CapacityError;
use crate::ledger::LedgerStore;
use crate::volumes::VolumeSource;

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between passes.
    pub interval: Duration,

    /// Re-probe the monitoring root on every pass.
    pub refresh_total: bool,

    /// Conflict retry budget for the ledger write.
    pub retry: RetryPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RECONCILE_INTERVAL,
            refresh_total: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of a single pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The ledger already matched.
    Unchanged,
    /// The ledger was rewritten.
    Updated { required: Quantity, volumes: usize },
}

/// Periodically rebuilds the ledger from the volume listing.
pub struct Reconciler {
    bootstrap: Arc<LedgerBootstrapper>,
    store: Arc<dyn LedgerStore>,
    volumes: Arc<dyn VolumeSource>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        bootstrap: Arc<LedgerBootstrapper>,
        store: Arc<dyn LedgerStore>,
        volumes: Arc<dyn VolumeSource>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            bootstrap,
            store,
            volumes,
            config,
        }
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            ledger = %self.bootstrap.key(),
            interval_secs = self.config.interval.as_secs_f64(),
            refresh_total = self.config.refresh_total,
            "Starting reconciliation loop"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut streak = FailureStreak::default();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = interval.tick() => {
                    self.tick(&mut streak).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(ledger = %self.bootstrap.key(), "Reconciler shutting down");
    }

    async fn tick(&self, streak: &mut FailureStreak) {
        match self.reconcile_once().await {
            Ok(outcome) => {
                let recovered = streak.record_success();
                if recovered > 0 {
                    info!(failures = recovered, "Reconciliation recovered");
                }
                debug!(?outcome, "Reconciliation pass complete");
            }
            Err(e) => {
                if streak.record_failure() {
                    error!(
                        error = %e,
                        consecutive_failures = streak.consecutive(),
                        "Reconciliation failed repeatedly"
                    );
                } else {
                    warn!(
                        error = %e,
                        consecutive_failures = streak.consecutive(),
                        "Reconciliation failed, will retry"
                    );
                }
            }
        }
    }

    /// Perform a single reconciliation pass.
    pub async fn reconcile_once(&self) -> Result<ReconcileOutcome, CapacityError> {
        let volumes = self
            .volumes
            .list_volumes()
            .await
            .map_err(CapacityError::VolumeList)?;
        let observed = self.bootstrap.scope().ledger_status(&volumes);

        let total = if self.config.refresh_total {
            match self.bootstrap.probe_total() {
                Ok(total) => Some(total),
                Err(e) => {
                    warn!(error = %e, "Failed to re-probe capacity, keeping previous total");
                    None
                }
            }
        } else {
            None
        };

        let observed = &observed;
        retry_on_conflict(&self.config.retry, |_| async move {
            let mut ledger = self.bootstrap.ensure().await?;

            let mut next = ledger.status.clone();
            next.required = observed.required;
            next.disk_info = observed.disk_info.clone();
            if total.is_some() {
                next.total = total;
            }

            if next == ledger.status {
                return Ok::<_, CapacityError>(ReconcileOutcome::Unchanged);
            }

            if next.required != ledger.status.required {
                info!(
                    ledger = %self.bootstrap.key(),
                    from = %ledger.status.required,
                    to = %next.required,
                    "Correcting ledger drift"
                );
            }

            let outcome = ReconcileOutcome::Updated {
                required: next.required,
                volumes: next.disk_info.len(),
            };
            ledger.status = next;
            self.store.update(&ledger).await?;
            Ok(outcome)
        })
        .await
        .map_err(|e| CapacityError::from_retry(self.bootstrap.key(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconciler_config_default() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.interval, Duration::from_secs(5));
        assert!(!config.refresh_total);
        assert_eq!(config.retry.max_attempts, hostcap_reconcile::DEFAULT_MAX_ATTEMPTS);
    }
}
