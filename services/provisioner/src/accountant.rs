//! Ledger accountant: turns allocation and release events into ledger writes.
//!
//! Every mutation is a read-modify-write against the store, retried on
//! version conflicts up to the configured budget. There is no in-process
//! lock; concurrent writers (other workers, the reconciler) are serialized
//! by the store's optimistic concurrency.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use hostcap_quantity::Quantity;
use hostcap_reconcile::{retry_on_conflict, RetryPolicy};
use tracing::{debug, error, info, warn};

use crate::bootstrap::LedgerBootstrapper;
use crate::error::CapacityError;
use crate::ledger::{LedgerStore, NodeLedger, ReleaseOutcome, VolumeDetail};

/// Kind of ledger mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOperation {
    /// Record capacity committed to a new volume.
    Commit,
    /// Release capacity of a deleted volume.
    Release,
}

impl LedgerOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Release => "release",
        }
    }
}

impl fmt::Display for LedgerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerOperation {
    type Err = CapacityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commit" | "update" => Ok(Self::Commit),
            "release" | "delete" => Ok(Self::Release),
            other => Err(CapacityError::InvalidOperation(format!(
                "unknown operation '{other}'"
            ))),
        }
    }
}

/// Arguments for a tagged ledger mutation.
#[derive(Debug, Clone)]
pub struct ModifyLedgerArgs {
    pub path: String,
    pub operation: LedgerOperation,
    /// Required for commits, ignored for releases.
    pub detail: Option<VolumeDetail>,
    pub size: Quantity,
}

/// Applies commit/release events to the node ledger.
pub struct LedgerAccountant {
    bootstrap: Arc<LedgerBootstrapper>,
    store: Arc<dyn LedgerStore>,
    retry: RetryPolicy,
}

impl LedgerAccountant {
    pub fn new(
        bootstrap: Arc<LedgerBootstrapper>,
        store: Arc<dyn LedgerStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            bootstrap,
            store,
            retry,
        }
    }

    pub fn bootstrapper(&self) -> &LedgerBootstrapper {
        &self.bootstrap
    }

    /// Apply a tagged mutation.
    pub async fn modify(&self, args: ModifyLedgerArgs) -> Result<NodeLedger, CapacityError> {
        match args.operation {
            LedgerOperation::Commit => {
                let detail = args.detail.ok_or_else(|| {
                    CapacityError::InvalidOperation(format!(
                        "commit of {} requires a volume detail",
                        args.path
                    ))
                })?;
                self.record_commit(&args.path, detail, args.size).await
            }
            LedgerOperation::Release => self.record_release(&args.path, args.size).await,
        }
    }

    /// Record `size` committed to the volume backed by `path`.
    ///
    /// `size` is authoritative: a detail declaring a different size is
    /// corrected before it is stored.
    pub async fn record_commit(
        &self,
        path: &str,
        mut detail: VolumeDetail,
        size: Quantity,
    ) -> Result<NodeLedger, CapacityError> {
        if detail.declared_size != size {
            warn!(
                path,
                declared = %detail.declared_size,
                size = %size,
                "Volume detail disagrees with committed size, using committed size"
            );
            detail.declared_size = size;
        }

        let result = retry_on_conflict(&self.retry, |attempt| {
            let detail = detail.clone();
            async move {
                let mut ledger = self.bootstrap.ensure().await?;
                if let Some(previous) = ledger.status.commit(path, detail) {
                    debug!(
                        path,
                        previous = %previous.declared_size,
                        attempt,
                        "Overwriting existing ledger entry"
                    );
                }
                let updated = self.store.update(&ledger).await?;
                Ok::<_, CapacityError>(updated)
            }
        })
        .await;

        match result {
            Ok(ledger) => {
                info!(
                    ledger = %self.bootstrap.key(),
                    path,
                    size = %size,
                    required = %ledger.status.required,
                    "Recorded capacity commit"
                );
                Ok(ledger)
            }
            Err(e) => {
                let err = CapacityError::from_retry(self.bootstrap.key(), e);
                error!(ledger = %self.bootstrap.key(), path, error = %err, "Failed to record capacity commit");
                Err(err)
            }
        }
    }

    /// Release `size` committed to the volume backed by `path`.
    ///
    /// Paths the ledger does not know about are not an error and cause no
    /// write.
    pub async fn record_release(
        &self,
        path: &str,
        size: Quantity,
    ) -> Result<NodeLedger, CapacityError> {
        let result = retry_on_conflict(&self.retry, |_| async move {
            let mut ledger = self.bootstrap.ensure().await?;
            match ledger.status.release(path, size) {
                ReleaseOutcome::Absent => Ok::<_, CapacityError>((ledger, false)),
                ReleaseOutcome::Released { drift, .. } => {
                    if let Some(drift) = drift {
                        warn!(ledger = %self.bootstrap.key(), error = %drift, "Clamped required capacity at zero");
                    }
                    Ok((self.store.update(&ledger).await?, true))
                }
            }
        })
        .await;

        match result {
            Ok((ledger, true)) => {
                info!(
                    ledger = %self.bootstrap.key(),
                    path,
                    size = %size,
                    required = %ledger.status.required,
                    "Recorded capacity release"
                );
                Ok(ledger)
            }
            Ok((ledger, false)) => {
                debug!(ledger = %self.bootstrap.key(), path, "Release of untracked path, nothing to do");
                Ok(ledger)
            }
            Err(e) => {
                let err = CapacityError::from_retry(self.bootstrap.key(), e);
                error!(ledger = %self.bootstrap.key(), path, error = %err, "Failed to record capacity release");
                Err(err)
            }
        }
    }
}
