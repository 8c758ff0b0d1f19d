//! Error types for capacity accounting and admission.

use std::io;
use std::path::PathBuf;

use hostcap_reconcile::{Conflicting, RetryError};
use thiserror::Error;

use crate::ledger::{LedgerKey, StoreError};

/// Errors surfaced by the capacity core.
#[derive(Debug, Error)]
pub enum CapacityError {
    /// The storage root could not be measured. Admission fails closed.
    #[error("failed to probe capacity of {path}: {source}")]
    Probe {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("ledger store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to list volumes: {0:#}")]
    VolumeList(anyhow::Error),

    /// Every read-modify-write attempt lost to a concurrent writer or deletion.
    #[error("ledger {key} still conflicting after {attempts} attempts")]
    ConflictRetriesExhausted { key: LedgerKey, attempts: u32 },

    #[error("invalid ledger operation: {0}")]
    InvalidOperation(String),

    #[error("failed to resolve ledger owner: {0:#}")]
    Owner(anyhow::Error),

    #[error("directory operation failed for {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The backing directory exists but its commitment was not recorded.
    #[error("provisioning {path} failed after its directory was created: {source}")]
    ProvisionFailed {
        path: PathBuf,
        #[source]
        source: Box<CapacityError>,
    },

    /// The request belongs to another provisioner or node.
    #[error("ignored: {0}")]
    Ignored(String),

    #[error("volume {volume} is missing annotation {annotation}")]
    MissingAnnotation {
        volume: String,
        annotation: &'static str,
    },

    #[error("volume {0} has no host path")]
    MissingHostPath(String),
}

impl CapacityError {
    /// Collapse the outcome of a conflict-retry loop on `key`.
    pub fn from_retry(key: &LedgerKey, err: RetryError<CapacityError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, .. } => Self::ConflictRetriesExhausted {
                key: key.clone(),
                attempts,
            },
            RetryError::Aborted(e) => e,
        }
    }

    /// Returns true for requests that are not ours to handle.
    pub fn is_ignored(&self) -> bool {
        matches!(self, Self::Ignored(_))
    }
}

/// A write that lost to a concurrent writer, or whose ledger vanished
/// between read and write. Either way the next attempt re-reads (and
/// re-bootstraps) the ledger.
impl Conflicting for CapacityError {
    fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict() || e.is_not_found())
    }
}
