//! The per-node capacity ledger.
//!
//! One ledger exists per node. It records:
//! - `total`: the measured, rounded capacity of the node's storage root
//! - `required`: the capacity committed to tracked volumes
//! - `diskInfo`: backing path → volume detail for every tracked volume
//!
//! The object is persisted through a [`LedgerStore`] which provides
//! optimistic concurrency via an opaque resource version.

mod sqlite;
mod store;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use hostcap_quantity::Quantity;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use sqlite::SqliteLedgerStore;
pub use store::{InMemoryLedgerStore, LedgerStore, StoreError};

/// API version of the ledger object.
pub const LEDGER_API_VERSION: &str = "diskmonitor.domain/v1";

/// Kind of the ledger object.
pub const LEDGER_KIND: &str = "DiskMonitor";

/// Identifies a ledger: the namespace it lives in and the node it describes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LedgerKey {
    pub namespace: String,
    pub name: String,
}

impl LedgerKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reference to the resource whose removal garbage-collects the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
    #[serde(default)]
    pub block_owner_deletion: bool,
}

/// Object metadata for a ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerMeta {
    pub name: String,
    pub namespace: String,

    /// Opaque version assigned by the store on every write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<OwnerReference>,

    /// Metadata this crate does not model (uid, labels, annotations,
    /// finalizers, ...). Carried through unchanged so a full-object write
    /// never strips what other controllers set.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Detail recorded for each volume in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeDetail {
    pub volume_name: String,
    pub declared_size: Quantity,
}

impl VolumeDetail {
    pub fn new(volume_name: impl Into<String>, declared_size: Quantity) -> Self {
        Self {
            volume_name: volume_name.into(),
            declared_size,
        }
    }
}

/// Capacity accounting fields of a ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStatus {
    /// Rounded capacity of the storage root. `None` if it could not be probed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<Quantity>,

    #[serde(default)]
    pub required: Quantity,

    #[serde(default)]
    pub disk_info: BTreeMap<String, VolumeDetail>,
}

/// A release subtracted more than the ledger had committed.
///
/// The subtraction is clamped at zero and the next reconciliation pass
/// restores the true value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("ledger drift releasing {path}: {released} exceeds committed {required}")]
pub struct LedgerDrift {
    pub path: String,
    pub required: Quantity,
    pub released: Quantity,
}

/// Result of applying a release to a ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The path was not tracked; nothing changed.
    Absent,

    /// The entry was removed and `required` reduced.
    Released {
        detail: VolumeDetail,
        drift: Option<LedgerDrift>,
    },
}

impl LedgerStatus {
    /// Record `detail` for `path`, adding its declared size to `required`.
    ///
    /// If the path is already tracked its previous declared size is removed
    /// from `required` first, so re-applying the same commit does not count
    /// it twice. Returns the replaced detail, if any.
    pub fn commit(&mut self, path: &str, detail: VolumeDetail) -> Option<VolumeDetail> {
        let size = detail.declared_size;
        let replaced = self.disk_info.insert(path.to_string(), detail);
        if let Some(previous) = &replaced {
            self.required = self.required.saturating_sub(previous.declared_size);
        }
        self.required += size;
        replaced
    }

    /// Release `size` committed for `path`.
    ///
    /// Untracked paths are left alone. `required` never goes below zero.
    pub fn release(&mut self, path: &str, size: Quantity) -> ReleaseOutcome {
        let Some(detail) = self.disk_info.remove(path) else {
            return ReleaseOutcome::Absent;
        };

        let drift = match self.required.checked_sub(size) {
            Some(remaining) => {
                self.required = remaining;
                None
            }
            None => {
                let drift = LedgerDrift {
                    path: path.to_string(),
                    required: self.required,
                    released: size,
                };
                self.required = Quantity::ZERO;
                Some(drift)
            }
        };

        ReleaseOutcome::Released { detail, drift }
    }

    /// Sum of the declared sizes of all tracked volumes.
    pub fn declared_sum(&self) -> Quantity {
        self.disk_info.values().map(|d| d.declared_size).sum()
    }

    /// Returns true if `required` matches the tracked volumes.
    pub fn is_consistent(&self) -> bool {
        self.required == self.declared_sum()
    }

    /// Uncommitted capacity according to the ledger, if `total` is known.
    pub fn free(&self) -> Option<Quantity> {
        self.total.map(|total| total.saturating_sub(self.required))
    }
}

/// The ledger object as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeLedger {
    #[serde(default = "default_api_version")]
    pub api_version: String,

    #[serde(default = "default_kind")]
    pub kind: String,

    pub metadata: LedgerMeta,

    #[serde(default)]
    pub status: LedgerStatus,

    /// Unmodelled top-level fields, carried through unchanged.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_api_version() -> String {
    LEDGER_API_VERSION.to_string()
}

fn default_kind() -> String {
    LEDGER_KIND.to_string()
}

impl NodeLedger {
    /// Build an unpersisted ledger.
    pub fn new(key: &LedgerKey, status: LedgerStatus, owner: Option<OwnerReference>) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: LedgerMeta {
                name: key.name.clone(),
                namespace: key.namespace.clone(),
                resource_version: None,
                creation_timestamp: None,
                owner_references: owner.into_iter().collect(),
                extra: serde_json::Map::new(),
            },
            status,
            extra: serde_json::Map::new(),
        }
    }

    pub fn key(&self) -> LedgerKey {
        LedgerKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn resource_version(&self) -> Option<&str> {
        self.metadata.resource_version.as_deref()
    }
}
