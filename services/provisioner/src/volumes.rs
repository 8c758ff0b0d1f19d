//! Provisioned volumes: the ground truth the ledger is checked against.
//!
//! The orchestration system owns the list of volumes. This module only
//! reads it, decides which volumes this node accounts for, and derives
//! ledger fields from them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use hostcap_quantity::Quantity;
use tokio::sync::RwLock;
use tracing::warn;

use crate::ledger::{LedgerStatus, VolumeDetail};

/// Annotation naming the node a volume was provisioned on.
pub const ANN_PROVISION_ON_NODE: &str = "kubevirt.io/provisionOnNode";

/// Annotation set by the scheduler under late binding.
pub const ANN_SELECTED_NODE: &str = "volume.kubernetes.io/selected-node";

/// Annotation identifying the provisioner that created a volume.
pub const ANN_PROVISIONER_IDENTITY: &str = "hostPathProvisionerIdentity";

/// A provisioned volume as reported by the orchestration API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRecord {
    pub name: String,
    pub storage_class: String,
    pub capacity: Quantity,
    pub host_path: Option<String>,
    pub annotations: BTreeMap<String, String>,
}

impl VolumeRecord {
    /// Node the volume was provisioned on, if annotated.
    pub fn node(&self) -> Option<&str> {
        self.annotations
            .get(ANN_PROVISION_ON_NODE)
            .map(String::as_str)
    }
}

/// Read-only source of provisioned volumes.
#[async_trait]
pub trait VolumeSource: Send + Sync {
    /// List every volume in the cluster.
    async fn list_volumes(&self) -> Result<Vec<VolumeRecord>>;
}

/// The slice of volumes one node accounts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeScope {
    pub node_name: String,
    pub storage_class: String,
}

impl VolumeScope {
    pub fn new(node_name: impl Into<String>, storage_class: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            storage_class: storage_class.into(),
        }
    }

    /// Returns true if the volume is on this node and in the tracked class.
    pub fn tracks(&self, volume: &VolumeRecord) -> bool {
        volume.node() == Some(self.node_name.as_str()) && volume.storage_class == self.storage_class
    }

    /// Tracked volumes from a cluster-wide listing.
    pub fn tracked<'a>(
        &'a self,
        volumes: &'a [VolumeRecord],
    ) -> impl Iterator<Item = &'a VolumeRecord> + 'a {
        volumes.iter().filter(move |v| self.tracks(v))
    }

    /// Capacity held by tracked volumes.
    pub fn committed(&self, volumes: &[VolumeRecord]) -> Quantity {
        self.tracked(volumes).map(|v| v.capacity).sum()
    }

    /// Build `required` and `diskInfo` from scratch.
    ///
    /// `total` is left unset. Volumes without a host path cannot be keyed
    /// and are skipped.
    pub fn ledger_status(&self, volumes: &[VolumeRecord]) -> LedgerStatus {
        let mut status = LedgerStatus::default();
        for volume in self.tracked(volumes) {
            let Some(path) = &volume.host_path else {
                warn!(volume = %volume.name, "Tracked volume has no host path, leaving it out of the ledger");
                continue;
            };
            status.commit(path, VolumeDetail::new(&volume.name, volume.capacity));
        }
        status
    }
}

/// In-memory volume source for tests and development.
pub struct InMemoryVolumeSource {
    volumes: RwLock<Vec<VolumeRecord>>,
    failing: AtomicBool,
}

impl InMemoryVolumeSource {
    pub fn new() -> Self {
        Self::with_volumes(Vec::new())
    }

    pub fn with_volumes(volumes: Vec<VolumeRecord>) -> Self {
        Self {
            volumes: RwLock::new(volumes),
            failing: AtomicBool::new(false),
        }
    }

    /// Add or replace a volume by name.
    pub async fn upsert(&self, volume: VolumeRecord) {
        let mut volumes = self.volumes.write().await;
        volumes.retain(|v| v.name != volume.name);
        volumes.push(volume);
    }

    /// Remove a volume by name. Returns true if it existed.
    pub async fn remove(&self, name: &str) -> bool {
        let mut volumes = self.volumes.write().await;
        let before = volumes.len();
        volumes.retain(|v| v.name != name);
        volumes.len() != before
    }

    /// Make listing fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Default for InMemoryVolumeSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VolumeSource for InMemoryVolumeSource {
    async fn list_volumes(&self) -> Result<Vec<VolumeRecord>> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("volume listing configured to fail");
        }
        Ok(self.volumes.read().await.clone())
    }
}
