//! Lazy ledger creation.
//!
//! A ledger that does not exist yet (first start, or deleted out from under
//! the process) is created from a scan of the node's tracked volumes. Two
//! bootstraps racing for the same node are harmless: the loser re-reads the
//! winner's ledger.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use hostcap_quantity::Quantity;
use tracing::{debug, info, warn};

use crate::error::CapacityError;
use crate::ledger::{LedgerKey, LedgerStore, NodeLedger, OwnerReference};
use crate::probe::CapacityProbe;
use crate::volumes::{VolumeScope, VolumeSource};

/// Default root probed for the ledger's `total`.
pub const DEFAULT_MONITOR_ROOT: &str = "/mnt/disks/";

/// Finds the resource that owns a node's ledger.
///
/// The owner reference is attached at creation so the ledger is garbage
/// collected together with its owner.
#[async_trait]
pub trait OwnerResolver: Send + Sync {
    async fn resolve_owner(&self) -> Result<Option<OwnerReference>>;
}

/// Owner resolver returning a fixed reference.
#[derive(Debug, Clone, Default)]
pub struct StaticOwner(pub Option<OwnerReference>);

#[async_trait]
impl OwnerResolver for StaticOwner {
    async fn resolve_owner(&self) -> Result<Option<OwnerReference>> {
        Ok(self.0.clone())
    }
}

/// Creates a node's ledger on first need.
pub struct LedgerBootstrapper {
    key: LedgerKey,
    scope: VolumeScope,
    monitor_root: PathBuf,
    probe: Arc<dyn CapacityProbe>,
    volumes: Arc<dyn VolumeSource>,
    store: Arc<dyn LedgerStore>,
    owner: Arc<dyn OwnerResolver>,
}

impl LedgerBootstrapper {
    pub fn new(
        key: LedgerKey,
        scope: VolumeScope,
        probe: Arc<dyn CapacityProbe>,
        volumes: Arc<dyn VolumeSource>,
        store: Arc<dyn LedgerStore>,
    ) -> Self {
        Self {
            key,
            scope,
            monitor_root: PathBuf::from(DEFAULT_MONITOR_ROOT),
            probe,
            volumes,
            store,
            owner: Arc::new(StaticOwner::default()),
        }
    }

    /// Probe `root` instead of the default monitoring root.
    pub fn with_monitor_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.monitor_root = root.into();
        self
    }

    pub fn with_owner(mut self, owner: Arc<dyn OwnerResolver>) -> Self {
        self.owner = owner;
        self
    }

    pub fn key(&self) -> &LedgerKey {
        &self.key
    }

    pub fn scope(&self) -> &VolumeScope {
        &self.scope
    }

    pub fn monitor_root(&self) -> &Path {
        &self.monitor_root
    }

    /// Probe the monitoring root.
    pub fn probe_total(&self) -> io::Result<Quantity> {
        self.probe.total_capacity(&self.monitor_root)
    }

    /// Return the node's ledger, creating it if it does not exist.
    pub async fn ensure(&self) -> Result<NodeLedger, CapacityError> {
        match self.store.get(&self.key).await {
            Ok(ledger) => Ok(ledger),
            Err(e) if e.is_not_found() => self.create().await,
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self) -> Result<NodeLedger, CapacityError> {
        let volumes = self
            .volumes
            .list_volumes()
            .await
            .map_err(CapacityError::VolumeList)?;

        let mut status = self.scope.ledger_status(&volumes);
        status.total = match self.probe_total() {
            Ok(total) => Some(total),
            Err(e) => {
                warn!(
                    root = %self.monitor_root.display(),
                    error = %e,
                    "Failed to probe monitoring root, creating ledger without total"
                );
                None
            }
        };

        let owner = self
            .owner
            .resolve_owner()
            .await
            .map_err(CapacityError::Owner)?;

        let ledger = NodeLedger::new(&self.key, status, owner);
        match self.store.create(&ledger).await {
            Ok(created) => {
                info!(
                    ledger = %self.key,
                    required = %created.status.required,
                    volumes = created.status.disk_info.len(),
                    total = ?created.status.total.map(|t| t.to_string()),
                    "Created node ledger"
                );
                Ok(created)
            }
            Err(e) if e.is_already_exists() => {
                debug!(ledger = %self.key, "Ledger created concurrently, re-reading");
                Ok(self.store.get(&self.key).await?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::ledger::{InMemoryLedgerStore, LedgerStatus, VolumeDetail};
    use crate::probe::FixedProbe;
    use crate::volumes::{InMemoryVolumeSource, VolumeRecord, ANN_PROVISION_ON_NODE};

    fn volume(name: &str, gib: u64) -> VolumeRecord {
        VolumeRecord {
            name: name.to_string(),
            storage_class: "hostpath".to_string(),
            capacity: Quantity::from_gib(gib),
            host_path: Some(format!("/var/hpvolumes/{name}")),
            annotations: BTreeMap::from([(ANN_PROVISION_ON_NODE.to_string(), "node-1".to_string())]),
        }
    }

    fn bootstrapper(
        probe: FixedProbe,
        volumes: Vec<VolumeRecord>,
        store: Arc<InMemoryLedgerStore>,
    ) -> LedgerBootstrapper {
        LedgerBootstrapper::new(
            LedgerKey::new("ns", "node-1"),
            VolumeScope::new("node-1", "hostpath"),
            Arc::new(probe),
            Arc::new(InMemoryVolumeSource::with_volumes(volumes)),
            store,
        )
    }

    #[tokio::test]
    async fn test_bootstrap_matches_existing_volumes() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let owner = OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "DaemonSet".to_string(),
            name: "hostpath-provisioner".to_string(),
            uid: "uid-1".to_string(),
            controller: true,
            block_owner_deletion: true,
        };
        let boot = bootstrapper(
            FixedProbe::new(Quantity::from_gib(100)),
            vec![volume("a", 2), volume("b", 3)],
            Arc::clone(&store),
        )
        .with_owner(Arc::new(StaticOwner(Some(owner.clone()))));

        let ledger = boot.ensure().await.unwrap();

        assert_eq!(ledger.status.total, Some(Quantity::from_gib(100)));
        assert_eq!(ledger.status.required, Quantity::from_gib(5));
        assert_eq!(
            ledger.status.disk_info["/var/hpvolumes/b"],
            VolumeDetail::new("b", Quantity::from_gib(3))
        );
        assert_eq!(ledger.metadata.owner_references, vec![owner]);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_existing_ledger_is_returned_untouched() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let existing = store
            .create(&NodeLedger::new(
                &LedgerKey::new("ns", "node-1"),
                LedgerStatus::default(),
                None,
            ))
            .await
            .unwrap();

        let boot = bootstrapper(
            FixedProbe::new(Quantity::from_gib(100)),
            vec![volume("a", 2)],
            Arc::clone(&store),
        );
        assert_eq!(boot.ensure().await.unwrap(), existing);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_probe_failure_leaves_total_unset() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let boot = bootstrapper(
            FixedProbe::failing(io::ErrorKind::NotFound),
            vec![volume("a", 2)],
            store,
        );

        let ledger = boot.ensure().await.unwrap();
        assert_eq!(ledger.status.total, None);
        assert_eq!(ledger.status.required, Quantity::from_gib(2));
    }

    #[tokio::test]
    async fn test_concurrent_bootstraps_agree() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let a = Arc::new(bootstrapper(
            FixedProbe::new(Quantity::from_gib(100)),
            vec![volume("a", 2)],
            Arc::clone(&store),
        ));
        let b = Arc::clone(&a);

        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.ensure().await }),
            tokio::spawn(async move { b.ensure().await }),
        );
        let (ra, rb) = (ra.unwrap().unwrap(), rb.unwrap().unwrap());

        assert_eq!(ra, rb);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_volume_listing_failure_is_surfaced() {
        let store = Arc::new(InMemoryLedgerStore::new());
        let source = Arc::new(InMemoryVolumeSource::new());
        source.set_failing(true);
        let boot = LedgerBootstrapper::new(
            LedgerKey::new("ns", "node-1"),
            VolumeScope::new("node-1", "hostpath"),
            Arc::new(FixedProbe::new(Quantity::from_gib(1))),
            source,
            store,
        );

        let err = boot.ensure().await.unwrap_err();
        assert!(matches!(err, CapacityError::VolumeList(_)));
    }
}
