//! Integration tests for the reconciliation loop.
//!
//! The volume listing is the ground truth; these tests perturb the ledger
//! and the listing independently and check that a pass brings them back
//! together.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use hostcap_provisioner::accountant::LedgerAccountant;
use hostcap_provisioner::bootstrap::LedgerBootstrapper;
use hostcap_provisioner::error::CapacityError;
use hostcap_provisioner::ledger::{InMemoryLedgerStore, LedgerKey, LedgerStore, VolumeDetail};
use hostcap_provisioner::probe::FixedProbe;
use hostcap_provisioner::reconciler::{ReconcileOutcome, Reconciler, ReconcilerConfig};
use hostcap_provisioner::volumes::{
    InMemoryVolumeSource, VolumeRecord, VolumeScope, VolumeSource, ANN_PROVISION_ON_NODE,
};
use hostcap_quantity::Quantity;
use hostcap_reconcile::RetryPolicy;
use tokio::sync::watch;

const NODE: &str = "node-1";
const CLASS: &str = "kubevirt-hostpath-provisioner";

fn key() -> LedgerKey {
    LedgerKey::new("hostpath", NODE)
}

fn volume(pv: &str, gib: u64) -> VolumeRecord {
    VolumeRecord {
        name: format!("default.{pv}"),
        storage_class: CLASS.to_string(),
        capacity: Quantity::from_gib(gib),
        host_path: Some(format!("/var/hpvolumes/{pv}")),
        annotations: BTreeMap::from([(ANN_PROVISION_ON_NODE.to_string(), NODE.to_string())]),
    }
}

struct Harness {
    store: Arc<InMemoryLedgerStore>,
    volumes: Arc<InMemoryVolumeSource>,
    probe: Arc<FixedProbe>,
    bootstrap: Arc<LedgerBootstrapper>,
}

impl Harness {
    fn new(volumes: Vec<VolumeRecord>) -> Self {
        let store = Arc::new(InMemoryLedgerStore::new());
        let volumes = Arc::new(InMemoryVolumeSource::with_volumes(volumes));
        let probe = Arc::new(FixedProbe::new(Quantity::from_gib(100)));
        let bootstrap = Arc::new(LedgerBootstrapper::new(
            key(),
            VolumeScope::new(NODE, CLASS),
            probe.clone(),
            volumes.clone(),
            store.clone(),
        ));
        Self {
            store,
            volumes,
            probe,
            bootstrap,
        }
    }

    fn reconciler(&self, config: ReconcilerConfig) -> Reconciler {
        Reconciler::new(
            self.bootstrap.clone(),
            self.store.clone(),
            self.volumes.clone(),
            config,
        )
    }

    fn accountant(&self) -> LedgerAccountant {
        LedgerAccountant::new(
            self.bootstrap.clone(),
            self.store.clone(),
            RetryPolicy::immediate(3),
        )
    }
}

#[tokio::test]
async fn test_reconcile_creates_missing_ledger() {
    let harness = Harness::new(vec![volume("pv-a", 1), volume("pv-b", 2)]);
    let reconciler = harness.reconciler(ReconcilerConfig::default());

    let outcome = reconciler.reconcile_once().await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Unchanged);

    let ledger = harness.store.get(&key()).await.unwrap();
    assert_eq!(ledger.status.required, Quantity::from_gib(3));
    assert_eq!(ledger.status.disk_info.len(), 2);
    assert_eq!(ledger.status.total, Some(Quantity::from_gib(100)));
}

#[tokio::test]
async fn test_reconcile_recreates_deleted_ledger() {
    let harness = Harness::new(vec![volume("pv-a", 1)]);
    let reconciler = harness.reconciler(ReconcilerConfig::default());
    reconciler.reconcile_once().await.unwrap();

    harness.store.delete(&key()).await.unwrap();
    reconciler.reconcile_once().await.unwrap();

    let ledger = harness.store.get(&key()).await.unwrap();
    assert_eq!(ledger.status.required, Quantity::from_gib(1));
}

#[tokio::test]
async fn test_reconcile_drops_volume_deleted_out_of_band() {
    let harness = Harness::new(vec![volume("pv-a", 1), volume("pv-b", 2)]);
    let reconciler = harness.reconciler(ReconcilerConfig::default());
    harness.bootstrap.ensure().await.unwrap();

    harness.volumes.remove("default.pv-b").await;

    let outcome = reconciler.reconcile_once().await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Updated {
            required: Quantity::from_gib(1),
            volumes: 1,
        }
    );

    let ledger = harness.store.get(&key()).await.unwrap();
    assert!(!ledger.status.disk_info.contains_key("/var/hpvolumes/pv-b"));
    assert!(ledger.status.is_consistent());
}

#[tokio::test]
async fn test_reconcile_repairs_lost_commit() {
    let harness = Harness::new(vec![]);
    let reconciler = harness.reconciler(ReconcilerConfig::default());
    harness.bootstrap.ensure().await.unwrap();

    // Volume appeared but its commit never reached the ledger.
    harness.volumes.upsert(volume("pv-a", 4)).await;

    reconciler.reconcile_once().await.unwrap();
    let ledger = harness.store.get(&key()).await.unwrap();
    assert_eq!(ledger.status.required, Quantity::from_gib(4));
    assert_eq!(
        ledger.status.disk_info["/var/hpvolumes/pv-a"],
        VolumeDetail::new("default.pv-a", Quantity::from_gib(4))
    );
}

#[tokio::test]
async fn test_reconcile_skips_write_when_consistent() {
    let harness = Harness::new(vec![volume("pv-a", 1)]);
    let reconciler = harness.reconciler(ReconcilerConfig::default());
    harness.bootstrap.ensure().await.unwrap();
    let writes = harness.store.writes();

    assert_eq!(
        reconciler.reconcile_once().await.unwrap(),
        ReconcileOutcome::Unchanged
    );
    assert_eq!(harness.store.writes(), writes);
}

#[tokio::test]
async fn test_eventual_consistency_after_mixed_events() {
    let harness = Harness::new(vec![]);
    let accountant = harness.accountant();
    let reconciler = harness.reconciler(ReconcilerConfig::default());

    // Provisioned and recorded.
    harness.volumes.upsert(volume("pv-a", 1)).await;
    accountant
        .record_commit(
            "/var/hpvolumes/pv-a",
            VolumeDetail::new("default.pv-a", Quantity::from_gib(1)),
            Quantity::from_gib(1),
        )
        .await
        .unwrap();

    // Recorded but the volume never materialized.
    accountant
        .record_commit(
            "/var/hpvolumes/pv-ghost",
            VolumeDetail::new("default.pv-ghost", Quantity::from_gib(7)),
            Quantity::from_gib(7),
        )
        .await
        .unwrap();

    // Provisioned but never recorded.
    harness.volumes.upsert(volume("pv-c", 3)).await;

    // Deleted and released.
    harness.volumes.upsert(volume("pv-d", 2)).await;
    accountant
        .record_commit(
            "/var/hpvolumes/pv-d",
            VolumeDetail::new("default.pv-d", Quantity::from_gib(2)),
            Quantity::from_gib(2),
        )
        .await
        .unwrap();
    harness.volumes.remove("default.pv-d").await;
    accountant
        .record_release("/var/hpvolumes/pv-d", Quantity::from_gib(2))
        .await
        .unwrap();

    reconciler.reconcile_once().await.unwrap();

    let ledger = harness.store.get(&key()).await.unwrap();
    let listing = harness.volumes.list_volumes().await.unwrap();
    let expected = VolumeScope::new(NODE, CLASS).ledger_status(&listing);
    assert_eq!(ledger.status.required, expected.required);
    assert_eq!(ledger.status.disk_info, expected.disk_info);
    assert_eq!(ledger.status.required, Quantity::from_gib(4));
}

#[tokio::test]
async fn test_reconcile_retries_conflicts() {
    let harness = Harness::new(vec![volume("pv-a", 1)]);
    let reconciler = harness.reconciler(ReconcilerConfig {
        retry: RetryPolicy::immediate(3),
        ..Default::default()
    });
    harness.bootstrap.ensure().await.unwrap();
    harness.volumes.upsert(volume("pv-b", 2)).await;

    harness.store.inject_conflicts(2);
    reconciler.reconcile_once().await.unwrap();

    let ledger = harness.store.get(&key()).await.unwrap();
    assert_eq!(ledger.status.required, Quantity::from_gib(3));
}

#[tokio::test]
async fn test_reconcile_listing_failure_leaves_ledger_alone() {
    let harness = Harness::new(vec![volume("pv-a", 1)]);
    let reconciler = harness.reconciler(ReconcilerConfig::default());
    let before = harness.bootstrap.ensure().await.unwrap();

    harness.volumes.set_failing(true);
    let err = reconciler.reconcile_once().await.unwrap_err();
    assert!(matches!(err, CapacityError::VolumeList(_)));
    assert_eq!(harness.store.get(&key()).await.unwrap(), before);
}

#[tokio::test]
async fn test_refresh_total_reprobes_root() {
    let harness = Harness::new(vec![]);
    let reconciler = harness.reconciler(ReconcilerConfig {
        refresh_total: true,
        ..Default::default()
    });
    harness.bootstrap.ensure().await.unwrap();

    harness.probe.set_total(Quantity::from_gib(200));
    reconciler.reconcile_once().await.unwrap();
    assert_eq!(
        harness.store.get(&key()).await.unwrap().status.total,
        Some(Quantity::from_gib(200))
    );

    // A failed probe keeps the last known total.
    harness.probe.set_failing(io::ErrorKind::PermissionDenied);
    reconciler.reconcile_once().await.unwrap();
    assert_eq!(
        harness.store.get(&key()).await.unwrap().status.total,
        Some(Quantity::from_gib(200))
    );
}

#[tokio::test]
async fn test_run_loop_reconciles_and_stops_on_shutdown() {
    let harness = Harness::new(vec![volume("pv-a", 1)]);
    let reconciler = harness.reconciler(ReconcilerConfig {
        interval: Duration::from_millis(10),
        ..Default::default()
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        reconciler.run(shutdown_rx).await;
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.volumes.upsert(volume("pv-b", 2)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let ledger = harness.store.get(&key()).await.unwrap();
    assert_eq!(ledger.status.required, Quantity::from_gib(3));

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("reconciler did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_run_loop_survives_failures() {
    let harness = Harness::new(vec![volume("pv-a", 1)]);
    harness.volumes.set_failing(true);
    let reconciler = harness.reconciler(ReconcilerConfig {
        interval: Duration::from_millis(5),
        ..Default::default()
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        reconciler.run(shutdown_rx).await;
    });

    // Long enough for several failing passes.
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(harness.store.get(&key()).await.unwrap_err().is_not_found());

    harness.volumes.set_failing(false);
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(
        harness.store.get(&key()).await.unwrap().status.required,
        Quantity::from_gib(1)
    );

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("reconciler did not stop")
        .unwrap();
}
