//! hostcap Provisioner
//!
//! Runs on every storage node alongside the provisioning controller.
//!
//! ## Architecture
//!
//! - **Startup**: creates the node ledger if it does not exist yet
//! - **Reconciler**: rebuilds the ledger from the volume listing on a fixed interval
//! - **Admission / accounting**: invoked by the controller through the library API

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hostcap_provisioner::admission::AdmissionDecider;
use hostcap_provisioner::bootstrap::{LedgerBootstrapper, OwnerResolver, StaticOwner};
use hostcap_provisioner::client::{DaemonSetOwner, OrchestratorClient};
use hostcap_provisioner::config::{Config, LedgerBackend};
use hostcap_provisioner::ledger::{LedgerKey, LedgerStore, SqliteLedgerStore};
use hostcap_provisioner::probe::StatfsProbe;
use hostcap_provisioner::reconciler::{Reconciler, ReconcilerConfig};
use hostcap_provisioner::volumes::{VolumeScope, VolumeSource};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let default_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting hostcap provisioner");

    // Volumes are created world-writable regardless of the inherited umask.
    unsafe {
        libc::umask(0);
    }

    // Load configuration
    let config = Config::from_env()?;
    info!(
        node = %config.node_name,
        namespace = %config.namespace,
        pv_dir = %config.pv_dir.display(),
        storage_class = %config.storage_class,
        naming_prefix = config.use_naming_prefix,
        backend = ?config.ledger_backend,
        "Configuration loaded"
    );

    let client = Arc::new(OrchestratorClient::new(
        config.orchestrator_url.clone(),
        config.read_token(),
    )?);

    let store: Arc<dyn LedgerStore> = match config.ledger_backend {
        LedgerBackend::Api => client.clone(),
        LedgerBackend::Sqlite => {
            if let Some(parent) = config.ledger_db_path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create ledger directory {}", parent.display())
                })?;
            }
            Arc::new(SqliteLedgerStore::open(&config.ledger_db_path)?)
        }
    };
    let volumes: Arc<dyn VolumeSource> = client.clone();
    let owner: Arc<dyn OwnerResolver> = match &config.owner_references {
        Some(hint) => Arc::new(DaemonSetOwner::new(client.clone(), &config.namespace, hint)),
        None => Arc::new(StaticOwner::default()),
    };

    let probe = Arc::new(StatfsProbe);
    let bootstrap = Arc::new(
        LedgerBootstrapper::new(
            LedgerKey::new(&config.namespace, &config.node_name),
            VolumeScope::new(&config.node_name, &config.storage_class),
            probe.clone(),
            Arc::clone(&volumes),
            Arc::clone(&store),
        )
        .with_monitor_root(&config.monitor_root)
        .with_owner(owner),
    );

    // The ledger must exist before the controller starts admitting volumes.
    let ledger = bootstrap
        .ensure()
        .await
        .context("failed to create node ledger")?;
    info!(
        ledger = %bootstrap.key(),
        required = %ledger.status.required,
        volumes = ledger.status.disk_info.len(),
        "Node ledger ready"
    );

    // Report what admission would see right now.
    let decider = AdmissionDecider::new(
        bootstrap.scope().clone(),
        &config.pv_dir,
        probe,
        Arc::clone(&volumes),
    );
    match decider.capacity().await {
        Ok(snapshot) => info!(
            total = %snapshot.total,
            committed = %snapshot.committed,
            free = %snapshot.free,
            "Storage capacity"
        ),
        Err(e) => warn!(error = %e, "Unable to determine storage capacity, requests will be rejected"),
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start the reconciliation loop
    let reconciler = Reconciler::new(
        Arc::clone(&bootstrap),
        Arc::clone(&store),
        volumes,
        ReconcilerConfig {
            interval: config.reconcile_interval,
            ..Default::default()
        },
    );
    let mut reconciler_handle = tokio::spawn(async move {
        reconciler.run(shutdown_rx).await;
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut reconciler_handle => {
            if let Err(e) = result {
                error!(error = %e, "Reconciler task panicked");
            }
        }
    }

    // Signal shutdown to the reconciler and let it finish its current pass
    let _ = shutdown_tx.send(true);
    if !reconciler_handle.is_finished() {
        let _ = reconciler_handle.await;
    }

    info!("Provisioner shutdown complete");
    Ok(())
}
