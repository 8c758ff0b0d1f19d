//! Provision and delete calls.
//!
//! These are the entry points the provisioning controller invokes once a
//! request has been admitted (or a volume released). They compute backing
//! paths, drive the directory collaborator and record the outcome in the
//! ledger.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use hostcap_quantity::Quantity;
use tracing::{error, info};

use crate::accountant::LedgerAccountant;
use crate::error::CapacityError;
use crate::ledger::VolumeDetail;
use crate::probe::CapacityProbe;
use crate::volumes::{VolumeRecord, ANN_PROVISIONER_IDENTITY, ANN_PROVISION_ON_NODE};

/// Identity stamped on every volume this provisioner creates.
pub const DEFAULT_IDENTITY: &str = "kubevirt.io/hostpath-provisioner";

/// Creates and removes backing directories.
#[async_trait]
pub trait DirectoryManager: Send + Sync {
    async fn create_dir(&self, path: &Path) -> io::Result<()>;

    /// Remove a directory tree. Missing directories are not an error.
    async fn remove_dir(&self, path: &Path) -> io::Result<()>;
}

/// Directories on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalDirectories;

#[async_trait]
impl DirectoryManager for LocalDirectories {
    async fn create_dir(&self, path: &Path) -> io::Result<()> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o777);
        builder.create(path).await
    }

    async fn remove_dir(&self, path: &Path) -> io::Result<()> {
        match tokio::fs::remove_dir_all(path).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Provisioner settings.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Directory backing volumes are created under.
    pub pv_dir: PathBuf,

    /// Identity annotation value.
    pub identity: String,

    /// Prefix backing directories with the claim name.
    pub use_naming_prefix: bool,
}

/// An admitted request to provision.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub pv_name: String,
    pub claim_name: String,
    pub claim_namespace: String,
    pub requested: Quantity,
}

/// Provision/delete entry points for one node.
pub struct Provisioner {
    config: ProvisionerConfig,
    probe: Arc<dyn CapacityProbe>,
    directories: Arc<dyn DirectoryManager>,
    accountant: Arc<LedgerAccountant>,
}

impl Provisioner {
    pub fn new(
        config: ProvisionerConfig,
        probe: Arc<dyn CapacityProbe>,
        directories: Arc<dyn DirectoryManager>,
        accountant: Arc<LedgerAccountant>,
    ) -> Self {
        Self {
            config,
            probe,
            directories,
            accountant,
        }
    }

    fn node_name(&self) -> &str {
        &self.accountant.bootstrapper().scope().node_name
    }

    /// Backing directory for a request.
    pub fn backing_path(&self, request: &ProvisionRequest) -> PathBuf {
        if self.config.use_naming_prefix {
            self.config
                .pv_dir
                .join(format!("{}-{}", request.claim_name, request.pv_name))
        } else {
            self.config.pv_dir.join(&request.pv_name)
        }
    }

    /// Create the backing directory and record its commitment.
    ///
    /// If the ledger write fails the directory is left in place and
    /// [`CapacityError::ProvisionFailed`] is returned; the reconciler brings
    /// the ledger back in line once the volume is visible.
    pub async fn provision(
        &self,
        request: &ProvisionRequest,
    ) -> Result<VolumeRecord, CapacityError> {
        let path = self.backing_path(request);

        self.probe
            .total_capacity(&self.config.pv_dir)
            .map_err(|source| CapacityError::Probe {
                path: self.config.pv_dir.clone(),
                source,
            })?;

        info!(path = %path.display(), "Creating backing directory");
        self.directories
            .create_dir(&path)
            .await
            .map_err(|source| CapacityError::Directory {
                path: path.clone(),
                source,
            })?;

        let record = self.volume_record(request);
        let path_str = path.to_string_lossy().into_owned();
        let detail = VolumeDetail::new(&record.name, request.requested);

        if let Err(e) = self
            .accountant
            .record_commit(&path_str, detail, request.requested)
            .await
        {
            error!(path = %path_str, error = %e, "Backing directory created but commitment not recorded");
            return Err(CapacityError::ProvisionFailed {
                path,
                source: Box::new(e),
            });
        }

        Ok(record)
    }

    /// The volume the controller publishes for `request`.
    pub fn volume_record(&self, request: &ProvisionRequest) -> VolumeRecord {
        VolumeRecord {
            name: format!("{}.{}", request.claim_namespace, request.pv_name),
            storage_class: self.accountant.bootstrapper().scope().storage_class.clone(),
            capacity: request.requested,
            host_path: Some(self.backing_path(request).to_string_lossy().into_owned()),
            annotations: BTreeMap::from([
                (ANN_PROVISIONER_IDENTITY.to_string(), self.config.identity.clone()),
                (ANN_PROVISION_ON_NODE.to_string(), self.node_name().to_string()),
            ]),
        }
    }

    /// Remove a volume's backing directory and release its commitment.
    pub async fn delete(&self, volume: &VolumeRecord) -> Result<(), CapacityError> {
        let identity = volume.annotations.get(ANN_PROVISIONER_IDENTITY).ok_or_else(|| {
            CapacityError::MissingAnnotation {
                volume: volume.name.clone(),
                annotation: ANN_PROVISIONER_IDENTITY,
            }
        })?;
        if identity != &self.config.identity {
            return Err(CapacityError::Ignored(format!(
                "identity annotation on {} does not match ours",
                volume.name
            )));
        }
        if volume.node() != Some(self.node_name()) {
            return Err(CapacityError::Ignored(format!(
                "{} was not provisioned on this node",
                volume.name
            )));
        }

        let path = volume
            .host_path
            .as_deref()
            .ok_or_else(|| CapacityError::MissingHostPath(volume.name.clone()))?;

        info!(path, "Removing backing directory");
        self.directories
            .remove_dir(Path::new(path))
            .await
            .map_err(|source| CapacityError::Directory {
                path: PathBuf::from(path),
                source,
            })?;

        self.accountant.record_release(path, volume.capacity).await?;
        Ok(())
    }
}
