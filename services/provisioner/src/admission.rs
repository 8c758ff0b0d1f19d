//! Admission decisions for new volume requests.
//!
//! Admission runs before any side effect. It trusts the live volume listing
//! rather than the ledger, so a stale ledger can never admit a request that
//! does not fit. It never reads or writes the ledger store.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use hostcap_quantity::Quantity;
use tracing::{debug, info, warn};

use crate::error::CapacityError;
use crate::probe::CapacityProbe;
use crate::volumes::{VolumeScope, VolumeSource, ANN_PROVISION_ON_NODE, ANN_SELECTED_NODE};

/// When a claim is bound to a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BindingMode {
    /// Bind as soon as the claim is created.
    #[default]
    Immediate,
    /// Bind once a consuming workload is scheduled.
    WaitForFirstConsumer,
}

/// A request for a new volume.
#[derive(Debug, Clone)]
pub struct VolumeRequest {
    pub claim_name: String,
    pub claim_namespace: String,
    pub requested: Quantity,
    pub annotations: BTreeMap<String, String>,
    pub binding_mode: BindingMode,
}

/// Why a request was turned away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// The request targets a different node.
    WrongNode,
    /// The request does not fit in the free capacity.
    InsufficientCapacity { requested: Quantity, free: Quantity },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admit,
    Reject(RejectReason),
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admit)
    }
}

/// Capacity snapshot used for a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacitySnapshot {
    pub total: Quantity,
    pub committed: Quantity,
    pub free: Quantity,
}

/// Returns true if `annotation` is present and names `node_name`.
pub fn is_correct_node(
    annotations: &BTreeMap<String, String>,
    node_name: &str,
    annotation: &str,
) -> bool {
    match annotations.get(annotation) {
        Some(value) if value == node_name => true,
        Some(value) => {
            debug!(annotation, value = %value, node = node_name, "Annotation names another node");
            false
        }
        None => {
            debug!(annotation, "Annotation missing, skipping request");
            false
        }
    }
}

/// Decide whether a request targets `node_name`.
///
/// An explicit provision-on-node annotation wins. Otherwise only late-bound
/// claims are considered, using the scheduler's selected node.
pub fn is_correct_node_by_binding_mode(
    annotations: &BTreeMap<String, String>,
    node_name: &str,
    binding_mode: BindingMode,
) -> bool {
    if annotations.contains_key(ANN_PROVISION_ON_NODE) {
        return is_correct_node(annotations, node_name, ANN_PROVISION_ON_NODE);
    }
    match binding_mode {
        BindingMode::WaitForFirstConsumer => {
            is_correct_node(annotations, node_name, ANN_SELECTED_NODE)
        }
        BindingMode::Immediate => false,
    }
}

/// Accepts or rejects volume requests for one node.
pub struct AdmissionDecider {
    scope: VolumeScope,
    storage_root: PathBuf,
    probe: Arc<dyn CapacityProbe>,
    volumes: Arc<dyn VolumeSource>,
}

impl AdmissionDecider {
    pub fn new(
        scope: VolumeScope,
        storage_root: impl Into<PathBuf>,
        probe: Arc<dyn CapacityProbe>,
        volumes: Arc<dyn VolumeSource>,
    ) -> Self {
        Self {
            scope,
            storage_root: storage_root.into(),
            probe,
            volumes,
        }
    }

    /// Measure total capacity and subtract what live volumes hold.
    pub async fn capacity(&self) -> Result<CapacitySnapshot, CapacityError> {
        let total = self
            .probe
            .total_capacity(&self.storage_root)
            .map_err(|source| CapacityError::Probe {
                path: self.storage_root.clone(),
                source,
            })?;

        let volumes = self
            .volumes
            .list_volumes()
            .await
            .map_err(CapacityError::VolumeList)?;
        let committed = self.scope.committed(&volumes);

        Ok(CapacitySnapshot {
            total,
            committed,
            free: total.saturating_sub(committed),
        })
    }

    /// Decide whether `request` should be provisioned on this node.
    ///
    /// Probe and listing failures are returned as errors; callers must treat
    /// them as rejections.
    pub async fn should_admit(
        &self,
        request: &VolumeRequest,
    ) -> Result<AdmissionDecision, CapacityError> {
        if !is_correct_node_by_binding_mode(
            &request.annotations,
            &self.scope.node_name,
            request.binding_mode,
        ) {
            return Ok(AdmissionDecision::Reject(RejectReason::WrongNode));
        }

        let snapshot = match self.capacity().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    claim = %request.claim_name,
                    namespace = %request.claim_namespace,
                    error = %e,
                    "Unable to determine free capacity, rejecting"
                );
                return Err(e);
            }
        };

        if request.requested > snapshot.free {
            info!(
                claim = %request.claim_name,
                namespace = %request.claim_namespace,
                requested = %request.requested,
                free = %snapshot.free,
                total = %snapshot.total,
                "Request larger than free capacity, rejecting"
            );
            return Ok(AdmissionDecision::Reject(
                RejectReason::InsufficientCapacity {
                    requested: request.requested,
                    free: snapshot.free,
                },
            ));
        }

        debug!(
            claim = %request.claim_name,
            requested = %request.requested,
            free = %snapshot.free,
            "Admitting request"
        );
        Ok(AdmissionDecision::Admit)
    }
}
