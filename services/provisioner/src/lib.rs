//! hostcap Provisioner Library
//!
//! Capacity accounting for hostpath volumes on a single node. Every node
//! keeps one ledger recording how much of its disk is committed to volumes,
//! and every new volume is admitted only if it fits.
//!
//! ## Architecture
//!
//! ```text
//! request ──► AdmissionDecider ──► Provisioner ──► LedgerAccountant ──► LedgerStore
//!               (probe + live            (directory)      (CAS retry)         ▲
//!                volume list)                                                  │
//!                                         Reconciler (every interval) ─────────┘
//! ```
//!
//! There is no in-process lock around the ledger. All writers do
//! read-modify-write against a versioned store and retry on conflict a
//! bounded number of times; the reconciler rebuilds the ledger from the
//! volume listing to repair anything the incremental writes missed.
//!
//! ## Modules
//!
//! - `probe`: filesystem capacity measurement and rounding
//! - `ledger`: the ledger object and its stores (memory, SQLite, API)
//! - `volumes`: the volume listing and per-node scoping
//! - `accountant`: commit/release mutations
//! - `admission`: accept/reject decisions
//! - `bootstrap`: lazy ledger creation
//! - `reconciler`: periodic full rebuild
//! - `provisioner`: provision/delete entry points

pub mod accountant;
pub mod admission;
pub mod bootstrap;
pub mod client;
pub mod config;
pub mod error;
pub mod ledger;
pub mod probe;
pub mod provisioner;
pub mod reconciler;
pub mod volumes;

// Re-export commonly used types
pub use accountant::{LedgerAccountant, LedgerOperation, ModifyLedgerArgs};
pub use admission::{AdmissionDecider, AdmissionDecision, BindingMode, RejectReason, VolumeRequest};
pub use bootstrap::{LedgerBootstrapper, OwnerResolver, StaticOwner};
pub use error::CapacityError;
pub use ledger::{LedgerKey, LedgerStore, NodeLedger, StoreError, VolumeDetail};
pub use probe::{CapacityProbe, FixedProbe, StatfsProbe};
pub use provisioner::{Provisioner, ProvisionRequest};
pub use reconciler::{ReconcileOutcome, Reconciler, ReconcilerConfig};
pub use volumes::{VolumeRecord, VolumeScope, VolumeSource};
