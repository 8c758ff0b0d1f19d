//! Ledger store interface and in-memory implementation.
//!
//! Every backend provides the same contract:
//! - `get` fails with [`StoreError::NotFound`] for unknown ledgers
//! - `create` fails with [`StoreError::AlreadyExists`] if the key is taken
//! - `update` requires the resource version last read and fails with
//!   [`StoreError::Conflict`] if the stored version has moved on
//! - every successful write assigns a fresh resource version

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use hostcap_reconcile::Conflicting;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use super::{LedgerKey, NodeLedger};

/// Errors from ledger store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ledger not found: {0}")]
    NotFound(LedgerKey),

    #[error("ledger already exists: {0}")]
    AlreadyExists(LedgerKey),

    #[error("write conflict on {key}: expected version {expected}, found {actual}")]
    Conflict {
        key: LedgerKey,
        expected: String,
        actual: String,
    },

    #[error("ledger {0} has no resource version to update against")]
    MissingVersion(LedgerKey),

    #[error("orchestration API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }
}

impl Conflicting for StoreError {
    fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Durable, versioned storage for node ledgers.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Fetch a ledger.
    async fn get(&self, key: &LedgerKey) -> Result<NodeLedger, StoreError>;

    /// Create a ledger. Any resource version on the input is ignored.
    async fn create(&self, ledger: &NodeLedger) -> Result<NodeLedger, StoreError>;

    /// Replace a ledger if its stored version still matches the input's.
    async fn update(&self, ledger: &NodeLedger) -> Result<NodeLedger, StoreError>;

    /// List all ledgers in a namespace.
    async fn list(&self, namespace: &str) -> Result<Vec<NodeLedger>, StoreError>;

    /// Delete a ledger.
    async fn delete(&self, key: &LedgerKey) -> Result<(), StoreError>;
}

/// In-memory ledger store for tests and development.
pub struct InMemoryLedgerStore {
    ledgers: RwLock<HashMap<LedgerKey, NodeLedger>>,

    /// Source of resource versions.
    next_version: AtomicU64,

    /// Number of upcoming updates to reject with a conflict.
    forced_conflicts: AtomicU32,

    /// Successful create/update count.
    writes: AtomicU64,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            ledgers: RwLock::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            forced_conflicts: AtomicU32::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Make the next `n` updates fail with a conflict, as if another writer
    /// got there first.
    pub fn inject_conflicts(&self, n: u32) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn next_version(&self) -> String {
        self.next_version.fetch_add(1, Ordering::SeqCst).to_string()
    }

    fn take_forced_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn get(&self, key: &LedgerKey) -> Result<NodeLedger, StoreError> {
        let ledgers = self.ledgers.read().await;
        ledgers
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn create(&self, ledger: &NodeLedger) -> Result<NodeLedger, StoreError> {
        let key = ledger.key();
        let mut ledgers = self.ledgers.write().await;
        if ledgers.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }

        let mut stored = ledger.clone();
        stored.metadata.resource_version = Some(self.next_version());
        stored.metadata.creation_timestamp.get_or_insert_with(Utc::now);
        ledgers.insert(key.clone(), stored.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);

        debug!(ledger = %key, "Created ledger in memory");
        Ok(stored)
    }

    async fn update(&self, ledger: &NodeLedger) -> Result<NodeLedger, StoreError> {
        let key = ledger.key();
        let expected = ledger
            .resource_version()
            .ok_or_else(|| StoreError::MissingVersion(key.clone()))?
            .to_string();

        let mut ledgers = self.ledgers.write().await;
        let current = ledgers
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        let actual = current.resource_version().unwrap_or_default().to_string();

        if self.take_forced_conflict() {
            return Err(StoreError::Conflict {
                key,
                expected,
                actual: "injected".to_string(),
            });
        }
        if actual != expected {
            return Err(StoreError::Conflict {
                key,
                expected,
                actual,
            });
        }

        let mut stored = ledger.clone();
        stored.metadata.resource_version = Some(self.next_version());
        *current = stored.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn list(&self, namespace: &str) -> Result<Vec<NodeLedger>, StoreError> {
        let ledgers = self.ledgers.read().await;
        let mut items: Vec<_> = ledgers
            .values()
            .filter(|l| l.metadata.namespace == namespace)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(items)
    }

    async fn delete(&self, key: &LedgerKey) -> Result<(), StoreError> {
        let mut ledgers = self.ledgers.write().await;
        ledgers
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }
}
