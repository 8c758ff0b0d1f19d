//! SQLite-backed ledger store.
//!
//! Used when the node runs without an orchestration API. Each ledger is one
//! row holding its JSON body and an integer version; updates are conditional
//! on that version so concurrent writers still see conflicts.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::store::{LedgerStore, StoreError};
use super::{LedgerKey, NodeLedger};

/// SQLite ledger store.
#[derive(Clone)]
pub struct SqliteLedgerStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedgerStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::with_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ledgers (
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                resource_version INTEGER NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (namespace, name)
            );
            "#,
        )?;

        debug!("Ledger store schema initialized");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&guard)
        })
        .await?
    }
}

fn decode(version: i64, body: &str) -> Result<NodeLedger, StoreError> {
    let mut ledger: NodeLedger = serde_json::from_str(body)?;
    ledger.metadata.resource_version = Some(version.to_string());
    Ok(ledger)
}

fn encode(ledger: &NodeLedger) -> Result<String, StoreError> {
    let mut body = ledger.clone();
    body.metadata.resource_version = None;
    Ok(serde_json::to_string(&body)?)
}

fn current_version(conn: &Connection, key: &LedgerKey) -> Result<Option<i64>, StoreError> {
    conn.query_row(
        "SELECT resource_version FROM ledgers WHERE namespace = ?1 AND name = ?2",
        params![key.namespace, key.name],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn get(&self, key: &LedgerKey) -> Result<NodeLedger, StoreError> {
        let key = key.clone();
        self.call(move |conn| {
            let row: Option<(i64, String)> = conn
                .query_row(
                    "SELECT resource_version, body FROM ledgers WHERE namespace = ?1 AND name = ?2",
                    params![key.namespace, key.name],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match row {
                Some((version, body)) => decode(version, &body),
                None => Err(StoreError::NotFound(key)),
            }
        })
        .await
    }

    async fn create(&self, ledger: &NodeLedger) -> Result<NodeLedger, StoreError> {
        let mut stored = ledger.clone();
        stored.metadata.creation_timestamp.get_or_insert_with(Utc::now);
        let key = stored.key();
        let body = encode(&stored)?;

        self.call(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO ledgers (namespace, name, resource_version, body) VALUES (?1, ?2, 1, ?3)",
                params![key.namespace, key.name, body],
            )?;
            if inserted == 0 {
                return Err(StoreError::AlreadyExists(key));
            }

            stored.metadata.resource_version = Some("1".to_string());
            Ok(stored)
        })
        .await
    }

    async fn update(&self, ledger: &NodeLedger) -> Result<NodeLedger, StoreError> {
        let key = ledger.key();
        let expected = ledger
            .resource_version()
            .ok_or_else(|| StoreError::MissingVersion(key.clone()))?
            .to_string();
        let mut stored = ledger.clone();
        let body = encode(&stored)?;

        self.call(move |conn| {
            // A version this store never issued can only be stale.
            let updated = match expected.parse::<i64>() {
                Ok(version) => conn.execute(
                    "UPDATE ledgers SET body = ?1, resource_version = resource_version + 1 \
                     WHERE namespace = ?2 AND name = ?3 AND resource_version = ?4",
                    params![body, key.namespace, key.name, version],
                )?,
                Err(_) => 0,
            };

            let actual = current_version(conn, &key)?;
            match actual {
                None => Err(StoreError::NotFound(key)),
                Some(version) if updated == 1 => {
                    stored.metadata.resource_version = Some(version.to_string());
                    Ok(stored)
                }
                Some(version) => Err(StoreError::Conflict {
                    key,
                    expected,
                    actual: version.to_string(),
                }),
            }
        })
        .await
    }

    async fn list(&self, namespace: &str) -> Result<Vec<NodeLedger>, StoreError> {
        let namespace = namespace.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT resource_version, body FROM ledgers WHERE namespace = ?1 ORDER BY name",
            )?;
            let rows = stmt
                .query_map(params![namespace], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.iter()
                .map(|(version, body)| decode(*version, body))
                .collect()
        })
        .await
    }

    async fn delete(&self, key: &LedgerKey) -> Result<(), StoreError> {
        let key = key.clone();
        self.call(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM ledgers WHERE namespace = ?1 AND name = ?2",
                params![key.namespace, key.name],
            )?;
            if deleted == 0 {
                return Err(StoreError::NotFound(key));
            }
            Ok(())
        })
        .await
    }
}
