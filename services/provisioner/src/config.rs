//! Configuration for the provisioner process.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use hostcap_reconcile::DEFAULT_RECONCILE_INTERVAL;

use crate::bootstrap::DEFAULT_MONITOR_ROOT;

/// Default tracked storage class.
pub const DEFAULT_STORAGE_CLASS: &str = "kubevirt-hostpath-provisioner";

const DEFAULT_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Where the ledger is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerBackend {
    /// Custom resource in the orchestration API.
    Api,
    /// Local SQLite database.
    Sqlite,
}

impl LedgerBackend {
    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "api" => Ok(Self::Api),
            "sqlite" => Ok(Self::Sqlite),
            other => bail!("unknown LEDGER_BACKEND '{other}', expected 'api' or 'sqlite'"),
        }
    }
}

/// Provisioner configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Node this process accounts for; also the ledger name.
    pub node_name: String,

    /// Namespace the ledger lives in.
    pub namespace: String,

    /// Name hint for the daemon set owning the ledger.
    pub owner_references: Option<String>,

    /// Directory volumes are created under.
    pub pv_dir: PathBuf,

    /// Prefix backing directories with the claim name.
    pub use_naming_prefix: bool,

    /// Root probed for the ledger's total.
    pub monitor_root: PathBuf,

    /// Tracked storage class.
    pub storage_class: String,

    /// Interval between reconciliation passes.
    pub reconcile_interval: Duration,

    pub ledger_backend: LedgerBackend,

    /// SQLite path when `ledger_backend` is `Sqlite`.
    pub ledger_db_path: PathBuf,

    /// Orchestration API base URL.
    pub orchestrator_url: String,

    /// Bearer token file for the orchestration API.
    pub token_file: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let Some(node_name) = var("NODE_NAME") else {
            bail!("NODE_NAME must be set so the provisioner can identify its node");
        };
        let Some(pv_dir) = var("PV_DIR") else {
            bail!("PV_DIR must be set so the provisioner knows where to place volumes");
        };

        let namespace = var("NAMESPACE").unwrap_or_else(|| "default".to_string());
        let owner_references = var("OWNER_REFERENCES");

        let use_naming_prefix = var("USE_NAMING_PREFIX")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let monitor_root = var("MONITOR_ROOT").unwrap_or_else(|| DEFAULT_MONITOR_ROOT.to_string());
        let storage_class =
            var("STORAGE_CLASS_NAME").unwrap_or_else(|| DEFAULT_STORAGE_CLASS.to_string());

        let reconcile_interval = match var("RECONCILE_INTERVAL_SECS") {
            Some(s) => match s.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => bail!("RECONCILE_INTERVAL_SECS must be a positive integer, got '{s}'"),
            },
            None => DEFAULT_RECONCILE_INTERVAL,
        };

        let ledger_backend = match var("LEDGER_BACKEND") {
            Some(s) => LedgerBackend::parse(&s)?,
            None => LedgerBackend::Api,
        };

        let ledger_db_path =
            var("LEDGER_DB_PATH").unwrap_or_else(|| "/var/lib/hostcap/ledger.db".to_string());
        let orchestrator_url = var("ORCHESTRATOR_URL")
            .unwrap_or_else(|| "https://kubernetes.default.svc".to_string());
        let token_file =
            var("ORCHESTRATOR_TOKEN_FILE").unwrap_or_else(|| DEFAULT_TOKEN_FILE.to_string());
        let log_level = var("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            node_name,
            namespace,
            owner_references,
            pv_dir: PathBuf::from(pv_dir),
            use_naming_prefix,
            monitor_root: PathBuf::from(monitor_root),
            storage_class,
            reconcile_interval,
            ledger_backend,
            ledger_db_path: PathBuf::from(ledger_db_path),
            orchestrator_url,
            token_file: PathBuf::from(token_file),
            log_level,
        })
    }

    /// Read the API token, if the token file exists.
    pub fn read_token(&self) -> Option<String> {
        std::fs::read_to_string(&self.token_file)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}
