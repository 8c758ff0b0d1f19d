//! Orchestration API client.
//!
//! Provides the production implementations of the core's collaborators:
//! - [`LedgerStore`] over the ledger custom resource
//! - [`VolumeSource`] over the persistent volume listing
//! - [`OwnerResolver`] over the namespace's daemon sets

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hostcap_quantity::Quantity;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, error};

use crate::bootstrap::OwnerResolver;
use crate::ledger::{LedgerKey, LedgerStore, NodeLedger, OwnerReference, StoreError};
use crate::volumes::{VolumeRecord, VolumeSource};

const LEDGER_GROUP_PATH: &str = "/apis/diskmonitor.domain/v1";
const LEDGER_RESOURCE: &str = "diskmonitors";

/// Orchestration API client.
pub struct OrchestratorClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl OrchestratorClient {
    /// Create a client for `base_url`, authenticating with `token` if given.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn ledgers_url(&self, namespace: &str) -> String {
        format!(
            "{}{}/namespaces/{}/{}",
            self.base_url, LEDGER_GROUP_PATH, namespace, LEDGER_RESOURCE
        )
    }

    fn ledger_url(&self, key: &LedgerKey) -> String {
        format!("{}/{}", self.ledgers_url(&key.namespace), key.name)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Turn a non-success response into an API error.
    async fn api_error(response: Response) -> StoreError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %body, "Orchestration API request failed");
        StoreError::Api {
            status: status.as_u16(),
            body,
        }
    }

    /// List every persistent volume in the cluster.
    pub async fn list_persistent_volumes(&self) -> Result<Vec<VolumeRecord>, StoreError> {
        let url = format!("{}/api/v1/persistentvolumes", self.base_url);
        debug!(url = %url, "Listing persistent volumes");

        let response = self.authed(self.client.get(&url)).send().await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let list: ObjectList<PersistentVolume> = response.json().await?;
        Ok(list.items.into_iter().map(VolumeRecord::from).collect())
    }

    /// Find the daemon set in `namespace` whose name appears in `hint`.
    pub async fn find_daemon_set_owner(
        &self,
        namespace: &str,
        hint: &str,
    ) -> Result<Option<OwnerReference>, StoreError> {
        let url = format!("{}/apis/apps/v1/namespaces/{}/daemonsets", self.base_url, namespace);
        let response = self.authed(self.client.get(&url)).send().await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let list: ObjectList<NamedObject> = response.json().await?;
        Ok(list
            .items
            .into_iter()
            .find(|ds| !ds.metadata.name.is_empty() && hint.contains(&ds.metadata.name))
            .map(|ds| OwnerReference {
                api_version: "apps/v1".to_string(),
                kind: "DaemonSet".to_string(),
                name: ds.metadata.name,
                uid: ds.metadata.uid,
                controller: true,
                block_owner_deletion: true,
            }))
    }
}

#[async_trait]
impl LedgerStore for OrchestratorClient {
    async fn get(&self, key: &LedgerKey) -> Result<NodeLedger, StoreError> {
        let response = self.authed(self.client.get(self.ledger_url(key))).send().await?;
        match response.status() {
            s if s.is_success() => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(key.clone())),
            _ => Err(Self::api_error(response).await),
        }
    }

    async fn create(&self, ledger: &NodeLedger) -> Result<NodeLedger, StoreError> {
        let key = ledger.key();
        let mut body = ledger.clone();
        body.metadata.resource_version = None;

        let response = self
            .authed(self.client.post(self.ledgers_url(&key.namespace)))
            .json(&body)
            .send()
            .await?;
        match response.status() {
            s if s.is_success() => Ok(response.json().await?),
            StatusCode::CONFLICT => Err(StoreError::AlreadyExists(key)),
            _ => Err(Self::api_error(response).await),
        }
    }

    async fn update(&self, ledger: &NodeLedger) -> Result<NodeLedger, StoreError> {
        let key = ledger.key();
        let expected = ledger
            .resource_version()
            .ok_or_else(|| StoreError::MissingVersion(key.clone()))?
            .to_string();

        let response = self
            .authed(self.client.put(self.ledger_url(&key)))
            .json(ledger)
            .send()
            .await?;
        match response.status() {
            s if s.is_success() => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(key)),
            StatusCode::CONFLICT => Err(StoreError::Conflict {
                key,
                expected,
                actual: "newer".to_string(),
            }),
            _ => Err(Self::api_error(response).await),
        }
    }

    async fn list(&self, namespace: &str) -> Result<Vec<NodeLedger>, StoreError> {
        let response = self
            .authed(self.client.get(self.ledgers_url(namespace)))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let list: ObjectList<NodeLedger> = response.json().await?;
        Ok(list.items)
    }

    async fn delete(&self, key: &LedgerKey) -> Result<(), StoreError> {
        let response = self
            .authed(self.client.delete(self.ledger_url(key)))
            .send()
            .await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound(key.clone())),
            _ => Err(Self::api_error(response).await),
        }
    }
}

#[async_trait]
impl VolumeSource for OrchestratorClient {
    async fn list_volumes(&self) -> anyhow::Result<Vec<VolumeRecord>> {
        Ok(self.list_persistent_volumes().await?)
    }
}

/// Resolves the ledger owner to the daemon set running the provisioner.
pub struct DaemonSetOwner {
    client: Arc<OrchestratorClient>,
    namespace: String,
    hint: String,
}

impl DaemonSetOwner {
    pub fn new(
        client: Arc<OrchestratorClient>,
        namespace: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            hint: hint.into(),
        }
    }
}

#[async_trait]
impl OwnerResolver for DaemonSetOwner {
    async fn resolve_owner(&self) -> anyhow::Result<Option<OwnerReference>> {
        match self
            .client
            .find_daemon_set_owner(&self.namespace, &self.hint)
            .await?
        {
            Some(owner) => Ok(Some(owner)),
            None => anyhow::bail!(
                "no daemon set in {} matches owner setting '{}'",
                self.namespace,
                self.hint
            ),
        }
    }
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    uid: String,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct NamedObject {
    #[serde(default)]
    metadata: ObjectMeta,
}

#[derive(Debug, Deserialize)]
struct PersistentVolume {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    spec: PersistentVolumeSpec,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistentVolumeSpec {
    #[serde(default)]
    storage_class_name: String,
    #[serde(default)]
    capacity: BTreeMap<String, Quantity>,
    host_path: Option<HostPathSource>,
}

#[derive(Debug, Deserialize)]
struct HostPathSource {
    path: String,
}

impl From<PersistentVolume> for VolumeRecord {
    fn from(pv: PersistentVolume) -> Self {
        Self {
            name: pv.metadata.name,
            storage_class: pv.spec.storage_class_name,
            capacity: pv
                .spec
                .capacity
                .get("storage")
                .copied()
                .unwrap_or_default(),
            host_path: pv.spec.host_path.map(|h| h.path),
            annotations: pv.metadata.annotations,
        }
    }
}
