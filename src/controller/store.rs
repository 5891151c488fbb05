//! Canary persistence and revision fingerprinting.
//!
//! All durable rollout state lives in the Canary's status subresource:
//! `{state, canaryRevision, failedChecks}`.

use crate::crd::canary::{Canary, CanaryState, CanaryStatus};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("canary not found")]
    NotFound,

    #[error("failed to encode pod template: {0}")]
    Encoding(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// Compute a stable fingerprint for a pod template.
///
/// FNV-1a over the template's canonical JSON encoding; deterministic across
/// processes, unlike the std hasher.
pub fn fingerprint(template: &PodTemplateSpec) -> Result<String, StoreError> {
    let encoded =
        serde_json::to_vec(template).map_err(|e| StoreError::Encoding(e.to_string()))?;

    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in &encoded {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }

    Ok(format!("{:016x}", hash))
}

/// True when the candidate's template no longer matches the recorded
/// revision (including when no revision was recorded yet).
pub fn has_new_revision(canary: &Canary, candidate: &Deployment) -> Result<bool, StoreError> {
    let current = match candidate.spec.as_ref() {
        Some(spec) => fingerprint(&spec.template)?,
        None => return Ok(true),
    };
    Ok(canary
        .status
        .as_ref()
        .map(|s| s.canary_revision.as_str())
        != Some(current.as_str()))
}

#[async_trait]
pub trait CanaryStore: Send + Sync {
    async fn get(&self, name: &str, namespace: &str) -> Result<Canary, StoreError>;

    /// Persist the canary's status subresource.
    async fn save(&self, canary: &Canary) -> Result<(), StoreError>;

    /// Re-record the candidate's template fingerprint under the given
    /// state, preserving the failure counter, and persist.
    async fn set_revision(
        &self,
        canary: &mut Canary,
        candidate: &Deployment,
        state: CanaryState,
    ) -> Result<(), StoreError> {
        let template = candidate
            .spec
            .as_ref()
            .map(|s| s.template.clone())
            .unwrap_or_default();
        let canary_revision = fingerprint(&template)?;
        let failed_checks = canary.status.as_ref().map_or(0, |s| s.failed_checks);
        canary.status = Some(CanaryStatus {
            state,
            canary_revision,
            failed_checks,
        });
        self.save(canary).await
    }
}

pub struct KubeCanaryStore {
    client: kube::Client,
}

impl KubeCanaryStore {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

fn map_api_error(err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => StoreError::NotFound,
        other => StoreError::Kube(other),
    }
}

#[async_trait]
impl CanaryStore for KubeCanaryStore {
    async fn get(&self, name: &str, namespace: &str) -> Result<Canary, StoreError> {
        let api: Api<Canary> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(map_api_error)
    }

    async fn save(&self, canary: &Canary) -> Result<(), StoreError> {
        let namespace = canary.namespace().unwrap_or_default();
        let api: Api<Canary> = Api::namespaced(self.client.clone(), &namespace);
        api.patch_status(
            &canary.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&serde_json::json!({ "status": canary.status })),
        )
        .await
        .map_err(map_api_error)?;
        Ok(())
    }
}

/// In-memory store for engine tests.
#[cfg(test)]
pub struct InMemoryCanaryStore {
    canaries: std::sync::Mutex<std::collections::HashMap<(String, String), Canary>>,
    fail_next_save: std::sync::Mutex<bool>,
}

#[cfg(test)]
impl InMemoryCanaryStore {
    pub fn new() -> Self {
        Self {
            canaries: std::sync::Mutex::new(std::collections::HashMap::new()),
            fail_next_save: std::sync::Mutex::new(false),
        }
    }

    pub fn insert(&self, canary: Canary) {
        let key = (
            canary.namespace().unwrap_or_default(),
            canary.name_any(),
        );
        self.canaries.lock().unwrap().insert(key, canary);
    }

    pub fn status(&self, name: &str, namespace: &str) -> Option<CanaryStatus> {
        self.canaries
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .and_then(|c| c.status.clone())
    }

    /// Make the next save fail like a dropped connection would.
    pub fn fail_next_save(&self) {
        *self.fail_next_save.lock().unwrap() = true;
    }
}

#[cfg(test)]
#[async_trait]
impl CanaryStore for InMemoryCanaryStore {
    async fn get(&self, name: &str, namespace: &str) -> Result<Canary, StoreError> {
        self.canaries
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn save(&self, canary: &Canary) -> Result<(), StoreError> {
        let mut fail = self.fail_next_save.lock().unwrap();
        if *fail {
            *fail = false;
            return Err(StoreError::Encoding("simulated save failure".to_string()));
        }
        drop(fail);

        let key = (
            canary.namespace().unwrap_or_default(),
            canary.name_any(),
        );
        let mut canaries = self.canaries.lock().unwrap();
        let stored = canaries.get_mut(&key).ok_or(StoreError::NotFound)?;
        stored.status = canary.status.clone();
        Ok(())
    }
}
