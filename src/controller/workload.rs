//! Deployment access for the rollout engine.
//!
//! Production code uses [`KubeWorkloadGateway`] against the cluster API.
//! Tests use the in-memory gateway to drive the engine without a cluster.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentStatus};
use kube::api::{Api, Patch, PatchParams, PostParams};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("workload not found")]
    NotFound,

    #[error("write conflict, retried next tick")]
    Conflict,

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

#[async_trait]
pub trait WorkloadGateway: Send + Sync {
    async fn get(&self, name: &str, namespace: &str) -> Result<Deployment, WorkloadError>;

    /// Replace the stored workload. Optimistic concurrency applies: a stale
    /// resourceVersion surfaces as [`WorkloadError::Conflict`].
    async fn update(&self, workload: &Deployment) -> Result<(), WorkloadError>;

    async fn scale(&self, name: &str, namespace: &str, replicas: i32)
        -> Result<(), WorkloadError>;
}

/// Derive readiness from a Deployment's status.
///
/// Returns a human-readable reason alongside the verdict; the reason is
/// surfaced in "halt advancement" events.
pub fn readiness(workload: &Deployment) -> (String, bool) {
    let name = workload.metadata.name.as_deref().unwrap_or_default();
    let generation = workload.metadata.generation.unwrap_or(0);
    let status = workload.status.clone().unwrap_or_default();

    if status.observed_generation.unwrap_or(0) < generation {
        return (
            "observed generation lags desired generation".to_string(),
            false,
        );
    }

    if let Some(cond) = condition(&status, "Progressing") {
        if cond.reason.as_deref() == Some("ProgressDeadlineExceeded") {
            return (
                format!("deployment {} exceeded its progress deadline", name),
                false,
            );
        }
    }

    let desired = workload.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
    let total = status.replicas.unwrap_or(0);
    let updated = status.updated_replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);

    if updated < desired {
        return (
            format!("rollout in progress, {} of {} updated", updated, desired),
            false,
        );
    }
    if total > updated {
        return (
            format!("{} old replicas pending termination", total - updated),
            false,
        );
    }
    if available < updated {
        return (
            format!(
                "waiting for availability, {} of {} available",
                available, updated
            ),
            false,
        );
    }

    ("ready".to_string(), true)
}

fn condition<'a>(status: &'a DeploymentStatus, type_: &str) -> Option<&'a DeploymentCondition> {
    status
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == type_)
}

pub struct KubeWorkloadGateway {
    client: kube::Client,
}

impl KubeWorkloadGateway {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn map_api_error(err: kube::Error) -> WorkloadError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => WorkloadError::NotFound,
        kube::Error::Api(resp) if resp.code == 409 => WorkloadError::Conflict,
        other => WorkloadError::Kube(other),
    }
}

#[async_trait]
impl WorkloadGateway for KubeWorkloadGateway {
    async fn get(&self, name: &str, namespace: &str) -> Result<Deployment, WorkloadError> {
        self.api(namespace).get(name).await.map_err(map_api_error)
    }

    async fn update(&self, workload: &Deployment) -> Result<(), WorkloadError> {
        let namespace = workload.metadata.namespace.as_deref().unwrap_or_default();
        let name = workload.metadata.name.as_deref().unwrap_or_default();
        self.api(namespace)
            .replace(name, &PostParams::default(), workload)
            .await
            .map_err(map_api_error)?;
        Ok(())
    }

    async fn scale(
        &self,
        name: &str,
        namespace: &str,
        replicas: i32,
    ) -> Result<(), WorkloadError> {
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        self.api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(map_api_error)?;
        Ok(())
    }
}

/// In-memory gateway for engine tests.
#[cfg(test)]
pub struct InMemoryWorkloadGateway {
    deployments: std::sync::Mutex<std::collections::HashMap<(String, String), Deployment>>,
}

#[cfg(test)]
impl InMemoryWorkloadGateway {
    pub fn new() -> Self {
        Self {
            deployments: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn key(deployment: &Deployment) -> (String, String) {
        (
            deployment
                .metadata
                .namespace
                .clone()
                .unwrap_or_default(),
            deployment.metadata.name.clone().unwrap_or_default(),
        )
    }

    /// Insert or replace a deployment, as the user or cluster would.
    pub fn insert(&self, deployment: Deployment) {
        let key = Self::key(&deployment);
        self.deployments.lock().unwrap().insert(key, deployment);
    }

    pub fn deployment(&self, name: &str, namespace: &str) -> Option<Deployment> {
        self.deployments
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn replicas_of(&self, name: &str, namespace: &str) -> Option<i32> {
        self.deployment(name, namespace)
            .and_then(|d| d.spec.as_ref().and_then(|s| s.replicas))
    }

    pub fn image_of(&self, name: &str, namespace: &str) -> Option<String> {
        self.deployment(name, namespace).and_then(|d| {
            d.spec
                .as_ref()
                .and_then(|s| s.template.spec.as_ref())
                .and_then(|p| p.containers.first())
                .and_then(|c| c.image.clone())
        })
    }
}

#[cfg(test)]
#[async_trait]
impl WorkloadGateway for InMemoryWorkloadGateway {
    async fn get(&self, name: &str, namespace: &str) -> Result<Deployment, WorkloadError> {
        self.deployment(name, namespace)
            .ok_or(WorkloadError::NotFound)
    }

    async fn update(&self, workload: &Deployment) -> Result<(), WorkloadError> {
        let key = Self::key(workload);
        let mut deployments = self.deployments.lock().unwrap();
        if !deployments.contains_key(&key) {
            return Err(WorkloadError::NotFound);
        }
        deployments.insert(key, workload.clone());
        Ok(())
    }

    async fn scale(
        &self,
        name: &str,
        namespace: &str,
        replicas: i32,
    ) -> Result<(), WorkloadError> {
        let mut deployments = self.deployments.lock().unwrap();
        let deployment = deployments
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or(WorkloadError::NotFound)?;
        if let Some(spec) = deployment.spec.as_mut() {
            spec.replicas = Some(replicas);
        }
        Ok(())
    }
}
