//! First-tick materialization of the primary workload and the weighted
//! route for a fresh Canary.
//!
//! Both ensure operations are idempotent: get, create on 404, otherwise
//! leave the object alone. A bootstrap failure is a recoverable tick-level
//! error; the next tick retries.

use crate::crd::canary::Canary;
use async_trait::async_trait;
use gateway_api::apis::standard::httproutes::HTTPRoute;
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, PostParams};
use kube::ResourceExt;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("candidate deployment {0} not found")]
    MissingCandidate(String),

    #[error("failed to encode bootstrap object: {0}")]
    Encoding(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

#[async_trait]
pub trait Initializer: Send + Sync {
    async fn ensure_bootstrapped(&self, canary: &Canary) -> Result<(), BootstrapError>;
}

pub struct KubeInitializer {
    client: kube::Client,
}

impl KubeInitializer {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    async fn ensure_primary(&self, canary: &Canary, namespace: &str) -> Result<(), BootstrapError> {
        let target = canary.spec.target_ref.name.as_str();
        let primary_name = canary.primary_name();
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);

        match deployments.get(&primary_name).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                let candidate = deployments.get(target).await.map_err(|e| match e {
                    kube::Error::Api(resp) if resp.code == 404 => {
                        BootstrapError::MissingCandidate(target.to_string())
                    }
                    other => BootstrapError::Kube(other),
                })?;

                let primary = build_primary(&candidate, &primary_name);
                deployments.create(&PostParams::default(), &primary).await?;
                info!(
                    deployment = %primary_name,
                    namespace = %namespace,
                    "created primary deployment"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_route(&self, canary: &Canary, namespace: &str) -> Result<(), BootstrapError> {
        let route_name = canary.name_any();
        let routes: Api<HTTPRoute> = Api::namespaced(self.client.clone(), namespace);

        match routes.get(&route_name).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                let route = build_route(&route_name, namespace, &canary.spec.target_ref.name)?;
                routes.create(&PostParams::default(), &route).await?;
                info!(route = %route_name, namespace = %namespace, "created weighted route");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Initializer for KubeInitializer {
    async fn ensure_bootstrapped(&self, canary: &Canary) -> Result<(), BootstrapError> {
        let namespace = canary.namespace().unwrap_or_default();
        self.ensure_primary(canary, &namespace).await?;
        self.ensure_route(canary, &namespace).await?;
        Ok(())
    }
}

/// Clone the candidate into a primary deployment.
///
/// The app label on the selector and pod template is rewritten to the
/// primary's name so the two deployments never select each other's pods.
fn build_primary(candidate: &Deployment, primary_name: &str) -> Deployment {
    let mut primary = candidate.clone();
    primary.metadata = kube::api::ObjectMeta {
        name: Some(primary_name.to_string()),
        namespace: candidate.metadata.namespace.clone(),
        labels: candidate.metadata.labels.clone(),
        ..Default::default()
    };
    primary.status = None;

    if let Some(spec) = primary.spec.as_mut() {
        if let Some(labels) = spec.selector.match_labels.as_mut() {
            if labels.contains_key("app") {
                labels.insert("app".to_string(), primary_name.to_string());
            }
        }
        if let Some(metadata) = spec.template.metadata.as_mut() {
            if let Some(labels) = metadata.labels.as_mut() {
                if labels.contains_key("app") {
                    labels.insert("app".to_string(), primary_name.to_string());
                }
            }
        }
    }

    primary
}

/// Build the initial weighted route: all traffic to the primary.
fn build_route(name: &str, namespace: &str, target: &str) -> Result<HTTPRoute, BootstrapError> {
    serde_json::from_value(serde_json::json!({
        "metadata": { "name": name, "namespace": namespace },
        "spec": {
            "rules": [{
                "backendRefs": [
                    { "group": "", "kind": "Service", "name": format!("{}-primary", target), "weight": 100 },
                    { "group": "", "kind": "Service", "name": target, "weight": 0 },
                ]
            }]
        }
    }))
    .map_err(|e| BootstrapError::Encoding(e.to_string()))
}

/// Test initializer: the cluster objects are seeded by the test itself.
#[cfg(test)]
pub struct NoopInitializer;

#[cfg(test)]
#[async_trait]
impl Initializer for NoopInitializer {
    async fn ensure_bootstrapped(&self, _canary: &Canary) -> Result<(), BootstrapError> {
        Ok(())
    }
}

/// Test initializer that always fails, like an unreachable cluster API.
#[cfg(test)]
pub struct FailingInitializer;

#[cfg(test)]
#[async_trait]
impl Initializer for FailingInitializer {
    async fn ensure_bootstrapped(&self, _canary: &Canary) -> Result<(), BootstrapError> {
        Err(BootstrapError::Encoding("bootstrap unavailable".to_string()))
    }
}
