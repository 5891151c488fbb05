//! Weighted HTTPRoute access for the rollout engine.
//!
//! Each Canary owns one Gateway API HTTPRoute of the same name. The engine
//! manages a single rule with exactly two weighted backends: the primary
//! service (`<target>-primary`) and the canary service (`<target>`).

use async_trait::async_trait;
use gateway_api::apis::standard::httproutes::HTTPRoute;
use kube::api::{Api, Patch, PatchParams};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route not found")]
    NotFound,

    #[error("missing weighted destinations {primary} and {canary}")]
    Malformed { primary: String, canary: String },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// One weighted backend of the managed rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    /// Backing service name
    pub host: String,

    /// Traffic share in [0, 100]
    pub weight: i32,
}

impl Destination {
    pub fn new(host: impl Into<String>, weight: i32) -> Self {
        Self {
            host: host.into(),
            weight,
        }
    }
}

#[async_trait]
pub trait RouteGateway: Send + Sync {
    /// Read the (primary, canary) destinations for `target` from the route.
    async fn get(
        &self,
        namespace: &str,
        name: &str,
        target: &str,
    ) -> Result<(Destination, Destination), RouteError>;

    /// Rewrite the route so it carries exactly the managed rule
    /// `[primary, canary]`. The engine assumes exclusive ownership: any
    /// other rules are dropped.
    async fn set_weights(
        &self,
        namespace: &str,
        name: &str,
        primary: &Destination,
        canary: &Destination,
    ) -> Result<(), RouteError>;
}

/// Locate the primary and canary destinations inside a route.
///
/// Every rule's backendRefs are scanned; when a service shows up more than
/// once, the last occurrence wins. A route referencing neither service
/// extracts two zero weights and is reported as malformed.
pub fn extract_destinations(
    route: &HTTPRoute,
    target: &str,
) -> Result<(Destination, Destination), RouteError> {
    let primary_host = format!("{}-primary", target);
    let mut primary = Destination::new(primary_host.clone(), 0);
    let mut canary = Destination::new(target, 0);

    for rule in route.spec.rules.iter().flatten() {
        for backend in rule.backend_refs.iter().flatten() {
            if backend.name == primary_host {
                primary.weight = backend.weight.unwrap_or(0);
            }
            if backend.name == target {
                canary.weight = backend.weight.unwrap_or(0);
            }
        }
    }

    if primary.weight == 0 && canary.weight == 0 {
        return Err(RouteError::Malformed {
            primary: primary_host,
            canary: target.to_string(),
        });
    }

    Ok((primary, canary))
}

pub struct KubeRouteGateway {
    client: kube::Client,
}

impl KubeRouteGateway {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<HTTPRoute> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn map_api_error(err: kube::Error) -> RouteError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => RouteError::NotFound,
        other => RouteError::Kube(other),
    }
}

#[async_trait]
impl RouteGateway for KubeRouteGateway {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
        target: &str,
    ) -> Result<(Destination, Destination), RouteError> {
        let route = self.api(namespace).get(name).await.map_err(map_api_error)?;
        extract_destinations(&route, target)
    }

    async fn set_weights(
        &self,
        namespace: &str,
        name: &str,
        primary: &Destination,
        canary: &Destination,
    ) -> Result<(), RouteError> {
        // Merge patching spec.rules replaces the whole array, which is the
        // point: the managed rule is the only rule the route may carry.
        let patch = serde_json::json!({
            "spec": {
                "rules": [{
                    "backendRefs": [
                        { "group": "", "kind": "Service", "name": primary.host, "weight": primary.weight },
                        { "group": "", "kind": "Service", "name": canary.host, "weight": canary.weight },
                    ]
                }]
            }
        });
        self.api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(map_api_error)?;
        Ok(())
    }
}

/// In-memory gateway for engine tests, keyed like the cluster API.
#[cfg(test)]
pub struct InMemoryRouteGateway {
    routes: std::sync::Mutex<
        std::collections::HashMap<(String, String), (Destination, Destination)>,
    >,
}

#[cfg(test)]
impl InMemoryRouteGateway {
    pub fn new() -> Self {
        Self {
            routes: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn insert(&self, namespace: &str, name: &str, primary: Destination, canary: Destination) {
        self.routes
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), (primary, canary));
    }

    pub fn weights(&self, namespace: &str, name: &str) -> Option<(i32, i32)> {
        self.routes
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .map(|(p, c)| (p.weight, c.weight))
    }
}

#[cfg(test)]
#[async_trait]
impl RouteGateway for InMemoryRouteGateway {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
        target: &str,
    ) -> Result<(Destination, Destination), RouteError> {
        let (primary, canary) = self
            .routes
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or(RouteError::NotFound)?;
        if primary.weight == 0 && canary.weight == 0 {
            return Err(RouteError::Malformed {
                primary: format!("{}-primary", target),
                canary: target.to_string(),
            });
        }
        Ok((primary, canary))
    }

    async fn set_weights(
        &self,
        namespace: &str,
        name: &str,
        primary: &Destination,
        canary: &Destination,
    ) -> Result<(), RouteError> {
        self.insert(namespace, name, primary.clone(), canary.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(rules: serde_json::Value) -> HTTPRoute {
        serde_json::from_value(serde_json::json!({
            "metadata": { "name": "podinfo", "namespace": "test" },
            "spec": { "rules": rules }
        }))
        .unwrap()
    }

    fn backend(name: &str, weight: i32) -> serde_json::Value {
        serde_json::json!({ "name": name, "weight": weight })
    }

    #[test]
    fn extracts_both_destinations() {
        let route = route(serde_json::json!([
            { "backendRefs": [backend("podinfo-primary", 80), backend("podinfo", 20)] }
        ]));

        let (primary, canary) = extract_destinations(&route, "podinfo").unwrap();
        assert_eq!(primary, Destination::new("podinfo-primary", 80));
        assert_eq!(canary, Destination::new("podinfo", 20));
    }

    #[test]
    fn last_matching_rule_wins() {
        let route = route(serde_json::json!([
            { "backendRefs": [backend("podinfo-primary", 50), backend("podinfo", 50)] },
            { "backendRefs": [backend("podinfo-primary", 90), backend("podinfo", 10)] }
        ]));

        let (primary, canary) = extract_destinations(&route, "podinfo").unwrap();
        assert_eq!(primary.weight, 90);
        assert_eq!(canary.weight, 10);
    }

    #[test]
    fn unrelated_backends_are_malformed() {
        let route = route(serde_json::json!([
            { "backendRefs": [backend("somebody-else", 100)] }
        ]));

        let err = extract_destinations(&route, "podinfo").unwrap_err();
        assert!(matches!(err, RouteError::Malformed { .. }));
    }

    #[test]
    fn empty_rules_are_malformed() {
        let route = route(serde_json::json!([]));
        assert!(extract_destinations(&route, "podinfo").is_err());
    }

    #[tokio::test]
    async fn in_memory_gateway_round_trips_weights() {
        let gateway = InMemoryRouteGateway::new();
        gateway.insert(
            "test",
            "podinfo",
            Destination::new("podinfo-primary", 100),
            Destination::new("podinfo", 0),
        );

        gateway
            .set_weights(
                "test",
                "podinfo",
                &Destination::new("podinfo-primary", 80),
                &Destination::new("podinfo", 20),
            )
            .await
            .unwrap();

        assert_eq!(gateway.weights("test", "podinfo"), Some((80, 20)));
    }
}
