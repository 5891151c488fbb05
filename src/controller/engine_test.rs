use std::sync::Arc;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentCondition, DeploymentSpec, DeploymentStatus,
};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use kube::api::ObjectMeta;

use crate::controller::analyzer::Analyzer;
use crate::controller::bootstrap::{FailingInitializer, Initializer, NoopInitializer};
use crate::controller::engine::RolloutEngine;
use crate::controller::events::{MemoryEventRecorder, Severity};
use crate::controller::metrics::{MetricsError, MockMetricsGateway};
use crate::controller::router::{Destination, InMemoryRouteGateway};
use crate::controller::store::{fingerprint, InMemoryCanaryStore};
use crate::controller::workload::InMemoryWorkloadGateway;
use crate::crd::canary::{
    Canary, CanaryAnalysis, CanarySpec, CanaryState, CanaryStatus, MetricCheck, TargetRef,
};

const NAME: &str = "podinfo";
const NS: &str = "test";

struct Harness {
    engine: RolloutEngine,
    workloads: Arc<InMemoryWorkloadGateway>,
    routes: Arc<InMemoryRouteGateway>,
    store: Arc<InMemoryCanaryStore>,
    metrics: Arc<MockMetricsGateway>,
    events: Arc<MemoryEventRecorder>,
}

impl Harness {
    fn new() -> Self {
        Self::with_initializer(Arc::new(NoopInitializer))
    }

    fn with_initializer(initializer: Arc<dyn Initializer>) -> Self {
        let workloads = Arc::new(InMemoryWorkloadGateway::new());
        let routes = Arc::new(InMemoryRouteGateway::new());
        let store = Arc::new(InMemoryCanaryStore::new());
        let metrics = Arc::new(MockMetricsGateway::new());
        let events = Arc::new(MemoryEventRecorder::new());
        let engine = RolloutEngine::new(
            workloads.clone(),
            routes.clone(),
            store.clone(),
            Analyzer::new(metrics.clone()),
            events.clone(),
            initializer,
        );
        Harness {
            engine,
            workloads,
            routes,
            store,
            metrics,
            events,
        }
    }

    async fn tick(&self) {
        self.engine.advance(NAME, NS).await;
    }

    fn weights(&self) -> (i32, i32) {
        self.routes.weights(NS, NAME).expect("route should exist")
    }

    fn state(&self) -> Option<CanaryState> {
        self.store.status(NAME, NS).map(|s| s.state)
    }

    fn failed_checks(&self) -> i32 {
        self.store.status(NAME, NS).map_or(0, |s| s.failed_checks)
    }

    /// Seed the cluster objects for a fresh canary: candidate and primary
    /// deployments plus the weighted route at (100, 0).
    fn seed(&self, step_weight: i32, max_weight: i32, threshold: i32, metrics: Vec<MetricCheck>) {
        self.store
            .insert(canary(step_weight, max_weight, threshold, metrics));
        self.workloads
            .insert(ready_deployment(NAME, "podinfo:1.0", 1));
        self.workloads
            .insert(ready_deployment("podinfo-primary", "podinfo:1.0", 1));
        self.routes.insert(
            NS,
            NAME,
            Destination::new("podinfo-primary", 100),
            Destination::new(NAME, 0),
        );
    }

    /// Seed, initialize, push a new image and let the gate mark the
    /// rollout running. Afterwards: state = running, weights = (100, 0).
    async fn seed_running(
        &self,
        step_weight: i32,
        max_weight: i32,
        threshold: i32,
        metrics: Vec<MetricCheck>,
    ) {
        self.seed(step_weight, max_weight, threshold, metrics);
        self.tick().await;
        assert_eq!(self.state(), Some(CanaryState::Initialized));

        self.workloads
            .insert(ready_deployment(NAME, "podinfo:1.1", 1));
        self.tick().await;
        assert_eq!(self.state(), Some(CanaryState::Running));
        assert_eq!(self.weights(), (100, 0));
        self.events.clear();
    }
}

fn success_check() -> MetricCheck {
    MetricCheck {
        name: "success-rate-counter".to_string(),
        interval: "1m".to_string(),
        threshold: 99.0,
    }
}

fn canary(
    step_weight: i32,
    max_weight: i32,
    threshold: i32,
    metrics: Vec<MetricCheck>,
) -> Canary {
    let mut canary = Canary::new(
        NAME,
        CanarySpec {
            target_ref: TargetRef {
                kind: "Deployment".to_string(),
                name: NAME.to_string(),
            },
            analysis: CanaryAnalysis {
                max_weight,
                step_weight,
                threshold,
                metrics,
            },
        },
    );
    canary.metadata.namespace = Some(NS.to_string());
    canary
}

fn pod_template(image: &str) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: None,
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "app".to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
    }
}

fn ready_deployment(name: &str, image: &str, replicas: i32) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NS.to_string()),
            generation: Some(1),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            template: pod_template(image),
            ..Default::default()
        }),
        status: Some(DeploymentStatus {
            observed_generation: Some(1),
            replicas: Some(replicas),
            updated_replicas: Some(replicas),
            available_replicas: Some(replicas),
            ..Default::default()
        }),
    }
}

#[tokio::test]
async fn fresh_canary_initializes_without_advancing() {
    let h = Harness::new();
    h.seed(20, 100, 2, vec![]);

    h.tick().await;

    let status = h.store.status(NAME, NS).expect("status should be recorded");
    assert_eq!(status.state, CanaryState::Initialized);
    assert_eq!(status.failed_checks, 0);
    assert_eq!(
        status.canary_revision,
        fingerprint(&pod_template("podinfo:1.0")).unwrap()
    );
    assert_eq!(h.weights(), (100, 0));
    assert!(h.events.contains(Severity::Info, "Initialization done"));

    // an unchanged revision keeps the rollout gated
    h.tick().await;
    assert_eq!(h.state(), Some(CanaryState::Initialized));
    assert_eq!(h.weights(), (100, 0));
}

#[tokio::test]
async fn happy_path_walks_to_promotion_and_finalizes() {
    let h = Harness::new();
    h.metrics.set_counter(100.0);
    h.seed_running(20, 100, 2, vec![success_check()]).await;

    for expected in [20, 40, 60, 80, 100] {
        h.tick().await;
        assert_eq!(h.weights(), (100 - expected, expected));
        assert_eq!(h.state(), Some(CanaryState::Running));

        if expected < 100 {
            // the primary template is untouched until the final step
            assert_eq!(
                h.workloads.image_of("podinfo-primary", NS).as_deref(),
                Some("podinfo:1.0")
            );
        }
    }

    // promotion happened on the tick that reached max weight, through the
    // advance path: template copied, traffic still fully on the canary
    assert_eq!(
        h.workloads.image_of("podinfo-primary", NS).as_deref(),
        Some("podinfo:1.1")
    );
    assert_eq!(h.weights(), (0, 100));
    assert_eq!(h.workloads.replicas_of(NAME, NS), Some(1));
    assert!(h.events.contains(Severity::Info, "Starting canary deployment"));
    assert!(h.events.contains(Severity::Info, "Copying"));

    // the next tick finalizes
    h.tick().await;
    assert_eq!(h.weights(), (100, 0));
    assert_eq!(h.workloads.replicas_of(NAME, NS), Some(0));
    assert_eq!(h.state(), Some(CanaryState::PromotionFinished));
}

#[tokio::test]
async fn overshooting_step_clamps_to_max_weight() {
    let h = Harness::new();
    h.seed_running(30, 50, 2, vec![]).await;

    h.tick().await;
    assert_eq!(h.weights(), (70, 30));

    // 30 + 30 would overshoot: both sides clamp around maxWeight
    h.tick().await;
    assert_eq!(h.weights(), (50, 50));
    assert_eq!(
        h.workloads.image_of("podinfo-primary", NS).as_deref(),
        Some("podinfo:1.1")
    );

    h.tick().await;
    assert_eq!(h.weights(), (100, 0));
    assert_eq!(h.state(), Some(CanaryState::PromotionFinished));
}

#[tokio::test]
async fn metric_failures_consume_budget_then_roll_back() {
    let h = Harness::new();
    h.metrics.set_counter(100.0);
    h.seed_running(20, 100, 2, vec![success_check()]).await;

    h.tick().await;
    assert_eq!(h.weights(), (80, 20));

    h.metrics.enqueue_counter(Ok(50.0));
    h.tick().await;
    assert_eq!(h.failed_checks(), 1);
    assert_eq!(h.weights(), (80, 20));
    assert!(h.events.contains(Severity::Warning, "Halt"));

    h.metrics.enqueue_counter(Ok(50.0));
    h.tick().await;
    assert_eq!(h.failed_checks(), 2);
    assert_eq!(h.weights(), (80, 20));

    // the budget gate fires on the tick after the counter reached the
    // threshold, before any further analysis
    h.tick().await;
    assert_eq!(h.weights(), (100, 0));
    assert_eq!(h.workloads.replicas_of(NAME, NS), Some(0));
    assert_eq!(h.state(), Some(CanaryState::PromotionFailed));
    assert!(h.events.contains(Severity::Warning, "Rolling back"));
    assert!(h.events.contains(Severity::Warning, "Canary failed!"));
}

#[tokio::test]
async fn budget_gate_fires_before_the_analyzer() {
    let h = Harness::new();
    h.metrics.set_counter(100.0);
    h.seed_running(20, 100, 1, vec![success_check()]).await;

    h.tick().await;
    assert_eq!(h.weights(), (80, 20));

    h.metrics.enqueue_counter(Ok(10.0));
    h.tick().await;
    assert_eq!(h.failed_checks(), 1);

    // metrics are healthy again, but the exhausted budget wins
    h.tick().await;
    assert_eq!(h.state(), Some(CanaryState::PromotionFailed));
    assert_eq!(h.weights(), (100, 0));
}

#[tokio::test]
async fn transport_errors_do_not_consume_budget() {
    let h = Harness::new();
    h.metrics.set_counter(100.0);
    h.seed_running(20, 100, 2, vec![success_check()]).await;

    h.tick().await;
    assert_eq!(h.weights(), (80, 20));

    for _ in 0..3 {
        h.metrics
            .enqueue_counter(Err(MetricsError::Http("connection refused".to_string())));
        h.tick().await;
        assert_eq!(h.failed_checks(), 0);
        assert_eq!(h.weights(), (80, 20));
    }
    assert!(h.events.contains(Severity::Error, "Metrics server query failed"));

    // once the backend recovers the walk resumes
    h.tick().await;
    assert_eq!(h.weights(), (60, 40));
}

#[tokio::test]
async fn threshold_zero_rolls_back_on_the_first_running_tick() {
    let h = Harness::new();
    h.metrics.set_counter(100.0);
    h.seed_running(20, 100, 0, vec![success_check()]).await;

    h.tick().await;
    assert_eq!(h.state(), Some(CanaryState::PromotionFailed));
    assert_eq!(h.weights(), (100, 0));
    assert_eq!(h.workloads.replicas_of(NAME, NS), Some(0));
}

#[tokio::test]
async fn no_metrics_walks_to_full_weight() {
    let h = Harness::new();
    // no mock responses configured: the analyzer must not hit the gateway
    h.seed_running(20, 100, 2, vec![]).await;

    for expected in [20, 40, 60, 80, 100] {
        h.tick().await;
        assert_eq!(h.weights().1, expected);
    }

    h.tick().await;
    assert_eq!(h.state(), Some(CanaryState::PromotionFinished));
}

#[tokio::test]
async fn terminal_state_ticks_are_idempotent() {
    let h = Harness::new();
    h.seed_running(50, 100, 2, vec![]).await;

    h.tick().await;
    h.tick().await;
    h.tick().await;
    assert_eq!(h.state(), Some(CanaryState::PromotionFinished));

    let settled = h.store.status(NAME, NS).unwrap();
    for _ in 0..3 {
        h.tick().await;
        assert_eq!(h.store.status(NAME, NS).unwrap(), settled);
        assert_eq!(h.weights(), (100, 0));
        assert_eq!(h.workloads.replicas_of(NAME, NS), Some(0));
    }
}

#[tokio::test]
async fn new_revision_after_completion_restarts_the_rollout() {
    let h = Harness::new();
    h.seed(20, 100, 2, vec![]);
    h.workloads.insert(ready_deployment(NAME, "podinfo:1.0", 0));
    h.store.insert({
        let mut c = canary(20, 100, 2, vec![]);
        c.status = Some(CanaryStatus {
            state: CanaryState::PromotionFailed,
            canary_revision: fingerprint(&pod_template("podinfo:1.0")).unwrap(),
            failed_checks: 2,
        });
        c
    });

    // settled: the tick re-records the revision and nothing else
    h.tick().await;
    let status = h.store.status(NAME, NS).unwrap();
    assert_eq!(status.state, CanaryState::PromotionFailed);
    assert_eq!(status.failed_checks, 2);
    assert_eq!(h.weights(), (100, 0));

    // the user pushes a fix
    h.workloads.insert(ready_deployment(NAME, "podinfo:2.0", 0));
    h.tick().await;

    let status = h.store.status(NAME, NS).unwrap();
    assert_eq!(status.state, CanaryState::Running);
    assert_eq!(status.failed_checks, 0);
    assert_eq!(
        status.canary_revision,
        fingerprint(&pod_template("podinfo:2.0")).unwrap()
    );
    assert_eq!(h.workloads.replicas_of(NAME, NS), Some(1));
    assert!(h.events.contains(Severity::Info, "New revision detected"));

    // and the walk starts over on the following tick
    h.tick().await;
    assert_eq!(h.weights(), (80, 20));
}

#[tokio::test]
async fn unhealthy_primary_halts_without_spending_budget() {
    let h = Harness::new();
    h.metrics.set_counter(100.0);
    h.seed_running(20, 100, 2, vec![success_check()]).await;

    h.tick().await;
    assert_eq!(h.weights(), (80, 20));

    let mut stalled = ready_deployment("podinfo-primary", "podinfo:1.0", 1);
    stalled.status.as_mut().unwrap().conditions = Some(vec![DeploymentCondition {
        type_: "Progressing".to_string(),
        reason: Some("ProgressDeadlineExceeded".to_string()),
        status: "False".to_string(),
        ..Default::default()
    }]);
    h.workloads.insert(stalled);

    h.tick().await;
    assert!(h.events.contains(Severity::Warning, "progress deadline"));
    assert_eq!(h.weights(), (80, 20));
    assert_eq!(h.failed_checks(), 0);
    assert_eq!(h.state(), Some(CanaryState::Running));

    // the walk resumes when the primary recovers
    h.workloads
        .insert(ready_deployment("podinfo-primary", "podinfo:1.0", 1));
    h.tick().await;
    assert_eq!(h.weights(), (60, 40));
}

#[tokio::test]
async fn scaled_down_primary_defers_the_tick() {
    let h = Harness::new();
    h.seed_running(20, 100, 2, vec![]).await;

    h.workloads
        .insert(ready_deployment("podinfo-primary", "podinfo:1.0", 0));
    h.tick().await;

    assert_eq!(h.weights(), (100, 0));
    assert_eq!(h.state(), Some(CanaryState::Running));
    assert!(h.events.events().is_empty());
}

#[tokio::test]
async fn missing_candidate_records_an_error() {
    let h = Harness::new();
    h.store.insert(canary(20, 100, 2, vec![]));
    h.workloads
        .insert(ready_deployment("podinfo-primary", "podinfo:1.0", 1));
    h.routes.insert(
        NS,
        NAME,
        Destination::new("podinfo-primary", 100),
        Destination::new(NAME, 0),
    );

    h.tick().await;

    assert!(h.events.contains(Severity::Error, "not found"));
    assert!(h.store.status(NAME, NS).is_none());
}

#[tokio::test]
async fn malformed_route_records_an_error() {
    let h = Harness::new();
    h.seed_running(20, 100, 2, vec![]).await;

    h.routes.insert(
        NS,
        NAME,
        Destination::new("podinfo-primary", 0),
        Destination::new(NAME, 0),
    );
    h.tick().await;

    assert!(h.events.contains(Severity::Error, "missing weighted destinations"));
    assert_eq!(h.state(), Some(CanaryState::Running));
}

#[tokio::test]
async fn bootstrap_failure_is_a_recoverable_warning() {
    let h = Harness::with_initializer(Arc::new(FailingInitializer));
    h.seed(20, 100, 2, vec![]);

    h.tick().await;

    assert!(h.events.contains(Severity::Warning, "bootstrap unavailable"));
    assert!(h.store.status(NAME, NS).is_none());
    assert_eq!(h.weights(), (100, 0));
}

#[tokio::test]
async fn interrupted_rollback_is_re_run_completely() {
    let h = Harness::new();
    h.seed(20, 100, 2, vec![]);
    // a previous tick wrote the route but died before the scale-down
    h.routes.insert(
        NS,
        NAME,
        Destination::new("podinfo-primary", 100),
        Destination::new(NAME, 0),
    );
    h.store.insert({
        let mut c = canary(20, 100, 2, vec![]);
        c.status = Some(CanaryStatus {
            state: CanaryState::Running,
            canary_revision: fingerprint(&pod_template("podinfo:1.0")).unwrap(),
            failed_checks: 2,
        });
        c
    });

    h.tick().await;

    assert_eq!(h.weights(), (100, 0));
    assert_eq!(h.workloads.replicas_of(NAME, NS), Some(0));
    assert_eq!(h.state(), Some(CanaryState::PromotionFailed));
}

#[tokio::test]
async fn status_save_failure_leaves_the_budget_unspent() {
    let h = Harness::new();
    h.metrics.set_counter(100.0);
    h.seed_running(20, 100, 2, vec![success_check()]).await;

    h.tick().await;
    assert_eq!(h.weights(), (80, 20));

    h.metrics.enqueue_counter(Ok(10.0));
    h.store.fail_next_save();
    h.tick().await;
    // the increment was lost with the write; nothing else moved
    assert_eq!(h.failed_checks(), 0);
    assert_eq!(h.weights(), (80, 20));

    h.metrics.enqueue_counter(Ok(10.0));
    h.tick().await;
    assert_eq!(h.failed_checks(), 1);
}
