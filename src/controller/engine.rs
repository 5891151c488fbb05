//! The per-canary rollout state machine.
//!
//! One tick = one [`RolloutEngine::advance`] call. Ticks are independent
//! and idempotent with respect to state already reached: every step
//! re-reads the cluster, and every failure ends the tick so the next one
//! can retry. Only a metric verdict below threshold spends the failure
//! budget; infrastructure errors never do.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use tracing::{debug, info, warn};

use crate::controller::analyzer::{Analyzer, Verdict};
use crate::controller::bootstrap::Initializer;
use crate::controller::events::EventRecorder;
use crate::controller::router::{Destination, RouteError, RouteGateway};
use crate::controller::store::{fingerprint, has_new_revision, CanaryStore, StoreError};
use crate::controller::ticker::Advancer;
use crate::controller::workload::{readiness, WorkloadError, WorkloadGateway};
use crate::crd::canary::{Canary, CanaryState, CanaryStatus};

pub struct RolloutEngine {
    workloads: Arc<dyn WorkloadGateway>,
    routes: Arc<dyn RouteGateway>,
    store: Arc<dyn CanaryStore>,
    analyzer: Analyzer,
    recorder: Arc<dyn EventRecorder>,
    initializer: Arc<dyn Initializer>,
}

impl RolloutEngine {
    pub fn new(
        workloads: Arc<dyn WorkloadGateway>,
        routes: Arc<dyn RouteGateway>,
        store: Arc<dyn CanaryStore>,
        analyzer: Analyzer,
        recorder: Arc<dyn EventRecorder>,
        initializer: Arc<dyn Initializer>,
    ) -> Self {
        Self {
            workloads,
            routes,
            store,
            analyzer,
            recorder,
            initializer,
        }
    }

    /// Advance one canary by one tick.
    ///
    /// Never fails: every error records an event or a log line and ends
    /// the tick, to be retried on the next one.
    pub async fn advance(&self, name: &str, namespace: &str) {
        // gate stage: the canary must still exist
        let mut canary = match self.store.get(name, namespace).await {
            Ok(canary) => canary,
            Err(StoreError::NotFound) => {
                debug!(canary = %name, namespace = %namespace, "canary gone, skipping tick");
                return;
            }
            Err(e) => {
                warn!(canary = %name, namespace = %namespace, error = %e, "canary read failed");
                return;
            }
        };

        if let Err(e) = self.initializer.ensure_bootstrapped(&canary).await {
            self.recorder.warning(&canary, format!("{}", e)).await;
            return;
        }

        let max_weight = canary.spec.analysis.effective_max_weight();
        let target = canary.spec.target_ref.name.clone();
        let primary_name = canary.primary_name();

        // gate stage: candidate deployment exists and is healthy
        let Some(candidate) = self.ready_workload(&canary, &target, namespace).await else {
            return;
        };

        // gate stage: primary deployment exists, is healthy and carries
        // replicas; a scaled-down primary defers the tick
        let Some(primary) = self.ready_workload(&canary, &primary_name, namespace).await else {
            return;
        };
        if primary
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0)
            == 0
        {
            debug!(
                canary = %name,
                namespace = %namespace,
                "primary has no replicas, deferring tick"
            );
            return;
        }

        // gate stage: the route carries weighted destinations for both
        // services
        let (primary_route, canary_route) =
            match self.routes.get(namespace, name, &target).await {
                Ok(pair) => pair,
                Err(RouteError::NotFound) => {
                    self.recorder
                        .error(&canary, format!("HTTPRoute {}.{} not found", name, namespace))
                        .await;
                    return;
                }
                Err(e @ RouteError::Malformed { .. }) => {
                    self.recorder
                        .error(&canary, format!("HTTPRoute {}.{} {}", name, namespace, e))
                        .await;
                    return;
                }
                Err(e) => {
                    self.recorder
                        .error(
                            &canary,
                            format!("HTTPRoute {}.{} read failed: {}", name, namespace, e),
                        )
                        .await;
                    return;
                }
            };

        // gate stage: should the rollout start or continue?
        if !self.rollout_gate(&mut canary, &candidate, namespace).await {
            return;
        }

        // gate stage: failure budget exhausted?
        let failed_checks = canary.status.as_ref().map_or(0, |s| s.failed_checks);
        if failed_checks >= canary.spec.analysis.threshold {
            self.recorder
                .warning(
                    &canary,
                    format!(
                        "Rolling back {}.{} failed checks threshold reached {}",
                        name, namespace, failed_checks
                    ),
                )
                .await;
            self.rollback(&mut canary, namespace).await;
            return;
        }

        // gate stage: metric checks, skipped while no traffic reaches the
        // canary yet
        if canary_route.weight == 0 {
            self.recorder
                .info(
                    &canary,
                    format!("Starting canary deployment for {}.{}", name, namespace),
                )
                .await;
        } else {
            match self.analyzer.check(&canary).await {
                Ok(Verdict::Pass) => {}
                Ok(Verdict::Fail(reason)) => {
                    self.recorder
                        .warning(
                            &canary,
                            format!("Halt {}.{} advancement {}", name, namespace, reason),
                        )
                        .await;
                    if let Some(status) = canary.status.as_mut() {
                        status.failed_checks += 1;
                    }
                    if let Err(e) = self.store.save(&canary).await {
                        warn!(canary = %name, namespace = %namespace, error = %e, "status update failed");
                    }
                    return;
                }
                Err(e) => {
                    self.recorder
                        .error(&canary, format!("Metrics server query failed: {}", e))
                        .await;
                    return;
                }
            }
        }

        if canary_route.weight < max_weight {
            self.advance_weights(
                &mut canary,
                namespace,
                &candidate,
                &primary,
                primary_route,
                canary_route,
                max_weight,
            )
            .await;
        } else {
            self.finalize(&mut canary, namespace).await;
        }
    }

    /// Fetch a deployment and halt the tick when it is missing or unready.
    async fn ready_workload(
        &self,
        canary: &Canary,
        name: &str,
        namespace: &str,
    ) -> Option<Deployment> {
        let workload = match self.workloads.get(name, namespace).await {
            Ok(workload) => workload,
            Err(WorkloadError::NotFound) => {
                self.recorder
                    .error(canary, format!("Deployment {}.{} not found", name, namespace))
                    .await;
                return None;
            }
            Err(e) => {
                self.recorder
                    .error(
                        canary,
                        format!("Deployment {}.{} read failed: {}", name, namespace, e),
                    )
                    .await;
                return None;
            }
        };

        let (message, ready) = readiness(&workload);
        if !ready {
            self.recorder
                .warning(
                    canary,
                    format!("Halt {}.{} advancement {}", name, namespace, message),
                )
                .await;
            return None;
        }

        Some(workload)
    }

    /// Decide whether the rollout may proceed this tick.
    ///
    /// Returns true only for an established running rollout. Everything
    /// else (first observation, settled promotions, a revision waiting to
    /// start) mutates status as needed and ends the tick.
    async fn rollout_gate(
        &self,
        canary: &mut Canary,
        candidate: &Deployment,
        namespace: &str,
    ) -> bool {
        let name = canary.spec.target_ref.name.clone();

        let Some(status) = canary.status.clone() else {
            // first observation: record the revision, do not start yet
            let template = match candidate.spec.as_ref() {
                Some(spec) => &spec.template,
                None => return false,
            };
            let canary_revision = match fingerprint(template) {
                Ok(revision) => revision,
                Err(e) => {
                    warn!(canary = %name, namespace = %namespace, error = %e, "fingerprint failed");
                    return false;
                }
            };
            canary.status = Some(CanaryStatus {
                state: CanaryState::Initialized,
                canary_revision,
                failed_checks: 0,
            });
            if let Err(e) = self.store.save(canary).await {
                warn!(canary = %name, namespace = %namespace, error = %e, "status update failed");
                return false;
            }
            self.recorder
                .info(canary, format!("Initialization done {}.{}", name, namespace))
                .await;
            return false;
        };

        let fresh_revision = match has_new_revision(canary, candidate) {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(canary = %name, namespace = %namespace, error = %e, "fingerprint failed");
                return false;
            }
        };

        match status.state {
            CanaryState::Running => true,
            CanaryState::Initialized => {
                if fresh_revision {
                    self.start_new_rollout(canary, candidate, namespace).await;
                }
                false
            }
            CanaryState::PromotionFinished | CanaryState::PromotionFailed => {
                if fresh_revision {
                    self.start_new_rollout(canary, candidate, namespace).await;
                } else {
                    // keep the recorded revision in step with the live
                    // candidate so the next edit is seen as a fresh one
                    if let Err(e) = self
                        .store
                        .set_revision(canary, candidate, status.state)
                        .await
                    {
                        warn!(canary = %name, namespace = %namespace, error = %e, "status update failed");
                    }
                    info!(
                        canary = %name,
                        namespace = %namespace,
                        state = ?status.state,
                        "promotion settled, waiting for a new revision"
                    );
                }
                false
            }
        }
    }

    /// Bring a freshly edited candidate up and mark the rollout running.
    ///
    /// The scale-up happens before the state transition: a tick dying in
    /// between leaves the canary initialized and the next tick repeats
    /// both steps.
    async fn start_new_rollout(
        &self,
        canary: &mut Canary,
        candidate: &Deployment,
        namespace: &str,
    ) {
        let target = canary.spec.target_ref.name.clone();

        self.recorder
            .info(canary, format!("New revision detected {}.{}", target, namespace))
            .await;

        if let Err(e) = self.workloads.scale(&target, namespace, 1).await {
            self.recorder
                .error(
                    canary,
                    format!("Scaling up {}.{} failed: {}", target, namespace, e),
                )
                .await;
            return;
        }

        let template = candidate
            .spec
            .as_ref()
            .map(|s| s.template.clone())
            .unwrap_or_default();
        let canary_revision = match fingerprint(&template) {
            Ok(revision) => revision,
            Err(e) => {
                warn!(canary = %target, namespace = %namespace, error = %e, "fingerprint failed");
                return;
            }
        };
        canary.status = Some(CanaryStatus {
            state: CanaryState::Running,
            canary_revision,
            failed_checks: 0,
        });
        if let Err(e) = self.store.save(canary).await {
            warn!(canary = %target, namespace = %namespace, error = %e, "status update failed");
            return;
        }

        self.recorder
            .info(canary, format!("Scaling up {}.{}", target, namespace))
            .await;
    }

    /// Shift one step of traffic to the canary, promoting the template on
    /// the step that reaches the max weight.
    #[allow(clippy::too_many_arguments)]
    async fn advance_weights(
        &self,
        canary: &mut Canary,
        namespace: &str,
        candidate: &Deployment,
        primary: &Deployment,
        mut primary_route: Destination,
        mut canary_route: Destination,
        max_weight: i32,
    ) {
        let name = canary.spec.target_ref.name.clone();
        let route_name = canary
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| name.clone());
        let primary_name = canary.primary_name();
        let step = canary.spec.analysis.step_weight;

        // the pair keeps summing to 100 even on the clamped final step
        canary_route.weight = (canary_route.weight + step).min(max_weight);
        primary_route.weight = 100 - canary_route.weight;

        if let Err(e) = self
            .routes
            .set_weights(namespace, &route_name, &primary_route, &canary_route)
            .await
        {
            self.recorder
                .error(
                    canary,
                    format!("HTTPRoute {}.{} update failed: {}", route_name, namespace, e),
                )
                .await;
            return;
        }

        self.recorder
            .info(
                canary,
                format!(
                    "Advance {}.{} canary weight {}",
                    route_name, namespace, canary_route.weight
                ),
            )
            .await;

        // promotion stage: the tick that reaches max weight copies the
        // candidate's pod spec into the primary
        if canary_route.weight == max_weight {
            self.recorder
                .info(
                    canary,
                    format!(
                        "Copying {}.{} template spec to {}.{}",
                        name, namespace, primary_name, namespace
                    ),
                )
                .await;

            let mut promoted = primary.clone();
            if let (Some(spec), Some(candidate_spec)) =
                (promoted.spec.as_mut(), candidate.spec.as_ref())
            {
                spec.template.spec = candidate_spec.template.spec.clone();
            }
            if let Err(e) = self.workloads.update(&promoted).await {
                self.recorder
                    .error(
                        canary,
                        format!(
                            "Updating template spec {}.{} failed: {}",
                            primary_name, namespace, e
                        ),
                    )
                    .await;
            }
        }
    }

    /// Return all traffic to the promoted primary and retire the canary.
    ///
    /// The route write strictly precedes the scale-down, and the terminal
    /// state is only recorded once both succeeded; a tick dying in between
    /// re-runs the whole sequence.
    async fn finalize(&self, canary: &mut Canary, namespace: &str) {
        let target = canary.spec.target_ref.name.clone();
        let route_name = canary
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| target.clone());

        if !self
            .route_all_to_primary(canary, namespace, &route_name)
            .await
        {
            return;
        }

        self.recorder
            .info(canary, format!("Scaling down {}.{}", target, namespace))
            .await;
        if let Err(e) = self.workloads.scale(&target, namespace, 0).await {
            self.recorder
                .error(
                    canary,
                    format!("Scaling down {}.{} failed: {}", target, namespace, e),
                )
                .await;
            return;
        }

        self.record_terminal_state(canary, namespace, CanaryState::PromotionFinished)
            .await;
    }

    /// Abort the rollout: restore the primary's traffic, then retire the
    /// canary. Same ordering guarantees as [`Self::finalize`].
    async fn rollback(&self, canary: &mut Canary, namespace: &str) {
        let target = canary.spec.target_ref.name.clone();
        let route_name = canary
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| target.clone());

        if !self
            .route_all_to_primary(canary, namespace, &route_name)
            .await
        {
            return;
        }

        self.recorder
            .warning(
                canary,
                format!("Canary failed! Scaling down {}.{}", target, namespace),
            )
            .await;
        if let Err(e) = self.workloads.scale(&target, namespace, 0).await {
            self.recorder
                .error(
                    canary,
                    format!("Scaling down {}.{} failed: {}", target, namespace, e),
                )
                .await;
            return;
        }

        self.record_terminal_state(canary, namespace, CanaryState::PromotionFailed)
            .await;
    }

    async fn route_all_to_primary(
        &self,
        canary: &Canary,
        namespace: &str,
        route_name: &str,
    ) -> bool {
        let target = canary.spec.target_ref.name.as_str();
        let primary = Destination::new(canary.primary_name(), 100);
        let retired = Destination::new(target, 0);
        if let Err(e) = self
            .routes
            .set_weights(namespace, route_name, &primary, &retired)
            .await
        {
            self.recorder
                .error(
                    canary,
                    format!("HTTPRoute {}.{} update failed: {}", route_name, namespace, e),
                )
                .await;
            return false;
        }
        true
    }

    async fn record_terminal_state(
        &self,
        canary: &mut Canary,
        namespace: &str,
        state: CanaryState,
    ) {
        let name = canary.spec.target_ref.name.clone();
        if let Some(status) = canary.status.as_mut() {
            status.state = state;
        }
        if let Err(e) = self.store.save(canary).await {
            warn!(canary = %name, namespace = %namespace, error = %e, "status update failed");
        }
    }
}

#[async_trait]
impl Advancer for RolloutEngine {
    async fn advance(&self, name: &str, namespace: &str) {
        RolloutEngine::advance(self, name, namespace).await;
    }
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod tests;
