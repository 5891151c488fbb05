//! Metric analysis for a canary under traffic.

use crate::controller::metrics::{MetricsError, MetricsGateway};
use crate::crd::canary::Canary;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one analysis pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    /// The first check that missed its threshold, with a reason suitable
    /// for a "halt advancement" event.
    Fail(String),
}

pub struct Analyzer {
    metrics: Arc<dyn MetricsGateway>,
}

impl Analyzer {
    pub fn new(metrics: Arc<dyn MetricsGateway>) -> Self {
        Self { metrics }
    }

    /// Evaluate the canary's checks in declared order.
    ///
    /// A threshold miss returns `Verdict::Fail` and charges the failure
    /// budget. A query transport error is returned as `Err` instead: the
    /// tick ends and is retried, without spending budget on an
    /// infrastructure hiccup. Unrecognized check names are skipped, and an
    /// empty list trivially passes.
    pub async fn check(&self, canary: &Canary) -> Result<Verdict, MetricsError> {
        let target = canary.spec.target_ref.name.as_str();
        let namespace = canary.namespace().unwrap_or_default();

        for metric in &canary.spec.analysis.metrics {
            match metric.name.as_str() {
                "success-rate-counter" => {
                    let observed = self
                        .metrics
                        .counter(target, &namespace, &metric.name, &metric.interval)
                        .await?;
                    if observed < metric.threshold {
                        return Ok(Verdict::Fail(format!(
                            "success rate {:.2}% < {}%",
                            observed, metric.threshold
                        )));
                    }
                }
                "request-duration-high" => {
                    let observed = self
                        .metrics
                        .histogram(target, &namespace, &metric.name, &metric.interval)
                        .await?;
                    // threshold is declared in milliseconds
                    let limit = Duration::from_secs_f64(metric.threshold.max(0.0) / 1000.0);
                    if observed > limit {
                        return Ok(Verdict::Fail(format!(
                            "request duration {:?} > {:?}",
                            observed, limit
                        )));
                    }
                }
                _ => {}
            }
        }

        Ok(Verdict::Pass)
    }
}
