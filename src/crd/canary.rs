use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Canary is a Custom Resource declaring a progressive rollout policy
/// for one target Deployment.
///
/// The candidate workload carries the target's own name; the stable copy
/// managed by the controller is named `<target>-primary`, and the weighted
/// HTTPRoute shares the Canary's name.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "kanari.io",
    version = "v1alpha1",
    kind = "Canary",
    namespaced,
    status = "CanaryStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"FailedChecks", "type":"integer", "jsonPath":".status.failedChecks"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CanarySpec {
    /// Reference to the workload being rolled out
    pub target_ref: TargetRef,

    /// Analysis configuration driving the traffic shift
    pub analysis: CanaryAnalysis,
}

/// Reference to the candidate workload
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct TargetRef {
    /// Workload kind (only "Deployment" is reconciled)
    #[serde(default = "default_target_kind")]
    pub kind: String,

    /// Name of the candidate workload
    pub name: String,
}

fn default_target_kind() -> String {
    "Deployment".to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CanaryAnalysis {
    /// Upper bound of canary traffic share before promotion (1-100)
    #[serde(default = "default_max_weight")]
    pub max_weight: i32,

    /// Traffic weight delta applied per tick (1-100)
    pub step_weight: i32,

    /// Failed metric checks tolerated before rollback
    #[serde(default)]
    pub threshold: i32,

    /// Ordered list of metric checks evaluated between steps
    #[serde(default)]
    pub metrics: Vec<MetricCheck>,
}

fn default_max_weight() -> i32 {
    100
}

impl CanaryAnalysis {
    /// Promotion weight bound, falling back to 100 when the declared value
    /// is outside 1-100.
    pub fn effective_max_weight(&self) -> i32 {
        if (1..=100).contains(&self.max_weight) {
            self.max_weight
        } else {
            100
        }
    }
}

/// A single metric check
///
/// Two names are recognized: `success-rate-counter` (percentage, passes at
/// or above the threshold) and `request-duration-high` (duration, threshold
/// in milliseconds, passes at or below). Anything else is skipped.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
pub struct MetricCheck {
    pub name: String,

    /// Query window, e.g. "30s", "1m"
    pub interval: String,

    pub threshold: f64,
}

/// Rollout lifecycle state
///
/// The absence of a status record is the fifth, initial state.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum CanaryState {
    #[serde(rename = "initialized")]
    Initialized,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "promotion-finished")]
    PromotionFinished,
    #[serde(rename = "promotion-failed")]
    PromotionFailed,
}

/// Status of the Canary, owned by the controller
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CanaryStatus {
    pub state: CanaryState,

    /// Fingerprint of the candidate pod template at the last observed
    /// transition
    #[serde(default)]
    pub canary_revision: String,

    /// Consecutive-or-cumulative failed metric checks
    #[serde(default)]
    pub failed_checks: i32,
}

impl Canary {
    /// Name of the stable workload receiving promoted templates.
    pub fn primary_name(&self) -> String {
        format!("{}-primary", self.spec.target_ref.name)
    }
}

/// Validate runtime constraints the CRD schema cannot enforce.
///
/// Invalid canaries are logged and excluded from the active registry until
/// the user fixes the spec.
pub fn validate_canary(canary: &Canary) -> Result<(), String> {
    if canary.spec.target_ref.name.is_empty() {
        return Err("spec.targetRef.name cannot be empty".to_string());
    }

    let analysis = &canary.spec.analysis;

    if !(1..=100).contains(&analysis.step_weight) {
        return Err(format!(
            "spec.analysis.stepWeight must be 1-100, got {}",
            analysis.step_weight
        ));
    }

    if !(1..=100).contains(&analysis.max_weight) {
        return Err(format!(
            "spec.analysis.maxWeight must be 1-100, got {}",
            analysis.max_weight
        ));
    }

    if analysis.threshold < 0 {
        return Err(format!(
            "spec.analysis.threshold must be >= 0, got {}",
            analysis.threshold
        ));
    }

    for (i, metric) in analysis.metrics.iter().enumerate() {
        if metric.name.is_empty() {
            return Err(format!("spec.analysis.metrics[{}].name cannot be empty", i));
        }
        if parse_duration(&metric.interval).is_none() {
            return Err(format!(
                "spec.analysis.metrics[{}].interval invalid: {}",
                i, metric.interval
            ));
        }
        if metric.threshold < 0.0 {
            return Err(format!(
                "spec.analysis.metrics[{}].threshold must be >= 0, got {}",
                i, metric.threshold
            ));
        }
    }

    Ok(())
}

/// Parse a duration string like "30s", "5m" or "2h".
///
/// Zero durations are rejected, as are values past sane upper bounds
/// (24h expressed in seconds or minutes, one week in hours) to catch typos.
pub fn parse_duration(duration_str: &str) -> Option<Duration> {
    let duration_str = duration_str.trim();
    if duration_str.is_empty() {
        return None;
    }

    let unit = duration_str.chars().last()?;
    let number: u64 = duration_str
        .get(..duration_str.len() - unit.len_utf8())?
        .parse()
        .ok()?;
    if number == 0 {
        return None;
    }

    match unit {
        's' if number <= 86_400 => Some(Duration::from_secs(number)),
        'm' if number <= 1_440 => number.checked_mul(60).map(Duration::from_secs),
        'h' if number <= 168 => number.checked_mul(3_600).map(Duration::from_secs),
        _ => None,
    }
}
