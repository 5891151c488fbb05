//! Prometheus-backed metric queries for canary analysis.
//!
//! Production code uses [`PrometheusGateway`] against a real server.
//! Tests use [`MockMetricsGateway`] which returns preconfigured responses.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Per-request deadline for metric queries; a stalled backend must not
/// stall the tick.
const QUERY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone, Debug, Error)]
pub enum MetricsError {
    #[error("metrics HTTP error: {0}")]
    Http(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("failed to parse metrics response: {0}")]
    Parse(String),

    #[error("no data returned for query")]
    NoData,

    #[error("invalid metric value: {0}")]
    InvalidValue(String),
}

#[async_trait]
pub trait MetricsGateway: Send + Sync {
    /// Success-rate style counter for the target workload, as a percentage
    /// in [0, 100], computed over the interval window.
    async fn counter(
        &self,
        target: &str,
        namespace: &str,
        metric: &str,
        interval: &str,
    ) -> Result<f64, MetricsError>;

    /// High-percentile request duration for the target workload over the
    /// interval window.
    async fn histogram(
        &self,
        target: &str,
        namespace: &str,
        metric: &str,
        interval: &str,
    ) -> Result<Duration, MetricsError>;
}

/// Build the PromQL query for the request success rate, in percent.
fn success_rate_query(target: &str, namespace: &str, interval: &str) -> String {
    format!(
        r#"sum(rate(http_requests_total{{kubernetes_namespace="{ns}",app="{app}",status!~"5.."}}[{window}])) / sum(rate(http_requests_total{{kubernetes_namespace="{ns}",app="{app}"}}[{window}])) * 100"#,
        ns = namespace,
        app = target,
        window = interval
    )
}

/// Build the PromQL query for the P99 request duration, in seconds.
fn request_duration_query(target: &str, namespace: &str, interval: &str) -> String {
    format!(
        r#"histogram_quantile(0.99, sum(rate(http_request_duration_seconds_bucket{{kubernetes_namespace="{ns}",app="{app}"}}[{window}])) by (le))"#,
        ns = namespace,
        app = target,
        window = interval
    )
}

/// Prometheus instant query response format
#[derive(Debug, Deserialize)]
struct PrometheusResponse {
    status: String,
    data: PrometheusData,
}

#[derive(Debug, Deserialize)]
struct PrometheusData {
    result: Vec<PrometheusResult>,
}

#[derive(Debug, Deserialize)]
struct PrometheusResult {
    value: (i64, String), // [timestamp, value_as_string]
}

fn parse_instant_query(body: &str) -> Result<f64, MetricsError> {
    let response: PrometheusResponse = serde_json::from_str(body)
        .map_err(|e| MetricsError::Parse(format!("invalid JSON: {}", e)))?;

    if response.status != "success" {
        return Err(MetricsError::Http(format!(
            "query failed with status: {}",
            response.status
        )));
    }

    let result = response.data.result.first().ok_or(MetricsError::NoData)?;
    let value = result
        .value
        .1
        .parse::<f64>()
        .map_err(|e| MetricsError::Parse(format!("invalid value: {}", e)))?;

    if value.is_nan() {
        return Err(MetricsError::InvalidValue("NaN".to_string()));
    }
    if value.is_infinite() {
        return Err(MetricsError::InvalidValue("infinity".to_string()));
    }

    Ok(value)
}

/// Production gateway querying a Prometheus-compatible HTTP API.
#[derive(Clone)]
pub struct PrometheusGateway {
    address: String,
}

impl PrometheusGateway {
    pub fn new(address: String) -> Self {
        Self { address }
    }

    async fn query_instant(&self, query: &str) -> Result<f64, MetricsError> {
        let url = format!("{}/api/v1/query", self.address);
        let client = reqwest::Client::new();

        let response = client
            .get(&url)
            .query(&[("query", query)])
            .timeout(QUERY_TIMEOUT)
            .send()
            .await
            .map_err(|e| MetricsError::Http(format!("HTTP request failed: {}", e)))?;

        let body = response
            .text()
            .await
            .map_err(|e| MetricsError::Http(format!("failed to read response: {}", e)))?;

        parse_instant_query(&body)
    }
}

#[async_trait]
impl MetricsGateway for PrometheusGateway {
    async fn counter(
        &self,
        target: &str,
        namespace: &str,
        metric: &str,
        interval: &str,
    ) -> Result<f64, MetricsError> {
        let query = match metric {
            "success-rate-counter" => success_rate_query(target, namespace, interval),
            other => {
                return Err(MetricsError::InvalidQuery(format!(
                    "unknown counter metric: {}",
                    other
                )))
            }
        };
        self.query_instant(&query).await
    }

    async fn histogram(
        &self,
        target: &str,
        namespace: &str,
        metric: &str,
        interval: &str,
    ) -> Result<Duration, MetricsError> {
        let query = match metric {
            "request-duration-high" => request_duration_query(target, namespace, interval),
            other => {
                return Err(MetricsError::InvalidQuery(format!(
                    "unknown histogram metric: {}",
                    other
                )))
            }
        };
        let seconds = self.query_instant(&query).await?;
        if seconds < 0.0 {
            return Err(MetricsError::InvalidValue(format!(
                "negative duration: {}",
                seconds
            )));
        }
        Ok(Duration::from_secs_f64(seconds))
    }
}

/// Mock gateway for tests.
///
/// Queued responses are consumed FIFO; when a queue is empty the configured
/// default applies. With neither, the query fails like an unreachable
/// backend would.
#[cfg(test)]
pub struct MockMetricsGateway {
    counter_default: std::sync::Mutex<Option<f64>>,
    counter_queue: std::sync::Mutex<Vec<Result<f64, MetricsError>>>,
    histogram_default: std::sync::Mutex<Option<Duration>>,
    histogram_queue: std::sync::Mutex<Vec<Result<Duration, MetricsError>>>,
}

#[cfg(test)]
impl MockMetricsGateway {
    pub fn new() -> Self {
        Self {
            counter_default: std::sync::Mutex::new(None),
            counter_queue: std::sync::Mutex::new(Vec::new()),
            histogram_default: std::sync::Mutex::new(None),
            histogram_queue: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn set_counter(&self, value: f64) {
        *self.counter_default.lock().unwrap() = Some(value);
    }

    pub fn set_histogram(&self, value: Duration) {
        *self.histogram_default.lock().unwrap() = Some(value);
    }

    pub fn enqueue_counter(&self, result: Result<f64, MetricsError>) {
        self.counter_queue.lock().unwrap().push(result);
    }

    pub fn enqueue_histogram(&self, result: Result<Duration, MetricsError>) {
        self.histogram_queue.lock().unwrap().push(result);
    }
}

#[cfg(test)]
#[async_trait]
impl MetricsGateway for MockMetricsGateway {
    async fn counter(
        &self,
        _target: &str,
        _namespace: &str,
        _metric: &str,
        _interval: &str,
    ) -> Result<f64, MetricsError> {
        let mut queue = self.counter_queue.lock().unwrap();
        if !queue.is_empty() {
            return queue.remove(0);
        }
        self.counter_default
            .lock()
            .unwrap()
            .ok_or_else(|| MetricsError::Http("no mock response set".to_string()))
    }

    async fn histogram(
        &self,
        _target: &str,
        _namespace: &str,
        _metric: &str,
        _interval: &str,
    ) -> Result<Duration, MetricsError> {
        let mut queue = self.histogram_queue.lock().unwrap();
        if !queue.is_empty() {
            return queue.remove(0);
        }
        self.histogram_default
            .lock()
            .unwrap()
            .ok_or_else(|| MetricsError::Http("no mock response set".to_string()))
    }
}
