//! Kubernetes Event emission bound to a Canary.
//!
//! Publishing is best effort: a failed publish is logged and never fails
//! the tick.

use crate::crd::canary::Canary;
use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Resource;
use tracing::warn;

#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn info(&self, canary: &Canary, message: String);
    async fn warning(&self, canary: &Canary, message: String);
    async fn error(&self, canary: &Canary, message: String);
}

pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl KubeEventRecorder {
    pub fn new(client: kube::Client) -> Self {
        let reporter = Reporter {
            controller: "kanari".to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }

    async fn publish(&self, canary: &Canary, type_: EventType, reason: &str, message: String) {
        let reference = canary.object_ref(&());
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message),
            action: "Advance".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &reference).await {
            warn!(error = %e, "failed to publish event");
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn info(&self, canary: &Canary, message: String) {
        self.publish(canary, EventType::Normal, "Synced", message).await;
    }

    async fn warning(&self, canary: &Canary, message: String) {
        self.publish(canary, EventType::Warning, "Halted", message).await;
    }

    async fn error(&self, canary: &Canary, message: String) {
        self.publish(canary, EventType::Warning, "Failed", message).await;
    }
}

#[cfg(test)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Test recorder keeping events in memory for assertions.
#[cfg(test)]
pub struct MemoryEventRecorder {
    events: std::sync::Mutex<Vec<(Severity, String)>>,
}

#[cfg(test)]
impl MemoryEventRecorder {
    pub fn new() -> Self {
        Self {
            events: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<(Severity, String)> {
        self.events.lock().unwrap().clone()
    }

    pub fn contains(&self, severity: Severity, needle: &str) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|(s, m)| *s == severity && m.contains(needle))
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

#[cfg(test)]
#[async_trait]
impl EventRecorder for MemoryEventRecorder {
    async fn info(&self, _canary: &Canary, message: String) {
        self.events.lock().unwrap().push((Severity::Info, message));
    }

    async fn warning(&self, _canary: &Canary, message: String) {
        self.events
            .lock()
            .unwrap()
            .push((Severity::Warning, message));
    }

    async fn error(&self, _canary: &Canary, message: String) {
        self.events.lock().unwrap().push((Severity::Error, message));
    }
}
