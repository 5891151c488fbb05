//! Active canary registry and the watch loop that maintains it.
//!
//! The registry is written by the watch loop and snapshot-read by the
//! ticker; the lock is held only for key enumeration.

use crate::crd::canary::{validate_canary, Canary};
use futures::{StreamExt, TryStreamExt};
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::ResourceExt;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Identity of one canary, `(namespace, name)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CanaryKey {
    pub name: String,
    pub namespace: String,
}

impl CanaryKey {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    pub fn from_canary(canary: &Canary) -> Option<Self> {
        let namespace = canary.namespace()?;
        Some(Self::new(canary.name_any(), namespace))
    }
}

impl fmt::Display for CanaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.namespace)
    }
}

#[derive(Default)]
pub struct Registry {
    entries: RwLock<HashSet<CanaryKey>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: CanaryKey) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
    }

    pub fn remove(&self, key: &CanaryKey) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Clone the active keys for one tick round.
    pub fn snapshot(&self) -> Vec<CanaryKey> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Watch all Canary resources and keep the registry in step.
///
/// Runs until the watch stream ends. Stream errors are logged; the
/// backoff-wrapped watcher re-establishes the watch by itself. A key that
/// outlives its canary is harmless: its next tick ends at the load step.
pub async fn run_watcher(client: kube::Client, registry: Arc<Registry>) {
    let api: Api<Canary> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    loop {
        match stream.try_next().await {
            Ok(Some(event)) => apply_event(&registry, event),
            Ok(None) => break,
            Err(e) => warn!(error = %e, "canary watch stream error"),
        }
    }
}

fn apply_event(registry: &Registry, event: watcher::Event<Canary>) {
    match event {
        watcher::Event::Apply(canary) | watcher::Event::InitApply(canary) => {
            let Some(key) = CanaryKey::from_canary(&canary) else {
                return;
            };
            if canary.spec.target_ref.kind != "Deployment" {
                debug!(canary = %key, kind = %canary.spec.target_ref.kind, "unsupported target kind, ignoring");
                return;
            }
            if let Err(reason) = validate_canary(&canary) {
                warn!(canary = %key, %reason, "invalid canary spec, excluded from rollout");
                registry.remove(&key);
                return;
            }
            registry.insert(key);
        }
        watcher::Event::Delete(canary) => {
            if let Some(key) = CanaryKey::from_canary(&canary) {
                registry.remove(&key);
            }
        }
        watcher::Event::Init | watcher::Event::InitDone => {}
    }
}
