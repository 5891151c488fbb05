//! Fixed-period tick dispatch.
//!
//! Every period the ticker snapshots the registry and spawns one advance
//! task per canary. Ticks for distinct canaries run concurrently; a canary
//! whose previous tick is still in flight is skipped, so ticks for the
//! same key never overlap.

use crate::controller::registry::{CanaryKey, Registry};
use crate::server::ShutdownSignal;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// One tick of one canary. Implemented by the rollout engine.
#[async_trait]
pub trait Advancer: Send + Sync + 'static {
    async fn advance(&self, name: &str, namespace: &str);
}

pub struct Ticker {
    advancer: Arc<dyn Advancer>,
    registry: Arc<Registry>,
    period: Duration,
    in_flight: StdMutex<HashMap<CanaryKey, Arc<Mutex<()>>>>,
}

impl Ticker {
    pub fn new(advancer: Arc<dyn Advancer>, registry: Arc<Registry>, period: Duration) -> Self {
        Self {
            advancer,
            registry,
            period,
            in_flight: StdMutex::new(HashMap::new()),
        }
    }

    /// Run tick rounds until shutdown is signaled.
    pub async fn run(&self, mut shutdown: ShutdownSignal) {
        let mut ticks = tokio::time::interval(self.period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticks.tick() => self.dispatch(),
                _ = shutdown.wait() => {
                    info!("ticker stopped");
                    break;
                }
            }
        }
    }

    /// Launch one advance task per registered canary.
    pub(crate) fn dispatch(&self) {
        let keys = self.registry.snapshot();
        self.prune(&keys);

        for key in keys {
            let advancer = Arc::clone(&self.advancer);
            let guard = self.guard_for(&key);
            tokio::spawn(async move {
                let Ok(_lock) = guard.try_lock() else {
                    debug!(canary = %key, "previous tick still in flight, skipping");
                    return;
                };
                advancer.advance(&key.name, &key.namespace).await;
            });
        }
    }

    fn guard_for(&self, key: &CanaryKey) -> Arc<Mutex<()>> {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(in_flight.entry(key.clone()).or_default())
    }

    /// Drop per-key guards for canaries no longer registered.
    fn prune(&self, live: &[CanaryKey]) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        in_flight.retain(|key, _| live.contains(key));
    }
}
