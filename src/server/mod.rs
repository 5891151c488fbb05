//! HTTP probes and process lifecycle for the controller.

mod health;
pub mod shutdown;

pub use health::{run_health_server, ReadinessState};
pub use shutdown::{shutdown_channel, wait_for_signal, ShutdownHandle, ShutdownSignal};
