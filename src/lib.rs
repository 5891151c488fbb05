//! KANARI progressive delivery controller.
//!
//! For every [`crd::canary::Canary`] resource the controller shifts traffic
//! step by step from a stable "primary" Deployment to the user-managed
//! candidate Deployment, watching success-rate and latency metrics between
//! steps. A healthy candidate is promoted by copying its pod template into
//! the primary; an unhealthy one is rolled back by restoring all traffic to
//! the primary and scaling the candidate to zero.

pub mod controller;
pub mod crd;
pub mod server;
