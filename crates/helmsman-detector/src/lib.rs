//! Failure detection for the helmsman cluster controller.
//!
//! This crate provides:
//! - The failure-detection server: a versioned status vector with
//!   delta-compressed replies and an adaptive declaration timeout
//! - Per-peer connection-health metrics published by workers

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod health;
pub mod server;
pub mod status;

pub use health::{FailureMetrics, HealthMonitor, LatencyCounts};
pub use server::{FailureDetector, FailureMonitoringReply, FailureMonitoringRequest};
pub use status::{FailureStatus, SystemFailureStatus};
