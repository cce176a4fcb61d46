//! Tracks the version difference between the primary and remote regions.
//!
//! Failing over into a badly lagging region would stall the cluster for as
//! long as the lag, so the recruiter avoids it; this monitor keeps the
//! difference fresh by polling one log on each side.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::gauge;
use tracing::{debug, info};

use helmsman_core::error::{Error, Result};

use crate::controller::Controller;
use crate::dbinfo::{LogRef, RecoveryState};

/// Queue metrics published by a transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuingMetrics {
    /// The log's durable version.
    pub version: i64,
}

/// Source of per-log queuing metrics.
///
/// The real implementation issues an RPC to the log's metrics endpoint;
/// tests and single-process clusters use in-memory stand-ins.
#[async_trait]
pub trait LogMetricsSource: Send + Sync {
    /// Fetches the current queuing metrics of `log`.
    async fn queuing_metrics(&self, log: &LogRef) -> Result<QueuingMetrics>;
}

/// A metrics source that reports every log at version zero.
pub struct NoOpLogMetricsSource;

#[async_trait]
impl LogMetricsSource for NoOpLogMetricsSource {
    async fn queuing_metrics(&self, _log: &LogRef) -> Result<QueuingMetrics> {
        Ok(QueuingMetrics { version: 0 })
    }
}

fn pick_logs(controller: &Controller) -> (Option<LogRef>, Option<LogRef>) {
    let info = controller.server_info.get();
    if info.recovery_state < RecoveryState::AllLogsRecruited {
        return (None, None);
    }
    let mut primary = None;
    let mut remote = None;
    for set in &info.log_system_config.log_sets {
        if set.is_local && !set.is_satellite && primary.is_none() {
            primary = set.tlogs.first().cloned();
        }
        if !set.is_local && remote.is_none() {
            remote = set.tlogs.first().cloned();
        }
    }
    (primary, remote)
}

/// Maintains `datacenter_version_difference`, waking the outstanding-work
/// checker whenever a too-large difference becomes acceptable.
pub async fn update_datacenter_version_difference(controller: Arc<Controller>) -> Result<()> {
    let mut last_log_time = 0.0f64;
    loop {
        {
            let mut state = controller.state.write();
            state.version_difference_updated = false;
        }

        let info = controller.server_info.get();
        let single_region = {
            let state = controller.state.read();
            state.db.config.usable_regions == 1
        };

        if info.recovery_state >= RecoveryState::AcceptingCommits && single_region {
            let notify = {
                let mut state = controller.state.write();
                let was_too_large = !state.version_difference_updated
                    || state.datacenter_version_difference
                        >= controller.knobs.max_version_difference;
                state.version_difference_updated = true;
                state.datacenter_version_difference = 0;
                was_too_large
            };
            if notify {
                controller.notify_outstanding_check();
            }
            controller.server_info.on_change().await;
            continue;
        }

        let (primary, remote) = pick_logs(&controller);
        let (Some(primary), Some(remote)) = (primary, remote) else {
            controller.server_info.on_change().await;
            continue;
        };

        let mut info_rx = controller.server_info.subscribe();
        loop {
            let poll = async {
                let primary_metrics = controller.log_metrics.queuing_metrics(&primary).await;
                let remote_metrics = controller.log_metrics.queuing_metrics(&remote).await;
                (primary_metrics, remote_metrics)
            };
            let (primary_metrics, remote_metrics) = tokio::select! {
                metrics = poll => metrics,
                _ = info_rx.changed() => break,
            };

            let (primary_metrics, remote_metrics) = match (primary_metrics, remote_metrics) {
                (Ok(p), Ok(r)) => (p, r),
                // A log died mid-poll; wait for the next log system.
                (Err(Error::BrokenPromise), _) | (_, Err(Error::BrokenPromise)) => break,
                (Err(err), _) | (_, Err(err)) => return Err(err),
            };

            let difference = primary_metrics.version - remote_metrics.version;
            let became_acceptable = {
                let mut state = controller.state.write();
                let was_too_large = !state.version_difference_updated
                    || state.datacenter_version_difference
                        >= controller.knobs.max_version_difference;
                state.version_difference_updated = true;
                state.datacenter_version_difference = difference;
                was_too_large && difference < controller.knobs.max_version_difference
            };
            gauge!("helmsman_datacenter_version_difference").set(difference as f64);
            if became_acceptable {
                debug!(difference, "Version lag became acceptable");
                controller.notify_outstanding_check();
            }

            let now = controller.clock.now();
            if now - last_log_time > controller.knobs.controller_logging_delay {
                last_log_time = now;
                info!(difference, "Datacenter version difference");
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(
                    controller.knobs.version_lag_metric_interval,
                )) => {}
                _ = info_rx.changed() => break,
            }
        }
    }
}
