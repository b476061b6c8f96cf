//! Health report types shared by workers and consoles.

use serde::{Deserialize, Serialize};

use crate::envelope::InstanceId;
use crate::version::VersionInfo;

/// Health of one worker as seen by whoever built the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// Answered the `health` verb
    Healthy,
    /// Reachable but answered with an error
    Degraded,
    /// Registered, but the heartbeat is stale or the endpoint is unreachable
    Unhealthy,
    /// Not in the registry
    Unknown,
}

/// Per-worker entry of a health aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub worker: String,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionInfo>,
    /// Why the worker is not healthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    pub fn healthy(worker: impl Into<String>) -> Self {
        Self::with_status(worker, HealthStatus::Healthy)
    }

    pub fn failed(worker: impl Into<String>, status: HealthStatus, error: impl Into<String>) -> Self {
        let mut report = Self::with_status(worker, status);
        report.error = Some(error.into());
        report
    }

    fn with_status(worker: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            worker: worker.into(),
            status,
            pid: None,
            instance_id: None,
            generation: None,
            uptime_sec: None,
            version: None,
            error: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}
