//! Health records and the snapshot a monitoring pass commits.

use std::collections::BTreeMap;

use serde::Serialize;

/// Result of probing one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthRecord {
    pub device_id: String,
    /// Unix timestamp (ms) of the probe.
    pub last_check: u64,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Every record produced by one monitoring pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSnapshot {
    /// Pass sequence number; 0 means no pass has completed yet.
    pub pass: u64,
    pub started_at: u64,
    pub completed_at: u64,
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub records: BTreeMap<String, HealthRecord>,
}

impl HealthSnapshot {
    pub(crate) fn from_records(pass: u64, started_at: u64, completed_at: u64, records: Vec<HealthRecord>) -> Self {
        let healthy = records.iter().filter(|r| r.healthy).count();
        let total = records.len();

        Self {
            pass,
            started_at,
            completed_at,
            total,
            healthy,
            unhealthy: total - healthy,
            records: records.into_iter().map(|r| (r.device_id.clone(), r)).collect(),
        }
    }
}

/// Monitor statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthStats {
    pub total_devices: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Probes run since start.
    pub total_checks: u64,
    /// Failed probes since start.
    pub total_errors: u64,
    /// Last committed pass.
    pub last_pass: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_completed_at: Option<u64>,
}
