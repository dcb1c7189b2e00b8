//! Per-cycle report returned to the scheduler and operators

use crate::domain::types::{Alert, AlertKind, DispatchResult};
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_run_id() -> String {
    Uuid::now_v7().to_string()
}

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// What happened to one fired alert
#[derive(Debug, Clone, Serialize)]
pub struct AlertDispatch {
    pub alert: Alert,
    /// Users selected inside the radius
    pub audience: usize,
    /// `None` when nobody was eligible and no send was made
    pub result: Option<DispatchResult>,
}

/// Outcome of one `run_weather_alert_cycle`
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: String,
    pub started_at_ms: u64,
    pub duration_ms: u64,
    /// Weather came from an expired cache entry
    pub weather_stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_reason: Option<String>,
    pub alerts: Vec<AlertDispatch>,
}

impl CycleReport {
    /// No threshold crossed
    pub fn no_alerts(&self) -> bool {
        self.alerts.is_empty()
    }

    pub fn dispatch_for(&self, kind: AlertKind) -> Option<&AlertDispatch> {
        self.alerts.iter().find(|a| a.alert.kind == kind)
    }

    /// Tokens attempted across every alert
    pub fn total_attempted(&self) -> usize {
        self.alerts.iter().filter_map(|a| a.result.as_ref()).map(|r| r.attempted()).sum()
    }

    pub fn total_succeeded(&self) -> usize {
        self.alerts.iter().filter_map(|a| a.result.as_ref()).map(|r| r.succeeded()).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.alerts.iter().filter_map(|a| a.result.as_ref()).map(|r| r.failed()).sum()
    }
}
