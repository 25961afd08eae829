//! Metrics persistence trait and the persisted record.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::AgentStatus;

/// The subset of agent state that survives a reload.
///
/// Live fields (status, call state, queue count) are deliberately absent:
/// they are always reset on load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedMetrics {
    /// Calls with a non-zero duration handled on `day`.
    pub calls_handled_today: u32,
    /// Total talk time on `day`, in seconds.
    pub total_handle_time_secs: u64,
    /// Accumulated time per status, in milliseconds.
    pub time_in_status_ms: BTreeMap<AgentStatus, u64>,
    /// Whether the agent opted into automatic call delivery.
    pub auto_call_enabled: bool,
    /// Day the daily counters belong to.
    pub day: Option<NaiveDate>,
}

impl PersistedMetrics {
    /// Accumulated time in `status`.
    #[must_use]
    pub fn time_in(&self, status: AgentStatus) -> Duration {
        Duration::from_millis(self.time_in_status_ms.get(&status).copied().unwrap_or(0))
    }

    /// Reset daily counters if they belong to a day other than `today`.
    ///
    /// Returns `true` if anything was reset.
    pub fn roll_over(&mut self, today: NaiveDate) -> bool {
        if self.day == Some(today) {
            return false;
        }
        let stale = self.day.is_some();
        if stale {
            tracing::info!(previous = ?self.day, %today, "Resetting daily call metrics");
            self.calls_handled_today = 0;
            self.total_handle_time_secs = 0;
            self.time_in_status_ms.clear();
        }
        self.day = Some(today);
        stale
    }
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for metrics storage backends.
#[async_trait]
pub trait MetricsStorage: Send + Sync {
    /// Load the last saved metrics, or `None` if nothing was ever saved.
    async fn load(&self) -> Result<Option<PersistedMetrics>, StorageError>;

    /// Replace the saved metrics.
    async fn save(&self, metrics: &PersistedMetrics) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[test]
    fn test_roll_over_same_day_keeps_counters() {
        let mut metrics = PersistedMetrics {
            calls_handled_today: 4,
            day: Some(day(2)),
            ..PersistedMetrics::default()
        };
        assert!(!metrics.roll_over(day(2)));
        assert_eq!(metrics.calls_handled_today, 4);
    }

    #[test]
    fn test_roll_over_new_day_resets_counters() {
        let mut metrics = PersistedMetrics {
            calls_handled_today: 4,
            total_handle_time_secs: 600,
            auto_call_enabled: true,
            day: Some(day(2)),
            ..PersistedMetrics::default()
        };
        metrics.time_in_status_ms.insert(AgentStatus::Available, 1000);

        assert!(metrics.roll_over(day(3)));
        assert_eq!(metrics.calls_handled_today, 0);
        assert_eq!(metrics.total_handle_time_secs, 0);
        assert!(metrics.time_in_status_ms.is_empty());
        assert!(metrics.auto_call_enabled);
        assert_eq!(metrics.day, Some(day(3)));
    }

    #[test]
    fn test_json_shape() {
        let mut metrics = PersistedMetrics::default();
        metrics.time_in_status_ms.insert(AgentStatus::OnCall, 2500);
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["timeInStatusMs"]["on-call"], 2500);

        let back: PersistedMetrics = serde_json::from_value(json).unwrap();
        assert_eq!(back.time_in(AgentStatus::OnCall), Duration::from_millis(2500));
    }
}
