use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Up,
    Degraded,
    Down,
    Unknown,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Up => "up",
            Status::Degraded => "degraded",
            Status::Down => "down",
            Status::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single probe. Produced once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOutcome {
    pub monitor_id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub response_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: Uuid,
    pub monitor_id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub response_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub checked_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryRecord {
    pub fn from_outcome(outcome: &CheckOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            monitor_id: outcome.monitor_id.clone(),
            status: outcome.status,
            status_code: outcome.status_code,
            response_time_ms: outcome.response_time_ms,
            error_message: outcome.error_message.clone(),
            checked_at: outcome.checked_at,
            recorded_at: outcome.checked_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatus {
    pub id: String,
    pub label: String,
    pub category: String,
    pub url: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryStatus {
    pub id: String,
    pub label: String,
    pub status: Status,
    pub up: usize,
    pub degraded: usize,
    pub down: usize,
    pub unknown: usize,
    pub total: usize,
}

/// Full snapshot: the unit stored in the snapshot cache and served to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub overall_status: Status,
    pub categories: Vec<CategoryStatus>,
    pub monitors: Vec<MonitorStatus>,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl StatusResponse {
    /// Placeholder served when no snapshot can be produced at all.
    pub fn unavailable(now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            overall_status: Status::Unknown,
            categories: Vec::new(),
            monitors: Vec::new(),
            timestamp: now,
            expires_at: now + ttl.max(Duration::seconds(1)),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryStats {
    pub total_checks: usize,
    pub up_count: usize,
    pub degraded_count: usize,
    pub down_count: usize,
    pub uptime: f64,
    pub avg_response_time: u64,
    pub min_response_time: u64,
    pub max_response_time: u64,
}

/// One page of a monitor's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorHistory {
    pub monitor_id: String,
    pub label: String,
    pub records: Vec<HistoryRecord>,
    pub total_records: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_record: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newest_record: Option<DateTime<Utc>>,
    pub has_more: bool,
    pub stats: HistoryStats,
}
