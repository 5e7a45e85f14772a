use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ComputeMinutes,
    StorageGbHours,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ComputeMinutes => "compute_minutes",
            EventType::StorageGbHours => "storage_gb_hours",
        }
    }

    /// Length of one metering slot in seconds.
    pub fn slot_seconds(&self) -> i64 {
        match self {
            EventType::ComputeMinutes => 60,
            EventType::StorageGbHours => 60 * 60,
        }
    }

    /// Start of the slot containing `now`, as unix seconds.
    pub fn slot_start(&self, now: DateTime<Utc>) -> i64 {
        let ts = now.timestamp();
        ts - ts.rem_euclid(self.slot_seconds())
    }

    fn describe(&self) -> &'static str {
        match self {
            EventType::ComputeMinutes => "compute minutes",
            EventType::StorageGbHours => "storage GB-hours",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub id: String,
    pub user_id: String,
    pub workspace_id: String,
    pub event_type: EventType,
    pub quantity: i64,
    pub billing_period_start: DateTime<Utc>,
    pub billing_period_end: DateTime<Utc>,
    pub idempotency_key: String,
    pub sync_status: SyncStatus,
    pub sync_attempts: i64,
    pub sync_error: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Key that makes one resource count at most once per slot.
pub fn idempotency_key(
    event_type: EventType,
    resource_id: &str,
    period_start: i64,
    slot_start: i64,
) -> String {
    format!(
        "{}:{}:{}:{}",
        event_type.as_str(),
        resource_id,
        period_start,
        slot_start
    )
}

/// Outcome of one sampling run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeteringReport {
    pub recorded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub total: usize,
}

/// Outcome of one processor sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
    pub total: usize,
}

#[derive(sqlx::FromRow)]
pub(crate) struct UsageEventRow {
    id: String,
    user_id: String,
    workspace_id: String,
    event_type: EventType,
    quantity: i64,
    billing_period_start: i64,
    billing_period_end: i64,
    idempotency_key: String,
    sync_status: SyncStatus,
    sync_attempts: i64,
    sync_error: Option<String>,
    synced_at: Option<i64>,
    created_at: i64,
}

impl From<UsageEventRow> for UsageEvent {
    fn from(row: UsageEventRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            workspace_id: row.workspace_id,
            event_type: row.event_type,
            quantity: row.quantity,
            billing_period_start: from_timestamp(row.billing_period_start),
            billing_period_end: from_timestamp(row.billing_period_end),
            idempotency_key: row.idempotency_key,
            sync_status: row.sync_status,
            sync_attempts: row.sync_attempts,
            sync_error: row.sync_error,
            synced_at: row.synced_at.map(from_timestamp),
            created_at: from_timestamp(row.created_at),
        }
    }
}

pub(crate) fn from_timestamp(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn slots_align_to_minute_and_hour() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 10, 17, 42).unwrap();

        let minute = EventType::ComputeMinutes.slot_start(now);
        let hour = EventType::StorageGbHours.slot_start(now);

        assert_eq!(minute, Utc.with_ymd_and_hms(2025, 3, 1, 10, 17, 0).unwrap().timestamp());
        assert_eq!(hour, Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap().timestamp());
    }

    #[test]
    fn idempotency_key_format() {
        let key = idempotency_key(EventType::StorageGbHours, "vol-1", 100, 3600);
        assert_eq!(key, "storage_gb_hours:vol-1:100:3600");
    }

    #[test]
    fn event_type_serializes_snake_case() {
        let json = serde_json::to_string(&EventType::ComputeMinutes).unwrap();
        assert_eq!(json, "\"compute_minutes\"");
    }
}
