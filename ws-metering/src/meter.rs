//! Sampling of active resources into usage events
//!
//! A sampling run looks at every resource that is billable right now and
//! records one event per resource and slot. Runs are safe to repeat: the
//! idempotency key turns a second sample of the same slot into a skip.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::alerts::{AlertStore, AlertType, NewAlert};
use crate::error::{is_unique_violation, Result};
use crate::event::{idempotency_key, EventType, MeteringReport, SyncReport, UsageEvent, UsageEventRow};
use crate::processor::{MeteringProcessor, UsageSubmission};

/// A billable resource observed during a sampling run.
#[derive(Debug, sqlx::FromRow)]
struct Sample {
    resource_id: String,
    workspace_id: String,
    user_id: String,
    quantity: i64,
    period_start: Option<i64>,
    period_end: Option<i64>,
    usage_limit: Option<i64>,
}

enum Recorded {
    New,
    Duplicate,
}

#[derive(Clone)]
pub struct UsageMeter {
    pool: SqlitePool,
    alerts: AlertStore,
}

impl UsageMeter {
    pub fn new(pool: SqlitePool) -> Self {
        let alerts = AlertStore::new(pool.clone());
        Self { pool, alerts }
    }

    pub fn alerts(&self) -> &AlertStore {
        &self.alerts
    }

    /// Record one compute minute for every running instance.
    #[instrument(skip(self))]
    pub async fn record_compute_usage(&self, now: DateTime<Utc>) -> Result<MeteringReport> {
        let samples = sqlx::query_as::<_, Sample>(
            r#"
            SELECT i.id AS resource_id, w.id AS workspace_id, w.user_id AS user_id,
                   1 AS quantity,
                   s.current_period_start AS period_start,
                   s.current_period_end AS period_end,
                   s.compute_minutes_limit AS usage_limit
            FROM workspace_instances i
            JOIN workspaces w ON w.id = i.workspace_id
            LEFT JOIN subscriptions s ON s.user_id = w.user_id AND s.status = 'active'
            WHERE i.status = 'running'
            ORDER BY i.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let report = self
            .record_samples(EventType::ComputeMinutes, samples, now)
            .await;
        info!(?report, "Compute usage recorded");
        Ok(report)
    }

    /// Record `size_gb` GB-hours for every available volume.
    #[instrument(skip(self))]
    pub async fn record_storage_usage(&self, now: DateTime<Utc>) -> Result<MeteringReport> {
        let samples = sqlx::query_as::<_, Sample>(
            r#"
            SELECT v.id AS resource_id, w.id AS workspace_id, w.user_id AS user_id,
                   v.size_gb AS quantity,
                   s.current_period_start AS period_start,
                   s.current_period_end AS period_end,
                   s.storage_gb_hours_limit AS usage_limit
            FROM workspace_volumes v
            JOIN workspaces w ON w.id = v.workspace_id
            LEFT JOIN subscriptions s ON s.user_id = w.user_id AND s.status = 'active'
            WHERE v.status = 'available'
            ORDER BY v.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let report = self
            .record_samples(EventType::StorageGbHours, samples, now)
            .await;
        info!(?report, "Storage usage recorded");
        Ok(report)
    }

    async fn record_samples(
        &self,
        event_type: EventType,
        samples: Vec<Sample>,
        now: DateTime<Utc>,
    ) -> MeteringReport {
        let slot_start = event_type.slot_start(now);
        let mut report = MeteringReport {
            total: samples.len(),
            ..MeteringReport::default()
        };

        for sample in samples {
            let (Some(period_start), Some(period_end)) = (sample.period_start, sample.period_end)
            else {
                debug!(resource = %sample.resource_id, "No billing period, skipping");
                report.skipped += 1;
                continue;
            };
            if sample.quantity <= 0 {
                warn!(resource = %sample.resource_id, quantity = sample.quantity, "Non-positive quantity, skipping");
                report.skipped += 1;
                continue;
            }

            let key = idempotency_key(event_type, &sample.resource_id, period_start, slot_start);
            match self
                .insert_event(&sample, event_type, period_start, period_end, &key, now)
                .await
            {
                Ok(Recorded::New) => {
                    report.recorded += 1;
                    self.check_thresholds(&sample, event_type, period_start)
                        .await;
                }
                Ok(Recorded::Duplicate) => {
                    debug!(key = %key, "Already recorded");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(resource = %sample.resource_id, error = %e, "Failed to record usage");
                    report.failed += 1;
                }
            }
        }

        report
    }

    async fn insert_event(
        &self,
        sample: &Sample,
        event_type: EventType,
        period_start: i64,
        period_end: i64,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Recorded> {
        let result = sqlx::query(
            r#"
            INSERT INTO usage_events
                (id, user_id, workspace_id, event_type, quantity,
                 billing_period_start, billing_period_end, idempotency_key, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&sample.user_id)
        .bind(&sample.workspace_id)
        .bind(event_type)
        .bind(sample.quantity)
        .bind(period_start)
        .bind(period_end)
        .bind(key)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(Recorded::New),
            Err(e) if is_unique_violation(&e) => Ok(Recorded::Duplicate),
            Err(e) => Err(e.into()),
        }
    }

    /// Total quantity a user has recorded for a resource type in a period.
    pub async fn usage_total(
        &self,
        user_id: &str,
        event_type: EventType,
        period_start: i64,
    ) -> Result<i64> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(quantity), 0) FROM usage_events
            WHERE user_id = ? AND event_type = ? AND billing_period_start = ?
            "#,
        )
        .bind(user_id)
        .bind(event_type)
        .bind(period_start)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    // Alerting never fails the sample that triggered it
    async fn check_thresholds(&self, sample: &Sample, event_type: EventType, period_start: i64) {
        let Some(limit) = sample.usage_limit.filter(|limit| *limit > 0) else {
            return;
        };

        let total = match self
            .usage_total(&sample.user_id, event_type, period_start)
            .await
        {
            Ok(total) => total,
            Err(e) => {
                warn!(user_id = %sample.user_id, error = %e, "Failed to compute usage total");
                return;
            }
        };

        let percent = total as f64 / limit as f64 * 100.0;
        for alert_type in AlertType::crossed(percent) {
            let alert =
                NewAlert::for_usage(&sample.user_id, alert_type, event_type, period_start, percent);
            if let Err(e) = self.alerts.create_alert(alert).await {
                warn!(user_id = %sample.user_id, ?alert_type, error = %e, "Failed to create alert");
            }
        }
    }

    /// Forward unsynced events to the processor, oldest first.
    ///
    /// Picks pending events and failed events with fewer than `max_attempts`
    /// attempts.
    #[instrument(skip(self, processor))]
    pub async fn sync_pending_events(
        &self,
        processor: &dyn MeteringProcessor,
        batch_size: i64,
        max_attempts: i64,
    ) -> Result<SyncReport> {
        let rows = sqlx::query_as::<_, SyncRow>(
            r#"
            SELECT e.*, s.processor_customer_id
            FROM usage_events e
            LEFT JOIN subscriptions s ON s.user_id = e.user_id
            WHERE e.sync_status = 'pending'
               OR (e.sync_status = 'failed' AND e.sync_attempts < ?)
            ORDER BY e.created_at ASC, e.id ASC
            LIMIT ?
            "#,
        )
        .bind(max_attempts)
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;

        let mut report = SyncReport {
            total: rows.len(),
            ..SyncReport::default()
        };

        for row in rows {
            let customer_id = row.processor_customer_id;
            let event: UsageEvent = row.event.into();
            let submission = UsageSubmission {
                idempotency_key: event.idempotency_key.clone(),
                user_id: event.user_id.clone(),
                customer_id,
                event_type: event.event_type,
                quantity: event.quantity,
                timestamp: event.created_at.timestamp(),
            };

            match processor.submit(&submission).await {
                Ok(()) => {
                    sqlx::query(
                        r#"
                        UPDATE usage_events
                        SET sync_status = 'synced', synced_at = ?, sync_error = NULL,
                            sync_attempts = sync_attempts + 1
                        WHERE id = ?
                        "#,
                    )
                    .bind(Utc::now().timestamp())
                    .bind(&event.id)
                    .execute(&self.pool)
                    .await?;
                    report.synced += 1;
                }
                Err(e) => {
                    warn!(event = %event.id, error = %e, "Usage sync failed");
                    sqlx::query(
                        r#"
                        UPDATE usage_events
                        SET sync_status = 'failed', sync_attempts = sync_attempts + 1, sync_error = ?
                        WHERE id = ?
                        "#,
                    )
                    .bind(e.to_string())
                    .bind(&event.id)
                    .execute(&self.pool)
                    .await?;
                    report.failed += 1;
                }
            }
        }

        info!(?report, "Usage sync finished");
        Ok(report)
    }

    pub async fn list_events(&self, user_id: &str) -> Result<Vec<UsageEvent>> {
        let rows = sqlx::query_as::<_, UsageEventRow>(
            "SELECT * FROM usage_events WHERE user_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(sqlx::FromRow)]
struct SyncRow {
    #[sqlx(flatten)]
    event: UsageEventRow,
    processor_customer_id: Option<String>,
}
