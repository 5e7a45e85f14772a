//! Integration tests for usage sampling, alerts and processor sync

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use ws_metering::{
    AlertStore, AlertType, EventType, MeteringError, MeteringProcessor, MeteringReport, NewAlert,
    SubscriptionStore, SyncReport, SyncStatus, UpsertSubscription, UsageMeter, UsageSubmission,
};
use ws_orchestrator::test_utils::{create_test_db, create_test_workspace};
use ws_orchestrator::WorkspaceStore;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, 12, 30, 15).unwrap()
}

fn period_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
}

async fn subscribe(pool: &SqlitePool, user_id: &str, compute_limit: Option<i64>) {
    SubscriptionStore::new(pool.clone())
        .upsert(UpsertSubscription {
            user_id: user_id.to_string(),
            status: "active".to_string(),
            current_period_start: Some(period_start()),
            current_period_end: Some(period_start() + Duration::days(31)),
            compute_minutes_limit: compute_limit,
            storage_gb_hours_limit: None,
            processor_customer_id: Some(format!("cus_{user_id}")),
        })
        .await
        .unwrap();
}

/// A workspace with a running instance, returning the workspace id
async fn running_workspace(store: &WorkspaceStore, user_id: &str) -> String {
    let ws = create_test_workspace(store, user_id).await;
    store.begin_instance(&ws.id).await.unwrap();
    store
        .set_instance_provider(&ws.id, &format!("srv-{}", ws.id), None)
        .await
        .unwrap();
    store.mark_instance_running(&ws.id, "100.64.0.9").await.unwrap();
    ws.id
}

#[derive(Default)]
struct RecordingProcessor {
    submitted: Mutex<Vec<UsageSubmission>>,
    failing: AtomicBool,
}

#[async_trait]
impl MeteringProcessor for RecordingProcessor {
    async fn submit(&self, usage: &UsageSubmission) -> ws_metering::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(MeteringError::Processor {
                status: 503,
                message: "unavailable".to_string(),
            });
        }
        self.submitted.lock().unwrap().push(usage.clone());
        Ok(())
    }
}

#[tokio::test]
async fn test_instance_without_billing_period_is_skipped() {
    let pool = create_test_db().await;
    let store = WorkspaceStore::new(pool.clone());
    let meter = UsageMeter::new(pool.clone());

    subscribe(&pool, "alice", None).await;
    running_workspace(&store, "alice").await;
    running_workspace(&store, "bob").await;

    let report = meter.record_compute_usage(now()).await.unwrap();

    assert_eq!(
        report,
        MeteringReport {
            recorded: 1,
            skipped: 1,
            failed: 0,
            total: 2,
        }
    );
}

#[tokio::test]
async fn test_same_slot_is_recorded_once() {
    let pool = create_test_db().await;
    let store = WorkspaceStore::new(pool.clone());
    let meter = UsageMeter::new(pool.clone());

    subscribe(&pool, "alice", None).await;
    running_workspace(&store, "alice").await;

    let first = meter.record_compute_usage(now()).await.unwrap();
    let second = meter
        .record_compute_usage(now() + Duration::seconds(20))
        .await
        .unwrap();

    assert_eq!(first.recorded, 1);
    assert_eq!(second.recorded, 0);
    assert_eq!(second.skipped, 1);

    let events = meter.list_events("alice").await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::ComputeMinutes);
    assert_eq!(events[0].quantity, 1);
    assert_eq!(events[0].sync_status, SyncStatus::Pending);
    assert!(events[0].idempotency_key.starts_with("compute_minutes:"));

    let next_minute = meter
        .record_compute_usage(now() + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(next_minute.recorded, 1);
}

#[tokio::test]
async fn test_stopped_instances_are_not_metered() {
    let pool = create_test_db().await;
    let store = WorkspaceStore::new(pool.clone());
    let meter = UsageMeter::new(pool.clone());

    subscribe(&pool, "alice", None).await;
    let ws_id = running_workspace(&store, "alice").await;
    store.mark_instance_stopped(&ws_id, true).await.unwrap();

    let report = meter.record_compute_usage(now()).await.unwrap();
    assert_eq!(report, MeteringReport::default());
}

#[tokio::test]
async fn test_storage_usage_uses_volume_size() {
    let pool = create_test_db().await;
    let store = WorkspaceStore::new(pool.clone());
    let meter = UsageMeter::new(pool.clone());

    subscribe(&pool, "alice", None).await;
    let ws = create_test_workspace(&store, "alice").await;
    store.create_volume_record(&ws.id, 40).await.unwrap();
    store.mark_volume_available(&ws.id, "vol-1").await.unwrap();

    // Still creating: not billable
    let pending = create_test_workspace(&store, "alice").await;
    store.create_volume_record(&pending.id, 10).await.unwrap();

    let report = meter.record_storage_usage(now()).await.unwrap();
    assert_eq!(report.recorded, 1);
    assert_eq!(report.total, 1);

    let again = meter
        .record_storage_usage(now() + Duration::minutes(20))
        .await
        .unwrap();
    assert_eq!(again.skipped, 1);

    let events = meter.list_events("alice").await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::StorageGbHours);
    assert_eq!(events[0].quantity, 40);
    assert_eq!(events[0].billing_period_start, period_start());
}

#[tokio::test]
async fn test_non_positive_volume_size_is_skipped() {
    let pool = create_test_db().await;
    let store = WorkspaceStore::new(pool.clone());
    let meter = UsageMeter::new(pool.clone());

    subscribe(&pool, "alice", None).await;
    let ws = create_test_workspace(&store, "alice").await;
    store.create_volume_record(&ws.id, 0).await.unwrap();
    store.mark_volume_available(&ws.id, "vol-empty").await.unwrap();

    let report = meter.record_storage_usage(now()).await.unwrap();
    assert_eq!(
        report,
        MeteringReport {
            recorded: 0,
            skipped: 1,
            failed: 0,
            total: 1,
        }
    );
    assert!(meter.list_events("alice").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_thresholds_raise_each_alert_once() {
    let pool = create_test_db().await;
    let store = WorkspaceStore::new(pool.clone());
    let meter = UsageMeter::new(pool.clone());

    subscribe(&pool, "alice", Some(2)).await;
    running_workspace(&store, "alice").await;

    meter.record_compute_usage(now()).await.unwrap();
    let alerts = meter.alerts().list_alerts("alice", true).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::UsageWarning);

    meter
        .record_compute_usage(now() + Duration::minutes(1))
        .await
        .unwrap();
    meter
        .record_compute_usage(now() + Duration::minutes(2))
        .await
        .unwrap();

    let mut types: Vec<_> = meter
        .alerts()
        .list_alerts("alice", true)
        .await
        .unwrap()
        .into_iter()
        .map(|alert| alert.alert_type)
        .collect();
    types.sort_by_key(|t| t.threshold() as i64);
    assert_eq!(
        types,
        vec![
            AlertType::UsageWarning,
            AlertType::UsageCritical,
            AlertType::LimitReached
        ]
    );

    let total = meter
        .usage_total("alice", EventType::ComputeMinutes, period_start().timestamp())
        .await
        .unwrap();
    assert_eq!(total, 3);
}

#[tokio::test]
async fn test_duplicate_alert_is_ignored() {
    let pool = create_test_db().await;
    let alerts = AlertStore::new(pool);

    let alert = || NewAlert {
        user_id: "alice".to_string(),
        alert_type: AlertType::UsageWarning,
        resource_type: EventType::ComputeMinutes,
        billing_period_start: period_start().timestamp(),
        message: "half way".to_string(),
    };

    let first = alerts.create_alert(alert()).await.unwrap();
    let second = alerts.create_alert(alert()).await.unwrap();

    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(alerts.list_alerts("alice", true).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_dismiss_and_email_alerts() {
    let pool = create_test_db().await;
    let alerts = AlertStore::new(pool);

    let alert = alerts
        .create_alert(NewAlert::for_usage(
            "alice",
            AlertType::UsageCritical,
            EventType::StorageGbHours,
            period_start().timestamp(),
            82.0,
        ))
        .await
        .unwrap()
        .unwrap();
    assert!(alert.message.contains("82%"));

    assert!(!alerts.dismiss_alert(&alert.id, "mallory").await.unwrap());
    assert!(alerts.dismiss_alert(&alert.id, "alice").await.unwrap());
    assert!(alerts.list_alerts("alice", false).await.unwrap().is_empty());
    assert_eq!(alerts.list_alerts("alice", true).await.unwrap().len(), 1);

    assert_eq!(alerts.unsent_alerts(10).await.unwrap().len(), 1);
    assert!(alerts.mark_alert_emailed(&alert.id).await.unwrap());
    assert!(alerts.unsent_alerts(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_sync_marks_events_synced() {
    let pool = create_test_db().await;
    let store = WorkspaceStore::new(pool.clone());
    let meter = UsageMeter::new(pool.clone());
    let processor = RecordingProcessor::default();

    subscribe(&pool, "alice", None).await;
    running_workspace(&store, "alice").await;
    meter.record_compute_usage(now()).await.unwrap();
    meter
        .record_compute_usage(now() + Duration::minutes(1))
        .await
        .unwrap();

    let report = meter.sync_pending_events(&processor, 100, 3).await.unwrap();
    assert_eq!(
        report,
        SyncReport {
            synced: 2,
            failed: 0,
            total: 2,
        }
    );

    let submitted = processor.submitted.lock().unwrap().clone();
    assert_eq!(submitted.len(), 2);
    assert_eq!(submitted[0].customer_id.as_deref(), Some("cus_alice"));

    let events = meter.list_events("alice").await.unwrap();
    assert!(events
        .iter()
        .all(|e| e.sync_status == SyncStatus::Synced && e.synced_at.is_some()));
    assert!(events.iter().all(|e| e.sync_attempts == 1));

    // Nothing left to sync
    let again = meter.sync_pending_events(&processor, 100, 3).await.unwrap();
    assert_eq!(again.total, 0);
}

#[tokio::test]
async fn test_failed_sync_is_retried_until_max_attempts() {
    let pool = create_test_db().await;
    let store = WorkspaceStore::new(pool.clone());
    let meter = UsageMeter::new(pool.clone());
    let processor = RecordingProcessor::default();
    processor.failing.store(true, Ordering::SeqCst);

    subscribe(&pool, "alice", None).await;
    running_workspace(&store, "alice").await;
    meter.record_compute_usage(now()).await.unwrap();

    for _ in 0..2 {
        let report = meter.sync_pending_events(&processor, 100, 2).await.unwrap();
        assert_eq!(report.failed, 1);
    }

    let event = &meter.list_events("alice").await.unwrap()[0];
    assert_eq!(event.sync_status, SyncStatus::Failed);
    assert_eq!(event.sync_attempts, 2);
    assert!(event.sync_error.as_deref().unwrap().contains("503"));

    // Out of attempts
    processor.failing.store(false, Ordering::SeqCst);
    let report = meter.sync_pending_events(&processor, 100, 2).await.unwrap();
    assert_eq!(report.total, 0);

    // A higher ceiling picks it up again
    let report = meter.sync_pending_events(&processor, 100, 5).await.unwrap();
    assert_eq!(report.synced, 1);

    let event = &meter.list_events("alice").await.unwrap()[0];
    assert_eq!(event.sync_status, SyncStatus::Synced);
    assert_eq!(event.sync_attempts, 3);
    assert!(event.sync_error.is_none());
}

#[tokio::test]
async fn test_sync_respects_batch_size() {
    let pool = create_test_db().await;
    let store = WorkspaceStore::new(pool.clone());
    let meter = UsageMeter::new(pool.clone());
    let processor = RecordingProcessor::default();

    subscribe(&pool, "alice", None).await;
    running_workspace(&store, "alice").await;
    running_workspace(&store, "alice").await;
    meter.record_compute_usage(now()).await.unwrap();

    let report = meter.sync_pending_events(&processor, 1, 3).await.unwrap();
    assert_eq!(report.total, 1);

    let report = meter.sync_pending_events(&processor, 1, 3).await.unwrap();
    assert_eq!(report.total, 1);
    assert_eq!(processor.submitted.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_inactive_subscription_is_not_billed() {
    let pool = create_test_db().await;
    let store = WorkspaceStore::new(pool.clone());
    let meter = UsageMeter::new(pool.clone());
    let subscriptions = SubscriptionStore::new(pool.clone());

    subscribe(&pool, "alice", None).await;
    subscriptions
        .upsert(UpsertSubscription {
            user_id: "alice".to_string(),
            status: "canceled".to_string(),
            ..UpsertSubscription::default()
        })
        .await
        .unwrap();

    let sub = subscriptions.get_for_user("alice").await.unwrap().unwrap();
    assert_eq!(sub.status, "canceled");
    assert!(subscriptions.get_for_user("bob").await.unwrap().is_none());

    running_workspace(&store, "alice").await;
    let report = meter.record_compute_usage(now()).await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.recorded, 0);
}
