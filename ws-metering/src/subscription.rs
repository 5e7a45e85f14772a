use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::Result;
use crate::event::from_timestamp;

/// A user's plan, mirrored from the payment processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    pub status: String,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub compute_minutes_limit: Option<i64>,
    pub storage_gb_hours_limit: Option<i64>,
    pub processor_customer_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpsertSubscription {
    pub user_id: String,
    pub status: String,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub compute_minutes_limit: Option<i64>,
    pub storage_gb_hours_limit: Option<i64>,
    pub processor_customer_id: Option<String>,
}

#[derive(Clone)]
pub struct SubscriptionStore {
    pool: SqlitePool,
}

impl SubscriptionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create or replace the subscription of a user
    pub async fn upsert(&self, sub: UpsertSubscription) -> Result<Subscription> {
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (id, user_id, status, current_period_start, current_period_end,
                 compute_minutes_limit, storage_gb_hours_limit, processor_customer_id,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                status = excluded.status,
                current_period_start = excluded.current_period_start,
                current_period_end = excluded.current_period_end,
                compute_minutes_limit = excluded.compute_minutes_limit,
                storage_gb_hours_limit = excluded.storage_gb_hours_limit,
                processor_customer_id = excluded.processor_customer_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&sub.user_id)
        .bind(&sub.status)
        .bind(sub.current_period_start.map(|dt| dt.timestamp()))
        .bind(sub.current_period_end.map(|dt| dt.timestamp()))
        .bind(sub.compute_minutes_limit)
        .bind(sub.storage_gb_hours_limit)
        .bind(&sub.processor_customer_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, SubscriptionRow>("SELECT * FROM subscriptions WHERE user_id = ?")
            .bind(&sub.user_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.into())
    }

    pub async fn get_for_user(&self, user_id: &str) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>("SELECT * FROM subscriptions WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: String,
    user_id: String,
    status: String,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
    compute_minutes_limit: Option<i64>,
    storage_gb_hours_limit: Option<i64>,
    processor_customer_id: Option<String>,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            status: row.status,
            current_period_start: row.current_period_start.map(from_timestamp),
            current_period_end: row.current_period_end.map(from_timestamp),
            compute_minutes_limit: row.compute_minutes_limit,
            storage_gb_hours_limit: row.storage_gb_hours_limit,
            processor_customer_id: row.processor_customer_id,
        }
    }
}
