//! Billing alerts raised when usage crosses a share of the plan limit

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::error::{is_unique_violation, Result};
use crate::event::{from_timestamp, EventType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    UsageWarning,
    UsageCritical,
    LimitReached,
}

impl AlertType {
    pub const ALL: [AlertType; 3] = [
        AlertType::UsageWarning,
        AlertType::UsageCritical,
        AlertType::LimitReached,
    ];

    /// Percent of the limit at which this alert fires.
    pub fn threshold(&self) -> f64 {
        match self {
            AlertType::UsageWarning => 50.0,
            AlertType::UsageCritical => 80.0,
            AlertType::LimitReached => 100.0,
        }
    }

    /// Alerts whose threshold `percent` has reached.
    pub fn crossed(percent: f64) -> impl Iterator<Item = AlertType> {
        Self::ALL
            .into_iter()
            .filter(move |alert| percent >= alert.threshold())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingAlert {
    pub id: String,
    pub user_id: String,
    pub alert_type: AlertType,
    pub resource_type: EventType,
    pub billing_period_start: DateTime<Utc>,
    pub message: String,
    pub email_sent: bool,
    pub in_app_dismissed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAlert {
    pub user_id: String,
    pub alert_type: AlertType,
    pub resource_type: EventType,
    /// Unix seconds.
    pub billing_period_start: i64,
    pub message: String,
}

impl NewAlert {
    pub fn for_usage(
        user_id: &str,
        alert_type: AlertType,
        resource_type: EventType,
        billing_period_start: i64,
        percent: f64,
    ) -> Self {
        let message = match alert_type {
            AlertType::LimitReached => {
                format!("You have reached your {resource_type} limit for this billing period")
            }
            _ => format!(
                "You have used {percent:.0}% of your {resource_type} for this billing period"
            ),
        };

        Self {
            user_id: user_id.to_string(),
            alert_type,
            resource_type,
            billing_period_start,
            message,
        }
    }
}

#[derive(Clone)]
pub struct AlertStore {
    pool: SqlitePool,
}

impl AlertStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert an alert unless the same one already exists for the period.
    pub async fn create_alert(&self, alert: NewAlert) -> Result<Option<BillingAlert>> {
        let id = Uuid::new_v4().to_string();

        let inserted = sqlx::query(
            r#"
            INSERT INTO billing_alerts
                (id, user_id, alert_type, resource_type, billing_period_start, message, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&alert.user_id)
        .bind(alert.alert_type)
        .bind(alert.resource_type)
        .bind(alert.billing_period_start)
        .bind(&alert.message)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        info!(
            user_id = %alert.user_id,
            alert_type = ?alert.alert_type,
            resource = %alert.resource_type,
            "Billing alert raised"
        );
        self.get_alert(&id).await
    }

    pub async fn get_alert(&self, id: &str) -> Result<Option<BillingAlert>> {
        let row = sqlx::query_as::<_, AlertRow>("SELECT * FROM billing_alerts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    pub async fn list_alerts(
        &self,
        user_id: &str,
        include_dismissed: bool,
    ) -> Result<Vec<BillingAlert>> {
        let sql = if include_dismissed {
            "SELECT * FROM billing_alerts WHERE user_id = ? ORDER BY created_at DESC"
        } else {
            "SELECT * FROM billing_alerts WHERE user_id = ? AND in_app_dismissed = 0 ORDER BY created_at DESC"
        };

        let rows = sqlx::query_as::<_, AlertRow>(sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Hide an alert in the dashboard. Only the owner can dismiss it.
    pub async fn dismiss_alert(&self, id: &str, user_id: &str) -> Result<bool> {
        let result =
            sqlx::query("UPDATE billing_alerts SET in_app_dismissed = 1 WHERE id = ? AND user_id = ?")
                .bind(id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_alert_emailed(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE billing_alerts SET email_sent = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Alerts nobody has been emailed about yet, oldest first.
    pub async fn unsent_alerts(&self, limit: i64) -> Result<Vec<BillingAlert>> {
        let rows = sqlx::query_as::<_, AlertRow>(
            "SELECT * FROM billing_alerts WHERE email_sent = 0 ORDER BY created_at ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(sqlx::FromRow)]
struct AlertRow {
    id: String,
    user_id: String,
    alert_type: AlertType,
    resource_type: EventType,
    billing_period_start: i64,
    message: String,
    email_sent: bool,
    in_app_dismissed: bool,
    created_at: i64,
}

impl From<AlertRow> for BillingAlert {
    fn from(row: AlertRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            alert_type: row.alert_type,
            resource_type: row.resource_type,
            billing_period_start: from_timestamp(row.billing_period_start),
            message: row.message,
            email_sent: row.email_sent,
            in_app_dismissed: row.in_app_dismissed,
            created_at: from_timestamp(row.created_at),
        }
    }
}
