//! Volume and instance rows owned by a workspace.

use crate::error::{OrchestratorError, Result};
use crate::workspace::{
    from_timestamp, serialize_datetime, serialize_optional_datetime, WorkspaceStore,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VolumeStatus {
    Creating,
    Available,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceVolume {
    pub id: String,
    pub workspace_id: String,
    pub provider_volume_id: Option<String>,
    pub size_gb: i64,
    pub status: VolumeStatus,

    #[serde(serialize_with = "serialize_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(serialize_with = "serialize_datetime")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceInstance {
    pub id: String,
    pub workspace_id: String,
    pub provider_instance_id: Option<String>,
    pub public_ip: Option<String>,
    pub mesh_ip: Option<String>,
    pub status: InstanceStatus,

    #[serde(serialize_with = "serialize_optional_datetime")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(serialize_with = "serialize_optional_datetime")]
    pub stopped_at: Option<DateTime<Utc>>,
}

impl WorkspaceStore {
    pub async fn get_volume(&self, workspace_id: &str) -> Result<Option<WorkspaceVolume>> {
        let row = sqlx::query_as::<_, VolumeRow>(
            "SELECT * FROM workspace_volumes WHERE workspace_id = ?",
        )
        .bind(workspace_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(Into::into))
    }

    /// Insert the volume row for a workspace, in `creating` state
    pub async fn create_volume_record(
        &self,
        workspace_id: &str,
        size_gb: i64,
    ) -> Result<WorkspaceVolume> {
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO workspace_volumes (id, workspace_id, size_gb, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(workspace_id)
        .bind(size_gb)
        .bind(VolumeStatus::Creating)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_volume(workspace_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(workspace_id.to_string()))
    }

    /// Record the provider id of a volume that finished creating
    pub async fn mark_volume_available(&self, workspace_id: &str, provider_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workspace_volumes
            SET provider_volume_id = ?, status = ?, updated_at = ?
            WHERE workspace_id = ?
            "#,
        )
        .bind(provider_id)
        .bind(VolumeStatus::Available)
        .bind(Utc::now().timestamp())
        .bind(workspace_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn set_volume_status(&self, workspace_id: &str, status: VolumeStatus) -> Result<()> {
        sqlx::query("UPDATE workspace_volumes SET status = ?, updated_at = ? WHERE workspace_id = ?")
            .bind(status)
            .bind(Utc::now().timestamp())
            .bind(workspace_id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    pub async fn get_instance(&self, workspace_id: &str) -> Result<Option<WorkspaceInstance>> {
        let row = sqlx::query_as::<_, InstanceRow>(
            "SELECT * FROM workspace_instances WHERE workspace_id = ?",
        )
        .bind(workspace_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(Into::into))
    }

    /// Put the workspace's instance row into `starting`.
    ///
    /// A row that still records a provider instance keeps it so the instance
    /// can be reused; otherwise the row is replaced by a fresh one.
    pub async fn begin_instance(&self, workspace_id: &str) -> Result<WorkspaceInstance> {
        let now = Utc::now().timestamp();
        let existing = self.get_instance(workspace_id).await?;

        match existing {
            Some(instance) if instance.provider_instance_id.is_some() => {
                sqlx::query(
                    r#"
                    UPDATE workspace_instances
                    SET status = ?, stopped_at = NULL, updated_at = ?
                    WHERE workspace_id = ?
                    "#,
                )
                .bind(InstanceStatus::Starting)
                .bind(now)
                .bind(workspace_id)
                .execute(self.pool())
                .await?;
            }
            _ => {
                sqlx::query("DELETE FROM workspace_instances WHERE workspace_id = ?")
                    .bind(workspace_id)
                    .execute(self.pool())
                    .await?;

                sqlx::query(
                    r#"
                    INSERT INTO workspace_instances (id, workspace_id, status, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?)
                    "#,
                )
                .bind(Uuid::new_v4().to_string())
                .bind(workspace_id)
                .bind(InstanceStatus::Starting)
                .bind(now)
                .bind(now)
                .execute(self.pool())
                .await?;
            }
        }

        self.get_instance(workspace_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(workspace_id.to_string()))
    }

    /// Persist the provider instance id and public address as soon as known
    pub async fn set_instance_provider(
        &self,
        workspace_id: &str,
        provider_instance_id: &str,
        public_ip: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workspace_instances
            SET provider_instance_id = ?, public_ip = ?, updated_at = ?
            WHERE workspace_id = ?
            "#,
        )
        .bind(provider_instance_id)
        .bind(public_ip)
        .bind(Utc::now().timestamp())
        .bind(workspace_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn set_instance_status(
        &self,
        workspace_id: &str,
        status: InstanceStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE workspace_instances SET status = ?, updated_at = ? WHERE workspace_id = ?",
        )
        .bind(status)
        .bind(Utc::now().timestamp())
        .bind(workspace_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn mark_instance_running(&self, workspace_id: &str, mesh_ip: &str) -> Result<()> {
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            UPDATE workspace_instances
            SET status = ?, mesh_ip = ?, started_at = ?, stopped_at = NULL, updated_at = ?
            WHERE workspace_id = ?
            "#,
        )
        .bind(InstanceStatus::Running)
        .bind(mesh_ip)
        .bind(now)
        .bind(now)
        .bind(workspace_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Move the instance to `stopped`. With `clear_addresses` the provider
    /// instance id, public IP and mesh IP are forgotten as well.
    pub async fn mark_instance_stopped(
        &self,
        workspace_id: &str,
        clear_addresses: bool,
    ) -> Result<()> {
        let now = Utc::now().timestamp();
        let sql = if clear_addresses {
            r#"
            UPDATE workspace_instances
            SET status = ?, stopped_at = ?, updated_at = ?,
                provider_instance_id = NULL, public_ip = NULL, mesh_ip = NULL
            WHERE workspace_id = ?
            "#
        } else {
            r#"
            UPDATE workspace_instances
            SET status = ?, stopped_at = ?, updated_at = ?
            WHERE workspace_id = ?
            "#
        };

        sqlx::query(sql)
            .bind(InstanceStatus::Stopped)
            .bind(now)
            .bind(now)
            .bind(workspace_id)
            .execute(self.pool())
            .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct VolumeRow {
    id: String,
    workspace_id: String,
    provider_volume_id: Option<String>,
    size_gb: i64,
    status: VolumeStatus,
    created_at: i64,
    updated_at: i64,
}

impl From<VolumeRow> for WorkspaceVolume {
    fn from(row: VolumeRow) -> Self {
        Self {
            id: row.id,
            workspace_id: row.workspace_id,
            provider_volume_id: row.provider_volume_id,
            size_gb: row.size_gb,
            status: row.status,
            created_at: from_timestamp(row.created_at),
            updated_at: from_timestamp(row.updated_at),
        }
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: String,
    workspace_id: String,
    provider_instance_id: Option<String>,
    public_ip: Option<String>,
    mesh_ip: Option<String>,
    status: InstanceStatus,
    started_at: Option<i64>,
    stopped_at: Option<i64>,
}

impl From<InstanceRow> for WorkspaceInstance {
    fn from(row: InstanceRow) -> Self {
        Self {
            id: row.id,
            workspace_id: row.workspace_id,
            provider_instance_id: row.provider_instance_id,
            public_ip: row.public_ip,
            mesh_ip: row.mesh_ip,
            status: row.status,
            started_at: row.started_at.map(from_timestamp),
            stopped_at: row.stopped_at.map(from_timestamp),
        }
    }
}
