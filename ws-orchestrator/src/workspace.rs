use crate::error::{OrchestratorError, Result};
use crate::resources::{WorkspaceInstance, WorkspaceVolume};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub status: WorkspaceStatus,
    pub storage_gb: i64,
    pub ssh_public_key: Option<String>,

    #[serde(serialize_with = "serialize_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(serialize_with = "serialize_datetime")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Pending,
    Provisioning,
    Ready,
    Suspended,
    Error,
}

/// A workspace loaded together with its volume and instance.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceDetail {
    pub workspace: Workspace,
    pub volume: Option<WorkspaceVolume>,
    pub instance: Option<WorkspaceInstance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWorkspaceRequest {
    pub user_id: String,
    pub name: String,
    pub storage_gb: i64,
    pub ssh_public_key: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkspaceFilters {
    pub user_id: Option<String>,
    pub status: Option<WorkspaceStatus>,
}

/// Persistence for workspaces and the resources backing them.
#[derive(Clone)]
pub struct WorkspaceStore {
    pool: SqlitePool,
}

impl WorkspaceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a new workspace in `pending` state
    pub async fn create_workspace(&self, req: CreateWorkspaceRequest) -> Result<Workspace> {
        if req.storage_gb <= 0 {
            return Err(OrchestratorError::InvalidInput(format!(
                "storage_gb must be positive, got {}",
                req.storage_gb
            )));
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO workspaces (id, user_id, name, status, storage_gb, ssh_public_key, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&req.user_id)
        .bind(&req.name)
        .bind(WorkspaceStatus::Pending)
        .bind(req.storage_gb)
        .bind(&req.ssh_public_key)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_workspace(&id).await
    }

    /// List workspaces with optional filters
    pub async fn list_workspaces(&self, filters: WorkspaceFilters) -> Result<Vec<Workspace>> {
        let mut query = "SELECT * FROM workspaces WHERE 1=1".to_string();

        if filters.user_id.is_some() {
            query.push_str(" AND user_id = ?");
        }
        if filters.status.is_some() {
            query.push_str(" AND status = ?");
        }

        query.push_str(" ORDER BY created_at DESC");

        let mut q = sqlx::query_as::<_, WorkspaceRow>(&query);

        if let Some(user_id) = &filters.user_id {
            q = q.bind(user_id);
        }
        if let Some(status) = &filters.status {
            q = q.bind(status);
        }

        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(|row| row.into()).collect())
    }

    /// Get a single workspace by ID
    pub async fn get_workspace(&self, id: &str) -> Result<Workspace> {
        self.find_workspace(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))
    }

    pub async fn find_workspace(&self, id: &str) -> Result<Option<Workspace>> {
        let row = sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    /// Load a workspace with its volume and instance, if it exists
    #[instrument(skip(self))]
    pub async fn get_workspace_detail(&self, id: &str) -> Result<Option<WorkspaceDetail>> {
        let Some(workspace) = self.find_workspace(id).await? else {
            return Ok(None);
        };

        let volume = self.get_volume(id).await?;
        let instance = self.get_instance(id).await?;

        Ok(Some(WorkspaceDetail {
            workspace,
            volume,
            instance,
        }))
    }

    pub async fn set_workspace_status(&self, id: &str, status: WorkspaceStatus) -> Result<()> {
        let result = sqlx::query("UPDATE workspaces SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Get all workspaces with a specific status
    pub async fn get_workspaces_by_status(
        &self,
        status: WorkspaceStatus,
    ) -> Result<Vec<Workspace>> {
        self.list_workspaces(WorkspaceFilters {
            user_id: None,
            status: Some(status),
        })
        .await
    }

    /// Remove a workspace record together with its volume and instance rows.
    /// Returns whether a workspace was deleted.
    pub async fn delete_workspace(&self, id: &str) -> Result<bool> {
        sqlx::query("DELETE FROM workspace_instances WHERE workspace_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM workspace_volumes WHERE workspace_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        let result = sqlx::query("DELETE FROM workspaces WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

// Internal row types for sqlx
#[derive(sqlx::FromRow)]
struct WorkspaceRow {
    id: String,
    user_id: String,
    name: String,
    status: WorkspaceStatus,
    storage_gb: i64,
    ssh_public_key: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl From<WorkspaceRow> for Workspace {
    fn from(row: WorkspaceRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            status: row.status,
            storage_gb: row.storage_gb,
            ssh_public_key: row.ssh_public_key,
            created_at: from_timestamp(row.created_at),
            updated_at: from_timestamp(row.updated_at),
        }
    }
}

pub(crate) fn from_timestamp(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

// Serialize DateTime as RFC 3339 / ISO 8601 string
pub(crate) fn serialize_datetime<S>(
    dt: &DateTime<Utc>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&dt.to_rfc3339())
}

pub(crate) fn serialize_optional_datetime<S>(
    dt: &Option<DateTime<Utc>>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match dt {
        Some(dt) => serializer.serialize_str(&dt.to_rfc3339()),
        None => serializer.serialize_none(),
    }
}
