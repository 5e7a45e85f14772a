use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::QueueError;

/// Kind of lifecycle job; each kind has its own queue list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Provision,
    Destroy,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::Provision, JobKind::Destroy];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Provision => "provision",
            JobKind::Destroy => "destroy",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provision" => Ok(JobKind::Provision),
            "destroy" => Ok(JobKind::Destroy),
            other => Err(QueueError::UnknownQueue(other.to_string())),
        }
    }
}

/// What a job acts on. Provider ids are optional hints carried from the
/// enqueuing side; orchestrators fall back to database state when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub workspace_id: String,
    pub user_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_device_id: Option<String>,

    /// Destroy only: remove the workspace record instead of suspending it.
    #[serde(default)]
    pub delete_record: bool,
}

impl JobPayload {
    pub fn new(workspace_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            user_id: user_id.into(),
            instance_id: None,
            volume_id: None,
            mesh_device_id: None,
            delete_record: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub payload: JobPayload,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,

    /// Serialized form as stored in the processing list (pre-increment).
    #[serde(skip)]
    pub(crate) reservation: Option<String>,
}

impl Job {
    pub(crate) fn new(kind: JobKind, payload: JobPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            payload,
            created_at: Utc::now(),
            attempts: 0,
            reservation: None,
        }
    }

    pub fn workspace_id(&self) -> &str {
        &self.payload.workspace_id
    }

    /// Serialized form used to locate this job in the processing list.
    pub(crate) fn reservation_key(&self) -> Result<String, serde_json::Error> {
        match &self.reservation {
            Some(raw) => Ok(raw.clone()),
            None => {
                let mut stored = self.clone();
                stored.attempts = self.attempts.saturating_sub(1);
                serde_json::to_string(&stored)
            }
        }
    }
}
