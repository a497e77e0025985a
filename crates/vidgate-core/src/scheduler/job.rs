use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::domain::{JobOutput, JobParams, OperationType, Priority, UtcDateTime};
use crate::error::{ApiErrorKind, ErrorReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value.trim()).map(Self)
    }
}

/// What a caller submits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(flatten)]
    pub params: JobParams,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

impl JobRequest {
    pub fn new(params: JobParams) -> Self {
        Self {
            params,
            priority: Priority::default(),
            owner_id: None,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub const fn operation_type(&self) -> OperationType {
        self.params.operation_type()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Active,
    Completed,
    Failed,
    /// Waiting out a retry backoff or the low-priority delay.
    Delayed,
}

impl JobStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Delayed => "delayed",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pollable view of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub operation_type: OperationType,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub status: JobStatus,
    pub attempts: u32,
    pub created_at: UtcDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<UtcDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

/// Returned by enqueue; resolves once the job reaches a terminal state.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    updates: watch::Receiver<JobSnapshot>,
}

impl JobHandle {
    pub(crate) fn new(id: JobId, updates: watch::Receiver<JobSnapshot>) -> Self {
        Self { id, updates }
    }

    pub const fn id(&self) -> JobId {
        self.id
    }

    /// Latest known state.
    pub fn snapshot(&self) -> JobSnapshot {
        self.updates.borrow().clone()
    }

    /// Wait for completion and return the final snapshot.
    pub async fn wait_snapshot(mut self) -> JobSnapshot {
        let finished = self
            .updates
            .wait_for(|job| job.status.is_terminal())
            .await
            .map(|snapshot| snapshot.clone());
        match finished {
            Ok(snapshot) => snapshot,
            // The queue dropped the job without finishing it.
            Err(_) => {
                let mut snapshot = self.updates.borrow().clone();
                snapshot.status = JobStatus::Failed;
                snapshot.error = Some(ErrorReport {
                    kind: ApiErrorKind::Internal,
                    code: "internal",
                    message: String::from("job was abandoned before it finished"),
                    status: None,
                    retry_after_secs: None,
                });
                snapshot
            }
        }
    }

    /// Wait for completion and return the job's output or its error.
    pub async fn wait(self) -> Result<JobOutput, ErrorReport> {
        let snapshot = self.wait_snapshot().await;
        match (snapshot.status, snapshot.result, snapshot.error) {
            (JobStatus::Completed, Some(output), _) => Ok(output),
            (_, _, Some(error)) => Err(error),
            (status, _, None) => Err(ErrorReport {
                kind: ApiErrorKind::Internal,
                code: "internal",
                message: format!("job ended {status} without a result"),
                status: None,
                retry_after_secs: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SearchParams;

    #[test]
    fn request_defaults_to_normal_priority_without_owner() {
        let request: JobRequest = serde_json::from_str(
            r#"{"operation_type":"SEARCH","params":{"query":"rust"}}"#,
        )
        .expect("request");
        assert_eq!(request.priority, Priority::Normal);
        assert_eq!(request.owner_id, None);
        assert_eq!(request.operation_type(), OperationType::Search);
        assert_eq!(request.params, JobParams::Search(SearchParams::new("rust")));
    }

    #[test]
    fn request_rejects_out_of_range_priority() {
        let parsed = serde_json::from_str::<JobRequest>(
            r#"{"operation_type":"VIDEO_STATS","params":["a"],"priority":7}"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn job_ids_parse_from_their_display_form() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().expect("parse"), id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[tokio::test]
    async fn dropped_job_resolves_as_failed() {
        let snapshot = JobSnapshot {
            id: JobId::new(),
            operation_type: OperationType::VideoStats,
            priority: Priority::Normal,
            owner_id: None,
            status: JobStatus::Queued,
            attempts: 0,
            created_at: UtcDateTime::now(),
            finished_at: None,
            result: None,
            error: None,
        };
        let (sender, receiver) = watch::channel(snapshot.clone());
        let handle = JobHandle::new(snapshot.id, receiver);
        drop(sender);

        let error = handle.wait().await.expect_err("abandoned");
        assert_eq!(error.code, "internal");
    }
}
