use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};

use super::scope::{ContainerScope, JobProgressStore};

const JOB_COLUMNS: &str = "id, rule_id, container_ids_json, status, total_count, processed_count, matched_count, match_breakdown_json, error, started_at, updated_at, completed_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Progress record of one bulk application run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleApplicationJob {
    pub id: String,
    /// `None` when the job applies every enabled rule.
    pub rule_id: Option<String>,
    pub container_ids: Option<Vec<i64>>,
    pub status: JobStatus,
    /// Scope size at creation. Display only; the scope may change while running.
    pub total_count: i64,
    pub processed_count: i64,
    pub matched_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_breakdown: Option<BTreeMap<String, i64>>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewRuleApplicationJob {
    pub rule_id: Option<String>,
    pub scope: ContainerScope,
    pub total_count: i64,
}

/// Counters written after every page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobProgress {
    pub processed_count: i64,
    pub matched_count: i64,
    /// Present only for all-rules runs.
    pub match_breakdown: Option<BTreeMap<String, i64>>,
}

impl JobProgress {
    pub fn new(track_breakdown: bool) -> Self {
        Self {
            processed_count: 0,
            matched_count: 0,
            match_breakdown: track_breakdown.then(BTreeMap::new),
        }
    }

    pub fn record_match(&mut self, rule_id: &str) {
        self.matched_count += 1;
        if let Some(breakdown) = &mut self.match_breakdown {
            *breakdown.entry(rule_id.to_string()).or_insert(0) += 1;
        }
    }
}

#[derive(Debug, Error)]
pub enum JobRecordError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("job is not running: {0}")]
    NotRunning(String),
    #[error("invalid job status value {0}")]
    InvalidStatus(String),
}

#[derive(Clone)]
pub struct RuleApplicationJobRepository {
    db: Database,
}

impl RuleApplicationJobRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Jobs start in `running`; there is no pending state.
    pub async fn create(
        &self,
        new_job: NewRuleApplicationJob,
    ) -> Result<RuleApplicationJob, JobRecordError> {
        let id = Uuid::new_v4().to_string();
        let now = now_rfc3339();
        let container_ids_json = new_job
            .scope
            .container_ids()
            .map(serde_json::to_string)
            .transpose()?;
        let breakdown_json = match new_job.rule_id {
            Some(_) => None,
            None => Some("{}".to_string()),
        };

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO rule_application_jobs (id, rule_id, container_ids_json, status, total_count, processed_count, matched_count, match_breakdown_json, error, started_at, updated_at, completed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, ?6, NULL, ?7, ?7, NULL)
                     RETURNING {JOB_COLUMNS}"
                ),
                params![
                    id,
                    new_job.rule_id,
                    container_ids_json,
                    JobStatus::Running.as_str(),
                    new_job.total_count,
                    breakdown_json,
                    now
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_job(row),
            None => Err(JobRecordError::JobNotFound("insert failed".into())),
        }
    }

    /// Counters never move backwards, even if a stale write arrives late.
    pub async fn update_progress(
        &self,
        job_id: &str,
        progress: &JobProgress,
    ) -> Result<(), JobRecordError> {
        let now = now_rfc3339();
        let breakdown_json = progress
            .match_breakdown
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE rule_application_jobs
                 SET processed_count = MAX(processed_count, ?2),
                     matched_count = MAX(matched_count, ?3),
                     match_breakdown_json = COALESCE(?4, match_breakdown_json),
                     updated_at = ?5
                 WHERE id = ?1 AND status = 'running'
                 RETURNING id",
                params![
                    job_id,
                    progress.processed_count,
                    progress.matched_count,
                    breakdown_json,
                    now
                ],
            )
            .await?;

        if rows.next().await?.is_none() {
            return self.resolve_missing_state(job_id).await;
        }
        Ok(())
    }

    pub async fn complete(
        &self,
        job_id: &str,
        progress: &JobProgress,
    ) -> Result<(), JobRecordError> {
        let now = now_rfc3339();
        let breakdown_json = progress
            .match_breakdown
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE rule_application_jobs
                 SET status = 'completed',
                     processed_count = MAX(processed_count, ?2),
                     matched_count = MAX(matched_count, ?3),
                     match_breakdown_json = COALESCE(?4, match_breakdown_json),
                     error = NULL,
                     completed_at = ?5,
                     updated_at = ?5
                 WHERE id = ?1 AND status = 'running'
                 RETURNING id",
                params![
                    job_id,
                    progress.processed_count,
                    progress.matched_count,
                    breakdown_json,
                    now
                ],
            )
            .await?;

        if rows.next().await?.is_none() {
            return self.resolve_missing_state(job_id).await;
        }
        Ok(())
    }

    /// Marks the job failed. Counters keep whatever the last progress write recorded.
    pub async fn fail(&self, job_id: &str, error: &str) -> Result<(), JobRecordError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE rule_application_jobs
                 SET status = 'failed', error = ?2, completed_at = ?3, updated_at = ?3
                 WHERE id = ?1 AND status = 'running'
                 RETURNING id",
                params![job_id, error, now],
            )
            .await?;

        if rows.next().await?.is_none() {
            return self.resolve_missing_state(job_id).await;
        }
        Ok(())
    }

    pub async fn get_by_id(&self, job_id: &str) -> Result<RuleApplicationJob, JobRecordError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM rule_application_jobs WHERE id = ?1"),
                params![job_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_job(row),
            None => Err(JobRecordError::JobNotFound(job_id.to_string())),
        }
    }

    /// Newest first.
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<RuleApplicationJob>, JobRecordError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM rule_application_jobs
                     ORDER BY started_at DESC, rowid DESC
                     LIMIT ?1"
                ),
                params![i64::from(limit)],
            )
            .await?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await? {
            jobs.push(row_to_job(row)?);
        }
        Ok(jobs)
    }

    /// Delete finished jobs that completed before `cutoff`. Returns the number removed.
    pub async fn prune_finished_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, JobRecordError> {
        let conn = self.db.connection().await?;
        let removed = conn
            .execute(
                "DELETE FROM rule_application_jobs
                 WHERE status != 'running' AND completed_at IS NOT NULL AND completed_at < ?1",
                params![to_rfc3339(cutoff)],
            )
            .await?;
        Ok(removed)
    }

    /// Fail every job still marked running. Only valid at startup, before this
    /// process spawns any run of its own.
    pub async fn fail_abandoned(&self, reason: &str) -> Result<u64, JobRecordError> {
        let now = now_rfc3339();
        let conn = self.db.connection().await?;
        let failed = conn
            .execute(
                "UPDATE rule_application_jobs
                 SET status = 'failed', error = ?1, completed_at = ?2, updated_at = ?2
                 WHERE status = 'running'",
                params![reason, now],
            )
            .await?;
        Ok(failed)
    }

    async fn resolve_missing_state(&self, job_id: &str) -> Result<(), JobRecordError> {
        match self.get_by_id(job_id).await {
            Ok(_) => Err(JobRecordError::NotRunning(job_id.to_string())),
            Err(JobRecordError::JobNotFound(_)) => {
                Err(JobRecordError::JobNotFound(job_id.to_string()))
            }
            Err(other) => Err(other),
        }
    }
}

#[async_trait]
impl JobProgressStore for RuleApplicationJobRepository {
    async fn update_progress(
        &self,
        job_id: &str,
        progress: &JobProgress,
    ) -> Result<(), JobRecordError> {
        RuleApplicationJobRepository::update_progress(self, job_id, progress).await
    }

    async fn complete(&self, job_id: &str, progress: &JobProgress) -> Result<(), JobRecordError> {
        RuleApplicationJobRepository::complete(self, job_id, progress).await
    }

    async fn fail(&self, job_id: &str, error: &str) -> Result<(), JobRecordError> {
        RuleApplicationJobRepository::fail(self, job_id, error).await
    }
}

fn row_to_job(row: Row) -> Result<RuleApplicationJob, JobRecordError> {
    let container_ids_json: Option<String> = row.get(2)?;
    let status: String = row.get(3)?;
    let match_breakdown_json: Option<String> = row.get(7)?;
    let started_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;
    let completed_at: Option<String> = row.get(11)?;

    let status =
        JobStatus::from_str(&status).ok_or_else(|| JobRecordError::InvalidStatus(status.clone()))?;

    Ok(RuleApplicationJob {
        id: row.get(0)?,
        rule_id: row.get(1)?,
        container_ids: container_ids_json
            .map(|value| serde_json::from_str(&value))
            .transpose()?,
        status,
        total_count: row.get(4)?,
        processed_count: row.get(5)?,
        matched_count: row.get(6)?,
        match_breakdown: match_breakdown_json
            .map(|value| serde_json::from_str(&value))
            .transpose()?,
        error: row.get(8)?,
        started_at: parse_timestamp(&started_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        completed_at: completed_at
            .as_deref()
            .map(parse_timestamp)
            .transpose()?,
    })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
