//! libSQL backend — async `Store` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! RFC 3339; JSON columns hold thread snapshots, task lists and sink
//! configuration.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    ClassifierSettings, Discussion, DiscussionStatus, Flow, Input, Job, JobPatch, JobStage,
    JobStatus, MappingType, Output, SinkConfig, SinkCredentials, SourceCredentials, ThreadRef,
    UserMapping,
};
use crate::store::migrations;
use crate::store::traits::Store;

/// libSQL store backend.
///
/// Holds a single connection reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("failed to create store directory: {e}")))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("failed to open libSQL database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&store.conn).await?;
        info!(path = %path.display(), "Store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("failed to create in-memory database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&store.conn).await?;
        Ok(store)
    }

    /// Seed a flow with its inputs and outputs. Stands in for the external
    /// admin layer, which normally writes these records.
    pub async fn add_flow(&self, flow: &Flow) -> Result<(), StoreError> {
        let topics = serde_json::to_string(&flow.topics)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let classifier = serde_json::to_string(&flow.classifier)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO flows (id, name, enabled, topics, classifier)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    flow.id.to_string(),
                    flow.name.clone(),
                    flow.enabled as i64,
                    topics,
                    classifier
                ],
            )
            .await
            .map_err(q)?;

        for input in &flow.inputs {
            self.conn
                .execute(
                    "INSERT OR REPLACE INTO inputs
                     (id, flow_id, platform, workspace_id, token, signing_secret)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        input.id.to_string(),
                        flow.id.to_string(),
                        input.platform.clone(),
                        input.workspace_id.clone(),
                        input.credentials.token.expose_secret().to_string(),
                        input.credentials.signing_secret.expose_secret().to_string()
                    ],
                )
                .await
                .map_err(q)?;
        }

        for output in &flow.outputs {
            let accepts = serde_json::to_string(&output.accepts)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let sink = serde_json::to_string(&output.sink)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            self.conn
                .execute(
                    "INSERT OR REPLACE INTO outputs
                     (id, flow_id, platform, name, accepts, is_default, token, sink)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        output.id.to_string(),
                        flow.id.to_string(),
                        output.platform.clone(),
                        output.name.clone(),
                        accepts,
                        output.is_default as i64,
                        output.credentials.token.expose_secret().to_string(),
                        sink
                    ],
                )
                .await
                .map_err(q)?;
        }

        Ok(())
    }

    async fn load_flow_parts(&self, flow_id: Uuid) -> Result<(Vec<Input>, Vec<Output>), StoreError> {
        let mut inputs = Vec::new();
        let mut rows = self
            .conn
            .query(
                "SELECT id, platform, workspace_id, token, signing_secret
                 FROM inputs WHERE flow_id = ?1",
                params![flow_id.to_string()],
            )
            .await
            .map_err(q)?;
        while let Some(row) = rows.next().await.map_err(q)? {
            let id: String = row.get(0).map_err(q)?;
            let token: String = row.get(3).map_err(q)?;
            let secret: String = row.get(4).map_err(q)?;
            inputs.push(Input {
                id: parse_uuid(&id)?,
                flow_id,
                platform: row.get(1).map_err(q)?,
                workspace_id: row.get(2).map_err(q)?,
                credentials: SourceCredentials {
                    token: SecretString::from(token),
                    signing_secret: SecretString::from(secret),
                },
            });
        }

        let mut outputs = Vec::new();
        let mut rows = self
            .conn
            .query(
                "SELECT id, platform, name, accepts, is_default, token, sink
                 FROM outputs WHERE flow_id = ?1",
                params![flow_id.to_string()],
            )
            .await
            .map_err(q)?;
        while let Some(row) = rows.next().await.map_err(q)? {
            let id: String = row.get(0).map_err(q)?;
            let accepts: String = row.get(3).map_err(q)?;
            let is_default: i64 = row.get(4).map_err(q)?;
            let token: String = row.get(5).map_err(q)?;
            let sink: String = row.get(6).map_err(q)?;
            outputs.push(Output {
                id: parse_uuid(&id)?,
                flow_id,
                platform: row.get(1).map_err(q)?,
                name: row.get(2).map_err(q)?,
                accepts: serde_json::from_str(&accepts)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
                is_default: is_default != 0,
                credentials: SinkCredentials {
                    token: SecretString::from(token),
                },
                sink: serde_json::from_str::<SinkConfig>(&sink)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
            });
        }

        Ok((inputs, outputs))
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn q(e: libsql::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Serialization(format!("bad uuid '{s}': {e}")))
}

/// Parse an RFC 3339 datetime string written by this backend.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn discussion_status_to_str(status: DiscussionStatus) -> &'static str {
    match status {
        DiscussionStatus::Pending => "pending",
        DiscussionStatus::Processing => "processing",
        DiscussionStatus::Completed => "completed",
        DiscussionStatus::Failed => "failed",
    }
}

fn str_to_discussion_status(s: &str) -> DiscussionStatus {
    match s {
        "processing" => DiscussionStatus::Processing,
        "completed" => DiscussionStatus::Completed,
        "failed" => DiscussionStatus::Failed,
        _ => DiscussionStatus::Pending,
    }
}

fn str_to_stage(s: &str) -> JobStage {
    match s {
        "job_creation" => JobStage::JobCreation,
        "thread_building" => JobStage::ThreadBuilding,
        "ai_analysis" => JobStage::AiAnalysis,
        "task_delivery" => JobStage::TaskDelivery,
        "notification" => JobStage::Notification,
        "completion" => JobStage::Completion,
        _ => JobStage::Ingestion,
    }
}

fn job_status_to_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Pending => "pending",
        JobStatus::Processing => "processing",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Retrying => "retrying",
    }
}

fn str_to_job_status(s: &str) -> JobStatus {
    match s {
        "processing" => JobStatus::Processing,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "retrying" => JobStatus::Retrying,
        _ => JobStatus::Pending,
    }
}

fn str_to_mapping_type(s: &str) -> MappingType {
    match s {
        "manual" => MappingType::Manual,
        "auto_matched" => MappingType::AutoMatched,
        _ => MappingType::DiscoveredUnmapped,
    }
}

/// Map a row from the discussions table (full column order).
fn row_to_discussion(row: &libsql::Row) -> Result<Discussion, StoreError> {
    let id: String = row.get(0).map_err(q)?;
    let flow_id: String = row.get(1).map_err(q)?;
    let thread: Option<String> = row.get(8).ok();
    let status: String = row.get(9).map_err(q)?;
    let tasks: String = row.get(11).map_err(q)?;
    let created: String = row.get(12).map_err(q)?;
    let updated: String = row.get(13).map_err(q)?;

    Ok(Discussion {
        id: parse_uuid(&id)?,
        flow_id: parse_uuid(&flow_id)?,
        platform: row.get(2).map_err(q)?,
        workspace_id: row.get(3).map_err(q)?,
        thread_ref: ThreadRef {
            channel_id: row.get(4).map_err(q)?,
            thread_id: row.get(5).map_err(q)?,
        },
        title: row.get(6).map_err(q)?,
        raw_content: row.get(7).map_err(q)?,
        thread: thread
            .filter(|t| !t.is_empty())
            .map(|t| serde_json::from_str(&t))
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        status: str_to_discussion_status(&status),
        summary: row.get(10).ok(),
        tasks: serde_json::from_str(&tasks)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

/// Map a row from the jobs table (full column order).
fn row_to_job(row: &libsql::Row) -> Result<Job, StoreError> {
    let id: String = row.get(0).map_err(q)?;
    let discussion_id: String = row.get(1).map_err(q)?;
    let stage: String = row.get(2).map_err(q)?;
    let status: String = row.get(3).map_err(q)?;
    let attempts: i64 = row.get(4).map_err(q)?;
    let max_attempts: i64 = row.get(5).map_err(q)?;
    let delivered: String = row.get(7).map_err(q)?;
    let partial: i64 = row.get(8).map_err(q)?;
    let created: String = row.get(9).map_err(q)?;
    let updated: String = row.get(10).map_err(q)?;
    let completed: Option<String> = row.get(11).ok();

    Ok(Job {
        id: parse_uuid(&id)?,
        discussion_id: parse_uuid(&discussion_id)?,
        stage: str_to_stage(&stage),
        status: str_to_job_status(&status),
        attempts: attempts as u32,
        max_attempts: max_attempts as u32,
        last_error: row.get(6).ok(),
        delivered: serde_json::from_str(&delivered)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        partial_delivery: partial != 0,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
        completed_at: completed.filter(|s| !s.is_empty()).map(|s| parse_datetime(&s)),
    })
}

fn row_to_mapping(row: &libsql::Row) -> Result<UserMapping, StoreError> {
    let confidence: f64 = row.get(5).map_err(q)?;
    let mapping_type: String = row.get(6).map_err(q)?;
    Ok(UserMapping {
        platform: row.get(0).map_err(q)?,
        workspace_id: row.get(1).map_err(q)?,
        source_user_id: row.get(2).map_err(q)?,
        dest_user_id: row.get(3).ok(),
        email: row.get(4).ok(),
        confidence: confidence as f32,
        mapping_type: str_to_mapping_type(&mapping_type),
    })
}

const DISCUSSION_COLUMNS: &str = "id, flow_id, platform, workspace_id, channel_id, thread_id, \
     title, raw_content, thread, status, summary, tasks, created_at, updated_at";

const JOB_COLUMNS: &str = "id, discussion_id, stage, status, attempts, max_attempts, last_error, \
     delivered, partial_delivery, created_at, updated_at, completed_at";

#[async_trait]
impl Store for LibSqlStore {
    async fn load_flow_by_workspace(
        &self,
        platform: &str,
        workspace_id: &str,
    ) -> Result<Option<Flow>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT f.id, f.name, f.enabled, f.topics, f.classifier
                 FROM flows f JOIN inputs i ON i.flow_id = f.id
                 WHERE i.platform = ?1 AND i.workspace_id = ?2 AND f.enabled = 1
                 LIMIT 1",
                params![platform, workspace_id],
            )
            .await
            .map_err(q)?;

        let Some(row) = rows.next().await.map_err(q)? else {
            return Ok(None);
        };

        let id_str: String = row.get(0).map_err(q)?;
        let topics: String = row.get(3).map_err(q)?;
        let classifier: String = row.get(4).map_err(q)?;
        let enabled: i64 = row.get(2).map_err(q)?;
        let id = parse_uuid(&id_str)?;

        let (inputs, outputs) = self.load_flow_parts(id).await?;

        Ok(Some(Flow {
            id,
            name: row.get(1).map_err(q)?,
            enabled: enabled != 0,
            topics: serde_json::from_str(&topics)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            classifier: serde_json::from_str::<ClassifierSettings>(&classifier)
                .unwrap_or_default(),
            inputs,
            outputs,
        }))
    }

    async fn flow_exists(&self, flow_id: Uuid) -> Result<bool, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM flows WHERE id = ?1",
                params![flow_id.to_string()],
            )
            .await
            .map_err(q)?;
        Ok(rows.next().await.map_err(q)?.is_some())
    }

    async fn insert_discussion(&self, discussion: &Discussion) -> Result<(), StoreError> {
        let thread = discussion
            .thread
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let tasks = serde_json::to_string(&discussion.tasks)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        self.conn
            .execute(
                &format!(
                    "INSERT INTO discussions ({DISCUSSION_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    discussion.id.to_string(),
                    discussion.flow_id.to_string(),
                    discussion.platform.clone(),
                    discussion.workspace_id.clone(),
                    discussion.thread_ref.channel_id.clone(),
                    discussion.thread_ref.thread_id.clone(),
                    discussion.title.clone(),
                    discussion.raw_content.clone(),
                    thread,
                    discussion_status_to_str(discussion.status),
                    discussion.summary.clone(),
                    tasks,
                    discussion.created_at.to_rfc3339(),
                    discussion.updated_at.to_rfc3339()
                ],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn get_discussion(&self, id: Uuid) -> Result<Option<Discussion>, StoreError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {DISCUSSION_COLUMNS} FROM discussions WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => Ok(Some(row_to_discussion(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_discussion(&self, discussion: &Discussion) -> Result<(), StoreError> {
        let thread = discussion
            .thread
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let tasks = serde_json::to_string(&discussion.tasks)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let affected = self
            .conn
            .execute(
                "UPDATE discussions
                 SET thread = ?2, status = ?3, summary = ?4, tasks = ?5, updated_at = ?6
                 WHERE id = ?1",
                params![
                    discussion.id.to_string(),
                    thread,
                    discussion_status_to_str(discussion.status),
                    discussion.summary.clone(),
                    tasks,
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(q)?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "discussion".into(),
                id: discussion.id.to_string(),
            });
        }
        Ok(())
    }

    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        let delivered = serde_json::to_string(&job.delivered)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    job.id.to_string(),
                    job.discussion_id.to_string(),
                    job.stage.as_str(),
                    job_status_to_str(job.status),
                    job.attempts as i64,
                    job.max_attempts as i64,
                    job.last_error.clone(),
                    delivered,
                    job.partial_delivery as i64,
                    job.created_at.to_rfc3339(),
                    job.updated_at.to_rfc3339(),
                    job.completed_at.map(|t| t.to_rfc3339())
                ],
            )
            .await
            .map_err(q)?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_active_job(&self, discussion_id: Uuid) -> Result<Option<Job>, StoreError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE discussion_id = ?1
                       AND status IN ('pending', 'processing', 'retrying')
                     LIMIT 1"
                ),
                params![discussion_id.to_string()],
            )
            .await
            .map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn persist_job_transition(
        &self,
        job_id: Uuid,
        patch: &JobPatch,
    ) -> Result<Job, StoreError> {
        let mut job = self.get_job(job_id).await?.ok_or_else(|| StoreError::NotFound {
            entity: "job".into(),
            id: job_id.to_string(),
        })?;
        patch.apply(&mut job);

        let delivered = serde_json::to_string(&job.delivered)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.conn
            .execute(
                "UPDATE jobs
                 SET stage = ?2, status = ?3, attempts = ?4, last_error = ?5,
                     delivered = ?6, partial_delivery = ?7, updated_at = ?8, completed_at = ?9
                 WHERE id = ?1",
                params![
                    job.id.to_string(),
                    job.stage.as_str(),
                    job_status_to_str(job.status),
                    job.attempts as i64,
                    job.last_error.clone(),
                    delivered,
                    job.partial_delivery as i64,
                    job.updated_at.to_rfc3339(),
                    job.completed_at.map(|t| t.to_rfc3339())
                ],
            )
            .await
            .map_err(q)?;
        Ok(job)
    }

    async fn find_user_mapping(
        &self,
        platform: &str,
        workspace_id: &str,
        source_user_id: &str,
    ) -> Result<Option<UserMapping>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT platform, workspace_id, source_user_id, dest_user_id, email,
                        confidence, mapping_type
                 FROM user_mappings
                 WHERE platform = ?1 AND workspace_id = ?2 AND source_user_id = ?3",
                params![platform, workspace_id, source_user_id],
            )
            .await
            .map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => Ok(Some(row_to_mapping(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_user_mapping_by_email(
        &self,
        platform: &str,
        workspace_id: &str,
        email: &str,
    ) -> Result<Option<UserMapping>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT platform, workspace_id, source_user_id, dest_user_id, email,
                        confidence, mapping_type
                 FROM user_mappings
                 WHERE platform = ?1 AND workspace_id = ?2
                   AND lower(email) = lower(?3) AND dest_user_id IS NOT NULL
                 LIMIT 1",
                params![platform, workspace_id, email],
            )
            .await
            .map_err(q)?;
        match rows.next().await.map_err(q)? {
            Some(row) => Ok(Some(row_to_mapping(&row)?)),
            None => Ok(None),
        }
    }

    async fn persist_user_mapping(&self, mapping: &UserMapping) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO user_mappings
                 (platform, workspace_id, source_user_id, dest_user_id, email,
                  confidence, mapping_type)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    mapping.platform.clone(),
                    mapping.workspace_id.clone(),
                    mapping.source_user_id.clone(),
                    mapping.dest_user_id.clone(),
                    mapping.email.clone(),
                    mapping.confidence as f64,
                    mapping.mapping_type.as_str()
                ],
            )
            .await
            .map_err(q)?;
        Ok(())
    }
}
