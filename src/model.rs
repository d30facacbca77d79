//! Core data model — flows, discussions, jobs, tasks, user mappings.
//!
//! Flow/Input/Output records are created by the external admin layer and
//! read-only here. Discussions and Jobs are owned by the pipeline.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ConfigError;

// ── Flow configuration ──────────────────────────────────────────────

/// Per-flow AI classifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierSettings {
    /// Model identifier passed to the classifier backend.
    pub model: String,
    /// Upper bound on tasks extracted from one thread.
    pub max_tasks: usize,
    /// Sampling temperature (kept low — classification, not generation).
    pub temperature: f32,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            max_tasks: 10,
            temperature: 0.1,
        }
    }
}

/// A named routing configuration bundling inputs, outputs and classifier
/// settings. Owned by the external admin layer.
#[derive(Debug, Clone)]
pub struct Flow {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    /// Topic labels this flow cares about (advisory, used in prompts).
    pub topics: Vec<String>,
    pub classifier: ClassifierSettings,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
}

impl Flow {
    /// Validate the flow invariants at load time.
    ///
    /// Exactly one output must be marked default. Routing relies on this;
    /// a violation is a configuration error, not a routing-time concern.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let defaults = self.outputs.iter().filter(|o| o.is_default).count();
        if defaults != 1 {
            return Err(ConfigError::InvalidFlow {
                flow_id: self.id,
                reason: format!("expected exactly 1 default output, found {defaults}"),
            });
        }
        Ok(())
    }

    /// The default output. Call `validate()` first; after that this cannot
    /// fail, but the accessor still returns an Option to avoid panics.
    pub fn default_output(&self) -> Option<&Output> {
        self.outputs.iter().find(|o| o.is_default)
    }

    /// Non-default outputs, in configuration order.
    pub fn candidate_outputs(&self) -> Vec<&Output> {
        self.outputs.iter().filter(|o| !o.is_default).collect()
    }
}

/// One configured source binding: which platform workspace feeds this flow.
#[derive(Debug, Clone)]
pub struct Input {
    pub id: Uuid,
    pub flow_id: Uuid,
    /// Platform type string, e.g. "slack".
    pub platform: String,
    /// Stable workspace identifier used to resolve the owning flow.
    pub workspace_id: String,
    pub credentials: SourceCredentials,
}

/// One configured sink binding with its accepted-topic filter.
#[derive(Debug, Clone)]
pub struct Output {
    pub id: Uuid,
    pub flow_id: Uuid,
    /// Platform type string, e.g. "linear" or "github".
    pub platform: String,
    pub name: String,
    /// Accepted topic labels. Empty means "accept all".
    pub accepts: Vec<String>,
    pub is_default: bool,
    pub credentials: SinkCredentials,
    pub sink: SinkConfig,
}

/// Sink-specific field-mapping rules, one variant per sink platform.
///
/// Deserialization dispatches on the `platform` tag, so admin-layer records
/// stay a single JSON column while the core gets a checked sum type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "platform", rename_all = "snake_case")]
pub enum SinkConfig {
    Linear {
        team_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_id: Option<String>,
        /// Label id applied to every created issue.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label_id: Option<String>,
    },
    Github {
        owner: String,
        repo: String,
        #[serde(default)]
        labels: Vec<String>,
    },
}

impl SinkConfig {
    /// The platform tag this config belongs to.
    pub fn platform(&self) -> &'static str {
        match self {
            Self::Linear { .. } => "linear",
            Self::Github { .. } => "github",
        }
    }
}

// ── Credentials ─────────────────────────────────────────────────────

/// Credentials for a source platform.
#[derive(Debug, Clone)]
pub struct SourceCredentials {
    /// API token used for thread fetches and replies.
    pub token: SecretString,
    /// Shared secret for webhook signature verification.
    pub signing_secret: SecretString,
}

/// Credentials for a sink platform.
#[derive(Debug, Clone)]
pub struct SinkCredentials {
    pub token: SecretString,
}

impl SinkCredentials {
    /// Stable fingerprint for per-credential throttling. Not reversible.
    pub fn fingerprint(&self) -> String {
        use secrecy::ExposeSecret;
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(self.token.expose_secret().as_bytes());
        hex::encode(&digest[..8])
    }
}

// ── Discussions ─────────────────────────────────────────────────────

/// Lifecycle of an ingested discussion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscussionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for DiscussionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A message in a discussion thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMessage {
    /// Platform-native author identifier.
    pub author: String,
    /// Human-readable author name, when the platform provides one.
    pub author_name: Option<String>,
    pub content: String,
    pub posted_at: Option<DateTime<Utc>>,
}

/// Snapshot of a discussion thread: root message plus ordered replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub root: ThreadMessage,
    pub replies: Vec<ThreadMessage>,
}

impl ThreadSnapshot {
    /// Total message count including the root.
    pub fn message_count(&self) -> usize {
        1 + self.replies.len()
    }
}

/// Opaque reference to a thread on its source platform.
///
/// The channel and timestamp/message id pair is enough for every source
/// platform shipped so far to re-fetch and reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRef {
    pub channel_id: String,
    pub thread_id: String,
}

/// Durable record of one ingested event.
#[derive(Debug, Clone)]
pub struct Discussion {
    pub id: Uuid,
    pub flow_id: Uuid,
    pub platform: String,
    pub workspace_id: String,
    pub thread_ref: ThreadRef,
    pub title: String,
    /// Raw event content as received at the webhook boundary. Kept so a
    /// manual reprocess can skip ingestion entirely.
    pub raw_content: String,
    pub thread: Option<ThreadSnapshot>,
    pub status: DiscussionStatus,
    /// AI-produced summary, set after analysis.
    pub summary: Option<String>,
    /// Extracted tasks, set after analysis.
    pub tasks: Vec<DetectedTask>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Discussion {
    pub fn new(
        flow_id: Uuid,
        platform: impl Into<String>,
        workspace_id: impl Into<String>,
        thread_ref: ThreadRef,
        title: impl Into<String>,
        raw_content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            flow_id,
            platform: platform.into(),
            workspace_id: workspace_id.into(),
            thread_ref,
            title: title.into(),
            raw_content: raw_content.into(),
            thread: None,
            status: DiscussionStatus::Pending,
            summary: None,
            tasks: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Detected tasks ──────────────────────────────────────────────────

/// Priority of a detected task, when the classifier commits to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Urgent,
}

/// One actionable item extracted from a discussion.
///
/// Every optional field stays `None` when the classifier is not confident.
/// Nothing downstream may coerce a `None` into a guessed value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedTask {
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    /// Raw source-platform mention token (user id or email), unresolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
}

// ── Jobs ────────────────────────────────────────────────────────────

/// Pipeline stages, strictly ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Ingestion,
    JobCreation,
    ThreadBuilding,
    AiAnalysis,
    TaskDelivery,
    Notification,
    Completion,
}

impl JobStage {
    /// The stage after this one, or `None` at the end of the pipeline.
    pub fn next(&self) -> Option<JobStage> {
        match self {
            Self::Ingestion => Some(Self::JobCreation),
            Self::JobCreation => Some(Self::ThreadBuilding),
            Self::ThreadBuilding => Some(Self::AiAnalysis),
            Self::AiAnalysis => Some(Self::TaskDelivery),
            Self::TaskDelivery => Some(Self::Notification),
            Self::Notification => Some(Self::Completion),
            Self::Completion => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ingestion => "ingestion",
            Self::JobCreation => "job_creation",
            Self::ThreadBuilding => "thread_building",
            Self::AiAnalysis => "ai_analysis",
            Self::TaskDelivery => "task_delivery",
            Self::Notification => "notification",
            Self::Completion => "completion",
        }
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a processing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl JobStatus {
    /// Terminal statuses never transition again without a manual reprocess.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Active statuses block creation of a second job for the discussion.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        };
        write!(f, "{s}")
    }
}

/// Per-task delivery outcome recorded on the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDelivery {
    pub task_title: String,
    pub output_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskDelivery {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// One processing attempt against a discussion, tracked through the
/// pipeline stages. A discussion has at most one active job at a time.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub discussion_id: Uuid,
    pub stage: JobStage,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub delivered: Vec<TaskDelivery>,
    pub partial_delivery: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(discussion_id: Uuid, stage: JobStage, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            discussion_id,
            stage,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            last_error: None,
            delivered: Vec::new(),
            partial_delivery: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Partial update applied to a job at each persisted transition.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub stage: Option<JobStage>,
    pub status: Option<JobStatus>,
    pub attempts: Option<u32>,
    pub last_error: Option<Option<String>>,
    pub delivered: Option<Vec<TaskDelivery>>,
    pub partial_delivery: Option<bool>,
}

impl JobPatch {
    pub fn stage(stage: JobStage, status: JobStatus) -> Self {
        Self {
            stage: Some(stage),
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(Some(error.into()));
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Apply this patch to a job in place, refreshing `updated_at` and
    /// stamping `completed_at` on terminal transitions.
    pub fn apply(&self, job: &mut Job) {
        if let Some(stage) = self.stage {
            job.stage = stage;
        }
        if let Some(status) = self.status {
            job.status = status;
            if status.is_terminal() && job.completed_at.is_none() {
                job.completed_at = Some(Utc::now());
            }
        }
        if let Some(attempts) = self.attempts {
            job.attempts = attempts;
        }
        if let Some(ref err) = self.last_error {
            job.last_error = err.clone();
        }
        if let Some(ref delivered) = self.delivered {
            job.delivered = delivered.clone();
        }
        if let Some(partial) = self.partial_delivery {
            job.partial_delivery = partial;
        }
        job.updated_at = Utc::now();
    }
}

// ── User mappings ───────────────────────────────────────────────────

/// How a user mapping came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingType {
    /// Entered by a human through the admin layer.
    Manual,
    /// Matched automatically by email within the same workspace.
    AutoMatched,
    /// Seen in a mention but never resolved; placeholder for the admin UI.
    DiscoveredUnmapped,
}

impl MappingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::AutoMatched => "auto_matched",
            Self::DiscoveredUnmapped => "discovered_unmapped",
        }
    }
}

/// Workspace-scoped association from a source-platform user to a
/// destination-platform user. The same raw user id is not globally unique
/// across workspaces, so workspace scoping is mandatory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMapping {
    pub platform: String,
    pub workspace_id: String,
    pub source_user_id: String,
    /// Destination user id; `None` for discovered-unmapped placeholders.
    pub dest_user_id: Option<String>,
    /// Email associated with the source user, when known.
    pub email: Option<String>,
    pub confidence: f32,
    pub mapping_type: MappingType,
}
