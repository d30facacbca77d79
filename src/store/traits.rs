//! The `Store` trait — the only persistence surface the core touches.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Discussion, Flow, Job, JobPatch, UserMapping};

/// Backend-agnostic persistence contract.
///
/// Read operations on Flow records are lookups only; the admin layer owns
/// their lifecycle, and a Flow may disappear between lookup and use — the
/// core checks `flow_exists` defensively before acting on one.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Flow configuration (read-only) ──────────────────────────────

    /// Resolve the flow owning a `(platform, workspace_id)` input binding.
    ///
    /// Keyed by stable identifiers, never by content inspection. Returns
    /// `None` when no enabled flow claims the workspace.
    async fn load_flow_by_workspace(
        &self,
        platform: &str,
        workspace_id: &str,
    ) -> Result<Option<Flow>, StoreError>;

    /// Existence check used before acting on a previously-resolved flow.
    async fn flow_exists(&self, flow_id: Uuid) -> Result<bool, StoreError>;

    // ── Discussions ─────────────────────────────────────────────────

    async fn insert_discussion(&self, discussion: &Discussion) -> Result<(), StoreError>;

    async fn get_discussion(&self, id: Uuid) -> Result<Option<Discussion>, StoreError>;

    /// Overwrite a discussion's mutable fields (status, thread snapshot,
    /// summary, tasks). Only the orchestrator calls this.
    async fn update_discussion(&self, discussion: &Discussion) -> Result<(), StoreError>;

    // ── Jobs ────────────────────────────────────────────────────────

    async fn create_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// The discussion's active (non-terminal) job, if any.
    async fn get_active_job(&self, discussion_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Apply a patch to a job and persist it. Returns the updated job.
    /// Every stage transition goes through here before the stage runs.
    async fn persist_job_transition(
        &self,
        job_id: Uuid,
        patch: &JobPatch,
    ) -> Result<Job, StoreError>;

    // ── User mappings ───────────────────────────────────────────────

    /// Exact lookup on `(platform, workspace_id, source_user_id)`.
    async fn find_user_mapping(
        &self,
        platform: &str,
        workspace_id: &str,
        source_user_id: &str,
    ) -> Result<Option<UserMapping>, StoreError>;

    /// Case-insensitive email lookup within the same workspace scope.
    /// Only returns mappings that actually have a destination user.
    async fn find_user_mapping_by_email(
        &self,
        platform: &str,
        workspace_id: &str,
        email: &str,
    ) -> Result<Option<UserMapping>, StoreError>;

    /// Insert or replace a mapping keyed by
    /// `(platform, workspace_id, source_user_id)`.
    async fn persist_user_mapping(&self, mapping: &UserMapping) -> Result<(), StoreError>;
}
