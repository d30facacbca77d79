//! In-memory store backend for tests and single-process development runs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Discussion, Flow, Job, JobPatch, UserMapping};
use crate::store::traits::Store;

/// Mapping key: (platform, workspace, source user id).
type MappingKey = (String, String, String);

/// Everything in `RwLock<HashMap>`s. Clones on read, which is fine at the
/// volumes tests and dev runs see.
#[derive(Default)]
pub struct MemoryStore {
    flows: RwLock<HashMap<Uuid, Flow>>,
    discussions: RwLock<HashMap<Uuid, Discussion>>,
    jobs: RwLock<HashMap<Uuid, Job>>,
    mappings: RwLock<HashMap<MappingKey, UserMapping>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed a flow. Stands in for the external admin layer.
    pub async fn add_flow(&self, flow: Flow) {
        self.flows.write().await.insert(flow.id, flow);
    }

    /// Remove a flow. Lets tests simulate the admin layer deleting one
    /// between lookup and use.
    pub async fn remove_flow(&self, flow_id: Uuid) {
        self.flows.write().await.remove(&flow_id);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_flow_by_workspace(
        &self,
        platform: &str,
        workspace_id: &str,
    ) -> Result<Option<Flow>, StoreError> {
        let flows = self.flows.read().await;
        Ok(flows
            .values()
            .find(|f| {
                f.enabled
                    && f.inputs
                        .iter()
                        .any(|i| i.platform == platform && i.workspace_id == workspace_id)
            })
            .cloned())
    }

    async fn flow_exists(&self, flow_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.flows.read().await.contains_key(&flow_id))
    }

    async fn insert_discussion(&self, discussion: &Discussion) -> Result<(), StoreError> {
        let mut discussions = self.discussions.write().await;
        if discussions.contains_key(&discussion.id) {
            return Err(StoreError::Constraint(format!(
                "discussion {} already exists",
                discussion.id
            )));
        }
        discussions.insert(discussion.id, discussion.clone());
        Ok(())
    }

    async fn get_discussion(&self, id: Uuid) -> Result<Option<Discussion>, StoreError> {
        Ok(self.discussions.read().await.get(&id).cloned())
    }

    async fn update_discussion(&self, discussion: &Discussion) -> Result<(), StoreError> {
        let mut discussions = self.discussions.write().await;
        if !discussions.contains_key(&discussion.id) {
            return Err(StoreError::NotFound {
                entity: "discussion".into(),
                id: discussion.id.to_string(),
            });
        }
        discussions.insert(discussion.id, discussion.clone());
        Ok(())
    }

    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn get_active_job(&self, discussion_id: Uuid) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .find(|j| j.discussion_id == discussion_id && j.status.is_active())
            .cloned())
    }

    async fn persist_job_transition(
        &self,
        job_id: Uuid,
        patch: &JobPatch,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&job_id).ok_or_else(|| StoreError::NotFound {
            entity: "job".into(),
            id: job_id.to_string(),
        })?;
        patch.apply(job);
        Ok(job.clone())
    }

    async fn find_user_mapping(
        &self,
        platform: &str,
        workspace_id: &str,
        source_user_id: &str,
    ) -> Result<Option<UserMapping>, StoreError> {
        let key = (
            platform.to_string(),
            workspace_id.to_string(),
            source_user_id.to_string(),
        );
        Ok(self.mappings.read().await.get(&key).cloned())
    }

    async fn find_user_mapping_by_email(
        &self,
        platform: &str,
        workspace_id: &str,
        email: &str,
    ) -> Result<Option<UserMapping>, StoreError> {
        let email_lower = email.to_lowercase();
        let mappings = self.mappings.read().await;
        Ok(mappings
            .values()
            .find(|m| {
                m.platform == platform
                    && m.workspace_id == workspace_id
                    && m.dest_user_id.is_some()
                    && m.email
                        .as_ref()
                        .is_some_and(|e| e.to_lowercase() == email_lower)
            })
            .cloned())
    }

    async fn persist_user_mapping(&self, mapping: &UserMapping) -> Result<(), StoreError> {
        let key = (
            mapping.platform.clone(),
            mapping.workspace_id.clone(),
            mapping.source_user_id.clone(),
        );
        self.mappings.write().await.insert(key, mapping.clone());
        Ok(())
    }
}
