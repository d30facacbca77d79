//! Pipeline orchestrator — drives a job through the processing stages.
//!
//! Stage order is total per job: ingestion → job_creation → thread_building
//! → ai_analysis → task_delivery → notification → completion. Every
//! transition is persisted before the stage runs. Failures back off and
//! re-enter the same stage until attempts run out; non-retryable errors go
//! straight to `failed`.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapters::{AdapterRegistry, MentionScope, ParsedDiscussion, SinkThrottle};
use crate::classifier::Classifier;
use crate::config::RelayConfig;
use crate::error::{IngressError, PipelineError};
use crate::mentions::MentionResolver;
use crate::model::{
    Discussion, DiscussionStatus, Flow, Input, Job, JobPatch, JobStage, JobStatus, TaskDelivery,
};
use crate::retry::{with_retry, RetryClass, RetryPolicy};
use crate::router::ConfidenceRouter;
use crate::store::Store;

/// Collaborators injected into the processor.
pub struct ProcessorDeps {
    pub store: Arc<dyn Store>,
    pub registry: Arc<AdapterRegistry>,
    pub classifier: Arc<dyn Classifier>,
    pub resolver: Arc<MentionResolver>,
    pub throttle: Arc<SinkThrottle>,
}

/// The pipeline orchestrator.
///
/// One `run()` per job; jobs share nothing mutable and may run concurrently.
pub struct Processor {
    store: Arc<dyn Store>,
    registry: Arc<AdapterRegistry>,
    classifier: Arc<dyn Classifier>,
    resolver: Arc<MentionResolver>,
    throttle: Arc<SinkThrottle>,
    router: ConfidenceRouter,
    stage_retry: RetryPolicy,
    delivery_retry: RetryPolicy,
}

impl Processor {
    pub fn new(config: &RelayConfig, deps: ProcessorDeps) -> Arc<Self> {
        Arc::new(Self {
            store: deps.store,
            registry: deps.registry,
            classifier: deps.classifier,
            resolver: deps.resolver,
            throttle: deps.throttle,
            router: ConfidenceRouter::new(config.router),
            stage_retry: config.stage_retry,
            delivery_retry: config.delivery_retry,
        })
    }

    // ── Intake ──────────────────────────────────────────────────────

    /// Create a discussion + job pair for a freshly parsed event.
    ///
    /// Called by the ingress before handing off; the pair is persisted in
    /// `pending` so a crash between intake and processing loses nothing.
    pub async fn intake(
        &self,
        flow: &Flow,
        platform: &str,
        parsed: ParsedDiscussion,
        raw_body: String,
    ) -> Result<(Discussion, Job), PipelineError> {
        let discussion = Discussion::new(
            flow.id,
            platform,
            parsed.workspace_id,
            parsed.thread_ref,
            parsed.title,
            raw_body,
        );
        self.store.insert_discussion(&discussion).await?;

        let job = Job::new(discussion.id, JobStage::Ingestion, self.stage_retry.max_attempts);
        self.store.create_job(&job).await?;

        info!(
            discussion = %discussion.id,
            job = %job.id,
            flow = %flow.id,
            "Discussion ingested"
        );
        Ok((discussion, job))
    }

    /// Create a fresh job for a failed discussion (manual reprocess).
    ///
    /// Re-enters `thread_building` from the stored raw payload; ingestion is
    /// not repeated. The active-job check is optimistic; single active job
    /// per discussion is advisory, not safety-critical.
    pub async fn reprocess(&self, discussion_id: Uuid) -> Result<Job, IngressError> {
        let Some(_discussion) = self.store.get_discussion(discussion_id).await? else {
            return Err(IngressError::DiscussionNotFound(discussion_id));
        };
        if self.store.get_active_job(discussion_id).await?.is_some() {
            return Err(IngressError::JobConflict(discussion_id));
        }

        let job = Job::new(
            discussion_id,
            JobStage::ThreadBuilding,
            self.stage_retry.max_attempts,
        );
        self.store.create_job(&job).await.map_err(IngressError::from)?;
        info!(discussion = %discussion_id, job = %job.id, "Manual reprocess requested");
        Ok(job)
    }

    /// Spawn `run()` on a fresh task. The caller returns immediately.
    pub fn spawn(self: &Arc<Self>, job_id: Uuid) {
        let processor = Arc::clone(self);
        tokio::spawn(async move {
            processor.run(job_id).await;
        });
    }

    // ── State machine ───────────────────────────────────────────────

    /// Drive one job to a terminal state. Never panics; terminal failures
    /// are persisted and logged.
    pub async fn run(&self, job_id: Uuid) {
        if let Err(e) = self.run_job(job_id).await {
            error!(job = %job_id, error = %e, "Job ended in failure");
        }
    }

    async fn run_job(&self, job_id: Uuid) -> Result<(), PipelineError> {
        let mut job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| PipelineError::Stage {
                stage: "startup".into(),
                reason: format!("job {job_id} not found"),
            })?;

        if job.status.is_terminal() {
            warn!(job = %job_id, status = %job.status, "Job already terminal, nothing to do");
            return Ok(());
        }

        let mut discussion = self
            .store
            .get_discussion(job.discussion_id)
            .await?
            .ok_or_else(|| PipelineError::Stage {
                stage: "startup".into(),
                reason: format!("discussion {} not found", job.discussion_id),
            })?;

        // Configuration races are expected: the admin layer may have deleted
        // the flow since ingestion. Skip the orphan with a warning.
        let flow = match self.load_flow(&discussion).await {
            Ok(flow) => flow,
            Err(e) => {
                warn!(
                    discussion = %discussion.id,
                    flow = %discussion.flow_id,
                    error = %e,
                    "Skipping job for orphaned flow reference"
                );
                self.fail_job(&job, &mut discussion, &e).await;
                return Err(e);
            }
        };

        loop {
            // Persist the transition before the stage runs.
            job = self
                .store
                .persist_job_transition(
                    job.id,
                    &JobPatch::stage(job.stage, JobStatus::Processing)
                        .with_attempts(job.attempts),
                )
                .await?;
            debug!(job = %job.id, stage = %job.stage, "Entering stage");

            match self.execute_stage(job.stage, &flow, &mut discussion, &mut job).await {
                Ok(()) => match job.stage.next() {
                    Some(next) => {
                        // Attempts count retries of the current stage; a
                        // clean advance resets them.
                        job.stage = next;
                        job.attempts = 0;
                    }
                    None => {
                        self.store
                            .persist_job_transition(job.id, &JobPatch::status(JobStatus::Completed))
                            .await?;
                        info!(
                            job = %job.id,
                            discussion = %discussion.id,
                            delivered = job.delivered.iter().filter(|d| d.succeeded()).count(),
                            partial = job.partial_delivery,
                            "Job completed"
                        );
                        return Ok(());
                    }
                },
                Err(e) if !e.is_retryable() => {
                    self.fail_job(&job, &mut discussion, &e).await;
                    return Err(e);
                }
                Err(e) => {
                    let attempts = job.attempts + 1;
                    if attempts < job.max_attempts {
                        job = self
                            .store
                            .persist_job_transition(
                                job.id,
                                &JobPatch::status(JobStatus::Retrying)
                                    .with_error(e.to_string())
                                    .with_attempts(attempts),
                            )
                            .await?;
                        let delay = self.stage_retry.delay_for(attempts - 1);
                        warn!(
                            job = %job.id,
                            stage = %job.stage,
                            attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Stage failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        // Loop re-enters the same stage.
                    } else {
                        self.store
                            .persist_job_transition(
                                job.id,
                                &JobPatch::status(JobStatus::Failed)
                                    .with_error(e.to_string())
                                    .with_attempts(attempts),
                            )
                            .await
                            .ok();
                        discussion.status = DiscussionStatus::Failed;
                        self.store.update_discussion(&discussion).await.ok();
                        warn!(
                            job = %job.id,
                            stage = %job.stage,
                            attempts,
                            error = %e,
                            "Retries exhausted, job failed"
                        );
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Persist a non-retryable failure. Best-effort: the job is already
    /// lost, so store errors here are logged and swallowed.
    async fn fail_job(&self, job: &Job, discussion: &mut Discussion, error: &PipelineError) {
        self.store
            .persist_job_transition(
                job.id,
                &JobPatch::status(JobStatus::Failed).with_error(error.to_string()),
            )
            .await
            .ok();
        discussion.status = DiscussionStatus::Failed;
        self.store.update_discussion(discussion).await.ok();
    }

    /// Re-resolve and validate the flow for a discussion.
    async fn load_flow(&self, discussion: &Discussion) -> Result<Flow, PipelineError> {
        if !self.store.flow_exists(discussion.flow_id).await? {
            return Err(PipelineError::FlowGone {
                flow_id: discussion.flow_id,
            });
        }
        let flow = self
            .store
            .load_flow_by_workspace(&discussion.platform, &discussion.workspace_id)
            .await?
            .filter(|f| f.id == discussion.flow_id)
            .ok_or(PipelineError::FlowGone {
                flow_id: discussion.flow_id,
            })?;
        flow.validate().map_err(|_| PipelineError::NoDefaultOutput {
            flow_id: flow.id,
        })?;
        Ok(flow)
    }

    fn input_for<'a>(
        &self,
        flow: &'a Flow,
        discussion: &Discussion,
    ) -> Result<&'a Input, PipelineError> {
        flow.inputs
            .iter()
            .find(|i| {
                i.platform == discussion.platform && i.workspace_id == discussion.workspace_id
            })
            .ok_or_else(|| PipelineError::MissingInput {
                flow_id: flow.id,
                workspace_id: discussion.workspace_id.clone(),
            })
    }

    // ── Stages ──────────────────────────────────────────────────────

    async fn execute_stage(
        &self,
        stage: JobStage,
        flow: &Flow,
        discussion: &mut Discussion,
        job: &mut Job,
    ) -> Result<(), PipelineError> {
        match stage {
            // The raw payload and the job record were persisted at the
            // webhook boundary; these stages are checkpoints, not work.
            JobStage::Ingestion | JobStage::JobCreation => Ok(()),
            JobStage::ThreadBuilding => self.build_thread(flow, discussion).await,
            JobStage::AiAnalysis => self.analyze(flow, discussion).await,
            JobStage::TaskDelivery => self.deliver_tasks(flow, discussion, job).await,
            JobStage::Notification => self.notify(flow, discussion, job).await,
            JobStage::Completion => {
                discussion.status = DiscussionStatus::Completed;
                self.store.update_discussion(discussion).await?;
                Ok(())
            }
        }
    }

    async fn build_thread(
        &self,
        flow: &Flow,
        discussion: &mut Discussion,
    ) -> Result<(), PipelineError> {
        let input = self.input_for(flow, discussion)?;
        let source = self.registry.source(&discussion.platform)?;

        let thread = source
            .fetch_thread(&discussion.thread_ref, &input.credentials)
            .await?;

        discussion.thread = Some(thread);
        discussion.status = DiscussionStatus::Processing;
        self.store.update_discussion(discussion).await?;
        Ok(())
    }

    async fn analyze(&self, flow: &Flow, discussion: &mut Discussion) -> Result<(), PipelineError> {
        let thread = discussion.thread.as_ref().ok_or_else(|| PipelineError::Stage {
            stage: JobStage::AiAnalysis.as_str().into(),
            reason: "no thread snapshot on discussion".into(),
        })?;

        let analysis = self
            .classifier
            .classify(thread, &flow.classifier, &flow.topics)
            .await?;

        info!(
            discussion = %discussion.id,
            tasks = analysis.tasks.len(),
            "Thread analyzed"
        );
        discussion.summary = Some(analysis.summary);
        discussion.tasks = analysis.tasks;
        self.store.update_discussion(discussion).await?;
        Ok(())
    }

    /// Fan out one delivery per detected task.
    ///
    /// Sibling failures don't abort the stage; the stage fails only when
    /// every delivery fails. Partial results are recorded per task.
    async fn deliver_tasks(
        &self,
        flow: &Flow,
        discussion: &Discussion,
        job: &mut Job,
    ) -> Result<(), PipelineError> {
        if discussion.tasks.is_empty() {
            debug!(discussion = %discussion.id, "No tasks to deliver");
            return Ok(());
        }

        let default = flow
            .default_output()
            .ok_or(PipelineError::NoDefaultOutput { flow_id: flow.id })?;
        let candidates = flow.candidate_outputs();
        let scope = MentionScope {
            platform: &discussion.platform,
            workspace_id: &discussion.workspace_id,
        };

        // Concurrent across tasks; the throttle serializes any two
        // deliveries that share a credential set.
        let attempts = discussion.tasks.iter().map(|task| {
            let decision = self.router.route(task, &candidates, default);
            let output = decision.output;
            async move {
                let result = match self.registry.sink(&output.platform) {
                    Ok(sink) => {
                        let fingerprint = output.credentials.fingerprint();
                        with_retry(self.delivery_retry, "create_task", || {
                            let sink = Arc::clone(&sink);
                            let fingerprint = fingerprint.clone();
                            async move {
                                self.throttle
                                    .run(&fingerprint, || {
                                        sink.create_task(
                                            task,
                                            &output.sink,
                                            &output.credentials,
                                            scope,
                                            &self.resolver,
                                        )
                                    })
                                    .await
                            }
                        })
                        .await
                    }
                    Err(e) => Err(e),
                };
                (task, output, decision.confidence, result)
            }
        });

        let mut deliveries = Vec::with_capacity(discussion.tasks.len());
        for (task, output, confidence, result) in futures::future::join_all(attempts).await {
            match result {
                Ok(created) => {
                    info!(
                        task = %task.title,
                        output = %output.name,
                        confidence,
                        external = %created.external_id,
                        "Task delivered"
                    );
                    deliveries.push(TaskDelivery {
                        task_title: task.title.clone(),
                        output_id: output.id,
                        external_id: Some(created.external_id),
                        external_url: Some(created.external_url),
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(task = %task.title, output = %output.name, error = %e, "Task delivery failed");
                    deliveries.push(TaskDelivery {
                        task_title: task.title.clone(),
                        output_id: output.id,
                        external_id: None,
                        external_url: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let succeeded = deliveries.iter().filter(|d| d.succeeded()).count();
        let total = deliveries.len();
        let partial = succeeded > 0 && succeeded < total;

        let patch = JobPatch {
            delivered: Some(deliveries),
            partial_delivery: Some(partial),
            ..Default::default()
        };
        *job = self.store.persist_job_transition(job.id, &patch).await?;

        if succeeded == 0 {
            return Err(PipelineError::AllDeliveriesFailed { total });
        }
        Ok(())
    }

    /// Post one acknowledgment reply into the originating thread.
    ///
    /// Runs regardless of partial delivery; the text states the partial
    /// outcome explicitly.
    async fn notify(
        &self,
        flow: &Flow,
        discussion: &Discussion,
        job: &Job,
    ) -> Result<(), PipelineError> {
        let input = self.input_for(flow, discussion)?;
        let source = self.registry.source(&discussion.platform)?;

        let text = build_notification(&job.delivered);
        source
            .post_reply(&discussion.thread_ref, &text, &input.credentials)
            .await?;
        Ok(())
    }
}

// ── Notification text ───────────────────────────────────────────────

/// Build the acknowledgment reply text from per-task delivery outcomes.
pub fn build_notification(deliveries: &[TaskDelivery]) -> String {
    let total = deliveries.len();
    let succeeded: Vec<&TaskDelivery> = deliveries.iter().filter(|d| d.succeeded()).collect();

    match total {
        0 => "No actionable tasks were detected in this thread.".to_string(),
        1 => {
            let d = &deliveries[0];
            match (&d.external_url, &d.error) {
                (Some(url), _) => format!("Created task: {} — {}", d.task_title, url),
                (None, _) => format!("Could not create task: {}", d.task_title),
            }
        }
        _ => {
            let mut text = if succeeded.len() == total {
                format!("Created {total} tasks:\n")
            } else {
                format!("{} of {} tasks created:\n", succeeded.len(), total)
            };
            for (i, d) in deliveries.iter().enumerate() {
                match &d.external_url {
                    Some(url) => {
                        text.push_str(&format!("{}. {} — {}\n", i + 1, d.task_title, url));
                    }
                    None => {
                        text.push_str(&format!("{}. {} (failed)\n", i + 1, d.task_title));
                    }
                }
            }
            text.trim_end().to_string()
        }
    }
}
