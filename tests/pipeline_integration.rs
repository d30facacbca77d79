//! Integration tests for the ingestion-to-routing pipeline.
//!
//! Drives the real orchestrator against the in-memory store with scripted
//! adapters and classifiers; the webhook tests spin up a real Axum server
//! on a random port and exercise the HTTP contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::SecretString;
use sha2::Sha256;
use tokio::sync::Mutex;
use tokio::time::timeout;
use uuid::Uuid;

use task_relay::adapters::{
    AdapterRegistry, CreatedTask, MentionScope, ParsedEvent, RawEvent, SinkAdapter, SinkThrottle,
    SlackSource, SourceAdapter, ValidationResult,
};
use task_relay::classifier::{Classifier, ThreadAnalysis};
use task_relay::config::RelayConfig;
use task_relay::error::{AdapterError, ClassifierError, IngressError};
use task_relay::ingress::{ingress_routes, IngressState};
use task_relay::mentions::MentionResolver;
use task_relay::model::{
    ClassifierSettings, DetectedTask, DiscussionStatus, Flow, Input, JobStatus, Output, SinkConfig,
    SinkCredentials, SourceCredentials, ThreadMessage, ThreadRef, ThreadSnapshot,
};
use task_relay::pipeline::{Processor, ProcessorDeps};
use task_relay::retry::RetryPolicy;
use task_relay::router::RouterConfig;
use task_relay::store::{MemoryStore, Store};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

// ── Scripted collaborators ──────────────────────────────────────────

/// Source adapter that serves a canned thread and records replies.
struct ScriptedSource {
    thread: ThreadSnapshot,
    replies: Arc<Mutex<Vec<String>>>,
    fetch_delay: Duration,
}

impl ScriptedSource {
    fn new(thread: ThreadSnapshot) -> Self {
        Self {
            thread,
            replies: Arc::new(Mutex::new(Vec::new())),
            fetch_delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl SourceAdapter for ScriptedSource {
    fn platform(&self) -> &'static str {
        "slack"
    }

    fn verify_webhook(
        &self,
        event: &RawEvent,
        signing_secret: &SecretString,
    ) -> Result<(), AdapterError> {
        // Delegate to the real Slack verification so HTTP tests stay honest.
        SlackSource::new().verify_webhook(event, signing_secret)
    }

    fn parse_incoming(&self, event: &RawEvent) -> Result<ParsedEvent, AdapterError> {
        SlackSource::new().parse_incoming(event)
    }

    async fn fetch_thread(
        &self,
        _thread: &ThreadRef,
        _credentials: &SourceCredentials,
    ) -> Result<ThreadSnapshot, AdapterError> {
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        Ok(self.thread.clone())
    }

    async fn post_reply(
        &self,
        _thread: &ThreadRef,
        text: &str,
        _credentials: &SourceCredentials,
    ) -> Result<(), AdapterError> {
        self.replies.lock().await.push(text.to_string());
        Ok(())
    }

    async fn validate_credentials(
        &self,
        _credentials: &SourceCredentials,
    ) -> Result<ValidationResult, AdapterError> {
        Ok(ValidationResult {
            valid: true,
            detail: None,
        })
    }
}

/// Sink adapter that records deliveries keyed by the configured team.
/// A team id of "FAIL" simulates a permanently missing destination.
struct RecordingSink {
    created: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingSink {
    fn new() -> Self {
        Self {
            created: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl SinkAdapter for RecordingSink {
    fn platform(&self) -> &'static str {
        "linear"
    }

    async fn create_task(
        &self,
        task: &DetectedTask,
        sink: &SinkConfig,
        _credentials: &SinkCredentials,
        _scope: MentionScope<'_>,
        _resolver: &MentionResolver,
    ) -> Result<CreatedTask, AdapterError> {
        let SinkConfig::Linear { team_id, .. } = sink else {
            return Err(AdapterError::InvalidPayload {
                platform: "linear".into(),
                reason: "wrong sink config".into(),
            });
        };
        if team_id == "FAIL" {
            return Err(AdapterError::NotFound {
                platform: "linear".into(),
                resource: "team FAIL".into(),
            });
        }
        let mut created = self.created.lock().await;
        created.push((team_id.clone(), task.title.clone()));
        let n = created.len();
        Ok(CreatedTask {
            external_id: format!("ISS-{n}"),
            external_url: format!("https://linear.app/issue/ISS-{n}"),
        })
    }

    async fn validate_credentials(
        &self,
        _credentials: &SinkCredentials,
    ) -> Result<ValidationResult, AdapterError> {
        Ok(ValidationResult {
            valid: true,
            detail: None,
        })
    }
}

/// Classifier returning a fixed analysis.
struct ScriptedClassifier {
    tasks: Vec<DetectedTask>,
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(
        &self,
        _thread: &ThreadSnapshot,
        _settings: &ClassifierSettings,
        _topics: &[String],
    ) -> Result<ThreadAnalysis, ClassifierError> {
        Ok(ThreadAnalysis {
            summary: "scripted".into(),
            tasks: self.tasks.clone(),
        })
    }
}

/// Classifier that always fails with a transient error.
struct FailingClassifier;

#[async_trait]
impl Classifier for FailingClassifier {
    async fn classify(
        &self,
        _thread: &ThreadSnapshot,
        _settings: &ClassifierSettings,
        _topics: &[String],
    ) -> Result<ThreadAnalysis, ClassifierError> {
        Err(ClassifierError::RequestFailed("upstream down".into()))
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

fn task(title: &str, topic: Option<&str>) -> DetectedTask {
    DetectedTask {
        title: title.into(),
        description: format!("{title} description"),
        topic: topic.map(String::from),
        priority: None,
        task_type: None,
        assignee: None,
    }
}

fn output(flow_id: Uuid, name: &str, accepts: &[&str], is_default: bool, team: &str) -> Output {
    Output {
        id: Uuid::new_v4(),
        flow_id,
        platform: "linear".into(),
        name: name.into(),
        accepts: accepts.iter().map(|s| s.to_string()).collect(),
        is_default,
        credentials: SinkCredentials {
            token: SecretString::from(format!("token-{name}")),
        },
        sink: SinkConfig::Linear {
            team_id: team.into(),
            project_id: None,
            label_id: None,
        },
    }
}

fn flow(outputs: Vec<Output>) -> Flow {
    let flow_id = outputs.first().map(|o| o.flow_id).unwrap_or_else(Uuid::new_v4);
    Flow {
        id: flow_id,
        name: "triage".into(),
        enabled: true,
        topics: vec!["design".into(), "infra".into(), "backend".into()],
        classifier: ClassifierSettings::default(),
        inputs: vec![Input {
            id: Uuid::new_v4(),
            flow_id,
            platform: "slack".into(),
            workspace_id: "T0001".into(),
            credentials: SourceCredentials {
                token: SecretString::from("xoxb-test"),
                signing_secret: SecretString::from("test-secret"),
            },
        }],
        outputs,
    }
}

fn sample_thread() -> ThreadSnapshot {
    ThreadSnapshot {
        root: ThreadMessage {
            author: "U1".into(),
            author_name: Some("Alice".into()),
            content: "The dashboard redesign needs work and staging is flaky".into(),
            posted_at: Some(Utc::now()),
        },
        replies: vec![ThreadMessage {
            author: "U2".into(),
            author_name: None,
            content: "Agreed on both".into(),
            posted_at: Some(Utc::now()),
        }],
    }
}

fn fast_config() -> RelayConfig {
    RelayConfig {
        stage_retry: RetryPolicy::immediate(3),
        delivery_retry: RetryPolicy::immediate(2),
        sink_min_interval: Duration::ZERO,
        router: RouterConfig::default(),
        ..RelayConfig::default()
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    processor: Arc<Processor>,
    replies: Arc<Mutex<Vec<String>>>,
    created: Arc<Mutex<Vec<(String, String)>>>,
}

fn harness(classifier: Arc<dyn Classifier>) -> Harness {
    let store = MemoryStore::new();
    let source = ScriptedSource::new(sample_thread());
    let replies = source.replies.clone();
    let sink = RecordingSink::new();
    let created = sink.created.clone();

    let mut registry = AdapterRegistry::new();
    registry.register_source(Arc::new(source));
    registry.register_sink(Arc::new(sink));

    let store_dyn: Arc<dyn Store> = store.clone();
    let processor = Processor::new(
        &fast_config(),
        ProcessorDeps {
            store: store_dyn.clone(),
            registry: Arc::new(registry),
            classifier,
            resolver: Arc::new(MentionResolver::new(store_dyn)),
            throttle: SinkThrottle::new(Duration::ZERO),
        },
    );

    Harness {
        store,
        processor,
        replies,
        created,
    }
}

async fn intake_and_run(h: &Harness, f: &Flow) -> (Uuid, Uuid) {
    h.store.add_flow(f.clone()).await;
    let parsed = task_relay::adapters::ParsedDiscussion {
        workspace_id: "T0001".into(),
        thread_ref: ThreadRef {
            channel_id: "C42".into(),
            thread_id: "1700000000.000100".into(),
        },
        author: "U1".into(),
        title: "The dashboard redesign needs work".into(),
        content: "raw".into(),
    };
    let (discussion, job) = h
        .processor
        .intake(f, "slack", parsed, r#"{"raw":true}"#.into())
        .await
        .unwrap();
    h.processor.run(job.id).await;
    (discussion.id, job.id)
}

// ── Routing end-to-end ──────────────────────────────────────────────

#[tokio::test]
async fn two_tasks_route_to_their_outputs() {
    let flow_id = Uuid::new_v4();
    let f = flow(vec![
        output(flow_id, "design", &["design"], false, "DESIGN"),
        output(flow_id, "infra", &["infra", "backend"], false, "INFRA"),
        output(flow_id, "default", &[], true, "DEFAULT"),
    ]);
    let h = harness(Arc::new(ScriptedClassifier {
        tasks: vec![
            task("Redesign dashboard", Some("design")),
            task("Stabilize staging", Some("infra")),
        ],
    }));

    let (discussion_id, job_id) = timeout(TEST_TIMEOUT, intake_and_run(&h, &f))
        .await
        .unwrap();

    let created = h.created.lock().await;
    assert_eq!(created.len(), 2);
    assert!(created.contains(&("DESIGN".into(), "Redesign dashboard".into())));
    assert!(created.contains(&("INFRA".into(), "Stabilize staging".into())));
    drop(created);

    let job = h.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(!job.partial_delivery);
    assert_eq!(job.delivered.len(), 2);
    assert!(job.delivered.iter().all(|d| d.succeeded()));

    let discussion = h.store.get_discussion(discussion_id).await.unwrap().unwrap();
    assert_eq!(discussion.status, DiscussionStatus::Completed);
    assert_eq!(discussion.tasks.len(), 2);
    assert!(discussion.summary.is_some());

    let replies = h.replies.lock().await;
    assert_eq!(replies.len(), 1);
    assert!(replies[0].starts_with("Created 2 tasks:"));
}

#[tokio::test]
async fn sole_broad_candidate_receives_task() {
    let flow_id = Uuid::new_v4();
    let f = flow(vec![
        output(flow_id, "design", &["design"], false, "DESIGN"),
        output(flow_id, "infra", &["infra", "backend"], false, "INFRA"),
        output(flow_id, "default", &[], true, "DEFAULT"),
    ]);
    let h = harness(Arc::new(ScriptedClassifier {
        tasks: vec![task("Tune API", Some("backend"))],
    }));

    timeout(TEST_TIMEOUT, intake_and_run(&h, &f)).await.unwrap();

    let created = h.created.lock().await;
    assert_eq!(created.as_slice(), &[("INFRA".into(), "Tune API".into())]);
}

#[tokio::test]
async fn ambiguous_tie_falls_back_to_default() {
    let flow_id = Uuid::new_v4();
    let f = flow(vec![
        output(flow_id, "a", &["frontend", "ui"], false, "A"),
        output(flow_id, "b", &["frontend", "backend"], false, "B"),
        output(flow_id, "default", &[], true, "DEFAULT"),
    ]);
    let h = harness(Arc::new(ScriptedClassifier {
        tasks: vec![task("Polish navbar", Some("frontend"))],
    }));

    timeout(TEST_TIMEOUT, intake_and_run(&h, &f)).await.unwrap();

    let created = h.created.lock().await;
    assert_eq!(created.as_slice(), &[("DEFAULT".into(), "Polish navbar".into())]);
}

#[tokio::test]
async fn untopiced_task_goes_to_default() {
    let flow_id = Uuid::new_v4();
    let f = flow(vec![
        output(flow_id, "design", &["design"], false, "DESIGN"),
        output(flow_id, "default", &[], true, "DEFAULT"),
    ]);
    let h = harness(Arc::new(ScriptedClassifier {
        tasks: vec![task("Untagged chore", None)],
    }));

    timeout(TEST_TIMEOUT, intake_and_run(&h, &f)).await.unwrap();

    let created = h.created.lock().await;
    assert_eq!(created.as_slice(), &[("DEFAULT".into(), "Untagged chore".into())]);
}

// ── Partial delivery ────────────────────────────────────────────────

#[tokio::test]
async fn partial_delivery_completes_with_flag_and_explicit_reply() {
    let flow_id = Uuid::new_v4();
    let f = flow(vec![
        output(flow_id, "design", &["design"], false, "DESIGN"),
        output(flow_id, "broken", &["infra"], false, "FAIL"),
        output(flow_id, "default", &[], true, "DEFAULT"),
    ]);
    let h = harness(Arc::new(ScriptedClassifier {
        tasks: vec![
            task("Redesign dashboard", Some("design")),
            task("Stabilize staging", Some("infra")),
        ],
    }));

    let (_, job_id) = timeout(TEST_TIMEOUT, intake_and_run(&h, &f))
        .await
        .unwrap();

    let job = h.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.partial_delivery);
    assert_eq!(job.delivered.iter().filter(|d| d.succeeded()).count(), 1);

    let replies = h.replies.lock().await;
    assert_eq!(replies.len(), 1);
    assert!(replies[0].starts_with("1 of 2 tasks created:"), "got: {}", replies[0]);
    assert!(replies[0].contains("(failed)"));
}

#[tokio::test]
async fn all_deliveries_failing_fails_the_job() {
    let flow_id = Uuid::new_v4();
    let f = flow(vec![
        output(flow_id, "broken", &["design"], false, "FAIL"),
        output(flow_id, "default", &[], true, "FAIL"),
    ]);
    let h = harness(Arc::new(ScriptedClassifier {
        tasks: vec![task("Redesign dashboard", Some("design"))],
    }));

    let (discussion_id, job_id) = timeout(TEST_TIMEOUT, intake_and_run(&h, &f))
        .await
        .unwrap();

    let job = h.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.is_some());

    let discussion = h.store.get_discussion(discussion_id).await.unwrap().unwrap();
    assert_eq!(discussion.status, DiscussionStatus::Failed);

    // No acknowledgment for a fully failed delivery stage.
    assert!(h.replies.lock().await.is_empty());
}

// ── Retry exhaustion & manual reprocess ─────────────────────────────

#[tokio::test]
async fn exhausted_retries_fail_the_job_until_manual_reprocess() {
    let flow_id = Uuid::new_v4();
    let f = flow(vec![
        output(flow_id, "design", &["design"], false, "DESIGN"),
        output(flow_id, "default", &[], true, "DEFAULT"),
    ]);

    let failing = harness(Arc::new(FailingClassifier));
    let (discussion_id, job_id) = timeout(TEST_TIMEOUT, intake_and_run(&failing, &f))
        .await
        .unwrap();

    let job = failing.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, job.max_attempts);

    // Terminal means terminal: re-running does not resurrect the job.
    failing.processor.run(job_id).await;
    let job = failing.store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(failing
        .store
        .get_active_job(discussion_id)
        .await
        .unwrap()
        .is_none());

    // A fresh processor with a healthy classifier reprocesses the same
    // discussion through a brand-new job, sharing the failed run's store so
    // the discussion carries over.
    let store_dyn: Arc<dyn Store> = failing.store.clone();
    let source = ScriptedSource::new(sample_thread());
    let sink = RecordingSink::new();
    let created = sink.created.clone();
    let mut registry = AdapterRegistry::new();
    registry.register_source(Arc::new(source));
    registry.register_sink(Arc::new(sink));
    let processor = Processor::new(
        &fast_config(),
        ProcessorDeps {
            store: store_dyn.clone(),
            registry: Arc::new(registry),
            classifier: Arc::new(ScriptedClassifier {
                tasks: vec![task("Redesign dashboard", Some("design"))],
            }),
            resolver: Arc::new(MentionResolver::new(store_dyn)),
            throttle: SinkThrottle::new(Duration::ZERO),
        },
    );

    let new_job = processor.reprocess(discussion_id).await.unwrap();
    assert_ne!(new_job.id, job_id);
    processor.run(new_job.id).await;

    let new_job = failing.store.get_job(new_job.id).await.unwrap().unwrap();
    assert_eq!(new_job.status, JobStatus::Completed);
    assert_eq!(created.lock().await.len(), 1);
}

#[tokio::test]
async fn reprocess_unknown_discussion_is_not_found() {
    let h = harness(Arc::new(ScriptedClassifier { tasks: vec![] }));
    let err = h.processor.reprocess(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, IngressError::DiscussionNotFound(_)));
}

#[tokio::test]
async fn reprocess_with_active_job_conflicts() {
    let flow_id = Uuid::new_v4();
    let f = flow(vec![output(flow_id, "default", &[], true, "DEFAULT")]);
    let h = harness(Arc::new(ScriptedClassifier { tasks: vec![] }));
    h.store.add_flow(f.clone()).await;

    let parsed = task_relay::adapters::ParsedDiscussion {
        workspace_id: "T0001".into(),
        thread_ref: ThreadRef {
            channel_id: "C1".into(),
            thread_id: "1.2".into(),
        },
        author: "U1".into(),
        title: "t".into(),
        content: "c".into(),
    };
    let (discussion, _job) = h
        .processor
        .intake(&f, "slack", parsed, "{}".into())
        .await
        .unwrap();

    // The intake job is still pending (never run), so it counts as active.
    let err = h.processor.reprocess(discussion.id).await.unwrap_err();
    assert!(matches!(err, IngressError::JobConflict(_)));
}

// ── Orphaned configuration ──────────────────────────────────────────

#[tokio::test]
async fn deleted_flow_is_skipped_with_failure_not_panic() {
    let flow_id = Uuid::new_v4();
    let f = flow(vec![output(flow_id, "default", &[], true, "DEFAULT")]);
    let h = harness(Arc::new(ScriptedClassifier { tasks: vec![] }));
    h.store.add_flow(f.clone()).await;

    let parsed = task_relay::adapters::ParsedDiscussion {
        workspace_id: "T0001".into(),
        thread_ref: ThreadRef {
            channel_id: "C1".into(),
            thread_id: "1.2".into(),
        },
        author: "U1".into(),
        title: "t".into(),
        content: "c".into(),
    };
    let (discussion, job) = h
        .processor
        .intake(&f, "slack", parsed, "{}".into())
        .await
        .unwrap();

    // Admin layer deletes the flow between intake and processing.
    h.store.remove_flow(f.id).await;
    h.processor.run(job.id).await;

    let job = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let discussion = h.store.get_discussion(discussion.id).await.unwrap().unwrap();
    assert_eq!(discussion.status, DiscussionStatus::Failed);
}

// ── Webhook HTTP contract ───────────────────────────────────────────

type HmacSha256 = Hmac<Sha256>;

fn slack_signature(secret: &str, timestamp: i64, body: &str) -> String {
    let basestring = format!("v0:{timestamp}:{body}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(basestring.as_bytes());
    format!("v0={}", hex::encode(mac.finalize().into_bytes()))
}

fn slack_message_body(team: &str) -> String {
    serde_json::json!({
        "type": "event_callback",
        "team_id": team,
        "event": {
            "type": "message",
            "user": "U123",
            "text": "We should fix the login bug",
            "channel": "C42",
            "ts": "1700000000.000100"
        }
    })
    .to_string()
}

/// Spin up a real ingress server; returns its base URL and the state.
async fn spawn_server(h: Harness, f: &Flow) -> (String, Arc<IngressState>) {
    h.store.add_flow(f.clone()).await;

    let source = ScriptedSource::new(sample_thread());
    let sink = RecordingSink::new();
    let mut registry = AdapterRegistry::new();
    registry.register_source(Arc::new(source));
    registry.register_sink(Arc::new(sink));

    let state = Arc::new(IngressState {
        store: h.store.clone(),
        registry: Arc::new(registry),
        processor: h.processor.clone(),
    });
    let app = ingress_routes(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    (format!("http://{addr}"), state)
}

#[tokio::test]
async fn webhook_accepts_signed_event_and_acks_immediately() {
    let flow_id = Uuid::new_v4();
    let f = flow(vec![output(flow_id, "default", &[], true, "DEFAULT")]);
    let h = harness(Arc::new(ScriptedClassifier { tasks: vec![] }));
    let (base, state) = spawn_server(h, &f).await;

    let body = slack_message_body("T0001");
    let ts = Utc::now().timestamp();
    let client = reqwest::Client::new();
    let response = timeout(
        TEST_TIMEOUT,
        client
            .post(format!("{base}/webhook/slack"))
            .header("x-slack-request-timestamp", ts.to_string())
            .header("x-slack-signature", slack_signature("test-secret", ts, &body))
            .body(body)
            .send(),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    let ack: serde_json::Value = response.json().await.unwrap();
    assert_eq!(ack["ok"], true);
    let discussion_id: Uuid = ack["discussion_id"].as_str().unwrap().parse().unwrap();

    // The discussion was persisted before the response went out.
    assert!(state
        .store
        .get_discussion(discussion_id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn webhook_rejects_bad_signature_with_401() {
    let flow_id = Uuid::new_v4();
    let f = flow(vec![output(flow_id, "default", &[], true, "DEFAULT")]);
    let h = harness(Arc::new(ScriptedClassifier { tasks: vec![] }));
    let (base, _state) = spawn_server(h, &f).await;

    let body = slack_message_body("T0001");
    let ts = Utc::now().timestamp();
    let response = reqwest::Client::new()
        .post(format!("{base}/webhook/slack"))
        .header("x-slack-request-timestamp", ts.to_string())
        .header("x-slack-signature", slack_signature("wrong-secret", ts, &body))
        .body(body)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
async fn webhook_unknown_workspace_is_404() {
    let flow_id = Uuid::new_v4();
    let f = flow(vec![output(flow_id, "default", &[], true, "DEFAULT")]);
    let h = harness(Arc::new(ScriptedClassifier { tasks: vec![] }));
    let (base, _state) = spawn_server(h, &f).await;

    let body = slack_message_body("T9999");
    let ts = Utc::now().timestamp();
    let response = reqwest::Client::new()
        .post(format!("{base}/webhook/slack"))
        .header("x-slack-request-timestamp", ts.to_string())
        .header("x-slack-signature", slack_signature("test-secret", ts, &body))
        .body(body)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn webhook_unknown_platform_is_404() {
    let flow_id = Uuid::new_v4();
    let f = flow(vec![output(flow_id, "default", &[], true, "DEFAULT")]);
    let h = harness(Arc::new(ScriptedClassifier { tasks: vec![] }));
    let (base, _state) = spawn_server(h, &f).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/webhook/teams"))
        .body("{}")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn webhook_echoes_url_verification_challenge() {
    let flow_id = Uuid::new_v4();
    let f = flow(vec![output(flow_id, "default", &[], true, "DEFAULT")]);
    let h = harness(Arc::new(ScriptedClassifier { tasks: vec![] }));
    let (base, _state) = spawn_server(h, &f).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/webhook/slack"))
        .body(r#"{"type": "url_verification", "challenge": "chal-42"}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    let ack: serde_json::Value = response.json().await.unwrap();
    assert_eq!(ack["challenge"], "chal-42");
}

#[tokio::test]
async fn reprocess_endpoint_maps_errors_to_statuses() {
    let flow_id = Uuid::new_v4();
    let f = flow(vec![output(flow_id, "default", &[], true, "DEFAULT")]);
    let h = harness(Arc::new(ScriptedClassifier { tasks: vec![] }));
    let (base, _state) = spawn_server(h, &f).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/api/discussions/{}/reprocess", Uuid::new_v4()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn health_endpoint_responds() {
    let flow_id = Uuid::new_v4();
    let f = flow(vec![output(flow_id, "default", &[], true, "DEFAULT")]);
    let h = harness(Arc::new(ScriptedClassifier { tasks: vec![] }));
    let (base, _state) = spawn_server(h, &f).await;

    let response = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
}
