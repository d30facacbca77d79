//! Source/sink adapter contracts and the platform registry.
//!
//! Adapters are pure I/O: they parse platform payloads, fetch threads,
//! create task records and post replies. Triage, routing and state live in
//! the pipeline. All network side effects in the crate are confined here
//! and to the classifier.

pub mod github;
pub mod linear;
pub mod slack;

pub use github::GithubSink;
pub use linear::LinearSink;
pub use slack::SlackSource;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::AdapterError;
use crate::mentions::MentionResolver;
use crate::model::{
    DetectedTask, SinkConfig, SinkCredentials, SourceCredentials, ThreadRef, ThreadSnapshot,
};

// ── Shared adapter types ────────────────────────────────────────────

/// A raw inbound webhook request as seen at the HTTP boundary.
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// Header map with lowercased keys.
    pub headers: HashMap<String, String>,
    /// Raw request body, exactly as received (signatures cover these bytes).
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl RawEvent {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }
}

/// A discussion parsed out of a raw event.
#[derive(Debug, Clone)]
pub struct ParsedDiscussion {
    pub workspace_id: String,
    pub thread_ref: ThreadRef,
    pub author: String,
    pub title: String,
    pub content: String,
}

/// What a raw event turned out to be.
#[derive(Debug, Clone)]
pub enum ParsedEvent {
    /// A discussion worth processing.
    Discussion(ParsedDiscussion),
    /// A verification handshake; echo the token back, nothing to process.
    Challenge(String),
    /// Valid but uninteresting (bot echo, edit, join notice).
    Ignore { reason: String },
}

/// Result of a credential check against the platform.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub valid: bool,
    pub detail: Option<String>,
}

/// A task record created in a destination platform.
#[derive(Debug, Clone)]
pub struct CreatedTask {
    pub external_id: String,
    pub external_url: String,
}

/// Source-platform scope for mention resolution during delivery.
#[derive(Debug, Clone, Copy)]
pub struct MentionScope<'a> {
    pub platform: &'a str,
    pub workspace_id: &'a str,
}

// ── Adapter contracts ───────────────────────────────────────────────

/// A source platform: where discussions come from.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Platform type string, e.g. "slack". Registry key.
    fn platform(&self) -> &'static str;

    /// Verify the platform signature and timestamp freshness over the raw
    /// body. Rejection means the request never becomes a Discussion.
    fn verify_webhook(
        &self,
        event: &RawEvent,
        signing_secret: &SecretString,
    ) -> Result<(), AdapterError>;

    /// Parse a raw webhook body into a discussion, challenge or ignore.
    /// Pure; no network.
    fn parse_incoming(&self, event: &RawEvent) -> Result<ParsedEvent, AdapterError>;

    /// Fetch the full thread (root + ordered replies) for a reference.
    async fn fetch_thread(
        &self,
        thread: &ThreadRef,
        credentials: &SourceCredentials,
    ) -> Result<ThreadSnapshot, AdapterError>;

    /// Post a reply into the originating thread.
    async fn post_reply(
        &self,
        thread: &ThreadRef,
        text: &str,
        credentials: &SourceCredentials,
    ) -> Result<(), AdapterError>;

    /// Check the credentials against the platform.
    async fn validate_credentials(
        &self,
        credentials: &SourceCredentials,
    ) -> Result<ValidationResult, AdapterError>;
}

/// A sink platform: where task records get created.
#[async_trait]
pub trait SinkAdapter: Send + Sync {
    /// Platform type string, e.g. "linear". Registry key.
    fn platform(&self) -> &'static str;

    /// Create one task record. Assignee fields go through the mention
    /// resolver; unresolved mentions degrade to plain text in the body.
    async fn create_task(
        &self,
        task: &DetectedTask,
        sink: &SinkConfig,
        credentials: &SinkCredentials,
        scope: MentionScope<'_>,
        resolver: &MentionResolver,
    ) -> Result<CreatedTask, AdapterError>;

    /// Check the credentials against the platform.
    async fn validate_credentials(
        &self,
        credentials: &SinkCredentials,
    ) -> Result<ValidationResult, AdapterError>;
}

// ── Registry ────────────────────────────────────────────────────────

/// Name-keyed adapter table, built once at startup.
///
/// Adding a platform means registering one adapter here; the orchestrator
/// and ingress only ever look up by platform string.
#[derive(Default)]
pub struct AdapterRegistry {
    sources: HashMap<&'static str, Arc<dyn SourceAdapter>>,
    sinks: HashMap<&'static str, Arc<dyn SinkAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every adapter this build ships.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_source(Arc::new(SlackSource::new()));
        registry.register_sink(Arc::new(LinearSink::new()));
        registry.register_sink(Arc::new(GithubSink::new()));
        registry
    }

    pub fn register_source(&mut self, adapter: Arc<dyn SourceAdapter>) {
        debug!(platform = adapter.platform(), "Registered source adapter");
        self.sources.insert(adapter.platform(), adapter);
    }

    pub fn register_sink(&mut self, adapter: Arc<dyn SinkAdapter>) {
        debug!(platform = adapter.platform(), "Registered sink adapter");
        self.sinks.insert(adapter.platform(), adapter);
    }

    pub fn source(&self, platform: &str) -> Result<Arc<dyn SourceAdapter>, AdapterError> {
        self.sources
            .get(platform)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownPlatform(platform.to_string()))
    }

    pub fn sink(&self, platform: &str) -> Result<Arc<dyn SinkAdapter>, AdapterError> {
        self.sinks
            .get(platform)
            .cloned()
            .ok_or_else(|| AdapterError::UnknownPlatform(platform.to_string()))
    }

    pub fn source_platforms(&self) -> Vec<&'static str> {
        self.sources.keys().copied().collect()
    }
}

// ── Per-credential throttle ─────────────────────────────────────────

/// Serializes sink calls per credential set with a fixed inter-call delay.
///
/// Destination platforms rate-limit per token; concurrent task deliveries
/// against the same token must queue, not race into 429s.
pub struct SinkThrottle {
    min_interval: Duration,
    slots: Mutex<HashMap<String, Arc<Mutex<Instant>>>>,
}

impl SinkThrottle {
    pub fn new(min_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            min_interval,
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Run `op` holding the slot for `key`, waiting out the inter-call
    /// delay first. Calls with different keys proceed concurrently.
    pub async fn run<T, F, Fut>(&self, key: &str, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots
                .entry(key.to_string())
                .or_insert_with(|| {
                    let past = Instant::now()
                        .checked_sub(self.min_interval)
                        .unwrap_or_else(Instant::now);
                    Arc::new(Mutex::new(past))
                })
                .clone()
        };

        let mut last_call = slot.lock().await;
        let since_last = last_call.elapsed();
        if since_last < self.min_interval {
            tokio::time::sleep(self.min_interval - since_last).await;
        }
        let result = op().await;
        *last_call = Instant::now();
        result
    }
}
