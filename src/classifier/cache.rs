//! Content-addressed classification cache.
//!
//! Re-analyzing an unchanged thread (webhook redelivery, manual reprocess)
//! would burn an identical LLM call. The cache is explicit and injected
//! rather than ambient module state, keyed by a content hash of the thread
//! plus the model, with bounded TTL and size.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;

use crate::classifier::{Classifier, ThreadAnalysis};
use crate::error::ClassifierError;
use crate::model::{ClassifierSettings, ThreadSnapshot};

struct Entry {
    analysis: ThreadAnalysis,
    inserted_at: Instant,
    /// Monotonic insertion sequence; breaks Instant ties on eviction.
    seq: u64,
}

/// Bounded TTL cache for thread analyses.
pub struct AnalysisCache {
    entries: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
    max_entries: usize,
    next_seq: std::sync::atomic::AtomicU64,
}

impl AnalysisCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
            next_seq: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Cache key: SHA-256 over the model id and the serialized thread.
    pub fn key(thread: &ThreadSnapshot, settings: &ClassifierSettings) -> String {
        let mut hasher = Sha256::new();
        hasher.update(settings.model.as_bytes());
        hasher.update(b"\0");
        if let Ok(serialized) = serde_json::to_vec(thread) {
            hasher.update(&serialized);
        }
        hex::encode(hasher.finalize())
    }

    pub async fn get(&self, key: &str) -> Option<ThreadAnalysis> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.inserted_at.elapsed() < self.ttl)
            .map(|e| e.analysis.clone())
    }

    pub async fn insert(&self, key: String, analysis: ThreadAnalysis) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, e| e.inserted_at.elapsed() < self.ttl);
        if entries.len() >= self.max_entries {
            // Evict the oldest surviving entry to stay within bounds.
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.seq)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key,
            Entry {
                analysis,
                inserted_at: Instant::now(),
                seq: self
                    .next_seq
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Classifier wrapper that consults the cache before the inner classifier.
pub struct CachedClassifier {
    inner: Arc<dyn Classifier>,
    cache: Arc<AnalysisCache>,
}

impl CachedClassifier {
    pub fn new(inner: Arc<dyn Classifier>, cache: Arc<AnalysisCache>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl Classifier for CachedClassifier {
    async fn classify(
        &self,
        thread: &ThreadSnapshot,
        settings: &ClassifierSettings,
        topics: &[String],
    ) -> Result<ThreadAnalysis, ClassifierError> {
        let key = AnalysisCache::key(thread, settings);
        if let Some(hit) = self.cache.get(&key).await {
            debug!(key = %&key[..12], "Classification cache hit");
            return Ok(hit);
        }

        let analysis = self.inner.classify(thread, settings, topics).await?;
        self.cache.insert(key, analysis.clone()).await;
        Ok(analysis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ThreadMessage;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn thread(content: &str) -> ThreadSnapshot {
        ThreadSnapshot {
            root: ThreadMessage {
                author: "U1".into(),
                author_name: None,
                content: content.into(),
                posted_at: None,
            },
            replies: vec![],
        }
    }

    struct CountingClassifier {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Classifier for CountingClassifier {
        async fn classify(
            &self,
            _thread: &ThreadSnapshot,
            _settings: &ClassifierSettings,
            _topics: &[String],
        ) -> Result<ThreadAnalysis, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ThreadAnalysis {
                summary: "s".into(),
                tasks: vec![],
            })
        }
    }

    #[tokio::test]
    async fn second_identical_call_hits_cache() {
        let inner = Arc::new(CountingClassifier {
            calls: AtomicU32::new(0),
        });
        let cache = AnalysisCache::new(Duration::from_secs(60), 16);
        let cached = CachedClassifier::new(inner.clone(), cache);
        let settings = ClassifierSettings::default();

        let t = thread("same content");
        cached.classify(&t, &settings, &[]).await.unwrap();
        cached.classify(&t, &settings, &[]).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_content_misses_cache() {
        let inner = Arc::new(CountingClassifier {
            calls: AtomicU32::new(0),
        });
        let cache = AnalysisCache::new(Duration::from_secs(60), 16);
        let cached = CachedClassifier::new(inner.clone(), cache);
        let settings = ClassifierSettings::default();

        cached.classify(&thread("a"), &settings, &[]).await.unwrap();
        cached.classify(&thread("b"), &settings, &[]).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_entries_are_ignored() {
        let cache = AnalysisCache::new(Duration::ZERO, 16);
        let key = "k".to_string();
        cache
            .insert(
                key.clone(),
                ThreadAnalysis {
                    summary: "s".into(),
                    tasks: vec![],
                },
            )
            .await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn size_bound_evicts_oldest() {
        let cache = AnalysisCache::new(Duration::from_secs(60), 2);
        for i in 0..3 {
            cache
                .insert(
                    format!("k{i}"),
                    ThreadAnalysis {
                        summary: i.to_string(),
                        tasks: vec![],
                    },
                )
                .await;
        }
        assert!(cache.len().await <= 2);
        assert!(cache.get("k0").await.is_none());
        assert!(cache.get("k2").await.is_some());
    }

    #[test]
    fn key_depends_on_model_and_content() {
        let settings_a = ClassifierSettings::default();
        let mut settings_b = ClassifierSettings::default();
        settings_b.model = "other-model".into();

        let t = thread("same");
        assert_ne!(
            AnalysisCache::key(&t, &settings_a),
            AnalysisCache::key(&t, &settings_b)
        );
        assert_eq!(
            AnalysisCache::key(&t, &settings_a),
            AnalysisCache::key(&thread("same"), &settings_a)
        );
    }
}
