//! AI classifier capability — `classify(thread) -> tasks`.
//!
//! The classifier is an external collaborator behind a narrow trait so the
//! pipeline can be tested with scripted implementations.

pub mod cache;
pub mod llm;

pub use cache::{AnalysisCache, CachedClassifier};
pub use llm::LlmClassifier;

use async_trait::async_trait;

use crate::error::ClassifierError;
use crate::model::{ClassifierSettings, DetectedTask, ThreadSnapshot};

/// Result of classifying one discussion thread.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ThreadAnalysis {
    /// One-paragraph summary of the discussion.
    pub summary: String,
    /// Actionable tasks extracted from the thread. May be empty.
    pub tasks: Vec<DetectedTask>,
}

/// The classification capability.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Extract actionable tasks from a thread snapshot.
    ///
    /// `topics` are the flow's known topic labels, passed as hints; the
    /// classifier may still return tasks with no topic, and must leave every
    /// field it is unsure about unset rather than guessing.
    async fn classify(
        &self,
        thread: &ThreadSnapshot,
        settings: &ClassifierSettings,
        topics: &[String],
    ) -> Result<ThreadAnalysis, ClassifierError>;
}
