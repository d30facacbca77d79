//! Confidence-based output router.
//!
//! Picks exactly one sink for a detected task by scoring each candidate
//! output on how specifically its accepted-topic filter matches the task's
//! topic. Narrow filters beat broad catch-alls; ambiguous ties fall back to
//! the flow's default output.

use tracing::debug;

use crate::model::{DetectedTask, Output};

/// Tunable routing knobs.
///
/// The specificity formula (`1 / |accepted set|`) is fixed; the ambiguity
/// gap below which two candidates are considered a tie is configurable.
#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    /// Minimum relative confidence gap, `(best - second) / second`, for the
    /// best candidate to win outright.
    pub gap_threshold: f32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { gap_threshold: 0.5 }
    }
}

/// Why a particular output was chosen. Recorded in logs, useful in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReason {
    /// Task had no topic label.
    NoTopic,
    /// No non-default output accepted the topic.
    NoCandidates,
    /// Exactly one output accepted the topic.
    SoleCandidate,
    /// The best candidate was sufficiently more specific than the runner-up.
    ClearWinner,
    /// Two or more candidates scored too close together.
    AmbiguousTie,
}

/// The routing decision for one task.
#[derive(Debug)]
pub struct RouteDecision<'a> {
    pub output: &'a Output,
    pub confidence: f32,
    pub reason: RouteReason,
}

/// Stateless router over a flow's outputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceRouter {
    config: RouterConfig,
}

impl ConfidenceRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// Route one task to exactly one output.
    ///
    /// `candidates` are the flow's non-default outputs; `default` is the
    /// flow's single default output (guaranteed by `Flow::validate`).
    pub fn route<'a>(
        &self,
        task: &DetectedTask,
        candidates: &[&'a Output],
        default: &'a Output,
    ) -> RouteDecision<'a> {
        let Some(topic) = task.topic.as_deref() else {
            debug!(task = %task.title, "No topic label, routing to default output");
            return RouteDecision {
                output: default,
                confidence: 0.0,
                reason: RouteReason::NoTopic,
            };
        };

        // Score every candidate whose filter accepts this topic. An empty
        // accepted set is a catch-all: it matches any topic but carries no
        // specificity, so it scores 0 and only wins as a sole candidate.
        let mut scored: Vec<(&Output, f32)> = candidates
            .iter()
            .filter(|o| o.accepts.is_empty() || o.accepts.iter().any(|t| t == topic))
            .map(|o| {
                let confidence = if o.accepts.is_empty() {
                    0.0
                } else {
                    1.0 / o.accepts.len() as f32
                };
                (*o, confidence)
            })
            .collect();

        match scored.len() {
            0 => {
                debug!(task = %task.title, topic, "No candidate accepts topic, using default");
                RouteDecision {
                    output: default,
                    confidence: 0.0,
                    reason: RouteReason::NoCandidates,
                }
            }
            1 => {
                let (output, confidence) = scored[0];
                debug!(
                    task = %task.title,
                    topic,
                    output = %output.name,
                    confidence,
                    "Sole candidate wins"
                );
                RouteDecision {
                    output,
                    confidence,
                    reason: RouteReason::SoleCandidate,
                }
            }
            _ => {
                scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                let (best, best_conf) = scored[0];
                let (_, second_conf) = scored[1];

                // A zero runner-up cannot contest a positive best score.
                let clear = if second_conf <= f32::EPSILON {
                    best_conf > f32::EPSILON
                } else {
                    (best_conf - second_conf) / second_conf >= self.config.gap_threshold
                };

                if clear {
                    debug!(
                        task = %task.title,
                        topic,
                        output = %best.name,
                        confidence = best_conf,
                        runner_up = second_conf,
                        "Clear winner"
                    );
                    RouteDecision {
                        output: best,
                        confidence: best_conf,
                        reason: RouteReason::ClearWinner,
                    }
                } else {
                    debug!(
                        task = %task.title,
                        topic,
                        best = best_conf,
                        runner_up = second_conf,
                        "Ambiguous match, routing to default output"
                    );
                    RouteDecision {
                        output: default,
                        confidence: 0.0,
                        reason: RouteReason::AmbiguousTie,
                    }
                }
            }
        }
    }
}
