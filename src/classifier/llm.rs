//! LLM-backed classifier over the Anthropic Messages API.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::classifier::{Classifier, ThreadAnalysis};
use crate::error::ClassifierError;
use crate::model::{ClassifierSettings, DetectedTask, TaskPriority, ThreadMessage, ThreadSnapshot};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Max tokens for the extraction call (kept tight — runs on every thread).
const MAX_TOKENS: u32 = 1024;

/// Per-message content cap fed into the prompt.
const CONTENT_PREVIEW_CHARS: usize = 600;

/// Classifier that calls the Anthropic Messages API directly.
pub struct LlmClassifier {
    api_key: SecretString,
    client: reqwest::Client,
}

impl LlmClassifier {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(
        &self,
        thread: &ThreadSnapshot,
        settings: &ClassifierSettings,
        topics: &[String],
    ) -> Result<ThreadAnalysis, ClassifierError> {
        let body = serde_json::json!({
            "model": settings.model,
            "max_tokens": MAX_TOKENS,
            "temperature": settings.temperature,
            "system": build_system_prompt(topics),
            "messages": [{"role": "user", "content": build_user_prompt(thread)}],
        });

        let response = self
            .client
            .post(API_URL)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| ClassifierError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ClassifierError::AuthFailed);
        }
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ClassifierError::RateLimited { retry_after });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ClassifierError::RequestFailed(format!(
                "HTTP {status}: {text}"
            )));
        }

        #[derive(Deserialize)]
        struct ContentBlock {
            #[serde(default)]
            text: String,
        }
        #[derive(Deserialize)]
        struct MessagesResponse {
            content: Vec<ContentBlock>,
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ClassifierError::InvalidResponse(e.to_string()))?;
        let text: String = parsed.content.iter().map(|b| b.text.as_str()).collect();

        let mut analysis = parse_analysis(&text)?;
        if analysis.tasks.len() > settings.max_tasks {
            warn!(
                extracted = analysis.tasks.len(),
                cap = settings.max_tasks,
                "Classifier exceeded task cap, truncating"
            );
            analysis.tasks.truncate(settings.max_tasks);
        }
        debug!(
            tasks = analysis.tasks.len(),
            summary_len = analysis.summary.len(),
            "Thread classified"
        );
        Ok(analysis)
    }
}

// ── Prompt construction ─────────────────────────────────────────────

/// Build the extraction system prompt.
fn build_system_prompt(topics: &[String]) -> String {
    let mut prompt = String::from(
        "You are a task extraction engine. Read a discussion thread and extract \
         actionable tasks.\n\n\
         Respond with ONLY a JSON object:\n\
         {\"summary\": \"...\", \"tasks\": [{\"title\": \"...\", \"description\": \"...\", \
         \"topic\": \"...\", \"priority\": \"...\", \"type\": \"...\", \"assignee\": \"...\"}]}\n\n\
         Rules:\n\
         - \"summary\": one or two sentences describing the discussion\n\
         - \"title\": short imperative phrase (max 10 words)\n\
         - \"priority\": one of \"low\", \"medium\", \"high\", \"urgent\" — omit if unclear\n\
         - \"assignee\": the user id or email of whoever the thread assigns the work to — \
           omit unless explicit\n\
         - Omit any field you are not confident about. Never guess.\n\
         - Return an empty \"tasks\" array when nothing is actionable.\n",
    );
    if !topics.is_empty() {
        prompt.push_str(&format!(
            "- \"topic\": pick from [{}] when one fits, otherwise omit\n",
            topics.join(", ")
        ));
    } else {
        prompt.push_str("- \"topic\": a short domain label, omit if unclear\n");
    }
    prompt
}

/// Build the user prompt from a thread snapshot.
fn build_user_prompt(thread: &ThreadSnapshot) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str("Discussion thread:\n\n");
    push_message(&mut prompt, &thread.root);
    for reply in &thread.replies {
        push_message(&mut prompt, reply);
    }
    prompt
}

fn push_message(prompt: &mut String, msg: &ThreadMessage) {
    let author = msg.author_name.as_deref().unwrap_or(&msg.author);
    let preview: String = msg.content.chars().take(CONTENT_PREVIEW_CHARS).collect();
    prompt.push_str(&format!("{author}: {preview}\n"));
}

// ── Response parsing ────────────────────────────────────────────────

/// Raw task shape from the model. Empty strings collapse to `None` so the
/// null-preservation rule holds even for models that emit `""` instead of
/// omitting a field.
#[derive(Debug, Deserialize)]
struct RawTask {
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default, rename = "type")]
    task_type: Option<String>,
    #[serde(default)]
    assignee: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    tasks: Vec<RawTask>,
}

/// Parse the model output into a `ThreadAnalysis`.
pub(crate) fn parse_analysis(raw: &str) -> Result<ThreadAnalysis, ClassifierError> {
    let json_str = extract_json_object(raw);
    let parsed: RawAnalysis = serde_json::from_str(&json_str)
        .map_err(|e| ClassifierError::InvalidResponse(format!("JSON parse error: {e}")))?;

    let tasks = parsed
        .tasks
        .into_iter()
        .filter(|t| !t.title.trim().is_empty())
        .map(|t| DetectedTask {
            title: t.title,
            description: t.description,
            topic: none_if_empty(t.topic),
            priority: t.priority.as_deref().and_then(parse_priority),
            task_type: none_if_empty(t.task_type),
            assignee: none_if_empty(t.assignee),
        })
        .collect();

    Ok(ThreadAnalysis {
        summary: parsed.summary,
        tasks,
    })
}

fn none_if_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Map a priority string; unknown values become `None`, never a guess.
fn parse_priority(s: &str) -> Option<TaskPriority> {
    match s.to_lowercase().as_str() {
        "low" => Some(TaskPriority::Low),
        "medium" => Some(TaskPriority::Medium),
        "high" => Some(TaskPriority::High),
        "urgent" => Some(TaskPriority::Urgent),
        _ => None,
    }
}

/// Extract a JSON object from model output (handles markdown wrapping).
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim().to_string();
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread() -> ThreadSnapshot {
        ThreadSnapshot {
            root: ThreadMessage {
                author: "U1".into(),
                author_name: Some("Alice".into()),
                content: "The login page drops sessions, can someone look?".into(),
                posted_at: None,
            },
            replies: vec![ThreadMessage {
                author: "U2".into(),
                author_name: None,
                content: "Probably the cookie domain change".into(),
                posted_at: None,
            }],
        }
    }

    #[test]
    fn system_prompt_lists_known_topics() {
        let prompt = build_system_prompt(&["design".into(), "infra".into()]);
        assert!(prompt.contains("design, infra"));
    }

    #[test]
    fn user_prompt_prefers_display_names() {
        let prompt = build_user_prompt(&thread());
        assert!(prompt.contains("Alice:"));
        assert!(prompt.contains("U2:"));
        assert!(prompt.contains("login page"));
    }

    #[test]
    fn user_prompt_truncates_long_messages() {
        let mut t = thread();
        t.root.content = "x".repeat(5000);
        let prompt = build_user_prompt(&t);
        assert!(prompt.len() < 1500);
    }

    #[test]
    fn parse_full_analysis() {
        let raw = r#"{
            "summary": "Login bug discussion",
            "tasks": [{
                "title": "Fix session drop",
                "description": "Cookie domain regression",
                "topic": "backend",
                "priority": "high",
                "type": "bug",
                "assignee": "U1"
            }]
        }"#;
        let analysis = parse_analysis(raw).unwrap();
        assert_eq!(analysis.summary, "Login bug discussion");
        assert_eq!(analysis.tasks.len(), 1);
        let task = &analysis.tasks[0];
        assert_eq!(task.topic.as_deref(), Some("backend"));
        assert_eq!(task.priority, Some(TaskPriority::High));
        assert_eq!(task.assignee.as_deref(), Some("U1"));
    }

    #[test]
    fn parse_preserves_missing_optionals() {
        let raw = r#"{"summary": "s", "tasks": [{"title": "Do the thing"}]}"#;
        let analysis = parse_analysis(raw).unwrap();
        let task = &analysis.tasks[0];
        assert!(task.topic.is_none());
        assert!(task.priority.is_none());
        assert!(task.task_type.is_none());
        assert!(task.assignee.is_none());
    }

    #[test]
    fn parse_collapses_empty_strings_to_none() {
        let raw = r#"{"summary": "s", "tasks": [{"title": "T", "topic": "", "assignee": "  "}]}"#;
        let analysis = parse_analysis(raw).unwrap();
        assert!(analysis.tasks[0].topic.is_none());
        assert!(analysis.tasks[0].assignee.is_none());
    }

    #[test]
    fn parse_unknown_priority_becomes_none() {
        let raw = r#"{"summary": "s", "tasks": [{"title": "T", "priority": "someday"}]}"#;
        let analysis = parse_analysis(raw).unwrap();
        assert!(analysis.tasks[0].priority.is_none());
    }

    #[test]
    fn parse_handles_markdown_wrapping() {
        let raw = "Here you go:\n```json\n{\"summary\": \"s\", \"tasks\": []}\n```";
        let analysis = parse_analysis(raw).unwrap();
        assert_eq!(analysis.summary, "s");
        assert!(analysis.tasks.is_empty());
    }

    #[test]
    fn parse_handles_surrounding_text() {
        let raw = "Analysis: {\"summary\": \"s\", \"tasks\": []} done.";
        assert!(parse_analysis(raw).is_ok());
    }

    #[test]
    fn parse_drops_untitled_tasks() {
        let raw = r#"{"summary": "s", "tasks": [{"title": "  "}, {"title": "Real task"}]}"#;
        let analysis = parse_analysis(raw).unwrap();
        assert_eq!(analysis.tasks.len(), 1);
        assert_eq!(analysis.tasks[0].title, "Real task");
    }

    #[test]
    fn parse_garbage_fails() {
        assert!(parse_analysis("not json at all").is_err());
    }
}
