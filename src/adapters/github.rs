//! GitHub sink adapter — creates issues through the REST API.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::adapters::{CreatedTask, MentionScope, SinkAdapter, ValidationResult};
use crate::error::AdapterError;
use crate::mentions::{MentionResolver, Resolution};
use crate::model::{DetectedTask, SinkConfig, SinkCredentials, TaskPriority};

const API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("task-relay/", env!("CARGO_PKG_VERSION"));

/// GitHub sink adapter.
pub struct GithubSink {
    client: reqwest::Client,
}

impl GithubSink {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn map_status(status: u16, body: String, resource: String) -> AdapterError {
        match status {
            401 => AdapterError::AuthFailed {
                platform: "github".into(),
            },
            404 => AdapterError::NotFound {
                platform: "github".into(),
                resource,
            },
            403 | 429 => AdapterError::RateLimited {
                platform: "github".into(),
                retry_after: None,
            },
            422 => AdapterError::InvalidPayload {
                platform: "github".into(),
                reason: body,
            },
            s => AdapterError::Http {
                platform: "github".into(),
                status: s,
                body,
            },
        }
    }
}

impl Default for GithubSink {
    fn default() -> Self {
        Self::new()
    }
}

fn priority_label(priority: TaskPriority) -> &'static str {
    match priority {
        TaskPriority::Low => "priority: low",
        TaskPriority::Medium => "priority: medium",
        TaskPriority::High => "priority: high",
        TaskPriority::Urgent => "priority: urgent",
    }
}

#[derive(Debug, Deserialize)]
struct IssueCreated {
    number: u64,
    html_url: String,
}

#[async_trait]
impl SinkAdapter for GithubSink {
    fn platform(&self) -> &'static str {
        "github"
    }

    async fn create_task(
        &self,
        task: &DetectedTask,
        sink: &SinkConfig,
        credentials: &SinkCredentials,
        scope: MentionScope<'_>,
        resolver: &MentionResolver,
    ) -> Result<CreatedTask, AdapterError> {
        let SinkConfig::Github {
            owner,
            repo,
            labels,
        } = sink
        else {
            return Err(AdapterError::InvalidPayload {
                platform: "github".into(),
                reason: format!("sink config is for '{}'", sink.platform()),
            });
        };

        let mut body_text = task.description.clone();
        let mut assignees: Vec<String> = Vec::new();

        if let Some(token) = &task.assignee {
            match resolver
                .resolve(scope.platform, scope.workspace_id, token)
                .await
            {
                Ok(Resolution::Resolved { dest_user_id, .. }) => assignees.push(dest_user_id),
                Ok(Resolution::Unresolved) => {
                    body_text.push_str(&format!("\n\nRequested assignee: {token}"));
                }
                Err(e) => {
                    warn!(error = %e, token, "Mention lookup failed, keeping raw handle");
                    body_text.push_str(&format!("\n\nRequested assignee: {token}"));
                }
            }
        }

        let mut issue_labels = labels.clone();
        if let Some(priority) = task.priority {
            issue_labels.push(priority_label(priority).to_string());
        }
        if let Some(task_type) = &task.task_type {
            issue_labels.push(task_type.clone());
        }

        let payload = serde_json::json!({
            "title": task.title,
            "body": body_text,
            "labels": issue_labels,
            "assignees": assignees,
        });

        let url = format!("{API_BASE}/repos/{owner}/{repo}/issues");
        let response = self
            .client
            .post(&url)
            .bearer_auth(credentials.token.expose_secret())
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AdapterError::Network {
                platform: "github".into(),
                reason: e.to_string(),
            })?;

        let status = response.status().as_u16();
        if status != 201 {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_status(status, body, format!("{owner}/{repo}")));
        }

        let issue: IssueCreated = response
            .json()
            .await
            .map_err(|e| AdapterError::InvalidPayload {
                platform: "github".into(),
                reason: e.to_string(),
            })?;

        debug!(repo = %format!("{owner}/{repo}"), number = issue.number, "Created GitHub issue");
        Ok(CreatedTask {
            external_id: issue.number.to_string(),
            external_url: issue.html_url,
        })
    }

    async fn validate_credentials(
        &self,
        credentials: &SinkCredentials,
    ) -> Result<ValidationResult, AdapterError> {
        let response = self
            .client
            .get(format!("{API_BASE}/user"))
            .bearer_auth(credentials.token.expose_secret())
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|e| AdapterError::Network {
                platform: "github".into(),
                reason: e.to_string(),
            })?;

        if response.status().as_u16() == 401 {
            return Ok(ValidationResult {
                valid: false,
                detail: Some("authentication failed".into()),
            });
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_status(status, body, "user".into()));
        }

        #[derive(Deserialize)]
        struct User {
            login: String,
        }
        let user: User = response
            .json()
            .await
            .map_err(|e| AdapterError::InvalidPayload {
                platform: "github".into(),
                reason: e.to_string(),
            })?;
        Ok(ValidationResult {
            valid: true,
            detail: Some(user.login),
        })
    }
}
