//! Linear sink adapter — creates issues through the GraphQL API.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::adapters::{CreatedTask, MentionScope, SinkAdapter, ValidationResult};
use crate::error::AdapterError;
use crate::mentions::{MentionResolver, Resolution};
use crate::model::{DetectedTask, SinkConfig, SinkCredentials, TaskPriority};

const API_URL: &str = "https://api.linear.app/graphql";

const CREATE_ISSUE: &str = r#"
mutation IssueCreate($input: IssueCreateInput!) {
  issueCreate(input: $input) {
    success
    issue { id identifier url }
  }
}"#;

const VIEWER: &str = "query { viewer { id email } }";

/// Linear sink adapter.
pub struct LinearSink {
    client: reqwest::Client,
}

impl LinearSink {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn graphql(
        &self,
        credentials: &SinkCredentials,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<serde_json::Value, AdapterError> {
        let response = self
            .client
            .post(API_URL)
            .header("Authorization", credentials.token.expose_secret())
            .json(&serde_json::json!({"query": query, "variables": variables}))
            .send()
            .await
            .map_err(|e| AdapterError::Network {
                platform: "linear".into(),
                reason: e.to_string(),
            })?;

        let status = response.status().as_u16();
        match status {
            401 | 403 => {
                return Err(AdapterError::AuthFailed {
                    platform: "linear".into(),
                });
            }
            429 => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(std::time::Duration::from_secs);
                return Err(AdapterError::RateLimited {
                    platform: "linear".into(),
                    retry_after,
                });
            }
            s if s >= 400 => {
                let body = response.text().await.unwrap_or_default();
                return Err(AdapterError::Http {
                    platform: "linear".into(),
                    status: s,
                    body,
                });
            }
            _ => {}
        }

        let payload: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| AdapterError::InvalidPayload {
                    platform: "linear".into(),
                    reason: e.to_string(),
                })?;

        if let Some(errors) = payload.get("errors").and_then(|e| e.as_array())
            && !errors.is_empty()
        {
            return Err(AdapterError::Http {
                platform: "linear".into(),
                status,
                body: errors
                    .iter()
                    .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
                    .collect::<Vec<_>>()
                    .join("; "),
            });
        }

        Ok(payload)
    }
}

impl Default for LinearSink {
    fn default() -> Self {
        Self::new()
    }
}

/// Linear priority scale: 1 urgent, 2 high, 3 normal, 4 low.
fn priority_value(priority: TaskPriority) -> u8 {
    match priority {
        TaskPriority::Urgent => 1,
        TaskPriority::High => 2,
        TaskPriority::Medium => 3,
        TaskPriority::Low => 4,
    }
}

#[derive(Debug, Deserialize)]
struct IssueCreated {
    id: String,
    identifier: String,
    url: String,
}

#[async_trait]
impl SinkAdapter for LinearSink {
    fn platform(&self) -> &'static str {
        "linear"
    }

    async fn create_task(
        &self,
        task: &DetectedTask,
        sink: &SinkConfig,
        credentials: &SinkCredentials,
        scope: MentionScope<'_>,
        resolver: &MentionResolver,
    ) -> Result<CreatedTask, AdapterError> {
        let SinkConfig::Linear {
            team_id,
            project_id,
            label_id,
        } = sink
        else {
            return Err(AdapterError::InvalidPayload {
                platform: "linear".into(),
                reason: format!("sink config is for '{}'", sink.platform()),
            });
        };

        let mut description = task.description.clone();
        let mut assignee_id = None;

        if let Some(token) = &task.assignee {
            match resolver
                .resolve(scope.platform, scope.workspace_id, token)
                .await
            {
                Ok(Resolution::Resolved { dest_user_id, .. }) => {
                    assignee_id = Some(dest_user_id);
                }
                Ok(Resolution::Unresolved) => {
                    // Graceful degradation: the handle stays visible as text.
                    description.push_str(&format!("\n\nRequested assignee: {token}"));
                }
                Err(e) => {
                    warn!(error = %e, token, "Mention lookup failed, keeping raw handle");
                    description.push_str(&format!("\n\nRequested assignee: {token}"));
                }
            }
        }

        let mut input = serde_json::json!({
            "teamId": team_id,
            "title": task.title,
            "description": description,
        });
        if let Some(priority) = task.priority {
            input["priority"] = priority_value(priority).into();
        }
        if let Some(project) = project_id {
            input["projectId"] = project.clone().into();
        }
        if let Some(label) = label_id {
            input["labelIds"] = serde_json::json!([label]);
        }
        if let Some(assignee) = assignee_id {
            input["assigneeId"] = assignee.into();
        }

        let payload = self
            .graphql(credentials, CREATE_ISSUE, serde_json::json!({"input": input}))
            .await?;

        let create = &payload["data"]["issueCreate"];
        if create["success"].as_bool() != Some(true) {
            return Err(AdapterError::Http {
                platform: "linear".into(),
                status: 200,
                body: "issueCreate reported failure".into(),
            });
        }

        let issue: IssueCreated = serde_json::from_value(create["issue"].clone()).map_err(|e| {
            AdapterError::InvalidPayload {
                platform: "linear".into(),
                reason: format!("malformed issue payload: {e}"),
            }
        })?;

        debug!(identifier = %issue.identifier, "Created Linear issue");
        Ok(CreatedTask {
            external_id: issue.id,
            external_url: issue.url,
        })
    }

    async fn validate_credentials(
        &self,
        credentials: &SinkCredentials,
    ) -> Result<ValidationResult, AdapterError> {
        match self
            .graphql(credentials, VIEWER, serde_json::json!({}))
            .await
        {
            Ok(payload) => Ok(ValidationResult {
                valid: payload["data"]["viewer"]["id"].is_string(),
                detail: payload["data"]["viewer"]["email"]
                    .as_str()
                    .map(String::from),
            }),
            Err(AdapterError::AuthFailed { .. }) => Ok(ValidationResult {
                valid: false,
                detail: Some("authentication failed".into()),
            }),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_maps_to_linear_scale() {
        assert_eq!(priority_value(TaskPriority::Urgent), 1);
        assert_eq!(priority_value(TaskPriority::High), 2);
        assert_eq!(priority_value(TaskPriority::Medium), 3);
        assert_eq!(priority_value(TaskPriority::Low), 4);
    }

    #[tokio::test]
    async fn mismatched_sink_config_is_rejected() {
        use crate::store::MemoryStore;
        use secrecy::SecretString;

        let sink = LinearSink::new();
        let task = DetectedTask {
            title: "T".into(),
            description: "D".into(),
            topic: None,
            priority: None,
            task_type: None,
            assignee: None,
        };
        let config = SinkConfig::Github {
            owner: "acme".into(),
            repo: "api".into(),
            labels: vec![],
        };
        let resolver = MentionResolver::new(MemoryStore::new());
        let err = sink
            .create_task(
                &task,
                &config,
                &SinkCredentials {
                    token: SecretString::from("t"),
                },
                MentionScope {
                    platform: "slack",
                    workspace_id: "W1",
                },
                &resolver,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::InvalidPayload { .. }));
    }
}
