//! Slack source adapter — Events API webhooks, Web API thread access.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use crate::adapters::{
    ParsedDiscussion, ParsedEvent, RawEvent, SourceAdapter, ValidationResult,
};
use crate::error::AdapterError;
use crate::model::{SourceCredentials, ThreadMessage, ThreadRef, ThreadSnapshot};

const API_BASE: &str = "https://slack.com/api";

/// Reject webhooks older (or newer) than this many seconds.
const FRESHNESS_WINDOW_SECS: i64 = 300;

/// Max characters lifted from the root message into the discussion title.
const TITLE_MAX_CHARS: usize = 80;

type HmacSha256 = Hmac<Sha256>;

/// Slack source adapter.
pub struct SlackSource {
    client: reqwest::Client,
}

impl SlackSource {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{API_BASE}/{method}")
    }

    /// Map a Slack API error string onto the adapter error taxonomy.
    fn api_error(error: &str) -> AdapterError {
        match error {
            "invalid_auth" | "not_authed" | "account_inactive" | "token_revoked" => {
                AdapterError::AuthFailed {
                    platform: "slack".into(),
                }
            }
            "channel_not_found" | "thread_not_found" | "message_not_found" => {
                AdapterError::NotFound {
                    platform: "slack".into(),
                    resource: error.to_string(),
                }
            }
            "ratelimited" | "rate_limited" => AdapterError::RateLimited {
                platform: "slack".into(),
                retry_after: None,
            },
            other => AdapterError::Http {
                platform: "slack".into(),
                status: 200,
                body: other.to_string(),
            },
        }
    }
}

impl Default for SlackSource {
    fn default() -> Self {
        Self::new()
    }
}

// ── Wire shapes ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    challenge: Option<String>,
    #[serde(default)]
    team_id: Option<String>,
    #[serde(default)]
    event: Option<MessageEvent>,
}

#[derive(Debug, Deserialize)]
struct MessageEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RepliesResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    messages: Vec<ReplyMessage>,
}

#[derive(Debug, Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    ts: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiAck {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    team_id: Option<String>,
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Parse a Slack "seconds.micros" timestamp.
fn parse_slack_ts(ts: &str) -> Option<DateTime<Utc>> {
    let secs: f64 = ts.parse().ok()?;
    DateTime::from_timestamp(secs as i64, 0)
}

/// Constant-time hex signature comparison.
fn signatures_match(expected: &str, provided: &str) -> bool {
    if expected.len() != provided.len() {
        return false;
    }
    expected
        .bytes()
        .zip(provided.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

fn title_from(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("");
    first_line.chars().take(TITLE_MAX_CHARS).collect()
}

#[async_trait]
impl SourceAdapter for SlackSource {
    fn platform(&self) -> &'static str {
        "slack"
    }

    fn verify_webhook(
        &self,
        event: &RawEvent,
        signing_secret: &SecretString,
    ) -> Result<(), AdapterError> {
        let timestamp = event.header("x-slack-request-timestamp").ok_or_else(|| {
            AdapterError::SignatureInvalid {
                platform: "slack".into(),
            }
        })?;
        let provided = event.header("x-slack-signature").ok_or_else(|| {
            AdapterError::SignatureInvalid {
                platform: "slack".into(),
            }
        })?;

        let ts: i64 = timestamp
            .parse()
            .map_err(|_| AdapterError::SignatureInvalid {
                platform: "slack".into(),
            })?;
        let age = (event.received_at.timestamp() - ts).abs();
        if age > FRESHNESS_WINDOW_SECS {
            return Err(AdapterError::StaleTimestamp {
                platform: "slack".into(),
                age_secs: age,
            });
        }

        let basestring = format!("v0:{timestamp}:{}", event.body);
        let mut mac = HmacSha256::new_from_slice(signing_secret.expose_secret().as_bytes())
            .map_err(|_| AdapterError::SignatureInvalid {
                platform: "slack".into(),
            })?;
        mac.update(basestring.as_bytes());
        let expected = format!("v0={}", hex::encode(mac.finalize().into_bytes()));

        if signatures_match(&expected, provided) {
            Ok(())
        } else {
            Err(AdapterError::SignatureInvalid {
                platform: "slack".into(),
            })
        }
    }

    fn parse_incoming(&self, event: &RawEvent) -> Result<ParsedEvent, AdapterError> {
        let envelope: Envelope =
            serde_json::from_str(&event.body).map_err(|e| AdapterError::InvalidPayload {
                platform: "slack".into(),
                reason: e.to_string(),
            })?;

        match envelope.kind.as_str() {
            "url_verification" => {
                let challenge = envelope.challenge.ok_or_else(|| {
                    AdapterError::InvalidPayload {
                        platform: "slack".into(),
                        reason: "url_verification without challenge".into(),
                    }
                })?;
                Ok(ParsedEvent::Challenge(challenge))
            }
            "event_callback" => {
                let team_id =
                    envelope
                        .team_id
                        .ok_or_else(|| AdapterError::InvalidPayload {
                            platform: "slack".into(),
                            reason: "event_callback without team_id".into(),
                        })?;
                let msg = envelope.event.ok_or_else(|| AdapterError::InvalidPayload {
                    platform: "slack".into(),
                    reason: "event_callback without event".into(),
                })?;

                if msg.kind != "message" {
                    return Ok(ParsedEvent::Ignore {
                        reason: format!("event type '{}'", msg.kind),
                    });
                }
                if msg.bot_id.is_some() {
                    return Ok(ParsedEvent::Ignore {
                        reason: "bot message".into(),
                    });
                }
                if let Some(subtype) = msg.subtype {
                    return Ok(ParsedEvent::Ignore {
                        reason: format!("message subtype '{subtype}'"),
                    });
                }

                let (Some(user), Some(text), Some(channel), Some(ts)) =
                    (msg.user, msg.text, msg.channel, msg.ts)
                else {
                    return Err(AdapterError::InvalidPayload {
                        platform: "slack".into(),
                        reason: "message event missing user/text/channel/ts".into(),
                    });
                };

                Ok(ParsedEvent::Discussion(ParsedDiscussion {
                    workspace_id: team_id,
                    thread_ref: ThreadRef {
                        channel_id: channel,
                        // Replies land in the root's thread; a root message
                        // is its own thread anchor.
                        thread_id: msg.thread_ts.unwrap_or(ts),
                    },
                    author: user,
                    title: title_from(&text),
                    content: text,
                }))
            }
            other => Ok(ParsedEvent::Ignore {
                reason: format!("envelope type '{other}'"),
            }),
        }
    }

    async fn fetch_thread(
        &self,
        thread: &ThreadRef,
        credentials: &SourceCredentials,
    ) -> Result<ThreadSnapshot, AdapterError> {
        let response = self
            .client
            .get(self.api_url("conversations.replies"))
            .bearer_auth(credentials.token.expose_secret())
            .query(&[("channel", &thread.channel_id), ("ts", &thread.thread_id)])
            .send()
            .await
            .map_err(|e| AdapterError::Network {
                platform: "slack".into(),
                reason: e.to_string(),
            })?;

        if response.status().as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(std::time::Duration::from_secs);
            return Err(AdapterError::RateLimited {
                platform: "slack".into(),
                retry_after,
            });
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Http {
                platform: "slack".into(),
                status,
                body,
            });
        }

        let replies: RepliesResponse =
            response
                .json()
                .await
                .map_err(|e| AdapterError::InvalidPayload {
                    platform: "slack".into(),
                    reason: e.to_string(),
                })?;
        if !replies.ok {
            return Err(Self::api_error(replies.error.as_deref().unwrap_or("unknown")));
        }

        let mut messages = replies.messages.into_iter().map(|m| ThreadMessage {
            author: m.user.or(m.username).unwrap_or_else(|| "unknown".into()),
            author_name: None,
            content: m.text,
            posted_at: m.ts.as_deref().and_then(parse_slack_ts),
        });

        let root = messages.next().ok_or_else(|| AdapterError::NotFound {
            platform: "slack".into(),
            resource: format!("thread {}", thread.thread_id),
        })?;

        let snapshot = ThreadSnapshot {
            root,
            replies: messages.collect(),
        };
        debug!(
            channel = %thread.channel_id,
            thread = %thread.thread_id,
            messages = snapshot.message_count(),
            "Fetched thread"
        );
        Ok(snapshot)
    }

    async fn post_reply(
        &self,
        thread: &ThreadRef,
        text: &str,
        credentials: &SourceCredentials,
    ) -> Result<(), AdapterError> {
        let body = serde_json::json!({
            "channel": thread.channel_id,
            "thread_ts": thread.thread_id,
            "text": text,
        });

        let response = self
            .client
            .post(self.api_url("chat.postMessage"))
            .bearer_auth(credentials.token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::Network {
                platform: "slack".into(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Http {
                platform: "slack".into(),
                status,
                body,
            });
        }

        let ack: ApiAck = response
            .json()
            .await
            .map_err(|e| AdapterError::InvalidPayload {
                platform: "slack".into(),
                reason: e.to_string(),
            })?;
        if !ack.ok {
            return Err(Self::api_error(ack.error.as_deref().unwrap_or("unknown")));
        }
        Ok(())
    }

    async fn validate_credentials(
        &self,
        credentials: &SourceCredentials,
    ) -> Result<ValidationResult, AdapterError> {
        let response = self
            .client
            .post(self.api_url("auth.test"))
            .bearer_auth(credentials.token.expose_secret())
            .send()
            .await
            .map_err(|e| AdapterError::Network {
                platform: "slack".into(),
                reason: e.to_string(),
            })?;

        let ack: ApiAck = response
            .json()
            .await
            .map_err(|e| AdapterError::InvalidPayload {
                platform: "slack".into(),
                reason: e.to_string(),
            })?;

        Ok(ValidationResult {
            valid: ack.ok,
            detail: ack.error.or(ack.team_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn signed_event(secret: &str, body: &str, ts_offset_secs: i64) -> RawEvent {
        let now = Utc::now();
        let ts = now.timestamp() + ts_offset_secs;
        let basestring = format!("v0:{ts}:{body}");
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(basestring.as_bytes());
        let signature = format!("v0={}", hex::encode(mac.finalize().into_bytes()));

        let mut headers = HashMap::new();
        headers.insert("x-slack-request-timestamp".to_string(), ts.to_string());
        headers.insert("x-slack-signature".to_string(), signature);
        RawEvent {
            headers,
            body: body.to_string(),
            received_at: now,
        }
    }

    fn message_body() -> String {
        serde_json::json!({
            "type": "event_callback",
            "team_id": "T0001",
            "event": {
                "type": "message",
                "user": "U123",
                "text": "We should fix the login bug\nmore detail here",
                "channel": "C42",
                "ts": "1700000000.000100"
            }
        })
        .to_string()
    }

    #[test]
    fn valid_signature_passes() {
        let adapter = SlackSource::new();
        let event = signed_event("secret", &message_body(), 0);
        assert!(adapter
            .verify_webhook(&event, &SecretString::from("secret"))
            .is_ok());
    }

    #[test]
    fn wrong_secret_fails_signature() {
        let adapter = SlackSource::new();
        let event = signed_event("secret", &message_body(), 0);
        let err = adapter
            .verify_webhook(&event, &SecretString::from("other"))
            .unwrap_err();
        assert!(matches!(err, AdapterError::SignatureInvalid { .. }));
    }

    #[test]
    fn tampered_body_fails_signature() {
        let adapter = SlackSource::new();
        let mut event = signed_event("secret", &message_body(), 0);
        event.body.push('x');
        assert!(adapter
            .verify_webhook(&event, &SecretString::from("secret"))
            .is_err());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let adapter = SlackSource::new();
        let event = signed_event("secret", &message_body(), -600);
        let err = adapter
            .verify_webhook(&event, &SecretString::from("secret"))
            .unwrap_err();
        assert!(matches!(err, AdapterError::StaleTimestamp { .. }));
    }

    #[test]
    fn missing_signature_headers_are_rejected() {
        let adapter = SlackSource::new();
        let event = RawEvent {
            headers: HashMap::new(),
            body: message_body(),
            received_at: Utc::now(),
        };
        assert!(adapter
            .verify_webhook(&event, &SecretString::from("secret"))
            .is_err());
    }

    #[test]
    fn parses_message_event() {
        let adapter = SlackSource::new();
        let event = signed_event("s", &message_body(), 0);
        match adapter.parse_incoming(&event).unwrap() {
            ParsedEvent::Discussion(d) => {
                assert_eq!(d.workspace_id, "T0001");
                assert_eq!(d.thread_ref.channel_id, "C42");
                assert_eq!(d.thread_ref.thread_id, "1700000000.000100");
                assert_eq!(d.author, "U123");
                assert_eq!(d.title, "We should fix the login bug");
            }
            other => panic!("expected discussion, got {other:?}"),
        }
    }

    #[test]
    fn threaded_reply_anchors_to_root() {
        let adapter = SlackSource::new();
        let body = serde_json::json!({
            "type": "event_callback",
            "team_id": "T0001",
            "event": {
                "type": "message",
                "user": "U123",
                "text": "agreed",
                "channel": "C42",
                "ts": "1700000050.000200",
                "thread_ts": "1700000000.000100"
            }
        })
        .to_string();
        let event = signed_event("s", &body, 0);
        match adapter.parse_incoming(&event).unwrap() {
            ParsedEvent::Discussion(d) => {
                assert_eq!(d.thread_ref.thread_id, "1700000000.000100");
            }
            other => panic!("expected discussion, got {other:?}"),
        }
    }

    #[test]
    fn challenge_is_surfaced() {
        let adapter = SlackSource::new();
        let body = r#"{"type": "url_verification", "challenge": "chal-123"}"#;
        let event = signed_event("s", body, 0);
        match adapter.parse_incoming(&event).unwrap() {
            ParsedEvent::Challenge(c) => assert_eq!(c, "chal-123"),
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    #[test]
    fn bot_messages_are_ignored() {
        let adapter = SlackSource::new();
        let body = serde_json::json!({
            "type": "event_callback",
            "team_id": "T0001",
            "event": {
                "type": "message",
                "bot_id": "B99",
                "text": "automated",
                "channel": "C42",
                "ts": "1700000000.000100"
            }
        })
        .to_string();
        let event = signed_event("s", &body, 0);
        assert!(matches!(
            adapter.parse_incoming(&event).unwrap(),
            ParsedEvent::Ignore { .. }
        ));
    }

    #[test]
    fn edits_are_ignored() {
        let adapter = SlackSource::new();
        let body = serde_json::json!({
            "type": "event_callback",
            "team_id": "T0001",
            "event": {
                "type": "message",
                "subtype": "message_changed",
                "channel": "C42",
                "ts": "1700000000.000100"
            }
        })
        .to_string();
        let event = signed_event("s", &body, 0);
        assert!(matches!(
            adapter.parse_incoming(&event).unwrap(),
            ParsedEvent::Ignore { .. }
        ));
    }

    #[test]
    fn garbage_body_is_invalid_payload() {
        let adapter = SlackSource::new();
        let event = signed_event("s", "not json", 0);
        assert!(matches!(
            adapter.parse_incoming(&event),
            Err(AdapterError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn slack_ts_parses_to_datetime() {
        let dt = parse_slack_ts("1700000000.000100").unwrap();
        assert_eq!(dt.timestamp(), 1_700_000_000);
    }

    #[test]
    fn title_truncates_first_line() {
        let long = "a".repeat(200);
        assert_eq!(title_from(&long).chars().count(), TITLE_MAX_CHARS);
        assert_eq!(title_from("line one\nline two"), "line one");
    }
}
