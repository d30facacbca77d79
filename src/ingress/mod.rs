//! Webhook ingress — the fire-and-forget HTTP boundary.
//!
//! Verifies signatures, resolves the owning flow by workspace, persists the
//! discussion + job pair and hands off to the orchestrator on a spawned
//! task. The response path never awaits processing: upstream platforms
//! enforce short response deadlines and retry-storm slow endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapters::{AdapterRegistry, ParsedEvent, RawEvent};
use crate::error::{AdapterError, IngressError};
use crate::pipeline::Processor;
use crate::store::Store;

/// Shared state for the ingress routes.
pub struct IngressState {
    pub store: Arc<dyn Store>,
    pub registry: Arc<AdapterRegistry>,
    pub processor: Arc<Processor>,
}

/// Build the ingress router.
pub fn ingress_routes(state: Arc<IngressState>) -> Router {
    Router::new()
        .route("/webhook/{platform}", post(handle_webhook))
        .route("/api/discussions/{id}/reprocess", post(handle_reprocess))
        .route("/health", get(handle_health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        let status = match &self {
            IngressError::UnknownPlatform(_) | IngressError::NoMatchingFlow { .. } => {
                StatusCode::NOT_FOUND
            }
            IngressError::SignatureRejected(_) => StatusCode::UNAUTHORIZED,
            IngressError::DiscussionNotFound(_) => StatusCode::NOT_FOUND,
            IngressError::JobConflict(_) => StatusCode::CONFLICT,
            IngressError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            IngressError::Adapter(e) => match e {
                AdapterError::SignatureInvalid { .. } | AdapterError::StaleTimestamp { .. } => {
                    StatusCode::UNAUTHORIZED
                }
                AdapterError::InvalidPayload { .. } => StatusCode::BAD_REQUEST,
                AdapterError::UnknownPlatform(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::BAD_GATEWAY,
            },
        };
        (status, Json(json!({"ok": false, "error": self.to_string()}))).into_response()
    }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// One webhook endpoint per source platform type.
async fn handle_webhook(
    State(state): State<Arc<IngressState>>,
    Path(platform): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<serde_json::Value>, IngressError> {
    let source = state
        .registry
        .source(&platform)
        .map_err(|_| IngressError::UnknownPlatform(platform.clone()))?;

    let event = RawEvent {
        headers: header_map(&headers),
        body,
        received_at: Utc::now(),
    };

    // Parsing is pure; the signature check needs the per-workspace secret,
    // which only the resolved input carries.
    let parsed = match source.parse_incoming(&event)? {
        ParsedEvent::Challenge(challenge) => {
            return Ok(Json(json!({"challenge": challenge})));
        }
        ParsedEvent::Ignore { reason } => {
            info!(platform, reason, "Ignoring webhook event");
            return Ok(Json(json!({"ok": true, "ignored": reason})));
        }
        ParsedEvent::Discussion(parsed) => parsed,
    };

    let flow = state
        .store
        .load_flow_by_workspace(&platform, &parsed.workspace_id)
        .await?
        .ok_or_else(|| IngressError::NoMatchingFlow {
            platform: platform.clone(),
            workspace_id: parsed.workspace_id.clone(),
        })?;

    let input = flow
        .inputs
        .iter()
        .find(|i| i.platform == platform && i.workspace_id == parsed.workspace_id)
        .ok_or_else(|| IngressError::NoMatchingFlow {
            platform: platform.clone(),
            workspace_id: parsed.workspace_id.clone(),
        })?;

    source.verify_webhook(&event, &input.credentials.signing_secret)?;

    if let Err(e) = flow.validate() {
        warn!(flow = %flow.id, error = %e, "Rejecting event for misconfigured flow");
        return Err(IngressError::Store(crate::error::StoreError::Constraint(
            e.to_string(),
        )));
    }

    let (discussion, job) = state
        .processor
        .intake(&flow, &platform, parsed, event.body)
        .await
        .map_err(|e| {
            warn!(error = %e, "Intake failed");
            IngressError::Store(crate::error::StoreError::Query(e.to_string()))
        })?;

    // Fire and forget: the spawned task owns processing from here.
    state.processor.spawn(job.id);

    Ok(Json(json!({
        "ok": true,
        "discussion_id": discussion.id,
        "job_id": job.id,
    })))
}

/// Manual reprocess of a failed discussion.
async fn handle_reprocess(
    State(state): State<Arc<IngressState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, IngressError> {
    let job = state.processor.reprocess(id).await?;
    state.processor.spawn(job.id);
    Ok(Json(json!({"ok": true, "job_id": job.id})))
}

/// Flatten an axum header map into lowercase-keyed strings.
fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect()
}
