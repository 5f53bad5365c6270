// SPDX-License-Identifier: MIT
// gateway/routes.rs — JSON endpoints: health, sessions, signal, cancel.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::ApiError;
use crate::sessions::{self, valid_session_id, SignalDelivery, SignalError};
use crate::InspectorContext;

/// Hard timeout for the non-streaming endpoints.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Signals a client may deliver through `/signal/{id}`.
const ALLOWED_SIGNALS: [&str; 3] = ["human_input_answer", "pause", "resume"];

/// Reject any id that could escape the traces directory. Pattern mismatch
/// is a 404 rather than a 403 so ids cannot be enumerated.
fn checked_session_id(session_id: &str) -> Result<&str, ApiError> {
    if valid_session_id(session_id) {
        Ok(session_id)
    } else {
        Err(ApiError::NotFound)
    }
}

pub async fn health(State(_ctx): State<Arc<InspectorContext>>) -> Json<Value> {
    Json(json!({
        "name": "mcp-agent-inspector",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn sessions(
    State(ctx): State<Arc<InspectorContext>>,
) -> Result<Json<sessions::SessionList>, ApiError> {
    let list = tokio::time::timeout(
        REQUEST_TIMEOUT,
        sessions::list(
            &ctx.config,
            &ctx.registry,
            &ctx.scan_cache,
            ctx.external.as_ref(),
        ),
    )
    .await
    .map_err(|_| ApiError::Internal("session listing timed out".to_string()))?;
    Ok(Json(list))
}

#[derive(Debug, Deserialize)]
pub struct SignalRequest {
    pub signal: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

pub async fn signal(
    State(ctx): State<Arc<InspectorContext>>,
    Path(session_id): Path<String>,
    Json(body): Json<SignalRequest>,
) -> Result<Json<Value>, ApiError> {
    let session_id = checked_session_id(&session_id)?;
    if !ALLOWED_SIGNALS.contains(&body.signal.as_str()) {
        return Err(ApiError::Validation(format!(
            "unknown signal: {}",
            body.signal
        )));
    }

    let delivery = SignalDelivery {
        signal: body.signal.clone(),
        payload: body.payload,
    };
    match ctx.registry.signal(session_id, delivery) {
        Ok(()) => {
            info!(session = session_id, signal = %body.signal, "signal dispatched");
            Ok(Json(json!({ "ok": true })))
        }
        Err(SignalError::UnknownSession) | Err(SignalError::Closed) => Err(ApiError::NotFound),
    }
}

pub async fn cancel(
    State(ctx): State<Arc<InspectorContext>>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session_id = checked_session_id(&session_id)?;
    if ctx.registry.cancel(session_id) {
        info!(session = session_id, "cancellation requested");
        Ok(Json(json!({ "ok": true })))
    } else {
        Err(ApiError::NotFound)
    }
}
