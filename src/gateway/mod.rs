// SPDX-License-Identifier: MIT
//! HTTP gateway.
//!
//! All routes mount under `/_inspector` and bind to localhost by default.
//! In co-embedded mode the host application merges [`build_router`] into
//! its own router; in standalone mode [`serve`] owns the listener and a
//! graceful shutdown that drains the exporter and releases the writer
//! lock.
//!
//! Endpoints:
//!   GET  /_inspector/health
//!   GET  /_inspector/sessions
//!   GET  /_inspector/trace/{session_id}
//!   GET  /_inspector/events            (SSE)
//!   POST /_inspector/signal/{session_id}
//!   POST /_inspector/cancel/{session_id}

pub mod routes;
pub mod sse;
pub mod trace_stream;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::info;

use crate::InspectorContext;

/// Request-scoped error mapped to a structured `{error:{kind,message}}`
/// body. Only per-request problems surface here; faults internal to the
/// observation plane never do.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    NotFound,
    Internal(String),
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::NotFound => "NotFound",
            Self::Internal(_) => "Internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            Self::Validation(m) | Self::Internal(m) => m.clone(),
            Self::NotFound => "not found".to_string(),
        };
        let body = Json(json!({
            "error": { "kind": self.kind(), "message": message }
        }));
        (self.status(), body).into_response()
    }
}

/// Build the inspector router for mounting into a host application.
pub fn build_router(ctx: Arc<InspectorContext>) -> Router {
    Router::new()
        .nest(
            "/_inspector",
            Router::new()
                .route("/health", get(routes::health))
                .route("/sessions", get(routes::sessions))
                .route("/trace/:session_id", get(trace_stream::trace))
                .route("/events", get(sse::events))
                .route("/signal/:session_id", post(routes::signal))
                .route("/cancel/:session_id", post(routes::cancel)),
        )
        .with_state(ctx)
}

/// Run the standalone server until a shutdown signal arrives, then drain
/// the span exporter so every buffered span reaches disk.
pub async fn serve(ctx: Arc<InspectorContext>) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", ctx.config.host, ctx.config.port)
        .parse()
        .context("parse bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind inspector gateway to {addr}"))?;

    info!(
        "inspector gateway listening on http://{}/_inspector",
        addr
    );

    let router = build_router(ctx.clone());
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("inspector gateway server")?;

    info!("gateway stopped, draining span exporter");
    ctx.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
