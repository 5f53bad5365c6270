// SPDX-License-Identifier: MIT
//! State and result capture onto the current span.
//!
//! `capture_result` wraps an operation so its return value lands on the
//! current span as `mcp.result.<name>_json`; `capture_state` records ad-hoc
//! checkpoints as `mcp.state.<name>_json`. Serialization failures and
//! missing spans are silently skipped, and nothing is recorded while an
//! external durable-workflow engine is replaying history.

use std::future::Future;

use serde::Serialize;

use crate::context;
use crate::span::ActiveSpan;
use crate::span_meta::{self, safe_json_attribute};

fn record(prefix: &str, name: &str, value: &impl Serialize) {
    if context::in_replay() {
        return;
    }
    let Some(span) = ActiveSpan::current() else {
        return;
    };
    if !span.is_recording() {
        return;
    }
    if let Ok(json) = serde_json::to_string(value) {
        safe_json_attribute(&span, &format!("{prefix}{name}_json"), &json);
    }
}

/// Run `fut` and attach its serialized return value to the current span
/// under `mcp.result.<name>_json`. The value passes through untouched.
pub async fn capture_result<F, T>(name: &str, fut: F) -> T
where
    F: Future<Output = T>,
    T: Serialize,
{
    let result = fut.await;
    record(span_meta::RESULT_PREFIX, name, &result);
    result
}

/// Record an arbitrary snapshot under `mcp.state.<name>_json`.
pub fn capture_state(name: &str, state: &impl Serialize) {
    record(span_meta::STATE_PREFIX, name, state);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::Tracer;
    use serde_json::json;

    fn test_tracer() -> (Tracer, tokio::sync::mpsc::Receiver<crate::span::Span>) {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        (Tracer::new(tx), rx)
    }

    #[tokio::test]
    async fn result_is_attached_under_named_key() {
        let (tracer, mut rx) = test_tracer();
        let out = tracer
            .in_span("plan", async {
                capture_result("plan", async { json!({"steps": 2}) }).await
            })
            .await;
        assert_eq!(out["steps"], 2);

        let span = rx.recv().await.unwrap();
        assert_eq!(
            span.attributes
                .get("mcp.result.plan_json")
                .and_then(|v| v.as_str()),
            Some(r#"{"steps":2}"#)
        );
    }

    #[tokio::test]
    async fn state_capture_uses_state_prefix() {
        let (tracer, mut rx) = test_tracer();
        tracer
            .in_span("checkpoint", async {
                capture_state("progress", &json!({"done": 50}));
            })
            .await;
        let span = rx.recv().await.unwrap();
        assert!(span.attributes.contains_key("mcp.state.progress_json"));
    }

    #[tokio::test]
    async fn replay_context_skips_recording() {
        let (tracer, mut rx) = test_tracer();
        tracer
            .in_span("replayed", async {
                context::replay_scope(async {
                    capture_result("decision", async { json!("cached") }).await
                })
                .await
            })
            .await;
        let span = rx.recv().await.unwrap();
        assert!(!span.attributes.contains_key("mcp.result.decision_json"));
    }

    #[tokio::test]
    async fn no_span_is_silent() {
        capture_state("orphan", &json!(1));
        let _ = capture_result("orphan", async { 1_u32 }).await;
    }
}
