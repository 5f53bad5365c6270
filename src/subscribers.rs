// SPDX-License-Identifier: MIT
//! Hook subscribers: span enrichment and lifecycle fan-out.
//!
//! Enrichment subscribers translate hook payloads into `mcp.*` attributes
//! on the task's current span. Lifecycle subscribers keep the live session
//! registry current, publish bus events, and run the per-session heartbeat
//! loop. All of them are strictly observational: no payload is mutated and
//! no failure propagates into agent code.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::context;
use crate::events::{Event, EventStream};
use crate::instrument::{self, hooks, HookCallback, HookPayload};
use crate::sessions::{CounterTotals, SessionRegistry, SessionStatus};
use crate::span::ActiveSpan;
use crate::span_meta::{self, safe_json_attribute};

/// Current recording span, or nothing to do.
fn recording_span() -> Option<ActiveSpan> {
    ActiveSpan::current().filter(ActiveSpan::is_recording)
}

fn set_session_attr(span: &ActiveSpan) {
    let session_id = context::get();
    if session_id != context::UNKNOWN_SESSION {
        span.set_attribute(span_meta::SESSION_ID, session_id);
    }
}

fn set_json(span: &ActiveSpan, key: &str, value: &Value) {
    match serde_json::to_string(value) {
        Ok(json) => safe_json_attribute(span, key, &json),
        Err(e) => debug!(key, err = %e, "payload serialization failed, skipping"),
    }
}

fn set_error(span: &ActiveSpan, message: &str) {
    span.set_attribute(span_meta::STATUS_CODE, "error");
    span.set_attribute(span_meta::ERROR_MESSAGE, message);
    span.set_status(crate::span::StatusCode::Error, Some(message.to_string()));
}

// ─── Enrichment subscribers ───────────────────────────────────────────────────

fn on_before_agent_call(payload: &HookPayload) {
    let Some(span) = recording_span() else { return };
    if let HookPayload::AgentCall { agent, .. } = payload {
        span.set_attribute(span_meta::AGENT_NAME, agent.as_str());
        set_session_attr(&span);
    }
}

fn on_after_agent_call(payload: &HookPayload) {
    let Some(span) = recording_span() else { return };
    if let HookPayload::AgentCall {
        result: Some(result),
        ..
    } = payload
    {
        set_json(&span, span_meta::AGENT_RESULT_JSON, result);
    }
}

fn on_before_llm_generate(payload: &HookPayload) {
    let Some(span) = recording_span() else { return };
    if let HookPayload::LlmGenerate {
        provider,
        model,
        prompt,
        ..
    } = payload
    {
        if let Some(provider) = provider {
            span.set_attribute(span_meta::LLM_PROVIDER, provider.as_str());
        }
        if let Some(model) = model {
            span.set_attribute(span_meta::LLM_MODEL, model.as_str());
        }
        if let Some(prompt) = prompt {
            set_json(&span, span_meta::LLM_PROMPT_JSON, prompt);
        }
        set_session_attr(&span);
    }
}

fn on_after_llm_generate(payload: &HookPayload) {
    let Some(span) = recording_span() else { return };
    if let HookPayload::LlmGenerate {
        response, usage, ..
    } = payload
    {
        if let Some(response) = response {
            set_json(&span, span_meta::LLM_RESPONSE_JSON, response);
        }
        if let Some(usage) = usage {
            span.set_attribute(span_meta::LLM_INPUT_TOKENS, usage.input_tokens);
            span.set_attribute(span_meta::LLM_OUTPUT_TOKENS, usage.output_tokens);
        }
    }
}

fn on_before_tool_call(payload: &HookPayload) {
    let Some(span) = recording_span() else { return };
    if let HookPayload::ToolCall {
        tool_name, args, ..
    } = payload
    {
        span.set_attribute(span_meta::TOOL_NAME, tool_name.as_str());
        set_json(&span, span_meta::TOOL_INPUT_JSON, args);
        set_session_attr(&span);
    }
}

fn on_after_tool_call(payload: &HookPayload) {
    let Some(span) = recording_span() else { return };
    if let HookPayload::ToolCall {
        result: Some(result),
        ..
    } = payload
    {
        set_json(&span, span_meta::TOOL_OUTPUT_JSON, result);
    }
}

fn on_before_workflow_run(payload: &HookPayload) {
    let Some(span) = recording_span() else { return };
    if let HookPayload::WorkflowRun {
        workflow, input, ..
    } = payload
    {
        span.set_attribute(span_meta::WORKFLOW_TYPE, workflow.as_str());
        if let Some(input) = input {
            set_json(&span, span_meta::WORKFLOW_INPUT_JSON, input);
        }
        set_session_attr(&span);
    }
}

fn on_after_workflow_run(payload: &HookPayload) {
    let Some(span) = recording_span() else { return };
    if let HookPayload::WorkflowRun { result, .. } = payload {
        span.set_attribute(span_meta::STATUS_CODE, "ok");
        if let Some(result) = result {
            set_json(&span, span_meta::WORKFLOW_OUTPUT_JSON, result);
        }
    }
}

fn on_before_rpc_request(payload: &HookPayload) {
    let Some(span) = recording_span() else { return };
    if let HookPayload::RpcRequest {
        envelope,
        transport,
        ..
    } = payload
    {
        if let Some(method) = envelope.get("method").and_then(Value::as_str) {
            span.set_attribute(span_meta::RPC_METHOD, method);
        }
        if let Some(id) = envelope.get("id") {
            span.set_attribute(span_meta::RPC_ID, id.to_string());
        }
        span.set_attribute(span_meta::RPC_TRANSPORT, transport.as_str());
        set_json(&span, span_meta::RPC_REQUEST_JSON, envelope);
    }
}

fn on_after_rpc_response(payload: &HookPayload) {
    let Some(span) = recording_span() else { return };
    if let HookPayload::RpcRequest {
        envelope,
        duration_ms,
        ..
    } = payload
    {
        if let Some(ms) = duration_ms {
            span.set_attribute(span_meta::RPC_DURATION_MS, *ms);
        }
        span.set_attribute(span_meta::TRANSPORT_STATUS, "connected");
        set_json(&span, span_meta::RPC_RESPONSE_JSON, envelope);
    }
}

fn on_error_rpc_request(payload: &HookPayload) {
    let Some(span) = recording_span() else { return };
    if let HookPayload::RpcRequest {
        error: Some(error), ..
    } = payload
    {
        set_error(&span, error);
        let lower = error.to_lowercase();
        let status = if lower.contains("timeout") || lower.contains("timed out") {
            span.set_attribute(span_meta::ERROR_CODE, "TIMEOUT");
            "disconnected"
        } else if lower.contains("connection") {
            "disconnected"
        } else {
            "error"
        };
        span.set_attribute(span_meta::TRANSPORT_STATUS, status);
    }
}

fn on_before_resource_fetch(payload: &HookPayload) {
    let Some(span) = recording_span() else { return };
    if let HookPayload::ResourceFetch { uri, .. } = payload {
        span.set_attribute(span_meta::RESOURCE_URI, uri.as_str());
    }
}

fn on_after_resource_fetch(payload: &HookPayload) {
    let Some(span) = recording_span() else { return };
    if let HookPayload::ResourceFetch {
        mime_type, content, ..
    } = payload
    {
        if let Some(mime) = mime_type {
            span.set_attribute(span_meta::RESOURCE_MIME_TYPE, mime.as_str());
        }
        if let Some(content) = content {
            set_json(&span, span_meta::RESOURCE_CONTENT_JSON, content);
        }
    }
}

fn on_before_prompt_apply(payload: &HookPayload) {
    let Some(span) = recording_span() else { return };
    if let HookPayload::PromptApply {
        template_id,
        parameters,
        ..
    } = payload
    {
        span.set_attribute(span_meta::PROMPT_TEMPLATE_ID, template_id.as_str());
        set_json(&span, span_meta::PROMPT_PARAMETERS_JSON, parameters);
    }
}

fn on_after_prompt_apply(payload: &HookPayload) {
    let Some(span) = recording_span() else { return };
    if let HookPayload::PromptApply {
        rendered: Some(rendered),
        ..
    } = payload
    {
        safe_json_attribute(&span, span_meta::PROMPT_RENDERED, rendered);
    }
}

/// Shared error handler for the plain `error_*` phases.
fn on_error_generic(payload: &HookPayload) {
    let Some(span) = recording_span() else { return };
    let error = match payload {
        HookPayload::AgentCall { error, .. }
        | HookPayload::LlmGenerate { error, .. }
        | HookPayload::ToolCall { error, .. }
        | HookPayload::WorkflowRun { error, .. }
        | HookPayload::ResourceFetch { error, .. }
        | HookPayload::PromptApply { error, .. } => error.as_deref(),
        _ => None,
    };
    if let Some(error) = error {
        set_error(&span, error);
    }
}

fn on_transport_status(status: &'static str) -> impl Fn(&HookPayload) {
    move |payload| {
        let Some(span) = recording_span() else { return };
        if let HookPayload::Transport { uri, .. } = payload {
            span.set_attribute(span_meta::TRANSPORT_STATUS, status);
            span.set_attribute(span_meta::RESOURCE_URI, uri.as_str());
        }
    }
}

// ─── Heartbeat loop ───────────────────────────────────────────────────────────

fn spawn_heartbeat(
    registry: Arc<SessionRegistry>,
    bus: Arc<EventStream>,
    session_id: String,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // skip immediate tick
        let mut previous = CounterTotals::default();
        loop {
            ticker.tick().await;
            let Some(totals) = registry.totals(&session_id) else {
                break; // session left the live registry
            };
            bus.publish(Event::Heartbeat {
                session_id: session_id.clone(),
                llm_calls_delta: totals.llm_calls.saturating_sub(previous.llm_calls),
                tokens_delta: totals.tokens.saturating_sub(previous.tokens),
                tool_calls_delta: totals.tool_calls.saturating_sub(previous.tool_calls),
                current_span_count: totals.spans,
            });
            previous = totals;
        }
    })
}

// ─── Registration ─────────────────────────────────────────────────────────────

/// Handle to every registration made by [`register_all`]; dropping it does
/// nothing, call [`SubscriberSet::unregister_all`] to detach cleanly.
pub struct SubscriberSet {
    registrations: Vec<(&'static str, HookCallback)>,
}

impl SubscriberSet {
    pub fn unregister_all(self) {
        for (name, callback) in &self.registrations {
            instrument::unregister(name, callback);
        }
    }
}

/// Wire every inspector subscriber into the hook bus.
///
/// Enrichment subscribers only touch the current span; the lifecycle and
/// counter subscribers need the registry and event bus and capture them.
pub fn register_all(
    registry: Arc<SessionRegistry>,
    bus: Arc<EventStream>,
    heartbeat_interval: Duration,
) -> SubscriberSet {
    let mut registrations: Vec<(&'static str, HookCallback)> = Vec::new();
    let mut add = |name: &'static str, callback: HookCallback| {
        instrument::register(name, callback.clone());
        registrations.push((name, callback));
    };

    // Span enrichment
    add(hooks::BEFORE_AGENT_CALL, HookCallback::sync(on_before_agent_call));
    add(hooks::AFTER_AGENT_CALL, HookCallback::sync(on_after_agent_call));
    add(hooks::ERROR_AGENT_CALL, HookCallback::sync(on_error_generic));
    add(hooks::BEFORE_LLM_GENERATE, HookCallback::sync(on_before_llm_generate));
    add(hooks::AFTER_LLM_GENERATE, HookCallback::sync(on_after_llm_generate));
    add(hooks::ERROR_LLM_GENERATE, HookCallback::sync(on_error_generic));
    add(hooks::BEFORE_TOOL_CALL, HookCallback::sync(on_before_tool_call));
    add(hooks::AFTER_TOOL_CALL, HookCallback::sync(on_after_tool_call));
    add(hooks::ERROR_TOOL_CALL, HookCallback::sync(on_error_generic));
    add(hooks::BEFORE_WORKFLOW_RUN, HookCallback::sync(on_before_workflow_run));
    add(hooks::AFTER_WORKFLOW_RUN, HookCallback::sync(on_after_workflow_run));
    add(hooks::ERROR_WORKFLOW_RUN, HookCallback::sync(on_error_generic));
    add(hooks::BEFORE_RPC_REQUEST, HookCallback::sync(on_before_rpc_request));
    add(hooks::AFTER_RPC_RESPONSE, HookCallback::sync(on_after_rpc_response));
    add(hooks::ERROR_RPC_REQUEST, HookCallback::sync(on_error_rpc_request));
    add(hooks::BEFORE_RESOURCE_FETCH, HookCallback::sync(on_before_resource_fetch));
    add(hooks::AFTER_RESOURCE_FETCH, HookCallback::sync(on_after_resource_fetch));
    add(hooks::ERROR_RESOURCE_FETCH, HookCallback::sync(on_error_generic));
    add(hooks::BEFORE_PROMPT_APPLY, HookCallback::sync(on_before_prompt_apply));
    add(hooks::AFTER_PROMPT_APPLY, HookCallback::sync(on_after_prompt_apply));
    add(hooks::ERROR_PROMPT_APPLY, HookCallback::sync(on_error_generic));
    add(
        hooks::TRANSPORT_CONNECTED,
        HookCallback::sync(on_transport_status("connected")),
    );
    add(
        hooks::TRANSPORT_DISCONNECTED,
        HookCallback::sync(on_transport_status("disconnected")),
    );
    add(
        hooks::TRANSPORT_RECONNECTING,
        HookCallback::sync(on_transport_status("reconnecting")),
    );

    // Live counters feeding the heartbeat deltas
    {
        let registry = registry.clone();
        add(
            hooks::AFTER_LLM_GENERATE,
            HookCallback::sync(move |payload| {
                if let HookPayload::LlmGenerate { usage, .. } = payload {
                    if let Some(counters) = registry.counters(&context::get()) {
                        counters
                            .llm_calls
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        if let Some(usage) = usage {
                            counters.tokens.fetch_add(
                                usage.input_tokens + usage.output_tokens,
                                std::sync::atomic::Ordering::Relaxed,
                            );
                        }
                    }
                }
            }),
        );
    }
    {
        let registry = registry.clone();
        add(
            hooks::AFTER_TOOL_CALL,
            HookCallback::sync(move |_| {
                if let Some(counters) = registry.counters(&context::get()) {
                    counters
                        .tool_calls
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }),
        );
    }
    for name in [
        hooks::BEFORE_AGENT_CALL,
        hooks::BEFORE_LLM_GENERATE,
        hooks::BEFORE_TOOL_CALL,
        hooks::BEFORE_WORKFLOW_RUN,
    ] {
        let registry = registry.clone();
        add(
            name,
            HookCallback::sync(move |_| {
                if let Some(counters) = registry.counters(&context::get()) {
                    counters
                        .spans
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            }),
        );
    }

    // Session lifecycle -> registry + event bus
    {
        let registry = registry.clone();
        let bus = bus.clone();
        add(
            hooks::SESSION_STARTED,
            HookCallback::sync(move |payload| {
                let HookPayload::Lifecycle(p) = payload else { return };
                bus.publish(Event::SessionStarted {
                    session_id: p.session_id.clone(),
                    engine: p.engine.unwrap_or_default(),
                    title: p.title.clone(),
                    metadata: p.payload.clone(),
                });
                let task = spawn_heartbeat(
                    registry.clone(),
                    bus.clone(),
                    p.session_id.clone(),
                    heartbeat_interval,
                );
                registry.set_heartbeat_task(&p.session_id, task);
            }),
        );
    }
    {
        let registry = registry.clone();
        let bus = bus.clone();
        add(
            hooks::SESSION_PAUSED,
            HookCallback::sync(move |payload| {
                let HookPayload::Lifecycle(p) = payload else { return };
                registry.set_status(&p.session_id, SessionStatus::Paused);
                bus.publish(Event::SessionPaused {
                    session_id: p.session_id.clone(),
                    signal_name: p.signal_name.clone().unwrap_or_default(),
                    prompt: p.prompt.clone(),
                    schema: p.schema.clone(),
                });
            }),
        );
    }
    {
        let registry = registry.clone();
        let bus = bus.clone();
        add(
            hooks::SESSION_RESUMED,
            HookCallback::sync(move |payload| {
                let HookPayload::Lifecycle(p) = payload else { return };
                registry.set_status(&p.session_id, SessionStatus::Running);
                bus.publish(Event::SessionResumed {
                    session_id: p.session_id.clone(),
                    signal_name: p.signal_name.clone().unwrap_or_default(),
                    payload: p.payload.clone(),
                });
            }),
        );
    }
    {
        let registry = registry.clone();
        let bus = bus.clone();
        add(
            hooks::SESSION_FINISHED,
            HookCallback::sync(move |payload| {
                let HookPayload::Lifecycle(p) = payload else { return };
                let status = p.status.unwrap_or(SessionStatus::Completed);
                registry.finish(&p.session_id, status);
                bus.publish(Event::SessionFinished {
                    session_id: p.session_id.clone(),
                    status,
                    error: p.error.clone(),
                    duration_ms: None,
                });
            }),
        );
    }
    {
        let bus = bus.clone();
        add(
            hooks::WAITING_ON_SIGNAL,
            HookCallback::sync(move |payload| {
                let HookPayload::Lifecycle(p) = payload else { return };
                bus.publish(Event::WaitingOnSignal {
                    session_id: p.session_id.clone(),
                    signal_name: p.signal_name.clone().unwrap_or_default(),
                    prompt: p.prompt.clone(),
                    schema: p.schema.clone(),
                });
            }),
        );
    }
    for name in [hooks::PROGRESS_UPDATE, hooks::PROGRESS_CANCELLED] {
        let bus = bus.clone();
        add(
            name,
            HookCallback::sync(move |payload| {
                let HookPayload::Progress {
                    operation_id,
                    percent,
                    message,
                    ..
                } = payload
                else {
                    return;
                };
                bus.publish(Event::Progress {
                    session_id: context::get(),
                    operation_id: operation_id.clone(),
                    percent: *percent,
                    message: message.clone(),
                });
            }),
        );
    }

    SubscriberSet { registrations }
}
