// SPDX-License-Identifier: MIT
//! Instrumentation hook bus.
//!
//! A fixed catalogue of named observation points decouples agent-framework
//! emit sites from observers. Fan-out within one name is FIFO in
//! registration order; nothing is guaranteed across names. A subscriber
//! that panics is logged and skipped; observation never breaks the
//! observed program.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use tracing::warn;

use crate::sessions::{Engine, SessionStatus};

// ─── Hook catalogue ───────────────────────────────────────────────────────────

pub mod hooks {
    pub const BEFORE_AGENT_CALL: &str = "before_agent_call";
    pub const AFTER_AGENT_CALL: &str = "after_agent_call";
    pub const ERROR_AGENT_CALL: &str = "error_agent_call";

    pub const BEFORE_LLM_GENERATE: &str = "before_llm_generate";
    pub const AFTER_LLM_GENERATE: &str = "after_llm_generate";
    pub const ERROR_LLM_GENERATE: &str = "error_llm_generate";

    pub const BEFORE_TOOL_CALL: &str = "before_tool_call";
    pub const AFTER_TOOL_CALL: &str = "after_tool_call";
    pub const ERROR_TOOL_CALL: &str = "error_tool_call";

    pub const BEFORE_WORKFLOW_RUN: &str = "before_workflow_run";
    pub const AFTER_WORKFLOW_RUN: &str = "after_workflow_run";
    pub const ERROR_WORKFLOW_RUN: &str = "error_workflow_run";

    pub const BEFORE_RPC_REQUEST: &str = "before_rpc_request";
    pub const AFTER_RPC_RESPONSE: &str = "after_rpc_response";
    pub const ERROR_RPC_REQUEST: &str = "error_rpc_request";

    pub const BEFORE_RESOURCE_FETCH: &str = "before_resource_fetch";
    pub const AFTER_RESOURCE_FETCH: &str = "after_resource_fetch";
    pub const ERROR_RESOURCE_FETCH: &str = "error_resource_fetch";

    pub const BEFORE_PROMPT_APPLY: &str = "before_prompt_apply";
    pub const AFTER_PROMPT_APPLY: &str = "after_prompt_apply";
    pub const ERROR_PROMPT_APPLY: &str = "error_prompt_apply";

    pub const SESSION_STARTED: &str = "session_started";
    pub const SESSION_PAUSED: &str = "session_paused";
    pub const SESSION_RESUMED: &str = "session_resumed";
    pub const SESSION_FINISHED: &str = "session_finished";
    pub const WAITING_ON_SIGNAL: &str = "waiting_on_signal";

    pub const PROGRESS_UPDATE: &str = "progress_update";
    pub const PROGRESS_CANCELLED: &str = "progress_cancelled";

    pub const TRANSPORT_CONNECTED: &str = "transport_connected";
    pub const TRANSPORT_DISCONNECTED: &str = "transport_disconnected";
    pub const TRANSPORT_RECONNECTING: &str = "transport_reconnecting";
}

// ─── Payloads ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Sse,
    Http,
    Websocket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::Http => "http",
            Self::Websocket => "websocket",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Session lifecycle payload shared by the `session_*` hooks.
#[derive(Debug, Clone, Default)]
pub struct LifecyclePayload {
    pub session_id: String,
    pub engine: Option<Engine>,
    pub title: Option<String>,
    pub status: Option<SessionStatus>,
    pub error: Option<String>,
    pub signal_name: Option<String>,
    pub prompt: Option<String>,
    pub schema: Option<Value>,
    pub payload: Option<Value>,
}

/// Variant record per hook family; `extra` is a forward-compatibility
/// catch-all that subscribers are free to ignore. Observers treat every
/// field as an immutable view.
#[derive(Debug, Clone)]
pub enum HookPayload {
    AgentCall {
        agent: String,
        result: Option<Value>,
        error: Option<String>,
        extra: Map<String, Value>,
    },
    LlmGenerate {
        provider: Option<String>,
        model: Option<String>,
        prompt: Option<Value>,
        response: Option<Value>,
        usage: Option<TokenUsage>,
        error: Option<String>,
        extra: Map<String, Value>,
    },
    ToolCall {
        tool_name: String,
        args: Value,
        result: Option<Value>,
        error: Option<String>,
        extra: Map<String, Value>,
    },
    WorkflowRun {
        workflow: String,
        input: Option<Value>,
        result: Option<Value>,
        error: Option<String>,
        extra: Map<String, Value>,
    },
    RpcRequest {
        envelope: Value,
        transport: TransportKind,
        duration_ms: Option<u64>,
        error: Option<String>,
        extra: Map<String, Value>,
    },
    ResourceFetch {
        uri: String,
        mime_type: Option<String>,
        content: Option<Value>,
        error: Option<String>,
        extra: Map<String, Value>,
    },
    PromptApply {
        template_id: String,
        parameters: Value,
        rendered: Option<String>,
        error: Option<String>,
        extra: Map<String, Value>,
    },
    Lifecycle(LifecyclePayload),
    Progress {
        operation_id: String,
        percent: f64,
        message: Option<String>,
        extra: Map<String, Value>,
    },
    Transport {
        transport_type: TransportKind,
        uri: String,
        attempt: Option<u32>,
        reason: Option<String>,
        extra: Map<String, Value>,
    },
}

// ─── Callbacks ────────────────────────────────────────────────────────────────

pub type SyncHookFn = Arc<dyn Fn(&HookPayload) + Send + Sync>;
pub type AsyncHookFn = Arc<dyn Fn(HookPayload) -> BoxFuture<'static, ()> + Send + Sync>;

/// A subscriber callback. Cloning shares identity: `unregister` matches by
/// pointer, so keep the clone you registered with.
#[derive(Clone)]
pub enum HookCallback {
    Sync(SyncHookFn),
    Async(AsyncHookFn),
}

impl HookCallback {
    pub fn sync(f: impl Fn(&HookPayload) + Send + Sync + 'static) -> Self {
        Self::Sync(Arc::new(f))
    }

    pub fn async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(HookPayload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self::Async(Arc::new(move |payload| f(payload).boxed()))
    }

    fn same_callback(&self, other: &HookCallback) -> bool {
        match (self, other) {
            (Self::Sync(a), Self::Sync(b)) => Arc::ptr_eq(a, b),
            (Self::Async(a), Self::Async(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────────

static HOOKS: Lazy<RwLock<HashMap<String, Vec<HookCallback>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Subscribe to a hook. Duplicate registrations are allowed and produce
/// duplicate invocations. Unknown names are accepted.
pub fn register(name: &str, callback: HookCallback) {
    let mut hooks = HOOKS.write().expect("hook registry poisoned");
    hooks.entry(name.to_string()).or_default().push(callback);
}

/// Remove the first registration matching `callback`. Idempotent; absent
/// callbacks are not an error.
pub fn unregister(name: &str, callback: &HookCallback) {
    let mut hooks = HOOKS.write().expect("hook registry poisoned");
    if let Some(list) = hooks.get_mut(name) {
        if let Some(pos) = list.iter().position(|cb| cb.same_callback(callback)) {
            list.remove(pos);
        }
    }
}

/// Whether `name` currently has any subscribers. Emit sites use this to
/// skip payload marshalling entirely on the hot path.
pub fn has_subscribers(name: &str) -> bool {
    HOOKS
        .read()
        .expect("hook registry poisoned")
        .get(name)
        .is_some_and(|list| !list.is_empty())
}

/// Fan an emission out to every subscriber of `name`, in registration
/// order, awaiting async subscribers sequentially. Returns once all have
/// completed. Panicking subscribers are logged at WARN and skipped.
///
/// The subscriber list is snapshot before invocation, so concurrent
/// `register`/`unregister` calls never tear an in-flight emission.
pub async fn emit(name: &str, payload: &HookPayload) {
    let snapshot: Vec<HookCallback> = {
        let hooks = HOOKS.read().expect("hook registry poisoned");
        match hooks.get(name) {
            None => return,
            Some(list) if list.is_empty() => return,
            Some(list) => list.clone(),
        }
    };

    for callback in snapshot {
        match callback {
            HookCallback::Sync(f) => {
                if catch_unwind(AssertUnwindSafe(|| f(payload))).is_err() {
                    warn!(hook = name, "hook subscriber panicked, skipping");
                }
            }
            HookCallback::Async(f) => {
                let fut = f(payload.clone());
                if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                    warn!(hook = name, "hook subscriber panicked, skipping");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn payload() -> HookPayload {
        HookPayload::ToolCall {
            tool_name: "search".to_string(),
            args: serde_json::json!({"q": "rust"}),
            result: None,
            error: None,
            extra: Map::new(),
        }
    }

    #[tokio::test]
    async fn fan_out_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let first = HookCallback::sync(move |_| o1.lock().unwrap().push(1));
        let second = HookCallback::sync(move |_| o2.lock().unwrap().push(2));

        register("test_order_hook", first.clone());
        register("test_order_hook", second.clone());
        emit("test_order_hook", &payload()).await;

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        unregister("test_order_hook", &first);
        unregister("test_order_hook", &second);
    }

    #[tokio::test]
    async fn duplicate_registration_fires_twice() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let cb = HookCallback::sync(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        register("test_dup_hook", cb.clone());
        register("test_dup_hook", cb.clone());
        emit("test_dup_hook", &payload()).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        // one unregister removes one of the two registrations
        unregister("test_dup_hook", &cb);
        emit("test_dup_hook", &payload()).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        unregister("test_dup_hook", &cb);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let cb = HookCallback::sync(|_| {});
        unregister("test_never_registered", &cb);
        unregister("test_never_registered", &cb);
    }

    #[tokio::test]
    async fn panicking_subscriber_is_skipped() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let bad = HookCallback::sync(|_| panic!("boom"));
        let good = HookCallback::sync(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        register("test_panic_hook", bad.clone());
        register("test_panic_hook", good.clone());
        emit("test_panic_hook", &payload()).await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        unregister("test_panic_hook", &bad);
        unregister("test_panic_hook", &good);
    }

    #[tokio::test]
    async fn async_subscribers_are_awaited_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let slow = HookCallback::async_fn(move |_| {
            let o = o1.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                o.lock().unwrap().push("slow");
            }
        });
        let fast = HookCallback::async_fn(move |_| {
            let o = o2.clone();
            async move {
                o.lock().unwrap().push("fast");
            }
        });

        register("test_async_hook", slow.clone());
        register("test_async_hook", fast.clone());
        emit("test_async_hook", &payload()).await;

        // sequential await: slow completes before fast starts
        assert_eq!(*order.lock().unwrap(), vec!["slow", "fast"]);
        unregister("test_async_hook", &slow);
        unregister("test_async_hook", &fast);
    }

    #[tokio::test]
    async fn unknown_name_is_a_no_op() {
        emit("test_nobody_home", &payload()).await;
        assert!(!has_subscribers("test_nobody_home"));
    }
}
