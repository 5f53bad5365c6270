// SPDX-License-Identifier: MIT
//! Session-id propagation through concurrent workflow execution.
//!
//! A workflow root enters a session scope once; every operation awaited
//! inside that scope, and every task spawned with [`spawn_inherit`], sees
//! the same session id without parameter plumbing. Independent tasks never
//! observe each other's ids.

use std::future::Future;

use tokio::task::JoinHandle;

/// Sentinel returned by [`get`] when no session scope is active.
pub const UNKNOWN_SESSION: &str = "unknown";

tokio::task_local! {
    static SESSION_ID: String;
    static REPLAY: bool;
}

/// Run `fut` inside a session scope.
///
/// Call exactly once at the root of a workflow (or in the middleware of an
/// inbound request). Nesting a second scope inside an active one is
/// undefined by contract; the scoping API makes the mistake visible at the
/// call site rather than silently replacing the id.
pub async fn scope<F>(session_id: impl Into<String>, fut: F) -> F::Output
where
    F: Future,
{
    SESSION_ID.scope(session_id.into(), fut).await
}

/// Current session id, or `"unknown"` outside any scope. Never fails.
pub fn get() -> String {
    SESSION_ID
        .try_with(Clone::clone)
        .unwrap_or_else(|_| UNKNOWN_SESSION.to_string())
}

/// Spawn a task that inherits a snapshot of the caller's session id.
///
/// The child sees the id as it was at spawn time; later scope changes in
/// either task do not leak across.
pub fn spawn_inherit<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let session_id = get();
    tokio::spawn(SESSION_ID.scope(session_id, fut))
}

/// Wrap a closure so that, when invoked, it receives the session id that
/// was current at *call* time as its argument.
///
/// The systems-language rendering of kwarg injection: a function that wants
/// the session id declares it as a parameter and is bound here; one that
/// does not simply isn't wrapped.
pub fn bind<F, T>(f: F) -> impl FnOnce() -> T
where
    F: FnOnce(String) -> T,
{
    move || f(get())
}

/// Mark `fut` as running under an external durable-workflow replay.
///
/// Result-capture helpers consult [`in_replay`] and skip serialization so
/// replayed history is not re-recorded.
pub async fn replay_scope<F>(fut: F) -> F::Output
where
    F: Future,
{
    REPLAY.scope(true, fut).await
}

/// Whether the current task is inside a replay scope.
pub fn in_replay() -> bool {
    REPLAY.try_with(|r| *r).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_outside_scope_is_unknown() {
        assert_eq!(get(), UNKNOWN_SESSION);
    }

    #[tokio::test]
    async fn scope_sets_and_restores() {
        let seen = scope("sess-abc123", async { get() }).await;
        assert_eq!(seen, "sess-abc123");
        assert_eq!(get(), UNKNOWN_SESSION);
    }

    #[tokio::test]
    async fn spawned_task_inherits_snapshot() {
        let seen = scope("sess-root01", async {
            spawn_inherit(async { get() }).await.unwrap()
        })
        .await;
        assert_eq!(seen, "sess-root01");
    }

    #[tokio::test]
    async fn independent_tasks_do_not_leak() {
        let a = tokio::spawn(scope("session-aaaaaa", async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            get()
        }));
        let b = tokio::spawn(scope("session-bbbbbb", async { get() }));
        let c = tokio::spawn(async { get() });
        assert_eq!(a.await.unwrap(), "session-aaaaaa");
        assert_eq!(b.await.unwrap(), "session-bbbbbb");
        assert_eq!(c.await.unwrap(), UNKNOWN_SESSION);
    }

    #[tokio::test]
    async fn bind_injects_current_session() {
        let out = scope("sess-bind99", async {
            let bound = bind(|session_id| format!("task/{session_id}"));
            bound()
        })
        .await;
        assert_eq!(out, "task/sess-bind99");
    }

    #[tokio::test]
    async fn replay_flag_scopes() {
        assert!(!in_replay());
        let inside = replay_scope(async { in_replay() }).await;
        assert!(inside);
        assert!(!in_replay());
    }
}
