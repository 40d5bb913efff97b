//! Session Context: ambient propagation of the current MCP session id.
//!
//! A single ambient value — the current MCP session id — readable by
//! `current_session()` and established by `run_with_session`. Rust has no
//! built-in ambient-value mechanism for async call graphs, but `tokio`
//! (already part of this crate's stack) provides exactly the primitive
//! needed here: task-local storage that is visible to everything
//! `.await`ed underneath the scope and is restored on exit, including across
//! nested scopes.

use std::future::Future;

tokio::task_local! {
    static SESSION_ID: String;
}

/// An empty session id behaves as "no session".
pub fn current_session() -> Option<String> {
    SESSION_ID
        .try_with(|id| if id.is_empty() { None } else { Some(id.clone()) })
        .unwrap_or(None)
}

/// Runs `fut` with `session_id` established as the ambient session for
/// every `.await` point underneath it. Nested calls shadow the outer value
/// and it reverts automatically once `fut` completes, because task-local
/// scopes are stack-discipline by construction.
pub async fn run_with_session<F, T>(session_id: impl Into<String>, fut: F) -> T
where
    F: Future<Output = T>,
{
    SESSION_ID.scope(session_id.into(), fut).await
}
