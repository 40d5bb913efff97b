//! Per-call context: Rust has no ambient-value mechanism
//! flow wrappers can rely on implicitly the way a single-threaded JS event
//! loop does, so `extra` is passed explicitly to every flow wrapper and to
//! the `tools/list` interceptor instead. `session::current_session()`
//! remains available for code that only needs the session id and would
//! otherwise have to thread this whole struct one more layer down.

use crate::protocol::ClientCapabilities;
use crate::transport::{JsonRpcMessage, JsonRpcNotification};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a flow wrapper needs besides the tool's own arguments.
#[derive(Clone)]
pub struct RequestContext {
    pub session_id: String,
    pub request_id: Value,
    pub auth_info: Option<Value>,
    pub headers: HashMap<String, String>,
    pub progress_token: Option<Value>,
    pub meta: Value,
    pub cancellation: CancellationToken,
    pub callbacks: Arc<dyn HostCallbacks>,
}

impl RequestContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn capabilities(&self) -> Option<ClientCapabilities> {
        self.auth_info
            .as_ref()
            .and_then(|v| v.get("capabilities"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Callbacks the host's transport exposes for a flow to talk back to the
/// client mid-invocation (`sendRequest`/`sendNotification`/
/// `reportProgress`), abstracted behind a trait so flows stay transport
/// agnostic the same way `PaymentProvider` keeps them provider agnostic.
#[async_trait::async_trait]
pub trait HostCallbacks: Send + Sync {
    async fn send_request(&self, method: &str, params: Value) -> crate::error::PaymcpResult<Value>;
    async fn send_notification(&self, notification: JsonRpcNotification) -> crate::error::PaymcpResult<()>;
    async fn report_progress(&self, progress_token: &Value, progress: u32, total: u32, message: &str) -> crate::error::PaymcpResult<()>;
}

/// Test/demo callbacks: records every call, answers `elicitation/create`
/// requests with a pre-scripted response queue.
pub struct RecordingCallbacks {
    pub sent_requests: tokio::sync::Mutex<Vec<(String, Value)>>,
    pub notifications: tokio::sync::Mutex<Vec<JsonRpcMessage>>,
    pub progress: tokio::sync::Mutex<Vec<(u32, u32, String)>>,
    pub elicitation_responses: tokio::sync::Mutex<Vec<Value>>,
}

impl Default for RecordingCallbacks {
    fn default() -> Self {
        Self {
            sent_requests: tokio::sync::Mutex::new(Vec::new()),
            notifications: tokio::sync::Mutex::new(Vec::new()),
            progress: tokio::sync::Mutex::new(Vec::new()),
            elicitation_responses: tokio::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl HostCallbacks for RecordingCallbacks {
    async fn send_request(&self, method: &str, params: Value) -> crate::error::PaymcpResult<Value> {
        self.sent_requests.lock().await.push((method.to_string(), params));
        let mut queue = self.elicitation_responses.lock().await;
        if queue.is_empty() {
            Ok(Value::Null)
        } else {
            Ok(queue.remove(0))
        }
    }

    async fn send_notification(&self, notification: JsonRpcNotification) -> crate::error::PaymcpResult<()> {
        self.notifications
            .lock()
            .await
            .push(JsonRpcMessage::Notification(notification));
        Ok(())
    }

    async fn report_progress(&self, _progress_token: &Value, progress: u32, total: u32, message: &str) -> crate::error::PaymcpResult<()> {
        self.progress.lock().await.push((progress, total, message.to_string()));
        Ok(())
    }
}

impl RequestContext {
    /// Builds a context for tests/demos: fresh cancellation token, no
    /// pre-existing auth info, recording callbacks.
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            request_id: Value::from(1),
            auth_info: None,
            headers: HashMap::new(),
            progress_token: Some(Value::from("progress-1")),
            meta: Value::Null,
            cancellation: CancellationToken::new(),
            callbacks: Arc::new(RecordingCallbacks::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_context_is_not_cancelled() {
        let ctx = RequestContext::for_session("s1");
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn cancelling_token_is_observed() {
        let ctx = RequestContext::for_session("s1");
        ctx.cancellation.cancel();
        assert!(ctx.is_cancelled());
    }
}
