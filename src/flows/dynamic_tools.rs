//! DYNAMIC_TOOLS / LIST_CHANGE: for clients that cannot run
//! custom confirmation RPCs but re-render the tool list on
//! `tools/list_changed`, hide the priced tool from the calling session and
//! register a per-session, per-payment confirmation tool in its place.
//!
//! To break the registration/closure/flow reference cycle, the two
//! process-local maps below hold only `{toolName, sessionId}`
//! pairs, never a reference back into the flow or the server; the actual
//! payment record lives in the state store like every other flow.

use super::{tool_descriptor_for_confirmation, Flow, FlowContext, FlowDescriptorPatch, PaymentRecord, ToolHandler};
use crate::context::RequestContext;
use crate::error::{PaymcpError, PaymcpResult};
use crate::protocol::CallToolResponse;
use crate::server_adapter::ServerAdapter;
use crate::session;
use crate::status::{self, PaymentStatus};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// `sessionId -> set of toolNames hidden from that session`.
type HiddenTools = DashMap<String, std::collections::HashSet<String>>;
/// `toolName -> owning sessionId`; confirmation-tool names are unique
/// across sessions since they embed the full payment id.
type ConfirmationTools = DashMap<String, String>;

pub struct DynamicToolsFlow {
    hidden: Arc<HiddenTools>,
    confirmation: Arc<ConfirmationTools>,
    created_at: Arc<DashMap<String, Instant>>,
}

impl Default for DynamicToolsFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicToolsFlow {
    pub fn new() -> Self {
        Self {
            hidden: Arc::new(DashMap::new()),
            confirmation: Arc::new(DashMap::new()),
            created_at: Arc::new(DashMap::new()),
        }
    }

    fn hide(&self, session_id: &str, tool_name: &str) {
        self.hidden.entry(session_id.to_string()).or_default().insert(tool_name.to_string());
    }

    fn unhide(&self, session_id: &str, tool_name: &str) {
        if let Some(mut set) = self.hidden.get_mut(session_id) {
            set.remove(tool_name);
        }
    }

    /// A session's view keeps a tool iff it isn't hidden for that session
    /// and, for confirmation tools, it's the owning session's own.
    pub fn visible_to(&self, session_id: &str, tool_name: &str) -> bool {
        if let Some(owner) = self.confirmation.get(tool_name) {
            return owner.as_str() == session_id;
        }
        !self
            .hidden
            .get(session_id)
            .map(|set| set.contains(tool_name))
            .unwrap_or(false)
    }

    /// Periodic sweep (default 10 min): drops payment
    /// bindings older than the cleanup interval from the process-local
    /// maps. The state store entry itself carries its own TTL/lifetime;
    /// this only prevents `HIDDEN_TOOLS`/`CONFIRMATION_TOOLS` from
    /// growing unboundedly if a client never reconnects.
    pub fn sweep(&self, max_age: Duration) {
        let cutoff = Instant::now().checked_sub(max_age);
        let Some(cutoff) = cutoff else { return };
        let stale: Vec<String> = self
            .created_at
            .iter()
            .filter(|entry| *entry.value() < cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        for name in stale {
            self.confirmation.remove(&name);
            self.created_at.remove(&name);
        }
    }
}

struct FirstCallHandler {
    flow_ctx: FlowContext,
    flow: Arc<DynamicToolsFlow>,
    original: Arc<dyn ToolHandler>,
    server: Arc<dyn ServerAdapter>,
}

#[async_trait]
impl ToolHandler for FirstCallHandler {
    async fn call(&self, args: Value, ctx: &RequestContext) -> PaymcpResult<CallToolResponse> {
        let session_id = if ctx.session_id.is_empty() {
            session::current_session().unwrap_or_default()
        } else {
            ctx.session_id.clone()
        };

        let handle = self
            .flow_ctx
            .provider
            .create_payment(&self.flow_ctx.price, json!({"tool": self.flow_ctx.tool_name}))
            .await?;

        let key = format!("payment:{}", handle.payment_id);
        let record = serde_json::to_value(PaymentRecord::new(args))
            .map_err(|e| PaymcpError::validation(e.to_string()))?;
        self.flow_ctx.store.set(&key, record, self.flow_ctx.settings.payment_record_ttl).await?;

        let confirm_name = format!("confirm_{}_{}", self.flow_ctx.tool_name, handle.payment_id);
        self.flow.hide(&session_id, &self.flow_ctx.tool_name);
        self.flow.confirmation.insert(confirm_name.clone(), session_id.clone());
        self.flow.created_at.insert(confirm_name.clone(), Instant::now());

        let descriptor = tool_descriptor_for_confirmation(confirm_name.clone(), &self.flow_ctx.tool_name, &handle.payment_id);
        let confirm_handler: Arc<dyn ToolHandler> = Arc::new(ConfirmationHandler {
            flow_ctx: self.flow_ctx.clone(),
            flow: self.flow.clone(),
            original: self.original.clone(),
            session_id: session_id.clone(),
            payment_key: key,
        });
        self.server.register_tool(descriptor, confirm_handler);
        self.server.notify_tools_list_changed().await?;

        Ok(CallToolResponse::json(json!({
            "status": "payment_required",
            "confirmation_tool": confirm_name,
            "payment_id": handle.payment_id,
            "payment_url": handle.payment_url,
        })))
    }
}

struct ConfirmationHandler {
    flow_ctx: FlowContext,
    flow: Arc<DynamicToolsFlow>,
    original: Arc<dyn ToolHandler>,
    session_id: String,
    payment_key: String,
}

#[async_trait]
impl ToolHandler for ConfirmationHandler {
    async fn call(&self, _args: Value, ctx: &RequestContext) -> PaymcpResult<CallToolResponse> {
        let payment_id = self
            .payment_key
            .strip_prefix("payment:")
            .unwrap_or(&self.payment_key)
            .to_string();

        let raw = self.flow_ctx.store.get(&self.payment_key).await?;
        let record: PaymentRecord = match raw {
            Some(value) => serde_json::from_value(value).map_err(|e| PaymcpError::validation(e.to_string()))?,
            None => return Err(PaymcpError::PaymentIdNotFound { payment_id }),
        };

        let raw_status = self.flow_ctx.provider.get_payment_status(&payment_id).await?;
        match status::normalize(&raw_status) {
            PaymentStatus::Paid => {
                // Handler runs before any bookkeeping unwinds: a failing
                // handler must not consume the payment or the confirmation
                // tool, so a retry of this same confirmation call stays possible.
                let result = self.original.call(record.args, ctx).await?;
                self.flow_ctx.store.delete(&self.payment_key).await?;
                self.flow.unhide(&self.session_id, &self.flow_ctx.tool_name);
                let confirm_name = format!("confirm_{}_{}", self.flow_ctx.tool_name, payment_id);
                self.flow.confirmation.remove(&confirm_name);
                self.flow.created_at.remove(&confirm_name);
                Ok(result)
            }
            PaymentStatus::Canceled => Ok(CallToolResponse::error(format!("payment {payment_id} was canceled"))),
            PaymentStatus::Pending => Ok(CallToolResponse::error(format!("payment {payment_id} is still pending"))),
        }
    }
}

#[async_trait]
impl Flow for DynamicToolsFlow {
    fn name(&self) -> &'static str {
        "dynamic_tools"
    }

    fn wrap(&self, _flow_ctx: FlowContext, _handler: Arc<dyn ToolHandler>) -> Arc<dyn ToolHandler> {
        unreachable!("DynamicToolsFlow requires a server handle; use wrap_with_server")
    }

    fn describe_patch(&self) -> FlowDescriptorPatch {
        FlowDescriptorPatch { adds_payment_id_param: false, strips_meta_from_original: true }
    }

    async fn setup(&self, server: &dyn ServerAdapter) -> PaymcpResult<()> {
        let _ = server;
        Ok(())
    }
}

impl DynamicToolsFlow {
    /// `PayMcp::install` calls this instead of the trait's `wrap` because
    /// DYNAMIC_TOOLS, unlike every other flow, needs a handle on the
    /// server to register confirmation tools as they're created.
    pub fn wrap_with_server(
        self: &Arc<Self>,
        flow_ctx: FlowContext,
        handler: Arc<dyn ToolHandler>,
        server: Arc<dyn ServerAdapter>,
    ) -> Arc<dyn ToolHandler> {
        Arc::new(FirstCallHandler { flow_ctx, flow: self.clone(), original: handler, server })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::FlowSettings;
    use crate::price::Price;
    use crate::provider::mock::MockProvider;
    use crate::server_adapter::InMemoryServerAdapter;
    use crate::state::memory::InMemoryStore;
    use rust_decimal::Decimal;

    struct Echo;
    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, args: Value, _ctx: &RequestContext) -> PaymcpResult<CallToolResponse> {
            Ok(CallToolResponse::json(args))
        }
    }

    fn flow_ctx(provider: Arc<MockProvider>) -> FlowContext {
        FlowContext {
            provider,
            store: Arc::new(InMemoryStore::new()),
            price: Price::new(Decimal::new(100, 2), "USD").unwrap(),
            tool_name: "draw".to_string(),
            settings: FlowSettings::default(),
        }
    }

    #[tokio::test]
    async fn per_session_isolation() {
        let provider = Arc::new(MockProvider::new());
        let server = Arc::new(InMemoryServerAdapter::new());
        let flow = Arc::new(DynamicToolsFlow::new());

        let ctx_a = flow_ctx(provider.clone());
        let handler_a = flow.wrap_with_server(ctx_a, Arc::new(Echo), server.clone());
        let rctx_a = RequestContext::for_session("session-a");
        handler_a.call(json!({}), &rctx_a).await.unwrap();

        let ctx_b = flow_ctx(provider.clone());
        let handler_b = flow.wrap_with_server(ctx_b, Arc::new(Echo), server.clone());
        let rctx_b = RequestContext::for_session("session-b");
        handler_b.call(json!({}), &rctx_b).await.unwrap();

        let all_names: Vec<String> = server.list_tool_descriptors().into_iter().map(|t| t.name).collect();
        let confirm_a: Vec<_> = all_names.iter().filter(|n| n.starts_with("confirm_draw_") && flow.visible_to("session-a", n)).collect();
        let confirm_b: Vec<_> = all_names.iter().filter(|n| n.starts_with("confirm_draw_") && flow.visible_to("session-b", n)).collect();

        assert_eq!(confirm_a.len(), 1);
        assert_eq!(confirm_b.len(), 1);
        assert_ne!(confirm_a[0], confirm_b[0]);

        assert!(!flow.visible_to("session-a", "draw"));
        assert!(!flow.visible_to("session-b", "draw"));
        assert!(!flow.visible_to("session-b", confirm_a[0]));
        assert!(!flow.visible_to("session-a", confirm_b[0]));
    }

    #[tokio::test]
    async fn successful_confirmation_restores_tool_and_removes_confirmation() {
        let provider = Arc::new(MockProvider::new());
        let server = Arc::new(InMemoryServerAdapter::new());
        let flow = Arc::new(DynamicToolsFlow::new());

        let ctx = flow_ctx(provider.clone());
        let handler = flow.wrap_with_server(ctx, Arc::new(Echo), server.clone());
        let rctx = RequestContext::for_session("s1");
        let created = handler.call(json!({"x": 1}), &rctx).await.unwrap();
        let crate::protocol::Content::Text { text, .. } = &created.content[0] else { panic!() };
        let body: Value = serde_json::from_str(text).unwrap();
        let confirm_name = body["confirmation_tool"].as_str().unwrap().to_string();
        let payment_id = body["payment_id"].as_str().unwrap().to_string();
        provider.mark_paid(&payment_id);

        let (_, confirm_handler) = server.get_tool(&confirm_name).unwrap();
        let result = confirm_handler.call(json!({}), &rctx).await.unwrap();
        let crate::protocol::Content::Text { text, .. } = &result.content[0] else { panic!() };
        assert_eq!(text, "{\"x\":1}");

        assert!(flow.visible_to("s1", "draw"));
        assert!(!flow.confirmation.contains_key(&confirm_name));
    }

    struct AlwaysFails;
    #[async_trait]
    impl ToolHandler for AlwaysFails {
        async fn call(&self, _args: Value, _ctx: &RequestContext) -> PaymcpResult<CallToolResponse> {
            Err(PaymcpError::provider("downstream exploded"))
        }
    }

    #[tokio::test]
    async fn handler_failure_after_paid_keeps_payment_retryable() {
        let provider = Arc::new(MockProvider::new());
        let server = Arc::new(InMemoryServerAdapter::new());
        let flow = Arc::new(DynamicToolsFlow::new());

        let ctx = flow_ctx(provider.clone());
        let handler = flow.wrap_with_server(ctx, Arc::new(AlwaysFails), server.clone());
        let rctx = RequestContext::for_session("s1");
        let created = handler.call(json!({"x": 1}), &rctx).await.unwrap();
        let crate::protocol::Content::Text { text, .. } = &created.content[0] else { panic!() };
        let body: Value = serde_json::from_str(text).unwrap();
        let confirm_name = body["confirmation_tool"].as_str().unwrap().to_string();
        let payment_id = body["payment_id"].as_str().unwrap().to_string();
        provider.mark_paid(&payment_id);

        let (_, confirm_handler) = server.get_tool(&confirm_name).unwrap();
        let result = confirm_handler.call(json!({}), &rctx).await;
        assert!(result.is_err());

        assert!(!flow.visible_to("s1", "draw"));
        assert!(flow.confirmation.contains_key(&confirm_name));
    }

    #[test]
    fn sweep_removes_only_stale_entries() {
        let flow = DynamicToolsFlow::new();
        flow.confirmation.insert("confirm_draw_old".to_string(), "s1".to_string());
        flow.created_at.insert("confirm_draw_old".to_string(), Instant::now() - Duration::from_secs(3600));
        flow.confirmation.insert("confirm_draw_new".to_string(), "s1".to_string());
        flow.created_at.insert("confirm_draw_new".to_string(), Instant::now());

        flow.sweep(Duration::from_secs(600));

        assert!(!flow.confirmation.contains_key("confirm_draw_old"));
        assert!(flow.confirmation.contains_key("confirm_draw_new"));
    }
}
