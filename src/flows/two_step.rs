//! TWO_STEP: first call creates a payment and tells the
//! client to invoke a confirmation tool; the confirmation tool polls
//! status and, on `paid`, runs the original handler.

use super::{confirmation_tool_name, text_response, Flow, FlowContext, FlowDescriptorPatch, PaymentRecord, ToolHandler};
use crate::context::RequestContext;
use crate::error::{PaymcpError, PaymcpResult};
use crate::protocol::CallToolResponse;
use crate::status::{self, PaymentStatus};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

pub struct TwoStepFlow;

struct FirstCallHandler {
    flow_ctx: FlowContext,
}

#[async_trait]
impl ToolHandler for FirstCallHandler {
    async fn call(&self, args: Value, _ctx: &RequestContext) -> PaymcpResult<CallToolResponse> {
        let handle = self
            .flow_ctx
            .provider
            .create_payment(&self.flow_ctx.price, json!({"tool": self.flow_ctx.tool_name}))
            .await?;

        let key = format!("payment:{}", handle.payment_id);
        let record = serde_json::to_value(PaymentRecord::new(args))
            .map_err(|e| PaymcpError::validation(e.to_string()))?;
        self.flow_ctx.store.set(&key, record, self.flow_ctx.settings.payment_record_ttl).await?;

        Ok(text_response(&json!({
            "status": "payment_required",
            "next_step": confirmation_tool_name(&self.flow_ctx.tool_name, "payment"),
            "payment_id": handle.payment_id,
            "payment_url": handle.payment_url,
        })))
    }
}

/// The confirmation tool's handler: registered once per priced tool,
/// idempotent across repeated calls with the same `payment_id` until the
/// underlying handler actually runs.
pub struct ConfirmationHandler {
    flow_ctx: FlowContext,
    original: Arc<dyn ToolHandler>,
}

#[async_trait]
impl ToolHandler for ConfirmationHandler {
    async fn call(&self, args: Value, ctx: &RequestContext) -> PaymcpResult<CallToolResponse> {
        let payment_id = args
            .get("payment_id")
            .and_then(Value::as_str)
            .ok_or_else(|| PaymcpError::validation("missing payment_id"))?;

        let key = format!("payment:{payment_id}");
        let raw = self.flow_ctx.store.get(&key).await?;
        let record: PaymentRecord = match raw {
            Some(value) => serde_json::from_value(value).map_err(|e| PaymcpError::validation(e.to_string()))?,
            None => return Err(PaymcpError::PaymentIdNotFound { payment_id: payment_id.to_string() }),
        };

        let raw_status = self.flow_ctx.provider.get_payment_status(payment_id).await?;
        match status::normalize(&raw_status) {
            PaymentStatus::Paid => {
                let result = self.original.call(record.args, ctx).await?;
                self.flow_ctx.store.delete(&key).await?;
                Ok(result)
            }
            PaymentStatus::Canceled => Ok(CallToolResponse::json(json!({
                "status": "error",
                "message": format!("payment {payment_id} was canceled"),
            }))),
            PaymentStatus::Pending => Ok(CallToolResponse::json(json!({
                "status": "error",
                "message": format!("payment {payment_id} is still pending"),
            }))),
        }
    }
}

#[async_trait]
impl Flow for TwoStepFlow {
    fn name(&self) -> &'static str {
        "two_step"
    }

    fn wrap(&self, flow_ctx: FlowContext, _handler: Arc<dyn ToolHandler>) -> Arc<dyn ToolHandler> {
        Arc::new(FirstCallHandler { flow_ctx })
    }

    fn describe_patch(&self) -> FlowDescriptorPatch {
        FlowDescriptorPatch::default()
    }
}

impl TwoStepFlow {
    /// Builds the confirmation tool's handler; `core::PayMcp` calls this
    /// separately from `wrap` because the confirmation tool needs the
    /// *original* handler, while the priced tool's own slot gets the
    /// first-call handler from `wrap`.
    pub fn confirmation_handler(flow_ctx: FlowContext, original: Arc<dyn ToolHandler>) -> Arc<dyn ToolHandler> {
        Arc::new(ConfirmationHandler { flow_ctx, original })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::FlowSettings;
    use crate::price::Price;
    use crate::provider::mock::MockProvider;
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
            tool_name: "echo".to_string(),
            settings: FlowSettings::default(),
        }
    }

    #[tokio::test]
    async fn first_call_returns_payment_required_with_next_step() {
        let provider = Arc::new(MockProvider::new());
        let ctx = flow_ctx(provider);
        let flow = TwoStepFlow;
        let handler = flow.wrap(ctx.clone(), Arc::new(Echo));
        let rctx = RequestContext::for_session("s1");
        let result = handler.call(json!({"msg": "hi"}), &rctx).await.unwrap();
        let crate::protocol::Content::Text { text, .. } = &result.content[0] else { panic!() };
        let body: Value = serde_json::from_str(text).unwrap();
        assert_eq!(body["status"], "payment_required");
        assert_eq!(body["next_step"], "confirm_echo_payment");
    }

    #[tokio::test]
    async fn confirmation_runs_handler_once_paid() {
        let provider = Arc::new(MockProvider::new());
        let ctx = flow_ctx(provider.clone());
        let flow = TwoStepFlow;
        let first = flow.wrap(ctx.clone(), Arc::new(Echo));
        let rctx = RequestContext::for_session("s1");
        let created = first.call(json!({"msg": "hi"}), &rctx).await.unwrap();
        let crate::protocol::Content::Text { text, .. } = &created.content[0] else { panic!() };
        let body: Value = serde_json::from_str(text).unwrap();
        let payment_id = body["payment_id"].as_str().unwrap().to_string();

        provider.mark_paid(&payment_id);
        let confirm = TwoStepFlow::confirmation_handler(ctx, Arc::new(Echo));
        let result = confirm.call(json!({"payment_id": payment_id}), &rctx).await.unwrap();
        let crate::protocol::Content::Text { text, .. } = &result.content[0] else { panic!() };
        assert_eq!(text, "{\"msg\":\"hi\"}");
    }

    #[tokio::test]
    async fn confirmation_reports_canceled_as_structured_error() {
        let provider = Arc::new(MockProvider::new());
        let ctx = flow_ctx(provider.clone());
        let flow = TwoStepFlow;
        let first = flow.wrap(ctx.clone(), Arc::new(Echo));
        let rctx = RequestContext::for_session("s1");
        let created = first.call(json!({"msg": "hi"}), &rctx).await.unwrap();
        let crate::protocol::Content::Text { text, .. } = &created.content[0] else { panic!() };
        let body: Value = serde_json::from_str(text).unwrap();
        let payment_id = body["payment_id"].as_str().unwrap().to_string();

        provider.mark_canceled(&payment_id);
        let confirm = TwoStepFlow::confirmation_handler(ctx, Arc::new(Echo));
        let result = confirm.call(json!({"payment_id": payment_id}), &rctx).await.unwrap();
        assert_eq!(result.is_error, None);
        let crate::protocol::Content::Text { text, .. } = &result.content[0] else { panic!() };
        let body: Value = serde_json::from_str(text).unwrap();
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().unwrap().contains("canceled"));
    }

    #[tokio::test]
    async fn confirmation_reports_pending_as_structured_error() {
        let provider = Arc::new(MockProvider::new());
        let ctx = flow_ctx(provider.clone());
        let flow = TwoStepFlow;
        let first = flow.wrap(ctx.clone(), Arc::new(Echo));
        let rctx = RequestContext::for_session("s1");
        let created = first.call(json!({"msg": "hi"}), &rctx).await.unwrap();
        let crate::protocol::Content::Text { text, .. } = &created.content[0] else { panic!() };
        let body: Value = serde_json::from_str(text).unwrap();
        let payment_id = body["payment_id"].as_str().unwrap().to_string();

        let confirm = TwoStepFlow::confirmation_handler(ctx, Arc::new(Echo));
        let result = confirm.call(json!({"payment_id": payment_id}), &rctx).await.unwrap();
        assert_eq!(result.is_error, None);
        let crate::protocol::Content::Text { text, .. } = &result.content[0] else { panic!() };
        let body: Value = serde_json::from_str(text).unwrap();
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().unwrap().contains("pending"));
    }

    #[tokio::test]
    async fn confirmation_with_unknown_payment_id_errors() {
        let provider = Arc::new(MockProvider::new());
        let ctx = flow_ctx(provider);
        let confirm = TwoStepFlow::confirmation_handler(ctx, Arc::new(Echo));
        let rctx = RequestContext::for_session("s1");
        let result = confirm.call(json!({"payment_id": "nope"}), &rctx).await;
        assert!(matches!(result, Err(PaymcpError::PaymentIdNotFound { .. })));
    }
}
