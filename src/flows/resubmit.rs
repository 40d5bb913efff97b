//! RESUBMIT: first call throws a structured 402 error
//! carrying `payment_id`/`payment_url`; the client resubmits the *same*
//! tool call with `payment_id` in its arguments.

use super::{Flow, FlowContext, FlowDescriptorPatch, PaymentRecord, ToolHandler};
use crate::context::RequestContext;
use crate::error::{PaymcpError, PaymcpResult};
use crate::protocol::CallToolResponse;
use crate::status::{self, PaymentStatus};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

pub struct ResubmitFlow;

struct ResubmitHandler {
    flow_ctx: FlowContext,
    original: Arc<dyn ToolHandler>,
}

impl ResubmitHandler {
    async fn first_call(&self, mut args: Value) -> PaymcpResult<CallToolResponse> {
        self.flow_ctx.price.require_positive()?;
        if let Value::Object(map) = &mut args {
            map.remove("payment_id");
        }

        let handle = self
            .flow_ctx
            .provider
            .create_payment(&self.flow_ctx.price, json!({"tool": self.flow_ctx.tool_name}))
            .await?;

        let key = format!("payment:{}", handle.payment_id);
        let record = serde_json::to_value(PaymentRecord::new(args))
            .map_err(|e| PaymcpError::validation(e.to_string()))?;
        // The write must complete before the error carrying payment_id
        // is surfaced to the caller.
        self.flow_ctx.store.set(&key, record, self.flow_ctx.settings.payment_record_ttl).await?;
        tracing::info!(tool = %self.flow_ctx.tool_name, payment_id = %handle.payment_id, flow = "resubmit", "payment created");

        Err(PaymcpError::PaymentRequired {
            message: format!("payment required for {}", self.flow_ctx.tool_name),
            payment_id: Some(handle.payment_id),
            payment_url: handle.payment_url,
        })
    }

    async fn resubmission(&self, payment_id: &str, ctx: &RequestContext) -> PaymcpResult<CallToolResponse> {
        let key = format!("payment:{payment_id}");
        let guard = self.flow_ctx.store.lock(&key, self.flow_ctx.settings.lock_ttl).await?;

        let outcome = self.resubmission_locked(payment_id, &key, ctx).await;
        self.flow_ctx.store.unlock(guard).await?;
        outcome
    }

    async fn resubmission_locked(&self, payment_id: &str, key: &str, ctx: &RequestContext) -> PaymcpResult<CallToolResponse> {
        let raw = self.flow_ctx.store.get(key).await?;
        let record: PaymentRecord = match raw {
            Some(value) => serde_json::from_value(value).map_err(|e| PaymcpError::validation(e.to_string()))?,
            None => return Err(PaymcpError::PaymentIdNotFound { payment_id: payment_id.to_string() }),
        };

        let raw_status = self.flow_ctx.provider.get_payment_status(payment_id).await?;
        match status::normalize(&raw_status) {
            PaymentStatus::Paid => {
                // Handler runs before state deletion: a failing handler
                // must not consume the payment.
                let result = self.original.call(record.args, ctx).await?;
                self.flow_ctx.store.delete(key).await?;
                tracing::info!(tool = %self.flow_ctx.tool_name, payment_id, flow = "resubmit", "payment confirmed");
                Ok(result)
            }
            PaymentStatus::Pending => Err(PaymcpError::PaymentPending { payment_id: payment_id.to_string() }),
            PaymentStatus::Canceled => Err(PaymcpError::PaymentCanceled { payment_id: payment_id.to_string() }),
        }
    }
}

#[async_trait]
impl ToolHandler for ResubmitHandler {
    async fn call(&self, args: Value, ctx: &RequestContext) -> PaymcpResult<CallToolResponse> {
        match args.get("payment_id").and_then(Value::as_str) {
            Some(payment_id) => self.resubmission(payment_id, ctx).await,
            None => self.first_call(args).await,
        }
    }
}

#[async_trait]
impl Flow for ResubmitFlow {
    fn name(&self) -> &'static str {
        "resubmit"
    }

    fn wrap(&self, flow_ctx: FlowContext, handler: Arc<dyn ToolHandler>) -> Arc<dyn ToolHandler> {
        Arc::new(ResubmitHandler { flow_ctx, original: handler })
    }

    fn describe_patch(&self) -> FlowDescriptorPatch {
        FlowDescriptorPatch { adds_payment_id_param: true, strips_meta_from_original: false }
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

    fn flow_ctx() -> FlowContext {
        FlowContext {
            provider: Arc::new(MockProvider::new()),
            store: Arc::new(InMemoryStore::new()),
            price: Price::new(Decimal::new(100, 2), "USD").unwrap(),
            tool_name: "echo".to_string(),
            settings: FlowSettings::default(),
        }
    }

    #[tokio::test]
    async fn first_call_errors_with_payment_required_and_mock_paid_id() {
        let ctx = flow_ctx();
        let flow = ResubmitFlow;
        let handler = flow.wrap(ctx, Arc::new(Echo));
        let rctx = RequestContext::for_session("s1");
        let err = handler.call(json!({"msg": "hi"}), &rctx).await.unwrap_err();
        match err {
            PaymcpError::PaymentRequired { payment_id, .. } => {
                assert!(payment_id.unwrap().starts_with("mock-"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn resubmit_happy_path_then_consumes_state() {
        let provider = Arc::new(MockProvider::new());
        let store = Arc::new(InMemoryStore::new());
        let ctx = FlowContext {
            provider: provider.clone(),
            store,
            price: Price::new(Decimal::new(100, 2), "USD").unwrap(),
            tool_name: "echo".to_string(),
            settings: FlowSettings::default(),
        };
        let flow = ResubmitFlow;
        let handler = flow.wrap(ctx, Arc::new(Echo));
        let rctx = RequestContext::for_session("s1");

        let err = handler.call(json!({"msg": "hi"}), &rctx).await.unwrap_err();
        let payment_id = match err {
            PaymcpError::PaymentRequired { payment_id, .. } => payment_id.unwrap(),
            other => panic!("unexpected: {other:?}"),
        };
        provider.mark_paid(&payment_id);

        let result = handler.call(json!({"payment_id": payment_id.clone()}), &rctx).await.unwrap();
        let crate::protocol::Content::Text { text, .. } = &result.content[0] else { panic!() };
        assert_eq!(text, "{\"msg\":\"hi\"}");

        let second = handler.call(json!({"payment_id": payment_id}), &rctx).await.unwrap_err();
        assert!(matches!(second, PaymcpError::PaymentIdNotFound { .. }));
    }

    #[tokio::test]
    async fn failed_payment_retains_state_for_retry() {
        let provider = Arc::new(MockProvider::new());
        let store = Arc::new(InMemoryStore::new());
        let ctx = FlowContext {
            provider: provider.clone(),
            store,
            price: Price::new(Decimal::new(100, 2), "USD").unwrap(),
            tool_name: "echo".to_string(),
            settings: FlowSettings::default(),
        };
        let flow = ResubmitFlow;
        let handler = flow.wrap(ctx, Arc::new(Echo));
        let rctx = RequestContext::for_session("s1");

        let err = handler.call(json!({"msg": "hi"}), &rctx).await.unwrap_err();
        let payment_id = match err {
            PaymcpError::PaymentRequired { payment_id, .. } => payment_id.unwrap(),
            other => panic!("unexpected: {other:?}"),
        };
        provider.mark_canceled(&payment_id);

        let confirm_err = handler.call(json!({"payment_id": payment_id.clone()}), &rctx).await.unwrap_err();
        assert!(matches!(confirm_err, PaymcpError::PaymentCanceled { .. }));

        // State survives the canceled attempt: the caller can inspect it
        // again (e.g. after marking it paid out of band).
        provider.mark_paid(&payment_id);
        let result = handler.call(json!({"payment_id": payment_id}), &rctx).await.unwrap();
        let crate::protocol::Content::Text { text, .. } = &result.content[0] else { panic!() };
        assert_eq!(text, "{\"msg\":\"hi\"}");
    }

    #[tokio::test]
    async fn zero_price_rejected_at_first_call() {
        let ctx = FlowContext {
            provider: Arc::new(MockProvider::new()),
            store: Arc::new(InMemoryStore::new()),
            price: Price::new(Decimal::ZERO, "USD").unwrap(),
            tool_name: "echo".to_string(),
            settings: FlowSettings::default(),
        };
        let flow = ResubmitFlow;
        let handler = flow.wrap(ctx, Arc::new(Echo));
        let rctx = RequestContext::for_session("s1");
        let err = handler.call(json!({"msg": "hi"}), &rctx).await.unwrap_err();
        assert!(matches!(err, PaymcpError::Validation { .. }));
    }
}
