//! ELICITATION: instead of a second tool call, the server
//! drives an `elicitation/create` request/response exchange with the
//! client in-band, re-checking payment status between attempts and
//! heartbeating progress so the client doesn't time out the call.

use super::{Flow, FlowContext, ToolHandler};
use crate::context::RequestContext;
use crate::error::{PaymcpError, PaymcpResult};
use crate::protocol::{CallToolResponse, ErrorCode};
use crate::status::{self, PaymentStatus};
use crate::transport::JsonRpcNotification;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

pub struct ElicitationFlow;

struct ElicitationHandler {
    flow_ctx: FlowContext,
    original: Arc<dyn ToolHandler>,
}

/// What the client's `elicitation/create` response told us to do next.
enum Exchange {
    /// Status confirmed paid by the response itself or by a follow-up poll.
    Paid,
    /// Client declined or canceled; stop retrying.
    Stopped,
    /// Timed out (-32001) or still pending; try again if attempts remain.
    Retry,
}

#[async_trait]
impl ToolHandler for ElicitationHandler {
    async fn call(&self, args: Value, ctx: &RequestContext) -> PaymcpResult<CallToolResponse> {
        let handle = self
            .flow_ctx
            .provider
            .create_payment(&self.flow_ctx.price, json!({"tool": self.flow_ctx.tool_name}))
            .await?;

        let max_attempts = self.flow_ctx.settings.elicitation_max_attempts;
        let heartbeat = self.flow_ctx.settings.elicitation_heartbeat;
        let elicitation_id = Uuid::new_v4().to_string();
        let url_mode = handle.payment_url.is_some();

        for attempt in 1..=max_attempts {
            if ctx.is_cancelled() {
                return Ok(CallToolResponse::json(json!({
                    "status": "pending",
                    "message": "Elicitation aborted. Call the tool again to continue.",
                })));
            }

            let mut params = json!({
                "message": format!("Payment required for {}. Complete payment then confirm.", self.flow_ctx.tool_name),
                "elicitationId": elicitation_id,
                "requestedSchema": {
                    "type": "object",
                    "properties": {
                        "action": { "type": "string", "enum": ["confirm", "cancel"] },
                    },
                },
                "paymentId": handle.payment_id,
                "paymentUrl": handle.payment_url,
                "attempt": attempt,
            });
            if url_mode {
                params["mode"] = json!("url");
            }

            let exchange = tokio::select! {
                result = ctx.callbacks.send_request("elicitation/create", params) => {
                    self.interpret(result, &handle.payment_id).await?
                }
                _ = tokio::time::sleep(heartbeat) => {
                    ctx.callbacks
                        .report_progress(
                            ctx.progress_token.as_ref().unwrap_or(&Value::Null),
                            0,
                            0,
                            "Waiting for payment confirmation",
                        )
                        .await
                        .ok();
                    Exchange::Retry
                }
                _ = ctx.cancellation.cancelled() => Exchange::Stopped,
            };

            match exchange {
                Exchange::Paid => {
                    if url_mode {
                        ctx.callbacks
                            .send_notification(JsonRpcNotification::new(
                                "notifications/elicitation/complete",
                                json!({"elicitationId": elicitation_id}),
                            ))
                            .await
                            .ok();
                    }
                    return self.original.call(args, ctx).await;
                }
                Exchange::Stopped => {
                    return Ok(CallToolResponse::json(json!({
                        "status": "canceled",
                        "payment_url": handle.payment_url,
                    })));
                }
                Exchange::Retry => continue,
            }
        }

        Ok(CallToolResponse::json(json!({
            "status": "pending",
            "message": format!("No confirmation after {max_attempts} attempts"),
            "payment_id": handle.payment_id,
        })))
    }
}

impl ElicitationHandler {
    async fn interpret(&self, result: PaymcpResult<Value>, payment_id: &str) -> PaymcpResult<Exchange> {
        let response = match result {
            Ok(value) => value,
            Err(PaymcpError::ProviderError { code, .. }) if code == ErrorCode::RequestTimeout as i64 => {
                return Ok(Exchange::Retry);
            }
            Err(PaymcpError::ProviderError { code, .. }) if code == ErrorCode::MethodNotFound as i64 => {
                return Err(PaymcpError::unsupported_flow("client does not support elicitation"));
            }
            Err(err) => return Err(err),
        };

        let action = response.get("action").and_then(Value::as_str).unwrap_or("");
        if action == "cancel" || action == "decline" {
            self.flow_ctx.provider.cancel_payment(payment_id).await.ok();
            return Ok(Exchange::Stopped);
        }

        let raw_status = self.flow_ctx.provider.get_payment_status(payment_id).await?;
        match status::normalize(&raw_status) {
            PaymentStatus::Paid => Ok(Exchange::Paid),
            PaymentStatus::Canceled => Ok(Exchange::Stopped),
            PaymentStatus::Pending => Ok(Exchange::Retry),
        }
    }
}

#[async_trait]
impl Flow for ElicitationFlow {
    fn name(&self) -> &'static str {
        "elicitation"
    }

    fn wrap(&self, flow_ctx: FlowContext, handler: Arc<dyn ToolHandler>) -> Arc<dyn ToolHandler> {
        Arc::new(ElicitationHandler { flow_ctx, original: handler })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{HostCallbacks, RecordingCallbacks};
    use crate::flows::FlowSettings;
    use crate::price::Price;
    use crate::provider::mock::MockProvider;
    use crate::state::memory::InMemoryStore;
    use crate::transport::JsonRpcNotification;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::time::Duration;

    struct Echo;
    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, args: Value, _ctx: &RequestContext) -> PaymcpResult<CallToolResponse> {
            Ok(CallToolResponse::json(args))
        }
    }

    /// Answers the first `elicitation/create` with `confirm` after marking
    /// the payment paid on the shared provider. Also records the params it
    /// was sent and any notifications, for tests asserting on the wire shape.
    struct ConfirmOnFirstTry {
        provider: Arc<MockProvider>,
        payment_id: std::sync::Mutex<Option<String>>,
        last_params: std::sync::Mutex<Option<Value>>,
        notifications: std::sync::Mutex<Vec<JsonRpcNotification>>,
    }

    #[async_trait]
    impl HostCallbacks for ConfirmOnFirstTry {
        async fn send_request(&self, _method: &str, params: Value) -> PaymcpResult<Value> {
            let payment_id = params["paymentId"].as_str().unwrap().to_string();
            *self.payment_id.lock().unwrap() = Some(payment_id.clone());
            *self.last_params.lock().unwrap() = Some(params);
            self.provider.mark_paid(&payment_id);
            Ok(json!({"action": "confirm"}))
        }
        async fn send_notification(&self, n: JsonRpcNotification) -> PaymcpResult<()> {
            self.notifications.lock().unwrap().push(n);
            Ok(())
        }
        async fn report_progress(&self, _t: &Value, _p: u32, _tot: u32, _m: &str) -> PaymcpResult<()> {
            Ok(())
        }
    }

    struct AlwaysDecline;
    #[async_trait]
    impl HostCallbacks for AlwaysDecline {
        async fn send_request(&self, _method: &str, _params: Value) -> PaymcpResult<Value> {
            Ok(json!({"action": "decline"}))
        }
        async fn send_notification(&self, _n: JsonRpcNotification) -> PaymcpResult<()> {
            Ok(())
        }
        async fn report_progress(&self, _t: &Value, _p: u32, _tot: u32, _m: &str) -> PaymcpResult<()> {
            Ok(())
        }
    }

    fn flow_ctx(provider: Arc<MockProvider>) -> FlowContext {
        let mut settings = FlowSettings::default();
        settings.elicitation_heartbeat = Duration::from_secs(60);
        FlowContext {
            provider,
            store: Arc::new(InMemoryStore::new()),
            price: Price::new(Decimal::new(100, 2), "USD").unwrap(),
            tool_name: "echo".to_string(),
            settings,
        }
    }

    #[tokio::test]
    async fn confirm_on_first_attempt_runs_handler() {
        let provider = Arc::new(MockProvider::new());
        let ctx = flow_ctx(provider.clone());
        let flow = ElicitationFlow;
        let handler = flow.wrap(ctx, Arc::new(Echo));

        let mut rctx = RequestContext::for_session("s1");
        rctx.callbacks = Arc::new(ConfirmOnFirstTry {
            provider,
            payment_id: std::sync::Mutex::new(None),
            last_params: std::sync::Mutex::new(None),
            notifications: std::sync::Mutex::new(Vec::new()),
        });

        let result = handler.call(json!({"msg": "hi"}), &rctx).await.unwrap();
        let crate::protocol::Content::Text { text, .. } = &result.content[0] else { panic!() };
        assert_eq!(text, "{\"msg\":\"hi\"}");
    }

    #[tokio::test]
    async fn elicitation_create_params_use_camel_case_and_url_mode() {
        let provider = Arc::new(MockProvider::new());
        let ctx = flow_ctx(provider.clone());
        let flow = ElicitationFlow;
        let handler = flow.wrap(ctx, Arc::new(Echo));

        let mut rctx = RequestContext::for_session("s1");
        let callbacks = Arc::new(ConfirmOnFirstTry {
            provider,
            payment_id: std::sync::Mutex::new(None),
            last_params: std::sync::Mutex::new(None),
            notifications: std::sync::Mutex::new(Vec::new()),
        });
        rctx.callbacks = callbacks.clone();

        handler.call(json!({"msg": "hi"}), &rctx).await.unwrap();

        let params = callbacks.last_params.lock().unwrap().clone().unwrap();
        assert!(params["elicitationId"].is_string());
        assert!(params["paymentId"].is_string());
        assert!(params["paymentUrl"].is_string());
        assert_eq!(params["mode"], "url");
        assert!(params.get("payment_id").is_none());
        assert!(params.get("payment_url").is_none());

        let notifications = callbacks.notifications.lock().unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].method, "notifications/elicitation/complete");
        assert_eq!(notifications[0].params.as_ref().unwrap()["elicitationId"], params["elicitationId"]);
    }

    #[tokio::test]
    async fn decline_stops_without_running_handler() {
        let provider = Arc::new(MockProvider::new());
        let mut settings_ctx = flow_ctx(provider);
        settings_ctx.settings.elicitation_max_attempts = 1;
        let flow = ElicitationFlow;
        let handler = flow.wrap(settings_ctx, Arc::new(Echo));

        let mut rctx = RequestContext::for_session("s1");
        rctx.callbacks = Arc::new(AlwaysDecline);

        let result = handler.call(json!({"msg": "hi"}), &rctx).await.unwrap();
        let crate::protocol::Content::Text { text, .. } = &result.content[0] else { panic!() };
        let body: Value = serde_json::from_str(text).unwrap();
        assert_eq!(body["status"], "canceled");
    }

    #[tokio::test]
    async fn exhausting_attempts_without_confirmation_returns_pending() {
        let provider = Arc::new(MockProvider::new());
        let mut ctx = flow_ctx(provider);
        ctx.settings.elicitation_max_attempts = 2;
        let flow = ElicitationFlow;
        let handler = flow.wrap(ctx, Arc::new(Echo));
        let rctx = RequestContext::for_session("s1");

        let result = handler.call(json!({"msg": "hi"}), &rctx).await.unwrap();
        let crate::protocol::Content::Text { text, .. } = &result.content[0] else { panic!() };
        let body: Value = serde_json::from_str(text).unwrap();
        assert_eq!(body["status"], "pending");
    }

    #[tokio::test]
    async fn cancellation_mid_wait_returns_pending_without_error() {
        let provider = Arc::new(MockProvider::new());
        let ctx = flow_ctx(provider);
        let flow = ElicitationFlow;
        let handler = flow.wrap(ctx, Arc::new(Echo));
        let rctx = RequestContext::for_session("s1");
        rctx.cancellation.cancel();

        let result = handler.call(json!({"msg": "hi"}), &rctx).await.unwrap();
        let crate::protocol::Content::Text { text, .. } = &result.content[0] else { panic!() };
        let body: Value = serde_json::from_str(text).unwrap();
        assert_eq!(body["status"], "pending");
    }
}
