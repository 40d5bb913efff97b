//! PROGRESS: create a payment, poll status on an interval,
//! emit `notifications/progress` with monotonically growing percentage
//! against a hard wall-clock ceiling, run the handler on `paid`.

use super::{Flow, FlowContext, ToolHandler};
use crate::context::RequestContext;
use crate::error::PaymcpResult;
use crate::protocol::CallToolResponse;
use crate::status::{self, PaymentStatus};
use crate::transport::JsonRpcNotification;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct ProgressFlow;

struct ProgressHandler {
    flow_ctx: FlowContext,
    original: Arc<dyn ToolHandler>,
}

#[async_trait]
impl ToolHandler for ProgressHandler {
    async fn call(&self, args: Value, ctx: &RequestContext) -> PaymcpResult<CallToolResponse> {
        let handle = self
            .flow_ctx
            .provider
            .create_payment(&self.flow_ctx.price, json!({"tool": self.flow_ctx.tool_name}))
            .await?;

        let started = Instant::now();
        let ceiling = self.flow_ctx.settings.progress_ceiling;
        let interval = self.flow_ctx.settings.poll_interval;

        self.emit_progress(ctx, 0, "Payment created").await;

        loop {
            if ctx.is_cancelled() {
                return Ok(CallToolResponse::json(json!({
                    "status": "pending",
                    "message": "Payment aborted. Call the tool again to continue.",
                })));
            }

            let elapsed = started.elapsed();
            if elapsed >= ceiling {
                return Ok(CallToolResponse::json(json!({
                    "status": "error",
                    "reason": "timeout",
                })));
            }

            let raw_status = self.flow_ctx.provider.get_payment_status(&handle.payment_id).await?;
            match status::normalize(&raw_status) {
                PaymentStatus::Paid => {
                    self.emit_progress(ctx, 100, "Payment confirmed").await;
                    return self.original.call(args, ctx).await;
                }
                PaymentStatus::Canceled => {
                    return Ok(CallToolResponse::json(json!({
                        "status": "canceled",
                        "payment_url": handle.payment_url,
                    })));
                }
                PaymentStatus::Pending => {
                    let pct = ((elapsed.as_secs_f64() / ceiling.as_secs_f64()) * 100.0).min(99.0) as u32;
                    self.emit_progress(ctx, pct, "Waiting for payment").await;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = ctx.cancellation.cancelled() => {}
            }
        }
    }
}

impl ProgressHandler {
    async fn emit_progress(&self, ctx: &RequestContext, progress: u32, message: &str) {
        if let Some(token) = &ctx.progress_token {
            let _ = ctx
                .callbacks
                .send_notification(JsonRpcNotification::new(
                    "notifications/progress",
                    json!({
                        "progressToken": token,
                        "progress": progress,
                        "total": 100,
                        "message": message,
                    }),
                ))
                .await;
        }
    }
}

#[async_trait]
impl Flow for ProgressFlow {
    fn name(&self) -> &'static str {
        "progress"
    }

    fn wrap(&self, flow_ctx: FlowContext, handler: Arc<dyn ToolHandler>) -> Arc<dyn ToolHandler> {
        Arc::new(ProgressHandler { flow_ctx, original: handler })
    }
}
