//! Subscription tool pair: demonstrates that the interception pattern this
//! crate builds generalizes past one-off payments. Not a billing engine —
//! just `subscribe`/`cancel_subscription` tools built the same way any
//! other tool is, registered through `core::PayMcp::register_tool` with
//! `SubscriptionCapable` doing the actual state check (`core::SubscriptionGate`
//! wraps a *different* tool's handler; these two tools are what a host
//! wires up to let a caller acquire or drop the subscription in the first
//! place).
//!
//! Grounded on the `tools::mod` tool-registration shape of the MCP server
//! this crate wraps (a descriptor plus an async fn), trimmed to the two
//! operations a subscription lifecycle needs.

use crate::context::RequestContext;
use crate::error::{PaymcpError, PaymcpResult};
use crate::flows::ToolHandler;
use crate::protocol::CallToolResponse;
use crate::provider::SubscriptionCapable;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// `subscribe` tool handler: creates a payment for the named plan via the
/// underlying `PaymentProvider` and tells the caller to confirm once paid,
/// the same shape TWO_STEP uses for one-off payments.
pub struct SubscribeHandler {
    provider: Arc<dyn SubscriptionCapable>,
    plan_prices: Vec<(String, crate::price::Price)>,
}

impl SubscribeHandler {
    pub fn new(provider: Arc<dyn SubscriptionCapable>, plan_prices: Vec<(String, crate::price::Price)>) -> Self {
        Self { provider, plan_prices }
    }

    fn price_for(&self, plan: &str) -> PaymcpResult<crate::price::Price> {
        self.plan_prices
            .iter()
            .find(|(name, _)| name == plan)
            .map(|(_, price)| *price)
            .ok_or_else(|| PaymcpError::validation(format!("unknown subscription plan: {plan}")))
    }
}

#[async_trait]
impl ToolHandler for SubscribeHandler {
    async fn call(&self, args: Value, ctx: &RequestContext) -> PaymcpResult<CallToolResponse> {
        let plan = args
            .get("plan")
            .and_then(Value::as_str)
            .ok_or_else(|| PaymcpError::validation("missing plan"))?;
        let price = self.price_for(plan)?;

        if self.provider.has_active_subscription(&ctx.session_id, &[plan.to_string()]).await? {
            return Ok(CallToolResponse::json(json!({
                "status": "already_subscribed",
                "plan": plan,
            })));
        }

        let handle = self
            .provider
            .create_payment(&price, json!({"plan": plan, "kind": "subscription"}))
            .await?;

        Ok(CallToolResponse::json(json!({
            "status": "payment_required",
            "plan": plan,
            "payment_id": handle.payment_id,
            "payment_url": handle.payment_url,
        })))
    }
}

/// `cancel_subscription` tool handler: best-effort cancellation through
/// the provider, mirroring `PaymentProvider::cancel_payment`'s contract
/// of treating inability to cancel as a no-op success.
pub struct CancelSubscriptionHandler {
    provider: Arc<dyn SubscriptionCapable>,
}

impl CancelSubscriptionHandler {
    pub fn new(provider: Arc<dyn SubscriptionCapable>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl ToolHandler for CancelSubscriptionHandler {
    async fn call(&self, args: Value, ctx: &RequestContext) -> PaymcpResult<CallToolResponse> {
        let plan = args
            .get("plan")
            .and_then(Value::as_str)
            .ok_or_else(|| PaymcpError::validation("missing plan"))?;

        if !self.provider.has_active_subscription(&ctx.session_id, &[plan.to_string()]).await? {
            return Err(PaymcpError::NotAuthorized {
                message: format!("no active subscription for plan {plan}"),
            });
        }

        let payment_id = args.get("payment_id").and_then(Value::as_str).unwrap_or_default();
        self.provider.cancel_payment(payment_id).await?;

        Ok(CallToolResponse::json(json!({
            "status": "canceled",
            "plan": plan,
        })))
    }
}
