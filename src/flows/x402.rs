//! X402: pay in one HTTP-402-style hop via a signed
//! payload instead of a second tool call. Stateless across instances by
//! binding a `challengeId` to the accepted payment requirements at
//! creation time, the same way RESUBMIT binds `payment_id` to the
//! original args.
//!
//! Unlike every other flow, `X402Flow` cannot be built from a plain
//! `Arc<dyn PaymentProvider>` — it needs the `X402Capable` capability
//! view, which `core::PayMcp` only has for providers it configured as
//! X402-capable. So, like `DynamicToolsFlow::wrap_with_server`, its
//! `Flow::wrap` is unreachable and `wrap_with_capable` is the real entry
//! point.

use super::{FlowContext, FlowDescriptorPatch, PaymentRecord, ToolHandler};
use crate::context::RequestContext;
use crate::error::{PaymcpError, PaymcpResult};
use crate::protocol::{CallToolResponse, Content};
use crate::provider::x402::X402_VERSION;
use crate::provider::X402Capable;
use crate::session;
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use std::sync::Arc;

pub struct X402Flow;

struct X402Handler {
    flow_ctx: FlowContext,
    x402: Arc<dyn X402Capable>,
    original: Arc<dyn ToolHandler>,
}

impl X402Handler {
    fn session_id(&self, ctx: &RequestContext) -> String {
        if ctx.session_id.is_empty() {
            session::current_session().unwrap_or_default()
        } else {
            ctx.session_id.clone()
        }
    }

    /// No signature present: mint a challenge, persist the args and the
    /// accepted requirements under it, and return a structured 402 tool
    /// result carrying the `paymentRequired` document.
    async fn first_hop(&self, args: Value, ctx: &RequestContext) -> PaymcpResult<CallToolResponse> {
        self.flow_ctx.price.require_positive()?;

        let challenge_id = format!("{}-{}", self.session_id(ctx), self.flow_ctx.tool_name);
        let resource_url = format!("mcp://{}", self.flow_ctx.tool_name);
        let mut requirements = self.x402.build_payment_requirements(&self.flow_ctx.price, &resource_url).await?;
        if let Value::Object(map) = &mut requirements {
            map.insert("challengeId".to_string(), Value::from(challenge_id.clone()));
        }

        let key = format!("challenge:{challenge_id}");
        let record = serde_json::to_value(PaymentRecord::with_requirements(args, requirements.clone()))
            .map_err(|e| PaymcpError::validation(e.to_string()))?;
        self.flow_ctx.store.set(&key, record, self.flow_ctx.settings.payment_record_ttl).await?;

        let body = json!({
            "x402Version": X402_VERSION,
            "accepts": [requirements],
        });
        Ok(CallToolResponse {
            content: vec![Content::Text { text: body.to_string(), annotations: None }],
            is_error: Some(true),
            meta: None,
        })
    }

    /// Signature present (the "second hop"): verify the
    /// submitted requirements match what was bound to the challenge,
    /// then hand the raw payload to the provider for verify+settle.
    async fn second_hop(&self, payload_b64: &str, ctx: &RequestContext) -> PaymcpResult<CallToolResponse> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(payload_b64)
            .map_err(|e| PaymcpError::validation(format!("invalid base64 x402 payload: {e}")))?;
        let submitted: Value = serde_json::from_slice(&decoded)
            .map_err(|e| PaymcpError::validation(format!("invalid x402 payload json: {e}")))?;

        let fallback_challenge = format!("{}-{}", self.session_id(ctx), self.flow_ctx.tool_name);
        let challenge_id = submitted
            .get("challengeId")
            .and_then(Value::as_str)
            .unwrap_or(&fallback_challenge)
            .to_string();

        let key = format!("challenge:{challenge_id}");
        let raw = self.flow_ctx.store.get(&key).await?;
        let record: PaymentRecord = match raw {
            Some(value) => serde_json::from_value(value).map_err(|e| PaymcpError::validation(e.to_string()))?,
            None => return Err(PaymcpError::UnknownChallenge { challenge_id }),
        };
        let Some(stored_requirements) = record.requirements.clone() else {
            return Err(PaymcpError::UnknownChallenge { challenge_id });
        };

        let submitted_accepted = submitted.get("accepted").cloned().unwrap_or(Value::Null);
        if !requirements_match(&stored_requirements, &submitted_accepted, &challenge_id, &submitted) {
            return Err(PaymcpError::IncorrectSignature);
        }

        let outcome = self.x402.verify_and_settle(&submitted, &stored_requirements).await;
        // Single-use regardless of outcome: a failed settlement still
        // consumes the challenge even on a failed settlement ("error ->
        // delete and throw").
        self.flow_ctx.store.delete(&key).await?;

        match outcome {
            Ok(_settlement) => self.original.call(record.args, ctx).await,
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl ToolHandler for X402Handler {
    async fn call(&self, args: Value, ctx: &RequestContext) -> PaymcpResult<CallToolResponse> {
        match ctx.meta.get("x402/payment").and_then(Value::as_str) {
            Some(payload_b64) => self.second_hop(payload_b64, ctx).await,
            None => self.first_hop(args, ctx).await,
        }
    }
}

fn requirements_match(stored: &Value, submitted: &Value, challenge_id: &str, submitted_outer: &Value) -> bool {
    let field = |v: &Value, k: &str| v.get(k).and_then(Value::as_str).unwrap_or("").to_string();

    let stored_challenge = field(stored, "challengeId");
    let submitted_challenge = submitted_outer.get("challengeId").and_then(Value::as_str).unwrap_or(challenge_id);
    if stored_challenge != submitted_challenge {
        return false;
    }
    if field(stored, "amount") != field(submitted, "amount") {
        return false;
    }
    if field(stored, "network") != field(submitted, "network") {
        return false;
    }
    if field(stored, "asset") != field(submitted, "asset") {
        return false;
    }
    if !field(stored, "payTo").eq_ignore_ascii_case(&field(submitted, "payTo")) {
        return false;
    }
    true
}

#[async_trait]
impl super::Flow for X402Flow {
    fn name(&self) -> &'static str {
        "x402"
    }

    fn wrap(&self, _flow_ctx: FlowContext, _handler: Arc<dyn ToolHandler>) -> Arc<dyn ToolHandler> {
        unreachable!("X402Flow requires an X402Capable provider; use wrap_with_capable")
    }

    fn describe_patch(&self) -> FlowDescriptorPatch {
        FlowDescriptorPatch::default()
    }
}

impl X402Flow {
    /// `core::PayMcp` calls this instead of the trait's `wrap` once it has
    /// resolved the priced tool's provider to an `X402Capable` view.
    pub fn wrap_with_capable(flow_ctx: FlowContext, x402: Arc<dyn X402Capable>, handler: Arc<dyn ToolHandler>) -> Arc<dyn ToolHandler> {
        Arc::new(X402Handler { flow_ctx, x402, original: handler })
    }
}
