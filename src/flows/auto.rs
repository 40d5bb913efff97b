//! AUTO: a dispatcher that chooses RESUBMIT or ELICITATION
//! per invocation based on the capabilities the calling client advertised
//! at `initialize` (stored under `session-{sessionId}`; flows read them
//! back off `RequestContext::capabilities`). An
//! X402-capable provider supersedes AUTO entirely — that collapse is
//! handled one level up by `resolve_mode` before a flow is ever built, so
//! this module only ever arbitrates between the other two.

use super::{Flow, FlowContext, FlowDescriptorPatch, ToolHandler};
use crate::context::RequestContext;
use crate::error::PaymcpResult;
use crate::protocol::CallToolResponse;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

pub struct AutoFlow;

impl Default for AutoFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoFlow {
    pub fn new() -> Self {
        Self
    }
}

struct AutoHandler {
    resubmit: Arc<dyn ToolHandler>,
    elicitation: Arc<dyn ToolHandler>,
}

#[async_trait]
impl ToolHandler for AutoHandler {
    async fn call(&self, args: Value, ctx: &RequestContext) -> PaymcpResult<CallToolResponse> {
        let wants_elicitation = ctx.capabilities().map(|c| c.supports_elicitation()).unwrap_or(false);
        if wants_elicitation {
            self.elicitation.call(args, ctx).await
        } else {
            self.resubmit.call(args, ctx).await
        }
    }
}

#[async_trait]
impl Flow for AutoFlow {
    fn name(&self) -> &'static str {
        "auto"
    }

    fn wrap(&self, flow_ctx: FlowContext, handler: Arc<dyn ToolHandler>) -> Arc<dyn ToolHandler> {
        let resubmit = super::resubmit::ResubmitFlow.wrap(flow_ctx.clone(), handler.clone());
        let elicitation = super::elicitation::ElicitationFlow.wrap(flow_ctx, handler);
        Arc::new(AutoHandler { resubmit, elicitation })
    }

    fn describe_patch(&self) -> FlowDescriptorPatch {
        // Mirrors RESUBMIT: the client may need to resubmit with
        // `payment_id` if it turns out not to support elicitation.
        FlowDescriptorPatch { adds_payment_id_param: true, strips_meta_from_original: false }
    }
}
