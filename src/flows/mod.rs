//! Flow Modules — one state machine per payment negotiation protocol.
//! Each flow implements the `Flow` trait; `PayMcp` (`crate::core`) picks
//! one per priced tool via `select_flow` and installs its `wrap_handler`
//! output as the tool's actual handler.
//!
//! This is the largest component by design, so each protocol lives in its
//! own file; this module holds only what's genuinely shared: the `Flow`
//! trait, the payment record persisted in the state store, and mode
//! selection/compatibility.

pub mod auto;
pub mod dynamic_tools;
pub mod elicitation;
pub mod progress;
pub mod resubmit;
pub mod two_step;
pub mod x402;

use crate::context::RequestContext;
use crate::error::PaymcpResult;
use crate::price::Price;
use crate::protocol::{CallToolResponse, ToolDefinition};
use crate::provider::PaymentProvider;
use crate::server_adapter::ServerAdapter;
use crate::state::StateStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// The original tool implementation a flow gates, type-erased so flows
/// don't need a generic parameter per tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value, ctx: &RequestContext) -> PaymcpResult<CallToolResponse>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(Value, RequestContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = PaymcpResult<CallToolResponse>> + Send,
{
    async fn call(&self, args: Value, ctx: &RequestContext) -> PaymcpResult<CallToolResponse> {
        self(args, ctx.clone()).await
    }
}

/// Everything a flow needs to build a wrapped handler for one priced
/// tool. Constructed once by `core::PayMcp` and handed to `Flow::wrap`.
#[derive(Clone)]
pub struct FlowContext {
    pub provider: Arc<dyn PaymentProvider>,
    pub store: Arc<dyn StateStore>,
    pub price: Price,
    pub tool_name: String,
    pub settings: FlowSettings,
}

/// Tunables every flow reads (poll intervals, ceilings, attempt counts)
/// instead of hardcoding them per flow.
#[derive(Clone, Debug)]
pub struct FlowSettings {
    pub poll_interval: std::time::Duration,
    pub progress_ceiling: std::time::Duration,
    pub elicitation_max_attempts: u32,
    pub elicitation_heartbeat: std::time::Duration,
    pub dynamic_tools_sweep_interval: std::time::Duration,
    pub payment_record_ttl: Option<std::time::Duration>,
    pub lock_ttl: std::time::Duration,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_secs(3),
            progress_ceiling: std::time::Duration::from_secs(15 * 60),
            elicitation_max_attempts: 5,
            elicitation_heartbeat: std::time::Duration::from_secs(3),
            dynamic_tools_sweep_interval: std::time::Duration::from_secs(10 * 60),
            payment_record_ttl: None,
            lock_ttl: std::time::Duration::from_secs(30),
        }
    }
}

/// The payment record persisted by most flows: original tool arguments,
/// creation timestamp, and — for X402 only — the accepted
/// payment-requirements document bound to the challenge id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub args: Value,
    pub ts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requirements: Option<Value>,
}

impl PaymentRecord {
    pub fn new(args: Value) -> Self {
        Self { args, ts: unix_now(), requirements: None }
    }

    pub fn with_requirements(args: Value, requirements: Value) -> Self {
        Self { args, ts: unix_now(), requirements: Some(requirements) }
    }
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One payment negotiation protocol. `wrap` builds the replacement
/// handler PayMCP installs for a priced tool; `setup` is only meaningful
/// for DYNAMIC_TOOLS, which must patch `server.connect()` to install its
/// own `tools/list` filter once the runtime's handler map exists.
#[async_trait]
pub trait Flow: Send + Sync {
    fn name(&self) -> &'static str;

    fn wrap(&self, flow_ctx: FlowContext, handler: Arc<dyn ToolHandler>) -> Arc<dyn ToolHandler>;

    /// Tool-descriptor adjustments this flow wants: whether the tool's
    /// input schema gets an optional `payment_id`
    /// field, and whether `_meta` should be stripped from the original
    /// descriptor because a confirmation tool carries it instead.
    fn describe_patch(&self) -> FlowDescriptorPatch {
        FlowDescriptorPatch::default()
    }

    /// DYNAMIC_TOOLS-only hook: called once when `PayMcp` installs onto
    /// `server`, after the server's handler map exists.
    async fn setup(&self, _server: &dyn ServerAdapter) -> PaymcpResult<()> {
        Ok(())
    }
}

#[derive(Default, Clone, Copy)]
pub struct FlowDescriptorPatch {
    pub adds_payment_id_param: bool,
    pub strips_meta_from_original: bool,
}

/// Payment flow selector. `Mode::Auto`
/// defers the RESUBMIT-vs-ELICITATION choice to call time (it depends on
/// capabilities captured at `initialize`, not on anything known at
/// install time), which is why `resolve` can return `Mode::Auto` itself
/// rather than eagerly picking a concrete flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    TwoStep,
    Elicitation,
    Progress,
    DynamicTools,
    Resubmit,
    X402,
    Auto,
}

impl Mode {
    pub fn from_name(name: &str) -> PaymcpResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "two_step" | "twostep" => Ok(Mode::TwoStep),
            "elicitation" => Ok(Mode::Elicitation),
            "progress" => Ok(Mode::Progress),
            "dynamic_tools" | "list_change" => Ok(Mode::DynamicTools),
            "resubmit" => Ok(Mode::Resubmit),
            "x402" => Ok(Mode::X402),
            "auto" => Ok(Mode::Auto),
            other => Err(crate::error::PaymcpError::unsupported_flow(format!("unknown mode: {other}"))),
        }
    }
}

/// Applies the x402 mode-compatibility table: a requested mode may
/// be downgraded depending on whether an X402-capable provider is
/// configured. Returns the *effective* mode, plus whether a downgrade
/// happened (callers log a warning on downgrade, per the table's note).
pub fn resolve_mode(requested: Mode, has_x402_provider: bool, x402_is_only_provider: bool) -> (Mode, bool) {
    match (requested, has_x402_provider) {
        (Mode::X402, false) => (Mode::Resubmit, true),
        (Mode::X402, true) => (Mode::X402, false),
        (_, false) => (requested, false),
        (Mode::Auto, true) => (Mode::X402, false),
        (_, true) if x402_is_only_provider => (Mode::X402, true),
        (_, true) => (Mode::Auto, true),
    }
}

pub fn build_flow(mode: Mode) -> Arc<dyn Flow> {
    match mode {
        Mode::TwoStep => Arc::new(two_step::TwoStepFlow),
        Mode::Elicitation => Arc::new(elicitation::ElicitationFlow),
        Mode::Progress => Arc::new(progress::ProgressFlow),
        Mode::DynamicTools => Arc::new(dynamic_tools::DynamicToolsFlow::new()),
        Mode::Resubmit => Arc::new(resubmit::ResubmitFlow),
        Mode::X402 => Arc::new(x402::X402Flow),
        Mode::Auto => Arc::new(auto::AutoFlow::new()),
    }
}

pub(crate) fn confirmation_tool_name(tool_name: &str, suffix: &str) -> String {
    format!("confirm_{tool_name}_{suffix}")
}

pub(crate) fn text_response(value: &Value) -> CallToolResponse {
    CallToolResponse::json(value.clone())
}

pub(crate) fn tool_descriptor_for_confirmation(name: String, tool_name: &str, payment_id: &str) -> ToolDefinition {
    let mut def = ToolDefinition::new(name, None);
    def.title = Some(format!("Confirm payment for {tool_name}"));
    def.description = Some(format!("Confirm payment {payment_id} and execute {tool_name}()"));
    def.input_schema = None;
    def
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_downgrades_to_auto_when_x402_present_among_others() {
        let (effective, downgraded) = resolve_mode(Mode::Progress, true, false);
        assert_eq!(effective, Mode::Auto);
        assert!(downgraded);
    }

    #[test]
    fn mode_collapses_to_x402_when_only_provider() {
        let (effective, downgraded) = resolve_mode(Mode::Auto, true, true);
        assert_eq!(effective, Mode::X402);
        assert!(!downgraded);
    }

    #[test]
    fn auto_collapses_to_x402_even_when_not_the_only_provider() {
        let (effective, downgraded) = resolve_mode(Mode::Auto, true, false);
        assert_eq!(effective, Mode::X402);
        assert!(!downgraded);
    }

    #[test]
    fn x402_mode_downgrades_to_resubmit_without_x402_provider() {
        let (effective, downgraded) = resolve_mode(Mode::X402, false, false);
        assert_eq!(effective, Mode::Resubmit);
        assert!(downgraded);
    }

    #[test]
    fn resubmit_mode_passes_through_without_x402() {
        let (effective, downgraded) = resolve_mode(Mode::Resubmit, false, false);
        assert_eq!(effective, Mode::Resubmit);
        assert!(!downgraded);
    }

    #[test]
    fn mode_from_name_accepts_list_change_alias() {
        assert_eq!(Mode::from_name("list_change").unwrap(), Mode::DynamicTools);
        assert_eq!(Mode::from_name("LIST_CHANGE").unwrap(), Mode::DynamicTools);
    }

    #[test]
    fn mode_from_name_rejects_unknown() {
        assert!(Mode::from_name("bogus").is_err());
    }
}
