//! End-to-end payment scenarios, driven entirely through the public
//! `core::PayMcp` surface (install → register_tool → server.call_tool →
//! list_tools) rather than calling a flow module directly, so these tests
//! also exercise the interception core's mode selection and descriptor
//! patching.

use async_trait::async_trait;
use paymcp::context::RequestContext;
use paymcp::core::{InstallOptions, PayMcp, ProviderHandle, ToolConfig};
use paymcp::error::{PaymcpError, PaymcpResult};
use paymcp::flows::{Mode, ToolHandler};
use paymcp::protocol::{CallToolResponse, Content};
use paymcp::provider::mock::MockProvider;
use paymcp::server_adapter::InMemoryServerAdapter;
use paymcp::Price;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

struct Echo;

#[async_trait]
impl ToolHandler for Echo {
    async fn call(&self, args: Value, _ctx: &RequestContext) -> PaymcpResult<CallToolResponse> {
        Ok(CallToolResponse::json(args))
    }
}

fn price() -> Price {
    Price::new(Decimal::new(100, 2), "USD").unwrap()
}

fn text_of(response: &CallToolResponse) -> &str {
    match &response.content[0] {
        Content::Text { text, .. } => text,
        Content::Resource { .. } => panic!("expected text content"),
    }
}

/// RESUBMIT happy path. First call errors with `payment_id`;
/// resubmitting with it runs the tool; a second resubmission with the same
/// (now-consumed) id is rejected.
#[tokio::test]
async fn resubmit_happy_path_then_id_is_consumed() {
    let server = Arc::new(InMemoryServerAdapter::new());
    let provider = Arc::new(MockProvider::new());
    let mut providers = HashMap::new();
    providers.insert("mock".to_string(), ProviderHandle::new(provider.clone()));

    let handle = PayMcp::install(server.clone(), InstallOptions { providers, mode: Mode::Resubmit, ..Default::default() }).unwrap();
    handle.register_tool("echo", ToolConfig { price: Some(price()), ..Default::default() }, Arc::new(Echo)).unwrap();

    let rctx = RequestContext::for_session("s1");
    let err = server.call_tool("echo", json!({"msg": "hi"}), &rctx).await.unwrap_err();
    let payment_id = match err {
        PaymcpError::PaymentRequired { payment_id, .. } => payment_id.unwrap(),
        other => panic!("unexpected: {other:?}"),
    };
    assert!(payment_id.starts_with("mock-"));

    provider.mark_paid(&payment_id);
    let ok = server.call_tool("echo", json!({"msg": "hi", "payment_id": payment_id.clone()}), &rctx).await.unwrap();
    assert_eq!(text_of(&ok), "{\"msg\":\"hi\"}");

    let again = server.call_tool("echo", json!({"payment_id": payment_id}), &rctx).await.unwrap_err();
    assert!(matches!(again, PaymcpError::PaymentIdNotFound { .. }));
}

/// A canceled resubmission keeps the state around so a later
/// retry with a *fresh* payment id still works (the stale entry is simply
/// never consumed, not cleaned up by this flow).
#[tokio::test]
async fn resubmit_failed_payment_retains_state_and_fresh_id_still_works() {
    let server = Arc::new(InMemoryServerAdapter::new());
    let provider = Arc::new(MockProvider::new());
    let mut providers = HashMap::new();
    providers.insert("mock".to_string(), ProviderHandle::new(provider.clone()));

    let handle = PayMcp::install(server.clone(), InstallOptions { providers, mode: Mode::Resubmit, ..Default::default() }).unwrap();
    handle.register_tool("echo", ToolConfig { price: Some(price()), ..Default::default() }, Arc::new(Echo)).unwrap();

    let rctx = RequestContext::for_session("s1");
    let first_err = server.call_tool("echo", json!({"msg": "hi"}), &rctx).await.unwrap_err();
    let first_id = match first_err {
        PaymcpError::PaymentRequired { payment_id, .. } => payment_id.unwrap(),
        other => panic!("unexpected: {other:?}"),
    };
    provider.mark_canceled(&first_id);

    let canceled = server.call_tool("echo", json!({"payment_id": first_id}), &rctx).await.unwrap_err();
    assert!(matches!(canceled, PaymcpError::PaymentCanceled { .. }));

    let second_err = server.call_tool("echo", json!({"msg": "hi"}), &rctx).await.unwrap_err();
    let second_id = match second_err {
        PaymcpError::PaymentRequired { payment_id, .. } => payment_id.unwrap(),
        other => panic!("unexpected: {other:?}"),
    };
    provider.mark_paid(&second_id);
    let ok = server.call_tool("echo", json!({"msg": "hi", "payment_id": second_id}), &rctx).await.unwrap();
    assert_eq!(text_of(&ok), "{\"msg\":\"hi\"}");
}

/// DYNAMIC_TOOLS per-session isolation through `list_tools`.
/// Session A's list contains its own confirmation tool and not `draw`;
/// session B's list contains its own confirmation tool and neither `draw`
/// nor A's confirmation tool.
#[tokio::test]
async fn dynamic_tools_isolates_confirmation_tools_per_session() {
    let server = Arc::new(InMemoryServerAdapter::new());
    let provider = Arc::new(MockProvider::new());
    let mut providers = HashMap::new();
    providers.insert("mock".to_string(), ProviderHandle::new(provider.clone()));

    let handle = PayMcp::install(server.clone(), InstallOptions { providers, mode: Mode::DynamicTools, ..Default::default() }).unwrap();
    handle.register_tool("draw", ToolConfig { price: Some(price()), ..Default::default() }, Arc::new(Echo)).unwrap();

    let rctx_a = RequestContext::for_session("session-a");
    server.call_tool("draw", json!({}), &rctx_a).await.unwrap();
    let rctx_b = RequestContext::for_session("session-b");
    server.call_tool("draw", json!({}), &rctx_b).await.unwrap();

    let list_a = handle.list_tools("session-a").await.unwrap();
    let names_a: Vec<_> = list_a.tools.iter().map(|t| t.name.clone()).collect();
    assert!(!names_a.contains(&"draw".to_string()));
    let confirm_a: Vec<_> = names_a.iter().filter(|n| n.starts_with("confirm_draw_")).collect();
    assert_eq!(confirm_a.len(), 1);

    let list_b = handle.list_tools("session-b").await.unwrap();
    let names_b: Vec<_> = list_b.tools.iter().map(|t| t.name.clone()).collect();
    assert!(!names_b.contains(&"draw".to_string()));
    assert!(!names_b.contains(confirm_a[0]));
    let confirm_b: Vec<_> = names_b.iter().filter(|n| n.starts_with("confirm_draw_")).collect();
    assert_eq!(confirm_b.len(), 1);
    assert_ne!(confirm_a[0], &confirm_b[0]);
}

/// AUTO dispatch picks ELICITATION or RESUBMIT per the calling
/// client's capabilities, captured by the patched `initialize` handler.
#[tokio::test]
async fn auto_mode_dispatches_per_client_capabilities_captured_at_initialize() {
    use paymcp::flows::FlowSettings;
    use paymcp::protocol::{ClientCapabilities, Implementation, InitializeRequest};

    let server = Arc::new(InMemoryServerAdapter::new());
    let provider = Arc::new(MockProvider::new());
    let mut providers = HashMap::new();
    providers.insert("mock".to_string(), ProviderHandle::new(provider.clone()));

    let mut settings = FlowSettings::default();
    settings.elicitation_max_attempts = 1;
    settings.elicitation_heartbeat = std::time::Duration::from_secs(60);

    let handle = PayMcp::install(server.clone(), InstallOptions { providers, mode: Mode::Auto, settings, ..Default::default() }).unwrap();
    handle.register_tool("draw", ToolConfig { price: Some(price()), ..Default::default() }, Arc::new(Echo)).unwrap();

    handle
        .handle_initialize(
            "client-a",
            InitializeRequest {
                protocol_version: "2025-06-18".to_string(),
                capabilities: ClientCapabilities { elicitation: Some(json!({})), ..Default::default() },
                client_info: Implementation { name: "client-a".to_string(), version: "1.0".to_string() },
            },
        )
        .await
        .unwrap();

    // AutoFlow reads capabilities off `RequestContext::auth_info`, which a
    // real host populates from the session info `handle_initialize` just
    // stored; the in-process test mirrors that hand-off explicitly.
    let mut rctx_a = RequestContext::for_session("client-a");
    rctx_a.auth_info = Some(json!({"capabilities": {"elicitation": {}}}));
    let result = server.call_tool("draw", json!({"shape": "circle"}), &rctx_a).await.unwrap();
    let body: Value = serde_json::from_str(text_of(&result)).unwrap();
    assert_eq!(body["status"], "pending");

    let rctx_b = RequestContext::for_session("client-b");
    let err = server.call_tool("draw", json!({"shape": "circle"}), &rctx_b).await.unwrap_err();
    assert!(matches!(err, PaymcpError::PaymentRequired { .. }));
}
