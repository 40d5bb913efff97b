//! Demo binary: installs PayMCP in RESUBMIT mode over an in-process
//! server adapter, registers one priced tool, and drives it through the
//! "payment required, then resubmit" happy path end to end. Intended as a
//! runnable illustration of the library surface, not a host
//! application — real hosts wire `core::PayMcp` into their own MCP server
//! instead of `server_adapter::InMemoryServerAdapter`.

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

struct Draw;

#[async_trait]
impl ToolHandler for Draw {
    async fn call(&self, args: Value, _ctx: &RequestContext) -> PaymcpResult<CallToolResponse> {
        Ok(CallToolResponse::json(json!({"drawing": "a circle", "requested": args})))
    }
}

#[tokio::main]
async fn main() -> PaymcpResult<()> {
    paymcp::logging::init_logging(None).ok();

    let server = Arc::new(InMemoryServerAdapter::new());
    let provider = Arc::new(MockProvider::new());

    let mut providers = HashMap::new();
    providers.insert("mock".to_string(), ProviderHandle::new(provider.clone()));

    let handle = PayMcp::install(
        server.clone(),
        InstallOptions { providers, mode: Mode::Resubmit, ..Default::default() },
    )?;

    handle.register_tool(
        "draw",
        ToolConfig { price: Some(Price::new(Decimal::new(150, 2), "USD")?), ..Default::default() },
        Arc::new(Draw),
    )?;

    let rctx = RequestContext::for_session("demo-session");

    let first = server.call_tool("draw", json!({"shape": "circle"}), &rctx).await;
    let payment_id = match first {
        Err(PaymcpError::PaymentRequired { payment_id, payment_url, .. }) => {
            println!("payment required: payment_id={payment_id:?} payment_url={payment_url:?}");
            payment_id.expect("mock provider always returns a payment_id")
        }
        other => panic!("expected payment_required, got {other:?}"),
    };

    provider.mark_paid(&payment_id);

    let second = server.call_tool("draw", json!({"shape": "circle", "payment_id": payment_id}), &rctx).await?;
    if let Content::Text { text, .. } = &second.content[0] {
        println!("tool result after payment: {text}");
    }

    handle.uninstall()?;
    Ok(())
}
