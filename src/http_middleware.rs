//! X402 HTTP Middleware: a second place x402 can be
//! enforced — in front of the transport, for hosts that serve MCP over
//! HTTP and want the 402 challenge to happen before a JSON-RPC body is
//! even dispatched to a tool handler. Distinct from `flows::x402`, which
//! gates the tool call itself; a host using HTTP transport can install
//! both, or just this one and skip the MCP-level X402 flow entirely.
//!
//! Grounded on this crate's `http_server.rs` reference shape: same axum `Router` +
//! `tower::ServiceBuilder` composition style, generalized from a
//! metrics/health/MCP-API router into a `tower::Layer`-compatible guard
//! function a host threads in with `axum::middleware::from_fn_with_state`.

use crate::error::PaymcpResult;
use crate::price::Price;
use crate::provider::X402Capable;
use crate::state::StateStore;
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const CHALLENGE_TTL: Duration = Duration::from_secs(5 * 60);

/// Holds the x402-capable provider and the state store challenges are
/// bound in; `core::PayMcpHandle::get_x402_middleware` is the only place
/// that constructs one, mirroring how `flows::x402::X402Flow` only ever
/// sees an `X402Capable` view handed to it deliberately.
pub struct X402Middleware {
    provider: Arc<dyn X402Capable>,
    store: Arc<dyn StateStore>,
}

impl X402Middleware {
    pub(crate) fn new(provider: Arc<dyn X402Capable>, store: Arc<dyn StateStore>) -> Self {
        Self { provider, store }
    }

    /// Inspects an inbound request ahead of dispatch. `Some` means the
    /// caller must answer with this 402 body instead of running the tool;
    /// `None` means the request should proceed (payment header already
    /// present, or the body isn't a priced `tools/call`).
    pub async fn intercept(&self, headers: &HeaderMap, body: &Value) -> PaymcpResult<Option<Value>> {
        if headers.get("payment-signature").is_some() || headers.get("x-payment").is_some() {
            return Ok(None);
        }

        if body.get("method").and_then(Value::as_str) != Some("tools/call") {
            return Ok(None);
        }

        let tool_name = body.pointer("/params/name").and_then(Value::as_str).unwrap_or_default();
        let Some(price) = parse_price(body.pointer("/params/_meta/price")) else {
            return Ok(None);
        };

        Ok(Some(self.challenge(&price, tool_name).await?))
    }

    async fn challenge(&self, price: &Price, tool_name: &str) -> PaymcpResult<Value> {
        let resource_url = format!("mcp://{tool_name}");
        let requirements = self.provider.build_payment_requirements(price, &resource_url).await?;

        let payment_id = Uuid::new_v4().to_string();
        self.store
            .set(&format!("http-challenge:{payment_id}"), requirements.clone(), Some(CHALLENGE_TTL))
            .await?;

        Ok(json!({
            "x402Version": crate::provider::x402::X402_VERSION,
            "accepts": [requirements],
            "paymentId": payment_id,
        }))
    }
}

/// base64-encodes a payment-data JSON document for the `PAYMENT-REQUIRED`
/// response header.
fn encode_payment_data(payment_data: &Value) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(payment_data.to_string())
}

fn parse_price(meta_price: Option<&Value>) -> Option<Price> {
    let meta_price = meta_price?;
    let amount = meta_price.get("amount").and_then(Value::as_str)?;
    let currency = meta_price.get("currency").and_then(Value::as_str)?;
    Price::new(amount.parse().ok()?, currency).ok()
}

/// `tower`-compatible guard: `Router::layer(axum::middleware::from_fn_with_state(middleware, x402_guard))`.
/// Reads the request body once (it must be replayed into the downstream
/// service on the pass-through path, same as any body-inspecting axum
/// middleware).
pub async fn x402_guard(State(middleware): State<Arc<X402Middleware>>, req: Request<Body>, next: Next) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::BAD_REQUEST, "failed to read request body").into_response(),
    };

    let parsed: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    match middleware.intercept(&parts.headers, &parsed).await {
        Ok(Some(challenge)) => {
            let header_value = encode_payment_data(&challenge);
            let body = crate::transport::JsonRpcMessage::error_response(Value::Null, 402, "Payment required", None);
            let body = serde_json::to_value(&body).unwrap_or(Value::Null);
            (
                StatusCode::PAYMENT_REQUIRED,
                [("PAYMENT-REQUIRED", header_value)],
                Json(body),
            )
                .into_response()
        }
        Ok(None) => next.run(Request::from_parts(parts, Body::from(bytes))).await,
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}
