//! x402 provider, grounded directly on an
//! `x402::facilitator::FacilitatorClient`, `x402::types`, and
//! `x402::config` modules: same request/retry shape, same trace-id
//! tagged `tracing` calls, same camelCase wire types, retargeted from
//! Solana-specific SVM settlement onto the generic x402 v2 wire contract.

use super::{PaymentHandle, PaymentProvider, X402Capable};
use crate::error::{PaymcpError, PaymcpResult};
use crate::price::Price;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const X402_VERSION: u32 = 1;

/// Per-asset minor-unit multiplier ("USDC = 10^6").
pub fn minor_units(amount: rust_decimal::Decimal, asset: &str) -> PaymcpResult<String> {
    let decimals: u32 = match asset.to_ascii_uppercase().as_str() {
        "USDC" => 6,
        _ => return Err(PaymcpError::unsupported_flow(format!("unknown x402 asset: {asset}"))),
    };
    let scaled = amount * rust_decimal::Decimal::from(10u64.pow(decimals));
    Ok(scaled.trunc().to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    pub amount: String,
    pub asset: String,
    pub pay_to: String,
    pub max_timeout_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub x402_version: u32,
    pub accepted: PaymentRequirements,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SettlementResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    pub transaction: String,
    pub network: String,
}

/// Produces an `Authorization`-style header value for facilitator calls.
/// Pluggable so hosts can swap in their facilitator's own auth scheme;
/// `CdpJwtAuth` below is the default for Coinbase CDP.
pub trait FacilitatorAuth: Send + Sync {
    fn header_value(&self, method: &str, host: &str, path: &str) -> PaymcpResult<String>;
}

/// No authentication — suitable for a facilitator run locally in tests.
pub struct NoAuth;

impl FacilitatorAuth for NoAuth {
    fn header_value(&self, _method: &str, _host: &str, _path: &str) -> PaymcpResult<String> {
        Ok(String::new())
    }
}

/// Default Coinbase CDP facilitator auth: a short-lived EdDSA-signed JWT
/// over `{method, host, path}`. The key is an Ed25519 signing key; CDP
/// issues these out of band.
pub struct CdpJwtAuth {
    signing_key: ed25519_dalek::SigningKey,
    key_id: String,
    ttl: Duration,
}

impl CdpJwtAuth {
    pub fn new(signing_key: ed25519_dalek::SigningKey, key_id: impl Into<String>) -> Self {
        Self { signing_key, key_id: key_id.into(), ttl: Duration::from_secs(120) }
    }

    fn now_unix(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

impl FacilitatorAuth for CdpJwtAuth {
    fn header_value(&self, method: &str, host: &str, path: &str) -> PaymcpResult<String> {
        use base64::Engine;
        use ed25519_dalek::Signer;

        let header = serde_json::json!({ "alg": "EdDSA", "typ": "JWT", "kid": self.key_id });
        let now = self.now_unix();
        let claims = serde_json::json!({
            "sub": self.key_id,
            "iat": now,
            "exp": now + self.ttl.as_secs(),
            "uri": format!("{method} {host}{path}"),
        });

        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header_b64 = engine.encode(header.to_string());
        let claims_b64 = engine.encode(claims.to_string());
        let signing_input = format!("{header_b64}.{claims_b64}");

        let signature = self.signing_key.sign(signing_input.as_bytes());
        let sig_b64 = engine.encode(signature.to_bytes());

        Ok(format!("Bearer {signing_input}.{sig_b64}"))
    }
}

/// Configuration for one network PayMCP is willing to accept x402
/// payments on (trimmed of the Solana-only compute-unit-price fields).
#[derive(Debug, Clone)]
pub struct X402NetworkConfig {
    pub network: String,
    pub asset: String,
    pub pay_to: String,
}

pub struct X402Provider {
    client: Client,
    facilitator_base_url: String,
    max_retries: u32,
    network: X402NetworkConfig,
    auth: Arc<dyn FacilitatorAuth>,
}

impl X402Provider {
    pub fn new(
        facilitator_base_url: impl Into<String>,
        network: X402NetworkConfig,
        auth: Arc<dyn FacilitatorAuth>,
    ) -> PaymcpResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PaymcpError::provider(format!("failed to build x402 HTTP client: {e}")))?;

        Ok(Self { client, facilitator_base_url: facilitator_base_url.into(), max_retries: 3, network, auth })
    }

    fn auth_header(&self, path: &str) -> PaymcpResult<String> {
        let url = url::Url::parse(&self.facilitator_base_url)
            .map_err(|e| PaymcpError::provider(e.to_string()))?;
        self.auth.header_value("POST", url.host_str().unwrap_or_default(), path)
    }

    async fn execute_with_retry<T, R>(&self, path: &str, request: &R) -> PaymcpResult<T>
    where
        T: serde::de::DeserializeOwned,
        R: Serialize,
    {
        let trace_id = Uuid::new_v4();
        let url = format!("{}{}", self.facilitator_base_url, path);
        let auth = self.auth_header(path)?;

        let mut attempt = 0;
        let mut last_error = None;

        while attempt <= self.max_retries {
            if attempt > 0 {
                let base_delay = 100u64 * 2u64.pow(attempt - 1);
                let jitter = rand::random::<u64>() % 100;
                let delay = Duration::from_millis(base_delay + jitter);
                tracing::debug!(trace_id = %trace_id, attempt, delay_ms = delay.as_millis(), "retrying facilitator call");
                tokio::time::sleep(delay).await;
            }

            let mut req = self.client.post(&url).header("X-Trace-ID", trace_id.to_string()).json(request);
            if !auth.is_empty() {
                req = req.header("Authorization", &auth);
            }

            match req.send().await {
                Ok(response) if response.status().is_success() => {
                    return response.json::<T>().await.map_err(|e| {
                        PaymcpError::provider(format!("failed to parse facilitator response: {e}"))
                    });
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    tracing::warn!(trace_id = %trace_id, %status, attempt, "facilitator returned error");
                    last_error = Some(PaymcpError::provider(format!("facilitator error: {status} - {body}")));
                }
                Err(e) => {
                    tracing::warn!(trace_id = %trace_id, error = %e, attempt, "facilitator request failed");
                    last_error = Some(PaymcpError::provider(e.to_string()));
                }
            }
            attempt += 1;
        }

        Err(last_error.unwrap_or_else(|| PaymcpError::provider("facilitator request exhausted retries")))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FacilitatorRequest<'a> {
    payment_payload: &'a serde_json::Value,
    payment_requirements: &'a serde_json::Value,
}

#[async_trait]
impl PaymentProvider for X402Provider {
    fn name(&self) -> &str {
        "x402"
    }

    async fn create_payment(&self, price: &Price, _metadata: serde_json::Value) -> PaymcpResult<PaymentHandle> {
        price.require_positive()?;
        // The payment_required document and its challenge-id binding are
        // assembled by flows::x402, which owns that state; this just
        // mints the id the challenge store will key on.
        let payment_id = Uuid::new_v4().to_string();
        Ok(PaymentHandle { payment_id, payment_url: None })
    }

    /// `getPaymentStatus` is overloaded here to take a base64-encoded
    /// client signature payload and perform the full verify-then-settle
    /// round trip, rather than a simple poll.
    async fn get_payment_status(&self, _payment_id: &str) -> PaymcpResult<serde_json::Value> {
        Err(PaymcpError::unsupported_flow(
            "x402 status must be resolved via verify_and_settle with bound requirements",
        ))
    }

    async fn cancel_payment(&self, _payment_id: &str) -> PaymcpResult<()> {
        Ok(())
    }
}

#[async_trait]
impl X402Capable for X402Provider {
    async fn build_payment_requirements(&self, price: &Price, _resource_url: &str) -> PaymcpResult<serde_json::Value> {
        let amount = minor_units(price.amount, &self.network.asset)?;
        let requirements = PaymentRequirements {
            scheme: "exact".to_string(),
            network: self.network.network.clone(),
            amount,
            asset: self.network.asset.clone(),
            pay_to: self.network.pay_to.clone(),
            max_timeout_seconds: 60,
            extra: None,
        };
        serde_json::to_value(requirements).map_err(|e| PaymcpError::validation(e.to_string()))
    }

    async fn verify_and_settle(&self, payload: &serde_json::Value, requirements: &serde_json::Value) -> PaymcpResult<serde_json::Value> {
        let body = FacilitatorRequest { payment_payload: payload, payment_requirements: requirements };

        let verify: VerifyResponse = self.execute_with_retry("/verify", &body).await?;
        if !verify.is_valid {
            return Err(PaymcpError::provider(
                verify.invalid_reason.unwrap_or_else(|| "payment verification failed".to_string()),
            ));
        }

        let settle: SettlementResponse = self.execute_with_retry("/settle", &body).await?;
        if !settle.success {
            return Err(PaymcpError::provider(
                settle.error_reason.unwrap_or_else(|| "payment settlement failed".to_string()),
            ));
        }

        serde_json::to_value(settle).map_err(|e| PaymcpError::validation(e.to_string()))
    }
}
