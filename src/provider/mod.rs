//! Provider Adapter: the boundary between PayMCP's flows and a concrete
//! payment backend.
//!
//! `PaymentProvider` is the one trait every payment backend implements;
//! flows call only this trait and never know which concrete provider is
//! behind it. Capability-query traits (`SubscriptionCapable`, `X402Capable`)
//! let a provider opt in to extra behavior without the core trait growing
//! provider-specific methods, grounded on the `ToolRegistry`/`McpAuth`
//! composition split in the axum-mcp reference file rather than on an
//! inheritance hierarchy.
//!
//! Two concrete providers ship: `mock::MockProvider` (deterministic,
//! in-memory, for tests and demos) and `x402::X402Provider` (talks to a
//! real x402 facilitator, grounded directly on an `x402::facilitator::
//! FacilitatorClient` shape). Stripe/PayPal/Adyen/Square/
//! Walleot are out of scope — only this trait's shape commits to what a
//! real client for them would need to implement.

pub mod mock;
pub mod x402;

use crate::error::PaymcpResult;
use crate::price::Price;
use async_trait::async_trait;
use serde_json::Value;

/// One payment created with a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentHandle {
    pub payment_id: String,
    pub payment_url: Option<String>,
}

/// The provider-facing contract every flow is written against; flows keep
/// their own `PaymentRecord` as the host-side mirror of what this trait
/// manages.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Unique, human-readable identifier (e.g. `"mock"`, `"x402"`) used in
    /// logs and in `PaymentRecord.provider`.
    fn name(&self) -> &str;

    /// Begins a payment for `price`, returning an id the flow can poll and
    /// a URL the end user can be sent to, if the provider has one.
    async fn create_payment(&self, price: &Price, metadata: Value) -> PaymcpResult<PaymentHandle>;

    /// Raw provider status string for `payment_id` — callers normalize it
    /// with `status::normalize` before branching.
    async fn get_payment_status(&self, payment_id: &str) -> PaymcpResult<Value>;

    /// Best-effort cancellation. Providers that can't cancel (e.g. a
    /// settled on-chain payment) should treat this as a no-op success
    /// rather than erroring, since RESUBMIT calls it defensively.
    async fn cancel_payment(&self, payment_id: &str) -> PaymcpResult<()>;
}

/// Opt-in: a provider that can report whether a caller already holds an
/// active subscription covering a plan, independent of any single
/// payment id.
#[async_trait]
pub trait SubscriptionCapable: PaymentProvider {
    async fn has_active_subscription(&self, subject: &str, plans: &[String]) -> PaymcpResult<bool>;
}

/// Opt-in: a provider that understands the x402 challenge/response
/// handshake rather than being polled for status.
#[async_trait]
pub trait X402Capable: PaymentProvider {
    /// Builds the `accepts` entry (a `PaymentRequirements`, as JSON) the
    /// `PaymentRequired` body offers for a priced tool call. The challenge
    /// store (owned by `flows::x402`, not the provider) binds the result
    /// to a challenge id so a later `verify_and_settle` call can look it
    /// back up — this keeps the provider stateless between requests.
    async fn build_payment_requirements(&self, price: &Price, resource_url: &str) -> PaymcpResult<Value>;

    /// Verifies and settles a submitted `PaymentPayload` against the
    /// `requirements` it was issued against, returning the facilitator's
    /// settlement response on success.
    async fn verify_and_settle(&self, payload: &Value, requirements: &Value) -> PaymcpResult<Value>;
}
