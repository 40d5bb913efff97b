use serde_json::Value;
use thiserror::Error;

/// Error kinds PayMCP raises internally.
///
/// Kept as one flat enum, matching an `McpError`-style shape: a
/// `#[derive(Error)]` variant per concern, each carrying just enough context
/// to build a JSON-RPC error `data` block or a structured tool result
/// without leaking provider internals.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PaymcpError {
    /// A priced tool requires payment before its handler may run.
    #[error("payment required: {message}")]
    PaymentRequired { message: String, payment_id: Option<String>, payment_url: Option<String> },

    /// Payment has been created but the provider has not settled it yet.
    #[error("payment pending: {payment_id}")]
    PaymentPending { payment_id: String },

    /// The payer or the provider terminated the payment before it settled.
    #[error("payment canceled: {payment_id}")]
    PaymentCanceled { payment_id: String },

    /// The provider returned a status PayMCP could not classify as
    /// paid/canceled/pending — defensive fallback, should not normally fire
    /// since `status::normalize` is total.
    #[error("payment status unknown for {payment_id}")]
    PaymentUnknown { payment_id: String },

    /// A resubmission or confirmation call named a `payment_id` no state
    /// entry exists for (never created, expired, or already consumed).
    #[error("unknown or expired payment_id: {payment_id}")]
    PaymentIdNotFound { payment_id: String },

    /// A subscription-gated tool was called without an active subscription.
    #[error("subscription required for plan(s): {plans}")]
    SubscriptionRequired { plans: String },

    #[error("not authorized: {message}")]
    NotAuthorized { message: String },

    /// X402 second hop referenced a `challenge_id` with no bound requirements.
    #[error("unknown x402 challenge: {challenge_id}")]
    UnknownChallenge { challenge_id: String },

    /// X402 second hop's signed payload does not match the bound requirements.
    #[error("incorrect signature")]
    IncorrectSignature,

    /// The outbound call to a payment provider or facilitator failed.
    #[error("provider error: {message}")]
    ProviderError { message: String },

    /// Distributed lock could not be acquired within the retry budget.
    #[error("Failed to acquire lock after {attempts} attempts")]
    LockAcquisitionFailed { attempts: u32 },

    /// Construction-time failure: unknown mode name, missing store, invalid
    /// price, or no provider configured for a priced tool.
    #[error("unsupported flow configuration: {message}")]
    UnsupportedFlow { message: String },

    /// Free-form validation failure (malformed request, bad schema value).
    #[error("validation error: {message}")]
    Validation { message: String },
}

impl PaymcpError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::ProviderError { message: message.into() }
    }

    pub fn unsupported_flow(message: impl Into<String>) -> Self {
        Self::UnsupportedFlow { message: message.into() }
    }

    /// The JSON-RPC error code carried by this error, per the wire
    /// contract (`code ∈ {402, 404}` for payment errors; standard JSON-RPC
    /// codes otherwise).
    pub fn json_rpc_code(&self) -> i32 {
        match self {
            PaymcpError::PaymentRequired { .. }
            | PaymcpError::PaymentPending { .. }
            | PaymcpError::PaymentCanceled { .. }
            | PaymcpError::PaymentUnknown { .. } => 402,
            PaymcpError::PaymentIdNotFound { .. } => 404,
            PaymcpError::SubscriptionRequired { .. } => 402,
            PaymcpError::NotAuthorized { .. } => -32601,
            PaymcpError::UnknownChallenge { .. } | PaymcpError::IncorrectSignature => 402,
            PaymcpError::ProviderError { .. } => -32603,
            PaymcpError::LockAcquisitionFailed { .. } => -32603,
            PaymcpError::UnsupportedFlow { .. } => -32602,
            PaymcpError::Validation { .. } => -32602,
        }
    }

    /// The `error` string slug from the JSON-RPC error contract.
    pub fn error_slug(&self) -> &'static str {
        match self {
            PaymcpError::PaymentRequired { .. } => "payment_required",
            PaymcpError::PaymentPending { .. } => "payment_pending",
            PaymcpError::PaymentCanceled { .. } => "payment_canceled",
            PaymcpError::PaymentUnknown { .. } => "payment_unknown",
            PaymcpError::PaymentIdNotFound { .. } => "payment_id_not_found",
            PaymcpError::SubscriptionRequired { .. } => "subscription_required",
            PaymcpError::NotAuthorized { .. } => "not_authorized",
            PaymcpError::UnknownChallenge { .. } => "unknown_challenge",
            PaymcpError::IncorrectSignature => "incorrect_signature",
            PaymcpError::ProviderError { .. } => "provider_error",
            PaymcpError::LockAcquisitionFailed { .. } => "lock_acquisition_failed",
            PaymcpError::UnsupportedFlow { .. } => "unsupported_flow",
            PaymcpError::Validation { .. } => "validation_error",
        }
    }

    /// Builds the `data` block: `{payment_id, payment_url?,
    /// retry_instructions, annotations:{payment:{status, payment_id}}}`.
    pub fn to_json_rpc_data(&self, payment_id: Option<&str>, payment_url: Option<&str>) -> Value {
        let status = match self {
            PaymcpError::PaymentRequired { .. } => "payment_required",
            PaymcpError::PaymentPending { .. } => "pending",
            PaymcpError::PaymentCanceled { .. } => "canceled",
            _ => "unknown",
        };

        serde_json::json!({
            "payment_id": payment_id,
            "payment_url": payment_url,
            "retry_instructions": "Call this tool again with the same payment_id once payment completes.",
            "annotations": { "payment": { "status": status, "payment_id": payment_id } },
        })
    }
}

pub type PaymcpResult<T> = Result<T, PaymcpError>;
