//! Status Normalizer.
//!
//! Maps whatever a provider's `get_payment_status` returns — a free-form
//! string in the common case — to the three canonical states every flow
//! actually branches on.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Paid,
    Canceled,
    Pending,
}

const PAID: &[&str] = &[
    "paid", "succeeded", "success", "complete", "completed", "ok", "no_payment_required",
    "captured", "confirmed", "approved",
];

const CANCELED: &[&str] = &[
    "canceled", "cancelled", "void", "voided", "failed", "declined", "error", "expired",
    "refused", "rejected",
];

/// Normalizes any raw provider status into `{paid, canceled, pending}`.
///
/// Total: every input — including `null`, numbers, booleans, and the empty
/// string — maps to exactly one of the three variants, defaulting to
/// `Pending` for anything not recognized as paid or canceled.
pub fn normalize(raw: &Value) -> PaymentStatus {
    let Some(s) = raw.as_str() else {
        return PaymentStatus::Pending;
    };
    normalize_str(s)
}

pub fn normalize_str(raw: &str) -> PaymentStatus {
    let lower = raw.to_ascii_lowercase();
    if PAID.contains(&lower.as_str()) {
        PaymentStatus::Paid
    } else if CANCELED.contains(&lower.as_str()) {
        PaymentStatus::Canceled
    } else {
        PaymentStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_all_paid_aliases_case_insensitively() {
        for alias in PAID {
            assert_eq!(normalize_str(&alias.to_ascii_uppercase()), PaymentStatus::Paid);
        }
    }

    #[test]
    fn recognizes_all_canceled_aliases() {
        for alias in CANCELED {
            assert_eq!(normalize_str(alias), PaymentStatus::Canceled);
        }
    }

    #[test]
    fn unrecognized_values_default_to_pending() {
        assert_eq!(normalize(&Value::Null), PaymentStatus::Pending);
        assert_eq!(normalize(&Value::Bool(true)), PaymentStatus::Pending);
        assert_eq!(normalize(&Value::from(42)), PaymentStatus::Pending);
        assert_eq!(normalize_str(""), PaymentStatus::Pending);
        assert_eq!(normalize_str("processing"), PaymentStatus::Pending);
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in PAID.iter().chain(CANCELED.iter()).chain(["gibberish"].iter()) {
            let once = normalize_str(raw);
            let twice = normalize_str(&serde_json::to_value(once).unwrap().as_str().unwrap().to_string());
            assert_eq!(once, twice);
        }
    }
}
