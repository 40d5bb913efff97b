//! Price type: a positive decimal amount plus an ISO-4217 currency code.

use crate::error::PaymcpError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// `{amount: decimal, currency: ISO-4217 code}`. Amount is a human-readable
/// major unit (e.g. `25.50`); providers convert to minor units themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub amount: Decimal,
    pub currency: Currency,
}

/// A validated three-or-four letter ISO-4217 code, stored uppercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency([u8; 4], u8);

impl Currency {
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0[..self.1 as usize]).expect("ascii currency code")
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = PaymcpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        if !(3..=4).contains(&upper.len()) || !upper.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err(PaymcpError::validation(format!(
                "invalid ISO-4217 currency code: {s:?}"
            )));
        }
        let mut buf = [0u8; 4];
        buf[..upper.len()].copy_from_slice(upper.as_bytes());
        Ok(Currency(buf, upper.len() as u8))
    }
}

impl TryFrom<String> for Currency {
    type Error = PaymcpError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.as_str().to_string()
    }
}

impl Price {
    pub fn new(amount: Decimal, currency: &str) -> Result<Self, PaymcpError> {
        let currency: Currency = currency.parse()?;
        Ok(Self { amount, currency })
    }

    /// RESUBMIT and X402 require a strictly positive price: zero amount
    /// or empty currency fails construction.
    pub fn require_positive(&self) -> Result<(), PaymcpError> {
        if self.amount <= Decimal::ZERO {
            return Err(PaymcpError::validation(format!(
                "price amount must be positive, got {}",
                self.amount
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_price() {
        let price = Price::new(Decimal::new(2550, 2), "usd").unwrap();
        assert_eq!(price.currency.as_str(), "USD");
        assert!(price.require_positive().is_ok());
    }

    #[test]
    fn rejects_non_alphabetic_currency() {
        assert!(Price::new(Decimal::ONE, "12").is_err());
    }

    #[test]
    fn rejects_zero_amount() {
        let price = Price::new(Decimal::ZERO, "USD").unwrap();
        assert!(price.require_positive().is_err());
    }

    #[test]
    fn serializes_currency_as_plain_string() {
        let price = Price::new(Decimal::ONE, "EUR").unwrap();
        let json = serde_json::to_value(price).unwrap();
        assert_eq!(json["currency"], "EUR");
    }
}
