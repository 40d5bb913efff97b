//! Deterministic in-memory provider for tests and demos.
//!
//! Payment ids are interpreted rather than stored, mirroring the naming
//! scheme the tests rely on:
//!   - `mock_paid_<id>`      -> always reports `"paid"`
//!   - `mock_failed_<id>`    -> always reports `"canceled"`
//!   - `mock_pending_<id>`   -> always reports `"pending"`
//!   - `mock_<status>_<id>_<delayMs>` -> reports `"pending"` until `delayMs`
//!     have elapsed since creation, then `<status>`
//! Any other id defaults to `"pending"` until explicitly marked otherwise
//! via `mark_paid`/`mark_canceled`, which is how tests drive RESUBMIT/
//! DYNAMIC_TOOLS scenarios that need a status transition mid-flow.

use super::{PaymentHandle, PaymentProvider};
use crate::error::PaymcpResult;
use crate::price::Price;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use uuid::Uuid;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Forced {
    Paid,
    Canceled,
}

struct Created {
    since: Instant,
}

pub struct MockProvider {
    counter: AtomicU64,
    created: DashMap<String, Created>,
    forced: DashMap<String, Forced>,
    canceled: DashMap<String, ()>,
    last_created: std::sync::Mutex<Option<String>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            created: DashMap::new(),
            forced: DashMap::new(),
            canceled: DashMap::new(),
            last_created: std::sync::Mutex::new(None),
        }
    }

    /// Test helper: the `payment_id` handed back by the most recent
    /// `create_payment` call, for tests that need to act on a payment id
    /// a handler created internally without it being returned directly.
    pub fn last_created_payment_id(&self) -> Option<String> {
        self.last_created.lock().unwrap().clone()
    }

    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("mock-{}-{}", n, Uuid::new_v4().simple())
    }

    /// Test helper: force `payment_id` to report paid regardless of its
    /// name-encoded status, simulating an out-of-band webhook.
    pub fn mark_paid(&self, payment_id: &str) {
        self.forced.insert(payment_id.to_string(), Forced::Paid);
    }

    pub fn mark_canceled(&self, payment_id: &str) {
        self.forced.insert(payment_id.to_string(), Forced::Canceled);
    }

    fn status_for(&self, payment_id: &str) -> &'static str {
        if let Some(forced) = self.forced.get(payment_id) {
            return match *forced {
                Forced::Paid => "paid",
                Forced::Canceled => "canceled",
            };
        }
        if self.canceled.contains_key(payment_id) {
            return "canceled";
        }

        let Some(rest) = payment_id.strip_prefix("mock_") else {
            return "pending";
        };
        let parts: Vec<&str> = rest.splitn(3, '_').collect();
        match parts.as_slice() {
            ["paid", ..] => "paid",
            ["failed", ..] => "canceled",
            ["pending", ..] => "pending",
            [status, _id, delay_ms] => {
                let delay_ms: u64 = delay_ms.parse().unwrap_or(0);
                let elapsed = self
                    .created
                    .get(payment_id)
                    .map(|c| c.since.elapsed().as_millis() as u64)
                    .unwrap_or(u64::MAX);
                if elapsed >= delay_ms {
                    match *status {
                        "paid" => "paid",
                        "canceled" | "failed" => "canceled",
                        _ => "pending",
                    }
                } else {
                    "pending"
                }
            }
            _ => "pending",
        }
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_payment(&self, price: &Price, _metadata: Value) -> PaymcpResult<PaymentHandle> {
        price.require_positive()?;
        let payment_id = self.next_id();
        self.created.insert(payment_id.clone(), Created { since: Instant::now() });
        *self.last_created.lock().unwrap() = Some(payment_id.clone());
        Ok(PaymentHandle {
            payment_url: Some(format!("https://mock.paymcp.local/pay/{payment_id}")),
            payment_id,
        })
    }

    async fn get_payment_status(&self, payment_id: &str) -> PaymcpResult<Value> {
        if !self.created.contains_key(payment_id) {
            self.created.insert(payment_id.to_string(), Created { since: Instant::now() });
        }
        Ok(Value::from(self.status_for(payment_id)))
    }

    async fn cancel_payment(&self, payment_id: &str) -> PaymcpResult<()> {
        self.canceled.insert(payment_id.to_string(), ());
        Ok(())
    }
}
