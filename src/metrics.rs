//! Payment metrics.
//!
//! Grounded on a `logging::Metrics`-style shape: the same shape (`AtomicU64`
//! counters plus a `DashMap` for per-key breakdowns, a `to_json` snapshot)
//! repointed at payment events instead of RPC call outcomes. One instance
//! is expected per [`crate::core::PayMcp`] installation; flows call the
//! `record_*` methods at the points a payment's lifecycle changes (created,
//! confirmed paid, canceled, lock contention).

use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PaymentMetrics {
    pub payments_created: AtomicU64,
    pub payments_confirmed: AtomicU64,
    pub payments_canceled: AtomicU64,
    pub payments_pending_timeout: AtomicU64,
    pub lock_acquisition_failures: AtomicU64,
    by_flow_created: DashMap<String, u64>,
    by_flow_confirmed: DashMap<String, u64>,
}

impl PaymentMetrics {
    pub fn record_created(&self, flow: &str) {
        self.payments_created.fetch_add(1, Ordering::Relaxed);
        *self.by_flow_created.entry(flow.to_string()).or_insert(0) += 1;
    }

    pub fn record_confirmed(&self, flow: &str) {
        self.payments_confirmed.fetch_add(1, Ordering::Relaxed);
        *self.by_flow_confirmed.entry(flow.to_string()).or_insert(0) += 1;
    }

    pub fn record_canceled(&self) {
        self.payments_canceled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pending_timeout(&self) {
        self.payments_pending_timeout.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_failure(&self) {
        self.lock_acquisition_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// JSON snapshot of every counter, in a shape a host wiring PayMCP
    /// into an HTTP server can serve at a `/metrics` endpoint verbatim.
    pub fn to_json(&self) -> Value {
        let by_flow_created: std::collections::HashMap<String, u64> =
            self.by_flow_created.iter().map(|e| (e.key().clone(), *e.value())).collect();
        let by_flow_confirmed: std::collections::HashMap<String, u64> =
            self.by_flow_confirmed.iter().map(|e| (e.key().clone(), *e.value())).collect();

        serde_json::json!({
            "payments_created": self.payments_created.load(Ordering::Relaxed),
            "payments_confirmed": self.payments_confirmed.load(Ordering::Relaxed),
            "payments_canceled": self.payments_canceled.load(Ordering::Relaxed),
            "payments_pending_timeout": self.payments_pending_timeout.load(Ordering::Relaxed),
            "lock_acquisition_failures": self.lock_acquisition_failures.load(Ordering::Relaxed),
            "by_flow": { "created": by_flow_created, "confirmed": by_flow_confirmed },
        })
    }
}
