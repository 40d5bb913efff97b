//! Structured logging setup.
//!
//! Same `tracing` + `tracing-subscriber` JSON layer, same `EnvFilter`
//! precedence (explicit
//! `RUST_LOG` wins over the `level` argument). Everything downstream —
//! `flows::*`, `provider::x402`, `state::redis` — logs through `tracing`'s
//! macros directly; this module only owns the one-time subscriber install.

use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initializes the global `tracing` subscriber. `level` is the default
/// filter used when `RUST_LOG` is unset; pass `None` for `"info"`.
pub fn init_logging(level: Option<&str>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level.unwrap_or("info")))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_current_span(false)
                .with_thread_ids(true)
                .with_target(true)
                .with_line_number(true)
                .with_file(true),
        )
        .try_init()?;

    tracing::info!("paymcp structured logging initialized");
    Ok(())
}
