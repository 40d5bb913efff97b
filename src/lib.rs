//! PayMCP — a paywall middleware for Model Context Protocol tool servers.
//!
//! Host applications register tools through [`core::PayMcp`] the way they
//! would through any MCP server's own `registerTool`; tools carrying a
//! price (`ToolConfig.price`) are transparently wrapped in one of
//! the payment flows under [`flows`] before the original handler ever runs.

pub mod context;
pub mod core;
pub mod error;
pub mod flows;
pub mod http_middleware;
pub mod logging;
pub mod metrics;
pub mod price;
pub mod protocol;
pub mod provider;
pub mod server_adapter;
pub mod session;
pub mod state;
pub mod status;
pub mod subscription;
pub mod transport;

pub use core::{InstallOptions, PayMcp, PayMcpHandle, ProviderHandle, ToolConfig};
pub use error::{PaymcpError, PaymcpResult};
pub use flows::Mode;
pub use price::Price;
