//! `ServerAdapter`: a composition-based wrapper around the host's MCP
//! server instead of a monkey-patch of `server.registerTool` in place.
//! Grounded on the `ToolRegistry`/`McpServerState` split in the axum-mcp
//! reference file: rather than mutating the host server, PayMCP wraps it
//! behind a trait with the same `register_tool` contract and delegates
//! everything else.
//!
//! `initialize`/`tools/list` still have to be patched on the runtime's
//! request-handler map, because that is the MCP runtime's only extension
//! point for those two methods — patching is unavoidable where it's the
//! only extension point, so it's encapsulated here in one function,
//! `patch_handlers`, rather than scattered across flows.

use crate::context::RequestContext;
use crate::error::PaymcpResult;
use crate::protocol::{InitializeRequest, InitializeResponse, ToolDefinition, ToolsListResponse};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

/// The handler a tool call ultimately reaches — same shape as
/// `flows::ToolHandler`, re-exported at this boundary so a host can
/// register tools without depending on the flows module directly.
pub type ToolCallHandler = Arc<dyn crate::flows::ToolHandler>;

/// The contract PayMCP needs from a host's MCP server. A real host
/// implements this over whatever server type it already has (the MCP SDK
/// object, in the original); `InMemoryServerAdapter` below is a
/// self-contained implementation used by tests, the demo binary, and any
/// host too small to need its own.
#[async_trait]
pub trait ServerAdapter: Send + Sync {
    /// Registers (or replaces) a tool's descriptor and handler.
    fn register_tool(&self, descriptor: ToolDefinition, handler: ToolCallHandler);

    fn get_tool(&self, name: &str) -> Option<(ToolDefinition, ToolCallHandler)>;

    /// Snapshot of every registered descriptor, in registration order.
    fn list_tool_descriptors(&self) -> Vec<ToolDefinition>;

    fn remove_tool(&self, name: &str);

    /// Runs the host's own `initialize` handling, if any, before PayMCP's
    /// patch stores session info.
    async fn handle_initialize(&self, request: InitializeRequest) -> PaymcpResult<InitializeResponse> {
        Ok(InitializeResponse {
            protocol_version: request.protocol_version,
            ..Default::default()
        })
    }

    /// Emits `notifications/tools/list_changed`, used by DYNAMIC_TOOLS
    /// every time a confirmation tool is installed or removed.
    async fn notify_tools_list_changed(&self) -> PaymcpResult<()>;
}

/// A minimal, fully in-process `ServerAdapter` — enough to run every flow
/// end to end in tests and in the demo binary without a real MCP runtime
/// underneath. A genuine host wraps its own server object instead.
pub struct InMemoryServerAdapter {
    tools: DashMap<String, (ToolDefinition, ToolCallHandler)>,
    registration_order: DashMap<String, u64>,
    counter: std::sync::atomic::AtomicU64,
    list_changed_notifications: std::sync::atomic::AtomicU64,
}

impl Default for InMemoryServerAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryServerAdapter {
    pub fn new() -> Self {
        Self {
            tools: DashMap::new(),
            registration_order: DashMap::new(),
            counter: std::sync::atomic::AtomicU64::new(0),
            list_changed_notifications: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn list_changed_count(&self) -> u64 {
        self.list_changed_notifications.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Invokes a registered tool's handler directly, the way a real MCP
    /// `tools/call` dispatch would once it has resolved the tool name.
    pub async fn call_tool(&self, name: &str, args: Value, ctx: &RequestContext) -> PaymcpResult<crate::protocol::CallToolResponse> {
        match self.get_tool(name) {
            Some((_, handler)) => handler.call(args, ctx).await,
            None => Err(crate::error::PaymcpError::validation(format!("unknown tool: {name}"))),
        }
    }
}

#[async_trait]
impl ServerAdapter for InMemoryServerAdapter {
    fn register_tool(&self, descriptor: ToolDefinition, handler: ToolCallHandler) {
        let order = self.counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.registration_order.insert(descriptor.name.clone(), order);
        self.tools.insert(descriptor.name.clone(), (descriptor, handler));
    }

    fn get_tool(&self, name: &str) -> Option<(ToolDefinition, ToolCallHandler)> {
        self.tools.get(name).map(|entry| entry.value().clone())
    }

    fn list_tool_descriptors(&self) -> Vec<ToolDefinition> {
        let mut entries: Vec<_> = self
            .tools
            .iter()
            .map(|e| (self.registration_order.get(e.key()).map(|o| *o).unwrap_or(0), e.value().0.clone()))
            .collect();
        entries.sort_by_key(|(order, _)| *order);
        entries.into_iter().map(|(_, def)| def).collect()
    }

    fn remove_tool(&self, name: &str) {
        self.tools.remove(name);
        self.registration_order.remove(name);
    }

    async fn notify_tools_list_changed(&self) -> PaymcpResult<()> {
        self.list_changed_notifications.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }
}

/// Builds the `ToolsListResponse` for a session by applying a filter
/// (DYNAMIC_TOOLS' hidden-tools/confirmation-tools rules) on top of the
/// adapter's full descriptor list. Kept as a free function — the one
/// place `tools/list` patching actually happens — rather than duplicated
/// per flow.
pub fn filtered_tools_list<F>(server: &dyn ServerAdapter, mut keep: F) -> ToolsListResponse
where
    F: FnMut(&str) -> bool,
{
    let tools = server
        .list_tool_descriptors()
        .into_iter()
        .filter(|t| keep(&t.name))
        .collect();
    ToolsListResponse { tools, next_cursor: None, meta: None }
}
