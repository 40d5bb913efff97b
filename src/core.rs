//! Interception Core: `PayMcp::install` is the crate's single entry
//! point. On construction it resolves the effective flow mode, then
//! `register_tool` plays the role a monkey-patched `server.registerTool`
//! would play in a framework without this trait: for each priced or
//! subscription-gated tool it attaches `_meta.price`, optionally adds the
//! `payment_id` schema field, installs the flow's wrapped handler, and —
//! for DYNAMIC_TOOLS — strips `_meta` from the original descriptor.
//!
//! Composition over monkey-patching, grounded on the
//! `ToolRegistry`/`McpServerState` split in the axum-mcp reference file:
//! `PayMcp` never mutates the host's own server object. It wraps a
//! `ServerAdapter` and exposes its own `register_tool`/`handle_initialize`/
//! `list_tools` for the host to call instead — `tools/list` and
//! `initialize` end up patched, reached without rebinding anything on
//! someone else's struct.

use crate::context::RequestContext;
use crate::error::{PaymcpError, PaymcpResult};
use crate::flows::{self, Flow, FlowContext, FlowSettings, Mode, ToolHandler};
use crate::price::Price;
use crate::protocol::{ClientCapabilities, InitializeRequest, InitializeResponse, ToolDefinition, ToolsListResponse};
use crate::provider::{PaymentProvider, SubscriptionCapable, X402Capable};
use crate::server_adapter::{self, ServerAdapter};
use crate::state::{self, StateStore};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const SESSION_INFO_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// One configured payment backend plus whichever capability views it
/// supports. Built explicitly by the host rather than discovered by
/// downcasting a trait object: the capability-query pattern made fully
/// static, a provider opts in by handing over the extra `Arc`, not by
/// `PayMcp` probing for it at runtime.
#[derive(Clone)]
pub struct ProviderHandle {
    pub provider: Arc<dyn PaymentProvider>,
    pub x402: Option<Arc<dyn X402Capable>>,
    pub subscription: Option<Arc<dyn SubscriptionCapable>>,
}

impl ProviderHandle {
    pub fn new(provider: Arc<dyn PaymentProvider>) -> Self {
        Self { provider, x402: None, subscription: None }
    }

    /// Builds a handle for a provider that is both the plain
    /// `PaymentProvider` and the `X402Capable` view of the same instance
    /// (`X402Provider` implements both).
    pub fn x402<P>(provider: Arc<P>) -> Self
    where
        P: PaymentProvider + X402Capable + 'static,
    {
        Self { provider: provider.clone(), x402: Some(provider), subscription: None }
    }

    pub fn subscription<P>(provider: Arc<P>) -> Self
    where
        P: PaymentProvider + SubscriptionCapable + 'static,
    {
        Self { provider: provider.clone(), x402: None, subscription: Some(provider) }
    }
}

/// Per-tool configuration (`ToolConfig`): what `register_tool`
/// needs beyond the handler itself.
#[derive(Default, Clone)]
pub struct ToolConfig {
    pub price: Option<Price>,
    pub subscription_plans: Vec<String>,
    pub provider: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
    pub meta: Option<Value>,
}

/// `install(server, options)`: the crate's inbound API.
pub struct InstallOptions {
    pub providers: HashMap<String, ProviderHandle>,
    pub default_provider: Option<String>,
    pub mode: Mode,
    pub state_store: Option<Arc<dyn StateStore>>,
    pub settings: FlowSettings,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: None,
            mode: Mode::Auto,
            state_store: None,
            settings: FlowSettings::default(),
        }
    }
}

pub struct PayMcp {
    server: Arc<dyn ServerAdapter>,
    store: Arc<dyn StateStore>,
    effective_mode: Mode,
    settings: FlowSettings,
    providers: HashMap<String, ProviderHandle>,
    default_provider: String,
    dynamic_tools: Arc<flows::dynamic_tools::DynamicToolsFlow>,
    sweep_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// The handle `install` returns: `getServer()`, `uninstall()`,
/// `getX402Middleware()`.
pub struct PayMcpHandle {
    inner: Arc<PayMcp>,
}

impl PayMcp {
    /// Validates `options` eagerly: missing store for RESUBMIT/X402 is
    /// handled per-tool since the store always exists here —
    /// `InMemoryStore` is the default — but an unknown provider reference
    /// or a multi-provider install with no default is rejected
    /// immediately, the way an `X402Config::validate` rejects a malformed
    /// config before any request is ever served.
    pub fn install(server: Arc<dyn ServerAdapter>, options: InstallOptions) -> PaymcpResult<PayMcpHandle> {
        if options.providers.is_empty() {
            return Err(PaymcpError::unsupported_flow("install requires at least one payment provider"));
        }

        let default_provider = match options.default_provider {
            Some(name) if options.providers.contains_key(&name) => name,
            Some(name) => {
                return Err(PaymcpError::unsupported_flow(format!(
                    "default_provider {name} is not among the configured providers"
                )))
            }
            None if options.providers.len() == 1 => options.providers.keys().next().cloned().unwrap(),
            None => return Err(PaymcpError::unsupported_flow("default_provider is required when multiple providers are configured")),
        };

        let has_x402 = options.providers.values().any(|p| p.x402.is_some());
        let only_x402 = options.providers.len() == 1 && options.providers.values().next().map(|p| p.x402.is_some()).unwrap_or(false);
        let (effective_mode, downgraded) = flows::resolve_mode(options.mode, has_x402, only_x402);
        if downgraded {
            tracing::warn!(requested = ?options.mode, effective = ?effective_mode, "downgrading configured payment flow mode per x402 compatibility table");
        }

        let store = options.state_store.unwrap_or_else(|| Arc::new(state::memory::InMemoryStore::new()));
        let settings = options.settings;
        let sweep_interval = settings.dynamic_tools_sweep_interval;
        let dynamic_tools = Arc::new(flows::dynamic_tools::DynamicToolsFlow::new());

        let inner = Arc::new(PayMcp {
            server,
            store,
            effective_mode,
            settings,
            providers: options.providers,
            default_provider,
            dynamic_tools: dynamic_tools.clone(),
            sweep_handle: std::sync::Mutex::new(None),
        });

        if effective_mode == Mode::DynamicTools {
            let sweep_target = dynamic_tools;
            let handle = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(sweep_interval).await;
                    sweep_target.sweep(sweep_interval);
                }
            });
            *inner.sweep_handle.lock().unwrap() = Some(handle);
        }

        Ok(PayMcpHandle { inner })
    }

    fn resolve_provider(&self, name: &Option<String>) -> PaymcpResult<&ProviderHandle> {
        let key = name.as_deref().unwrap_or(&self.default_provider);
        self.providers.get(key).ok_or_else(|| PaymcpError::unsupported_flow(format!("unknown provider: {key}")))
    }

    async fn session_capabilities(&self, session_id: &str) -> PaymcpResult<Option<ClientCapabilities>> {
        let key = format!("session-{session_id}");
        match self.store.get(&key).await? {
            Some(value) => Ok(value.get("capabilities").and_then(|c| serde_json::from_value(c.clone()).ok())),
            None => Ok(None),
        }
    }

    /// For each priced/subscription-gated tool, attach `_meta.price`,
    /// optionally add `payment_id` to the schema, install
    /// the flow's wrapped handler, and — for DYNAMIC_TOOLS — strip
    /// `_meta` from the original descriptor.
    fn register_tool(&self, name: String, config: ToolConfig, handler: ToolCallHandler) -> PaymcpResult<()> {
        let mut descriptor = ToolDefinition::new(name.clone(), config.input_schema.clone());
        descriptor.title = config.title.clone();
        descriptor.description = config.description.clone();
        descriptor.meta = config.meta.clone();

        let mut handler = handler;

        if !config.subscription_plans.is_empty() {
            let provider_handle = self.resolve_provider(&config.provider)?;
            let subscription = provider_handle.subscription.clone().ok_or_else(|| {
                PaymcpError::unsupported_flow(format!("provider {} is not subscription-capable", provider_handle.provider.name()))
            })?;
            handler = Arc::new(SubscriptionGate {
                subscription,
                plans: config.subscription_plans.clone(),
                original: handler,
            });
        }

        let Some(price) = config.price.clone() else {
            self.server.register_tool(descriptor, handler);
            return Ok(());
        };

        price
            .require_positive()
            .map_err(|_| PaymcpError::unsupported_flow(format!("tool {name} has a non-positive price")))?;

        let provider_handle = self.resolve_provider(&config.provider)?;
        let flow_ctx = FlowContext {
            provider: provider_handle.provider.clone(),
            store: self.store.clone(),
            price: price.clone(),
            tool_name: name.clone(),
            settings: self.settings.clone(),
        };

        match self.effective_mode {
            Mode::DynamicTools => {
                descriptor.meta = None;
                let wrapped = self.dynamic_tools.wrap_with_server(flow_ctx, handler, self.server.clone());
                self.server.register_tool(descriptor, wrapped);
            }
            Mode::X402 => {
                let x402 = provider_handle.x402.clone().ok_or_else(|| {
                    PaymcpError::unsupported_flow(format!("provider {} is not x402-capable", provider_handle.provider.name()))
                })?;
                descriptor.meta = Some(merge_price_meta(descriptor.meta.take(), &price));
                let wrapped = flows::x402::X402Flow::wrap_with_capable(flow_ctx, x402, handler);
                self.server.register_tool(descriptor, wrapped);
            }
            Mode::TwoStep => {
                descriptor.meta = Some(merge_price_meta(descriptor.meta.take(), &price));
                let first = flows::two_step::TwoStepFlow.wrap(flow_ctx.clone(), handler.clone());
                self.server.register_tool(descriptor, first);

                let confirm_name = flows::confirmation_tool_name(&name, "payment");
                let mut confirm_descriptor = ToolDefinition::new(
                    confirm_name,
                    Some(json!({
                        "type": "object",
                        "properties": { "payment_id": { "type": "string" } },
                        "required": ["payment_id"],
                    })),
                );
                confirm_descriptor.title = Some(format!("Confirm payment for {name}"));
                confirm_descriptor.description = Some(format!("Confirm payment and execute {name}()"));
                let confirm_handler = flows::two_step::TwoStepFlow::confirmation_handler(flow_ctx, handler);
                self.server.register_tool(confirm_descriptor, confirm_handler);
            }
            mode @ (Mode::Resubmit | Mode::Auto) => {
                descriptor.meta = Some(merge_price_meta(descriptor.meta.take(), &price));
                descriptor.input_schema = Some(add_payment_id_param(descriptor.input_schema.take()));
                let wrapped = flows::build_flow(mode).wrap(flow_ctx, handler);
                self.server.register_tool(descriptor, wrapped);
            }
            mode @ (Mode::Elicitation | Mode::Progress) => {
                descriptor.meta = Some(merge_price_meta(descriptor.meta.take(), &price));
                let wrapped = flows::build_flow(mode).wrap(flow_ctx, handler);
                self.server.register_tool(descriptor, wrapped);
            }
        }

        Ok(())
    }

    async fn handle_initialize(&self, session_id: &str, request: InitializeRequest) -> PaymcpResult<InitializeResponse> {
        let response = self.server.handle_initialize(request.clone()).await?;
        let info = json!({
            "name": request.client_info.name,
            "session_id": session_id,
            "capabilities": request.capabilities,
        });
        self.store.set(&format!("session-{session_id}"), info, Some(SESSION_INFO_TTL)).await?;
        Ok(response)
    }

    async fn list_tools(&self, session_id: &str) -> PaymcpResult<ToolsListResponse> {
        let caps = self.session_capabilities(session_id).await?;

        let list = if self.effective_mode == Mode::DynamicTools {
            let dynamic_tools = self.dynamic_tools.clone();
            let session_id = session_id.to_string();
            server_adapter::filtered_tools_list(self.server.as_ref(), move |name| dynamic_tools.visible_to(&session_id, name))
        } else {
            server_adapter::filtered_tools_list(self.server.as_ref(), |_| true)
        };

        let strip_payment_id = caps.map(|c| c.supports_x402() || c.supports_elicitation()).unwrap_or(false);
        if !strip_payment_id {
            return Ok(list);
        }

        let tools = list
            .tools
            .into_iter()
            .map(|mut tool| {
                if let Some(schema) = tool.input_schema.as_mut() {
                    if let Some(properties) = schema.get_mut("properties").and_then(Value::as_object_mut) {
                        properties.remove("payment_id");
                    }
                }
                tool
            })
            .collect();

        Ok(ToolsListResponse { tools, next_cursor: list.next_cursor, meta: list.meta })
    }
}

fn merge_price_meta(existing: Option<Value>, price: &Price) -> Value {
    let mut meta = existing.unwrap_or_else(|| json!({}));
    if let Value::Object(map) = &mut meta {
        map.insert(
            "price".to_string(),
            json!({ "amount": price.amount.to_string(), "currency": String::from(price.currency.clone()) }),
        );
    }
    meta
}

fn add_payment_id_param(schema: Option<Value>) -> Value {
    let mut schema = schema.unwrap_or_else(|| json!({ "type": "object", "properties": {} }));
    if let Value::Object(root) = &mut schema {
        root.entry("type").or_insert_with(|| Value::from("object"));
        let properties = root.entry("properties").or_insert_with(|| json!({}));
        if let Value::Object(props) = properties {
            props.entry("payment_id").or_insert_with(|| {
                json!({ "type": "string", "description": "Payment id returned by a prior call, to resubmit once payment completes." })
            });
        }
    }
    schema
}

type ToolCallHandler = Arc<dyn ToolHandler>;

struct SubscriptionGate {
    subscription: Arc<dyn SubscriptionCapable>,
    plans: Vec<String>,
    original: ToolCallHandler,
}

#[async_trait]
impl ToolHandler for SubscriptionGate {
    async fn call(&self, args: Value, ctx: &RequestContext) -> PaymcpResult<crate::protocol::CallToolResponse> {
        let active = self.subscription.has_active_subscription(&ctx.session_id, &self.plans).await?;
        if active {
            self.original.call(args, ctx).await
        } else {
            Err(PaymcpError::SubscriptionRequired { plans: self.plans.join(", ") })
        }
    }
}

impl PayMcpHandle {
    pub fn get_server(&self) -> Arc<dyn ServerAdapter> {
        self.inner.server.clone()
    }

    /// Open Question (b): the original's retrofit path depends on the
    /// runtime's internal tool map and is best-effort there; this crate's
    /// composition design has no such map to retrofit at all — every tool
    /// passes through `register_tool` once, so there is nothing to patch
    /// retroactively. `uninstall` is correspondingly narrow: it only stops
    /// the DYNAMIC_TOOLS cleanup sweep, since the server itself was never
    /// mutated in place.
    pub fn uninstall(&self) -> PaymcpResult<()> {
        if let Ok(mut guard) = self.inner.sweep_handle.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
        Ok(())
    }

    pub fn get_x402_middleware(&self) -> Option<crate::http_middleware::X402Middleware> {
        let x402 = self.inner.providers.values().find_map(|p| p.x402.clone())?;
        Some(crate::http_middleware::X402Middleware::new(x402, self.inner.store.clone()))
    }

    pub fn register_tool(&self, name: impl Into<String>, config: ToolConfig, handler: ToolCallHandler) -> PaymcpResult<()> {
        self.inner.register_tool(name.into(), config, handler)
    }

    pub async fn handle_initialize(&self, session_id: &str, request: InitializeRequest) -> PaymcpResult<InitializeResponse> {
        self.inner.handle_initialize(session_id, request).await
    }

    pub async fn list_tools(&self, session_id: &str) -> PaymcpResult<ToolsListResponse> {
        self.inner.list_tools(session_id).await
    }
}
