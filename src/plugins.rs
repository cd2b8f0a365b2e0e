// ============================================================================
// Plugin Engine
// ============================================================================
//
// Named-hook fan-out. A plugin declares its metadata (including the hooks
// it handles) and receives a read-only context snapshot at each fired
// hook; it may return a partial context patch which the orchestrator
// merges over the live request context. Handler failures are logged and
// isolated: the remaining handlers still run and the request proceeds.
//
// Plugins are compiled implementations resolved through a name-keyed
// factory; the configuration's load list plays the role of a plugin
// directory. Load, unload and reload operate on that registry at runtime.
//
// ============================================================================

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Hook {
    BeforeRequest,
    AfterRequest,
    BeforeAuth,
    AfterAuth,
    BeforeRouting,
    AfterRouting,
    BeforeCache,
    AfterCache,
    BeforeResponse,
    AfterResponse,
    OnError,
    OnStartup,
    OnShutdown,
}

impl Hook {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::BeforeRequest => "beforeRequest",
            Hook::AfterRequest => "afterRequest",
            Hook::BeforeAuth => "beforeAuth",
            Hook::AfterAuth => "afterAuth",
            Hook::BeforeRouting => "beforeRouting",
            Hook::AfterRouting => "afterRouting",
            Hook::BeforeCache => "beforeCache",
            Hook::AfterCache => "afterCache",
            Hook::BeforeResponse => "beforeResponse",
            Hook::AfterResponse => "afterResponse",
            Hook::OnError => "onError",
            Hook::OnStartup => "onStartup",
            Hook::OnShutdown => "onShutdown",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: String,
    pub hooks: Vec<Hook>,
}

/// Read-only view of the request handed to hook handlers.
#[derive(Clone, Debug, Default)]
pub struct HookContext {
    pub request_id: String,
    pub client_ip: String,
    pub method: String,
    pub path: String,
    pub service: Option<String>,
    pub instance: Option<String>,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub attributes: HashMap<String, serde_json::Value>,
}

/// Partial override returned by a handler, merged over the live context.
#[derive(Clone, Debug, Default)]
pub struct ContextPatch {
    pub request_headers: Vec<(String, String)>,
    pub response_headers: Vec<(String, String)>,
    pub attributes: HashMap<String, serde_json::Value>,
}

impl ContextPatch {
    pub fn is_empty(&self) -> bool {
        self.request_headers.is_empty()
            && self.response_headers.is_empty()
            && self.attributes.is_empty()
    }

    fn merge(&mut self, other: ContextPatch) {
        self.request_headers.extend(other.request_headers);
        self.response_headers.extend(other.response_headers);
        self.attributes.extend(other.attributes);
    }
}

#[async_trait]
pub trait GatewayPlugin: Send + Sync {
    fn metadata(&self) -> PluginMetadata;

    /// Handle one fired hook. Returning a patch mutates the request
    /// context; returning None observes only.
    async fn handle(&self, hook: Hook, ctx: &HookContext)
        -> anyhow::Result<Option<ContextPatch>>;

    /// Called when the plugin is unloaded.
    async fn cleanup(&self) {}
}

type PluginFactory = fn() -> Arc<dyn GatewayPlugin>;

pub struct PluginEngine {
    factories: HashMap<String, PluginFactory>,
    plugins: RwLock<Vec<Arc<dyn GatewayPlugin>>>,
}

impl PluginEngine {
    pub fn new() -> Self {
        let mut engine = Self {
            factories: HashMap::new(),
            plugins: RwLock::new(Vec::new()),
        };
        engine.register_factory("request-logger", || Arc::new(RequestLoggerPlugin));
        engine.register_factory("response-stamp", || Arc::new(ResponseStampPlugin));
        engine
    }

    pub fn register_factory(&mut self, name: &str, factory: PluginFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    /// Instantiate and register a plugin by factory name.
    pub async fn load(&self, name: &str) -> anyhow::Result<()> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown plugin '{}'", name))?;
        let plugin = factory();
        let metadata = plugin.metadata();
        let mut plugins = self.plugins.write().await;
        if plugins.iter().any(|p| p.metadata().name == metadata.name) {
            anyhow::bail!("Plugin '{}' is already loaded", name);
        }
        tracing::info!(
            plugin = %metadata.name,
            version = %metadata.version,
            hooks = metadata.hooks.len(),
            "Plugin loaded"
        );
        plugins.push(plugin);
        Ok(())
    }

    /// Unload a plugin, invoking its cleanup handler.
    pub async fn unload(&self, name: &str) -> anyhow::Result<()> {
        let removed = {
            let mut plugins = self.plugins.write().await;
            let position = plugins
                .iter()
                .position(|p| p.metadata().name == name)
                .ok_or_else(|| anyhow::anyhow!("Plugin '{}' is not loaded", name))?;
            plugins.remove(position)
        };
        removed.cleanup().await;
        tracing::info!(plugin = %name, "Plugin unloaded");
        Ok(())
    }

    pub async fn reload(&self, name: &str) -> anyhow::Result<()> {
        self.unload(name).await?;
        self.load(name).await
    }

    pub async fn list(&self) -> Vec<PluginMetadata> {
        self.plugins
            .read()
            .await
            .iter()
            .map(|p| p.metadata())
            .collect()
    }

    /// Fire a hook: every registered handler that declared it runs in
    /// registration order; failures are isolated; patches merge in order.
    pub async fn fire(&self, hook: Hook, ctx: &HookContext) -> ContextPatch {
        let plugins: Vec<Arc<dyn GatewayPlugin>> = self.plugins.read().await.clone();
        let mut merged = ContextPatch::default();
        for plugin in plugins {
            let metadata = plugin.metadata();
            if !metadata.hooks.contains(&hook) {
                continue;
            }
            match plugin.handle(hook, ctx).await {
                Ok(Some(patch)) => merged.merge(patch),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        plugin = %metadata.name,
                        hook = hook.as_str(),
                        error = %e,
                        "Plugin hook failed; continuing"
                    );
                }
            }
        }
        merged
    }

    pub async fn startup(&self) {
        let _ = self.fire(Hook::OnStartup, &HookContext::default()).await;
    }

    /// Shutdown hooks run in reverse registration order.
    pub async fn shutdown(&self) {
        let plugins: Vec<Arc<dyn GatewayPlugin>> = self.plugins.read().await.clone();
        for plugin in plugins.iter().rev() {
            let metadata = plugin.metadata();
            if metadata.hooks.contains(&Hook::OnShutdown) {
                if let Err(e) = plugin.handle(Hook::OnShutdown, &HookContext::default()).await {
                    tracing::warn!(plugin = %metadata.name, error = %e, "Shutdown hook failed");
                }
            }
        }
    }
}

impl Default for PluginEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Built-in plugins
// ============================================================================

/// Logs each completed request with its routing decision.
struct RequestLoggerPlugin;

#[async_trait]
impl GatewayPlugin for RequestLoggerPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            name: "request-logger".to_string(),
            version: "1.0.0".to_string(),
            description: "Logs each completed request with its routing decision".to_string(),
            author: "portico".to_string(),
            hooks: vec![Hook::AfterResponse, Hook::OnError],
        }
    }

    async fn handle(
        &self,
        hook: Hook,
        ctx: &HookContext,
    ) -> anyhow::Result<Option<ContextPatch>> {
        match hook {
            Hook::AfterResponse => {
                tracing::info!(
                    request_id = %ctx.request_id,
                    method = %ctx.method,
                    path = %ctx.path,
                    service = ctx.service.as_deref().unwrap_or("-"),
                    status = ctx.status.unwrap_or(0),
                    "request completed"
                );
            }
            Hook::OnError => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    path = %ctx.path,
                    error = ctx.error.as_deref().unwrap_or("unknown"),
                    "request errored"
                );
            }
            _ => {}
        }
        Ok(None)
    }
}

/// Stamps responses with the plugin engine's marker header.
struct ResponseStampPlugin;

#[async_trait]
impl GatewayPlugin for ResponseStampPlugin {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata {
            name: "response-stamp".to_string(),
            version: "1.0.0".to_string(),
            description: "Stamps responses with the plugin engine's marker header".to_string(),
            author: "portico".to_string(),
            hooks: vec![Hook::BeforeResponse],
        }
    }

    async fn handle(
        &self,
        _hook: Hook,
        _ctx: &HookContext,
    ) -> anyhow::Result<Option<ContextPatch>> {
        let mut patch = ContextPatch::default();
        patch
            .response_headers
            .push(("x-plugin-stamp".to_string(), "portico".to_string()));
        Ok(Some(patch))
    }
}
