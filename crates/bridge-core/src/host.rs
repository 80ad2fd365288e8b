//! Host context: the one object that owns all host-side bridge state.
//!
//! [`HostBridge`] bundles the bridge registry, the instance directory, the
//! transport binding table, the host's pending-call table, the host API
//! table and the message router. Everything host-side is reached through
//! it, so tearing down a host is dropping (or [`shutdown`]ing) one value.
//!
//! [`shutdown`]: HostBridge::shutdown

use std::sync::Arc;
use std::time::Duration;

use bridge_config::BridgeSettings;
use bridge_error::BridgeError;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::directory::{InstanceDirectory, InstanceTable};
use crate::envelope::{Envelope, FunctionCall};
use crate::functions::{CallContext, FunctionRegistry, Handler};
use crate::llm::LlmProvider;
use crate::pending::PendingCalls;
use crate::registry::{BridgeRegistry, BroadcastReport, ChannelSink, SendCapability};
use crate::router::{MessageRouter, RouteOutcome};
use crate::sandbox::SandboxRuntime;
use crate::transport::{TransportBindings, TransportSession};

#[cfg(feature = "metrics")]
use crate::metrics::BridgeMetrics;

/// Prefix on every correlation id the host issues, so host-issued ids never
/// collide with ids a sandbox generates.
pub const HOST_CORRELATION_PREFIX: &str = "host:";

/// An instance running in this process, connected by channels.
#[derive(Debug, Clone)]
pub struct InProcessInstance {
    /// The instance id the host assigned.
    pub instance_id: String,
    /// The sandbox side of the bridge.
    pub runtime: SandboxRuntime,
}

/// Host-side bridge state for one process.
#[derive(Clone)]
pub struct HostBridge {
    settings: BridgeSettings,
    registry: BridgeRegistry,
    instances: InstanceTable,
    bindings: TransportBindings,
    pending: PendingCalls,
    apis: FunctionRegistry,
    router: MessageRouter,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<BridgeMetrics>>,
}

impl std::fmt::Debug for HostBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBridge")
            .field("settings", &self.settings)
            .field("registry", &self.registry)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl Default for HostBridge {
    fn default() -> Self {
        Self::new(BridgeSettings::default())
    }
}

impl HostBridge {
    /// A host with no instances.
    pub fn new(settings: BridgeSettings) -> Self {
        let registry = BridgeRegistry::new();
        let instances = InstanceTable::new();
        let bindings = TransportBindings::new();
        let pending = PendingCalls::with_prefix(HOST_CORRELATION_PREFIX, settings.default_timeout);
        let apis = FunctionRegistry::apis();
        let router = MessageRouter::new(
            registry.clone(),
            instances.clone(),
            bindings.clone(),
            pending.clone(),
            apis.clone(),
        );
        Self {
            settings,
            registry,
            instances,
            bindings,
            pending,
            apis,
            router,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Record metrics into `metrics`.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<BridgeMetrics>) -> Self {
        self.router = self.router.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    /// Runtime settings in effect.
    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Whether `instance_id` has a live route.
    pub fn is_attached(&self, instance_id: &str) -> bool {
        self.registry.contains(instance_id)
    }

    /// Number of instances with a live route.
    pub fn attached_count(&self) -> usize {
        self.registry.len()
    }

    /// The instance directory.
    pub fn instances(&self) -> &InstanceTable {
        &self.instances
    }

    /// The transport binding table.
    pub fn bindings(&self) -> &TransportBindings {
        &self.bindings
    }

    /// The host's outbound pending-call table.
    pub fn pending_calls(&self) -> &PendingCalls {
        &self.pending
    }

    /// The message router.
    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    #[cfg(feature = "metrics")]
    fn update_instance_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.instances_registered.set(self.registry.len() as i64);
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn update_instance_gauge(&self) {}

    /// Attach a new instance of `logical_id` reachable through `sink`.
    /// Returns the generated instance id.
    pub fn attach_instance(&self, logical_id: &str, sink: SendCapability) -> String {
        let instance_id = uuid::Uuid::new_v4().to_string();
        self.attach_instance_with_id(logical_id, &instance_id, sink);
        instance_id
    }

    /// Attach an instance under a caller-chosen id. A second attach for the
    /// same id replaces the route; returns `true` in that case.
    pub fn attach_instance_with_id(&self, logical_id: &str, instance_id: &str, sink: SendCapability) -> bool {
        let replaced = self.registry.register(instance_id, sink);
        self.instances.add(logical_id, instance_id);
        self.update_instance_gauge();
        tracing::info!(instance_id = %instance_id, logical_id = %logical_id, "instance attached");
        replaced
    }

    /// Tear down an instance: unregister its route, forget it in the
    /// directory, reject host calls waiting on it and notify the transport
    /// session bound to it. Returns whether the instance was attached.
    pub fn detach_instance(&self, instance_id: &str) -> bool {
        let sink = self.registry.unregister(instance_id);
        let known = self.instances.remove(instance_id).is_some();
        let reason = format!("instance {instance_id} detached");
        let drained = self.pending.drain_target(instance_id, &reason);
        if let Some(session) = self.bindings.take(instance_id) {
            session.notify_peer_disconnected();
        }
        self.update_instance_gauge();

        let attached = sink.is_some() || known;
        if let Some(sink) = sink {
            sink.close();
        }
        if attached {
            tracing::info!(instance_id = %instance_id, drained, "instance detached");
        }
        attached
    }

    /// Route one raw envelope received from `instance_id`.
    pub fn handle_inbound(&self, instance_id: &str, raw: &Value) -> RouteOutcome {
        if !self.registry.contains(instance_id) {
            tracing::warn!(instance_id = %instance_id, "dropping envelope from unregistered instance");
            return RouteOutcome::UnknownInstance;
        }
        self.router.route(instance_id, raw)
    }

    /// Invoke a function registered inside `instance_id`.
    pub async fn call_function(
        &self,
        instance_id: &str,
        function_name: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        #[cfg(feature = "metrics")]
        let started = std::time::Instant::now();

        let sink = self.registry.get(instance_id).ok_or_else(|| BridgeError::InstanceNotFound {
            instance_id: instance_id.to_string(),
        })?;
        let result = match self
            .pending
            .issue(function_name, timeout, Some(instance_id), |correlation_id| {
                sink.send(&Envelope::ExecuteFunction {
                    correlation_id: correlation_id.to_string(),
                    call: FunctionCall::new(function_name, args),
                })
            }) {
            Ok(reply) => reply.await,
            Err(e) => Err(e),
        };

        #[cfg(feature = "metrics")]
        {
            if let Some(metrics) = &self.metrics {
                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(e) => e.code(),
                };
                metrics.record_call(outcome, started.elapsed().as_secs_f64());
            }
        }

        result
    }

    /// Invoke a function in the most recent instance of `logical_id`.
    pub async fn call_logical(
        &self,
        logical_id: &str,
        function_name: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        let instance_id = self
            .instances
            .resolve(logical_id)
            .ok_or_else(|| BridgeError::NoActiveInstance {
                logical_id: logical_id.to_string(),
            })?;
        self.call_function(&instance_id, function_name, args, timeout).await
    }

    /// Send a `hostEvent` to every attached instance.
    pub fn broadcast(&self, event_name: &str, data: Value) -> BroadcastReport {
        self.registry.broadcast(event_name, data)
    }

    /// Expose a host API to sandboxes.
    pub fn register_api(&self, name: impl Into<String>, handler: Handler) {
        self.apis.register(name, handler);
    }

    /// Expose a synchronous host API.
    pub fn register_sync_api<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(CallContext, Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.apis.register_sync(name, f);
    }

    /// Expose an asynchronous host API.
    pub fn register_async_api<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.apis.register_async(name, f);
    }

    /// Withdraw a host API.
    pub fn unregister_api(&self, name: &str) -> bool {
        self.apis.unregister(name)
    }

    /// Install the provider answering `llmCallRequest`.
    pub fn set_llm_provider(&self, provider: Arc<dyn LlmProvider>) {
        self.router.set_llm_provider(Some(provider));
    }

    /// Remove the LLM provider; further requests are answered with an error.
    pub fn clear_llm_provider(&self) {
        self.router.set_llm_provider(None);
    }

    /// A new, idle transport session for `logical_id`.
    pub fn transport(&self, logical_id: &str) -> TransportSession {
        TransportSession::new(
            logical_id,
            self.registry.clone(),
            Arc::new(self.instances.clone()),
            self.bindings.clone(),
            self.settings.start_retry_delay,
        )
    }

    /// Start an instance of `logical_id` inside this process.
    ///
    /// Both directions are unbounded channels pumped by spawned tasks. When
    /// the sandbox runtime shuts down the instance is detached; detaching the
    /// instance shuts the runtime down. Must be called within a Tokio runtime.
    pub fn connect_in_process(&self, logical_id: &str) -> InProcessInstance {
        let instance_id = uuid::Uuid::new_v4().to_string();
        let (to_sandbox, sandbox_rx) = mpsc::unbounded_channel();
        let (to_host, mut host_rx) = mpsc::unbounded_channel::<Value>();

        let runtime = SandboxRuntime::new(Arc::new(ChannelSink::new(to_host)), self.settings.default_timeout);
        self.attach_instance_with_id(logical_id, &instance_id, Arc::new(ChannelSink::new(to_sandbox)));

        tokio::spawn(runtime.clone().run(sandbox_rx));

        let host = self.clone();
        let id = instance_id.clone();
        tokio::spawn(async move {
            while let Some(raw) = host_rx.recv().await {
                host.handle_inbound(&id, &raw);
            }
            host.detach_instance(&id);
        });

        InProcessInstance {
            instance_id,
            runtime,
        }
    }

    /// Ids of every attached instance.
    pub fn instance_ids(&self) -> Vec<String> {
        self.registry.instance_ids()
    }

    /// Detach every instance and reject every outstanding host call.
    pub fn shutdown(&self, reason: &str) {
        for instance_id in self.registry.instance_ids() {
            self.detach_instance(&instance_id);
        }
        let drained = self.pending.drain_all(reason);
        tracing::info!(drained, reason = %reason, "host bridge shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn attach_and_detach_keep_tables_in_step() {
        let host = HostBridge::default();
        let (sink, _rx) = ChannelSink::pair();
        let id = host.attach_instance("notes", sink);
        assert!(host.is_attached(&id));
        assert_eq!(host.attached_count(), 1);
        assert_eq!(host.instances().resolve("notes").as_deref(), Some(id.as_str()));

        assert!(host.detach_instance(&id));
        assert!(!host.is_attached(&id));
        assert_eq!(host.attached_count(), 0);
        assert!(host.instances().resolve("notes").is_none());
        assert!(!host.detach_instance(&id));
    }

    #[tokio::test]
    async fn inbound_from_unknown_instance_is_dropped() {
        let host = HostBridge::default();
        let outcome = host.handle_inbound("ghost", &json!({"type": "apiRequest"}));
        assert_eq!(outcome, RouteOutcome::UnknownInstance);
    }

    #[tokio::test]
    async fn call_function_on_unknown_instance_fails_fast() {
        let host = HostBridge::default();
        let err = host.call_function("ghost", "ping", Value::Null, None).await.unwrap_err();
        assert!(matches!(err, BridgeError::InstanceNotFound { .. }));
        assert!(host.pending_calls().is_empty());
    }

    #[tokio::test]
    async fn detach_drains_calls_to_that_instance() {
        let host = HostBridge::default();
        let (sink, mut rx) = ChannelSink::pair();
        let id = host.attach_instance("notes", sink);

        let caller = host.clone();
        let target = id.clone();
        let call = tokio::spawn(async move { caller.call_function(&target, "slow", Value::Null, None).await });
        assert_eq!(rx.recv().await.unwrap()["type"], "executeFunction");

        host.detach_instance(&id);
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Drained { .. }), "got: {err:?}");
        assert!(host.pending_calls().is_empty());
    }

    #[tokio::test]
    async fn host_correlation_ids_are_prefixed() {
        let host = HostBridge::default();
        let (sink, mut rx) = ChannelSink::pair();
        let id = host.attach_instance("notes", sink);
        let caller = host.clone();
        let _call = tokio::spawn(async move { caller.call_function(&id, "ping", Value::Null, None).await });
        let raw = rx.recv().await.unwrap();
        assert!(raw["correlationId"].as_str().unwrap().starts_with(HOST_CORRELATION_PREFIX));
    }
}
