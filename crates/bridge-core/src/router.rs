//! Host-side message router.
//!
//! Every envelope a sandbox sends arrives here tagged with the sending
//! instance id. The router decodes it and dispatches by kind:
//!
//! - responses settle the host's pending table,
//! - `mcpOutgoingMessage` goes to the transport session bound to the sender,
//! - `apiRequest` runs a host API and answers with `apiResponse`,
//! - `executeFunction` is relayed to the addressed peer instance,
//! - `llmCallRequest` goes to the LLM provider.
//!
//! The router never looks inside tunneled protocol payloads.

use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::directory::{InstanceDirectory, InstanceTable};
use crate::envelope::{Envelope, EnvelopeKind, FunctionCall, PeerTarget};
use crate::functions::{CallContext, FunctionRegistry};
use crate::llm::{ChunkSender, LlmProvider};
use crate::pending::PendingCalls;
use crate::registry::BridgeRegistry;
use crate::transport::TransportBindings;

#[cfg(feature = "metrics")]
use crate::metrics::BridgeMetrics;

/// What the router did with one inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The sender is not a registered instance; dropped.
    UnknownInstance,
    /// Failed to decode; logged and dropped.
    Malformed,
    /// Settled a host-issued call.
    ResponseSettled,
    /// A response nobody is waiting for; dropped.
    StaleResponse,
    /// Handed to the bound transport session.
    ProtocolDelivered,
    /// Protocol traffic for an instance no session is bound to (or whose
    /// session is not connected); dropped.
    ProtocolUnbound,
    /// A host API call was started.
    ApiDispatched,
    /// A peer function call was relayed (or answered with an error).
    FunctionRelayed,
    /// An LLM completion was started (or answered with an error).
    LlmDispatched,
    /// A kind the host never receives; dropped.
    Unexpected(EnvelopeKind),
}

type ProviderSlot = Arc<RwLock<Option<Arc<dyn LlmProvider>>>>;

/// Dispatches inbound envelopes for a host context.
#[derive(Clone)]
pub struct MessageRouter {
    registry: BridgeRegistry,
    instances: InstanceTable,
    bindings: TransportBindings,
    pending: PendingCalls,
    apis: FunctionRegistry,
    llm: ProviderSlot,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<BridgeMetrics>>,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("registry", &self.registry)
            .field("bindings", &self.bindings)
            .field("pending", &self.pending)
            .field("apis", &self.apis.names())
            .finish()
    }
}

impl MessageRouter {
    /// A router over the given host state.
    pub fn new(
        registry: BridgeRegistry,
        instances: InstanceTable,
        bindings: TransportBindings,
        pending: PendingCalls,
        apis: FunctionRegistry,
    ) -> Self {
        Self {
            registry,
            instances,
            bindings,
            pending,
            apis,
            llm: Arc::new(RwLock::new(None)),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Record routing metrics into `metrics`.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<BridgeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Install or remove the LLM provider.
    pub fn set_llm_provider(&self, provider: Option<Arc<dyn LlmProvider>>) {
        *self
            .llm
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = provider;
    }

    fn llm_provider(&self) -> Option<Arc<dyn LlmProvider>> {
        self.llm
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn caller(&self, instance_id: &str) -> CallContext {
        CallContext::from_instance(instance_id, self.instances.logical_id_of(instance_id))
    }

    fn reply(registry: &BridgeRegistry, instance_id: &str, envelope: Envelope) {
        if let Err(e) = registry.send_to(instance_id, &envelope) {
            tracing::warn!(
                instance_id = %instance_id,
                kind = %envelope.kind(),
                correlation_id = envelope.correlation_id().unwrap_or_default(),
                error = %e,
                "reply could not be delivered"
            );
        }
    }

    /// Route one raw inbound value from `instance_id`.
    ///
    /// Work that may suspend (API handlers, relays, completions) runs on
    /// spawned tasks; this returns as soon as the envelope is dispatched.
    /// Must be called within a Tokio runtime.
    pub fn route(&self, instance_id: &str, raw: &Value) -> RouteOutcome {
        let envelope = match Envelope::try_decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(instance_id = %instance_id, code = e.code(), error = %e, "dropping malformed envelope from instance");
                self.record(None);
                return RouteOutcome::Malformed;
            }
        };
        self.record(Some(envelope.kind()));
        self.dispatch(instance_id, envelope)
    }

    #[cfg(feature = "metrics")]
    fn record(&self, kind: Option<EnvelopeKind>) {
        if let Some(metrics) = &self.metrics {
            metrics.record_envelope(kind.map(|k| k.as_str()).unwrap_or("malformed"));
        }
    }

    #[cfg(not(feature = "metrics"))]
    fn record(&self, _kind: Option<EnvelopeKind>) {}

    /// Route an already decoded envelope from `instance_id`.
    pub fn dispatch(&self, instance_id: &str, envelope: Envelope) -> RouteOutcome {
        match envelope {
            Envelope::ApiResponse {
                correlation_id,
                result,
            }
            | Envelope::FunctionResponse {
                correlation_id,
                result,
            }
            | Envelope::LlmCallResponse {
                correlation_id,
                result,
            } => {
                if self.pending.settle_from(&correlation_id, instance_id, result) {
                    RouteOutcome::ResponseSettled
                } else {
                    RouteOutcome::StaleResponse
                }
            }
            Envelope::McpOutgoingMessage { message } => self.deliver_protocol(instance_id, message),
            Envelope::ApiRequest {
                correlation_id,
                api_name,
                args,
            } => {
                self.spawn_api(instance_id, correlation_id, api_name, args);
                RouteOutcome::ApiDispatched
            }
            Envelope::ExecuteFunction {
                correlation_id,
                call,
            } => {
                self.relay_function(instance_id, correlation_id, call);
                RouteOutcome::FunctionRelayed
            }
            Envelope::LlmCallRequest {
                correlation_id,
                request,
            } => {
                self.spawn_llm(instance_id, correlation_id, request);
                RouteOutcome::LlmDispatched
            }
            other @ (Envelope::HostEvent { .. } | Envelope::LlmCallChunk { .. }) => {
                tracing::warn!(
                    instance_id = %instance_id,
                    kind = %other.kind(),
                    "dropping envelope the host does not accept"
                );
                RouteOutcome::Unexpected(other.kind())
            }
        }
    }

    fn deliver_protocol(&self, instance_id: &str, message: Value) -> RouteOutcome {
        match self.bindings.get(instance_id) {
            Some(session) if session.receive_from_bridge(message) => RouteOutcome::ProtocolDelivered,
            Some(_) => RouteOutcome::ProtocolUnbound,
            None => {
                tracing::warn!(
                    instance_id = %instance_id,
                    "protocol message from an instance with no transport session"
                );
                RouteOutcome::ProtocolUnbound
            }
        }
    }

    fn spawn_api(&self, instance_id: &str, correlation_id: String, api_name: String, args: Value) {
        let ctx = self.caller(instance_id);
        let apis = self.apis.clone();
        let registry = self.registry.clone();
        let instance_id = instance_id.to_string();
        tokio::spawn(async move {
            tracing::debug!(instance_id = %instance_id, api = %api_name, correlation_id = %correlation_id, "api request");
            let result = apis.execute(ctx, &api_name, args).await;
            Self::reply(
                &registry,
                &instance_id,
                Envelope::ApiResponse {
                    correlation_id,
                    result,
                },
            );
        });
    }

    fn resolve_peer(&self, target: Option<PeerTarget>) -> Result<String, String> {
        match target {
            None => Err("executeFunction sent to the host must name a targetLogicalId or targetInstanceId".into()),
            Some(PeerTarget::Logical(logical_id)) => self.instances.resolve(&logical_id).ok_or_else(|| {
                bridge_error::BridgeError::NoActiveInstance { logical_id }.to_string()
            }),
            Some(PeerTarget::Instance(instance_id)) => {
                if self.registry.contains(&instance_id) {
                    Ok(instance_id)
                } else {
                    Err(bridge_error::BridgeError::InstanceNotFound { instance_id }.to_string())
                }
            }
        }
    }

    fn relay_function(&self, caller: &str, correlation_id: String, call: FunctionCall) {
        let target = match self.resolve_peer(call.target) {
            Ok(target) => target,
            Err(message) => {
                tracing::debug!(instance_id = %caller, function = %call.function_name, error = %message, "relay target unavailable");
                Self::reply(
                    &self.registry,
                    caller,
                    Envelope::FunctionResponse {
                        correlation_id,
                        result: Err(message),
                    },
                );
                return;
            }
        };

        let registry = self.registry.clone();
        let pending = self.pending.clone();
        let caller = caller.to_string();
        let function_name = call.function_name;
        let args = call.args;
        tokio::spawn(async move {
            tracing::debug!(
                instance_id = %caller,
                target = %target,
                function = %function_name,
                "relaying peer function call"
            );
            let issued = pending.issue(&function_name, None, Some(&target), |host_id| {
                registry.send_to(
                    &target,
                    &Envelope::ExecuteFunction {
                        correlation_id: host_id.to_string(),
                        call: FunctionCall::new(function_name.clone(), args),
                    },
                )
            });
            let result = match issued {
                Ok(reply) => reply.await,
                Err(e) => Err(e),
            };
            Self::reply(
                &registry,
                &caller,
                Envelope::FunctionResponse {
                    correlation_id,
                    result: result.map_err(|e| e.to_string()),
                },
            );
        });
    }

    fn spawn_llm(&self, instance_id: &str, correlation_id: String, request: Value) {
        let Some(provider) = self.llm_provider() else {
            Self::reply(
                &self.registry,
                instance_id,
                Envelope::LlmCallResponse {
                    correlation_id,
                    result: Err("no LLM provider configured".into()),
                },
            );
            return;
        };

        let ctx = self.caller(instance_id);
        let registry = self.registry.clone();
        let instance_id = instance_id.to_string();
        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let completion = provider.complete(ctx, request, ChunkSender::new(tx));
            tokio::pin!(completion);

            let result = loop {
                tokio::select! {
                    Some(chunk) = rx.recv() => Self::reply(
                        &registry,
                        &instance_id,
                        Envelope::LlmCallChunk { correlation_id: correlation_id.clone(), chunk },
                    ),
                    result = &mut completion => break result,
                }
            };
            while let Ok(chunk) = rx.try_recv() {
                Self::reply(
                    &registry,
                    &instance_id,
                    Envelope::LlmCallChunk {
                        correlation_id: correlation_id.clone(),
                        chunk,
                    },
                );
            }
            Self::reply(
                &registry,
                &instance_id,
                Envelope::LlmCallResponse {
                    correlation_id,
                    result: result.map_err(|e| format!("{e:#}")),
                },
            );
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ChannelSink;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        router: MessageRouter,
        registry: BridgeRegistry,
        instances: InstanceTable,
        pending: PendingCalls,
        apis: FunctionRegistry,
    }

    fn fixture() -> Fixture {
        let registry = BridgeRegistry::new();
        let instances = InstanceTable::new();
        let pending = PendingCalls::with_prefix("host:", Duration::from_secs(5));
        let apis = FunctionRegistry::apis();
        let router = MessageRouter::new(
            registry.clone(),
            instances.clone(),
            TransportBindings::new(),
            pending.clone(),
            apis.clone(),
        );
        Fixture {
            router,
            registry,
            instances,
            pending,
            apis,
        }
    }

    impl Fixture {
        fn attach(&self, logical_id: &str, instance_id: &str) -> mpsc::UnboundedReceiver<Value> {
            let (sink, rx) = ChannelSink::pair();
            self.instances.add(logical_id, instance_id);
            self.registry.register(instance_id, sink);
            rx
        }
    }

    #[tokio::test]
    async fn malformed_input_is_dropped() {
        let fx = fixture();
        assert_eq!(fx.router.route("a", &json!({"type": "nope"})), RouteOutcome::Malformed);
        assert_eq!(fx.router.route("a", &json!(42)), RouteOutcome::Malformed);
    }

    #[tokio::test]
    async fn unknown_response_is_stale() {
        let fx = fixture();
        let raw = json!({"type": "functionResponse", "payload": 1, "correlationId": "host:x_9"});
        assert_eq!(fx.router.route("a", &raw), RouteOutcome::StaleResponse);
    }

    #[tokio::test]
    async fn response_settles_host_call() {
        let fx = fixture();
        let reply = fx.pending.issue("ping", None, Some("a"), |_| Ok(())).unwrap();
        let raw = Envelope::FunctionResponse {
            correlation_id: reply.correlation_id().to_string(),
            result: Ok(json!("pong")),
        }
        .to_value();
        assert_eq!(fx.router.route("a", &raw), RouteOutcome::ResponseSettled);
        assert_eq!(reply.await.unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn protocol_without_session_is_unbound() {
        let fx = fixture();
        let raw = Envelope::McpOutgoingMessage { message: json!({"id": 1}) }.to_value();
        assert_eq!(fx.router.route("a", &raw), RouteOutcome::ProtocolUnbound);
    }

    #[tokio::test]
    async fn api_request_is_answered() {
        let fx = fixture();
        let mut rx = fx.attach("notes", "a");
        fx.apis.register_sync("getOwnConfig", |ctx, _| {
            Ok(json!({"logical": ctx.caller_logical_id}))
        });
        let raw = Envelope::ApiRequest {
            correlation_id: "getOwnConfig_1".into(),
            api_name: "getOwnConfig".into(),
            args: json!({}),
        }
        .to_value();
        assert_eq!(fx.router.route("a", &raw), RouteOutcome::ApiDispatched);
        let answer = Envelope::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(
            answer,
            Envelope::ApiResponse {
                correlation_id: "getOwnConfig_1".into(),
                result: Ok(json!({"logical": "notes"})),
            }
        );
    }

    #[tokio::test]
    async fn relay_to_unknown_peer_answers_with_error() {
        let fx = fixture();
        let mut rx = fx.attach("notes", "a");
        let raw = Envelope::ExecuteFunction {
            correlation_id: "sum_1".into(),
            call: FunctionCall {
                function_name: "sum".into(),
                args: json!([1, 2]),
                target: Some(PeerTarget::Logical("calc".into())),
            },
        }
        .to_value();
        assert_eq!(fx.router.route("a", &raw), RouteOutcome::FunctionRelayed);
        match Envelope::decode(&rx.recv().await.unwrap()) {
            Some(Envelope::FunctionResponse { correlation_id, result: Err(message) }) => {
                assert_eq!(correlation_id, "sum_1");
                assert!(message.contains("no active instance for 'calc'"), "got: {message}");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn llm_without_provider_answers_with_error() {
        let fx = fixture();
        let mut rx = fx.attach("notes", "a");
        let raw = Envelope::LlmCallRequest {
            correlation_id: "llm_1".into(),
            request: json!({"prompt": "hi"}),
        }
        .to_value();
        assert_eq!(fx.router.route("a", &raw), RouteOutcome::LlmDispatched);
        match Envelope::decode(&rx.recv().await.unwrap()) {
            Some(Envelope::LlmCallResponse { result: Err(message), .. }) => {
                assert!(message.contains("no LLM provider"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn host_only_kinds_are_unexpected() {
        let fx = fixture();
        let raw = Envelope::HostEvent {
            event_name: "spoof".into(),
            data: Value::Null,
        }
        .to_value();
        assert_eq!(
            fx.router.route("a", &raw),
            RouteOutcome::Unexpected(EnvelopeKind::HostEvent)
        );
    }
}
