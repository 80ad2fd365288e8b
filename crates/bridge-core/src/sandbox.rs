//! Sandbox-side runtime.
//!
//! What a miniapp instance sees of the bridge: `call` for host APIs,
//! `call_peer` for functions in other instances, LLM completions, a function
//! registry the host and peers can invoke, a protocol handler for tunneled
//! traffic and host event subscriptions.
//!
//! The runtime owns one outbound [`SendCapability`] towards the host and is
//! fed inbound envelopes through [`SandboxRuntime::handle_inbound`] (or
//! [`SandboxRuntime::run`] over a channel).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bridge_error::BridgeError;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::envelope::{Envelope, FunctionCall, PeerTarget};
use crate::functions::{CallContext, FunctionRegistry, Handler};
use crate::pending::{PendingCalls, PendingReply};
use crate::registry::SendCapability;

/// Receives tunneled protocol messages from the host.
pub type ProtocolHandler = Arc<dyn Fn(Value) + Send + Sync>;
/// Receives one host event's data.
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

struct RuntimeInner {
    outbound: SendCapability,
    pending: PendingCalls,
    functions: FunctionRegistry,
    protocol: Mutex<Option<ProtocolHandler>>,
    events: Mutex<HashMap<String, Vec<EventHandler>>>,
    closed: AtomicBool,
}

/// The bridge as seen from inside one sandbox instance.
#[derive(Clone)]
pub struct SandboxRuntime {
    inner: Arc<RuntimeInner>,
}

/// A [`SandboxRuntime`] handle that does not keep the runtime alive. Meant
/// for handlers the runtime itself stores.
#[derive(Debug, Clone)]
pub struct WeakSandboxRuntime {
    inner: Weak<RuntimeInner>,
}

impl WeakSandboxRuntime {
    /// The runtime, if it still exists.
    pub fn upgrade(&self) -> Option<SandboxRuntime> {
        self.inner.upgrade().map(|inner| SandboxRuntime { inner })
    }
}

impl std::fmt::Debug for SandboxRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRuntime")
            .field("pending", &self.inner.pending)
            .field("functions", &self.inner.functions.names())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SandboxRuntime {
    /// A runtime sending to the host through `outbound`.
    pub fn new(outbound: SendCapability, default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                outbound,
                pending: PendingCalls::new(default_timeout),
                functions: FunctionRegistry::new(),
                protocol: Mutex::new(None),
                events: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The runtime's outbound pending-call table.
    pub fn pending_calls(&self) -> &PendingCalls {
        &self.inner.pending
    }

    /// Functions the host and peers may invoke.
    pub fn functions(&self) -> &FunctionRegistry {
        &self.inner.functions
    }

    /// A weak handle to this runtime.
    pub fn downgrade(&self) -> WeakSandboxRuntime {
        WeakSandboxRuntime {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn send(&self, envelope: &Envelope) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::ChannelClosed("sandbox runtime shut down".into()));
        }
        self.inner.outbound.send(envelope)
    }

    /// Call a host API. `timeout` defaults to the runtime's default deadline.
    pub async fn call(
        &self,
        api_name: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        self.inner
            .pending
            .issue(api_name, timeout, None, |correlation_id| {
                self.send(&Envelope::ApiRequest {
                    correlation_id: correlation_id.to_string(),
                    api_name: api_name.to_string(),
                    args,
                })
            })?
            .await
    }

    /// Call a function registered in another instance, relayed by the host.
    pub async fn call_peer(
        &self,
        target: PeerTarget,
        function_name: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        self.inner
            .pending
            .issue(function_name, timeout, None, |correlation_id| {
                self.send(&Envelope::ExecuteFunction {
                    correlation_id: correlation_id.to_string(),
                    call: FunctionCall {
                        function_name: function_name.to_string(),
                        args,
                        target: Some(target),
                    },
                })
            })?
            .await
    }

    /// Ask the host for an LLM completion and wait for the final result.
    pub async fn call_llm(&self, request: Value, timeout: Option<Duration>) -> Result<Value, BridgeError> {
        let (reply, _chunks) = self.call_llm_streaming(request, timeout)?;
        reply.await
    }

    /// Ask the host for an LLM completion, receiving partial output as it
    /// arrives. The chunk stream ends when the call settles.
    pub fn call_llm_streaming(
        &self,
        request: Value,
        timeout: Option<Duration>,
    ) -> Result<(PendingReply, mpsc::UnboundedReceiver<Value>), BridgeError> {
        self.inner
            .pending
            .issue_streaming("llm", timeout, None, |correlation_id| {
                self.send(&Envelope::LlmCallRequest {
                    correlation_id: correlation_id.to_string(),
                    request,
                })
            })
    }

    /// Register a function, replacing any previous one with that name.
    pub fn register_function(&self, name: impl Into<String>, handler: Handler) {
        self.inner.functions.register(name, handler);
    }

    /// Register a synchronous function.
    pub fn register_sync_function<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(CallContext, Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.inner.functions.register_sync(name, f);
    }

    /// Register an asynchronous function.
    pub fn register_async_function<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.inner.functions.register_async(name, f);
    }

    /// Remove a function. Returns whether it was registered.
    pub fn unregister_function(&self, name: &str) -> bool {
        self.inner.functions.unregister(name)
    }

    /// Install the handler for tunneled protocol messages, replacing any
    /// previous one.
    pub fn register_protocol_handler<F>(&self, f: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        *self
            .inner
            .protocol
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(f));
    }

    /// Remove the protocol handler.
    pub fn clear_protocol_handler(&self) {
        self.inner
            .protocol
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    /// Send one tunneled protocol message to the host.
    pub fn send_protocol(&self, message: Value) -> Result<(), BridgeError> {
        self.send(&Envelope::McpOutgoingMessage { message })
    }

    /// Subscribe to a host event.
    pub fn on_host_event<F>(&self, event_name: impl Into<String>, f: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.inner
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(event_name.into())
            .or_default()
            .push(Arc::new(f));
    }

    /// Process one raw envelope from the host.
    ///
    /// Function calls run on spawned tasks; everything else is handled
    /// inline. Must be called within a Tokio runtime.
    pub fn handle_inbound(&self, raw: &Value) {
        let envelope = match Envelope::try_decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(code = e.code(), error = %e, "dropping malformed envelope from host");
                return;
            }
        };
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
                self.inner.pending.settle(&correlation_id, result);
            }
            Envelope::LlmCallChunk {
                correlation_id,
                chunk,
            } => {
                self.inner.pending.push_chunk(&correlation_id, chunk);
            }
            Envelope::ExecuteFunction {
                correlation_id,
                call,
            } => {
                let runtime = self.clone();
                tokio::spawn(async move {
                    let answer = runtime
                        .inner
                        .functions
                        .respond(CallContext::default(), correlation_id, call)
                        .await;
                    if let Err(e) = runtime.send(&answer) {
                        tracing::warn!(error = %e, "function response could not be sent");
                    }
                });
            }
            Envelope::HostEvent { event_name, data } => {
                let handlers: Vec<EventHandler> = self
                    .inner
                    .events
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .get(&event_name)
                    .cloned()
                    .unwrap_or_default();
                if handlers.is_empty() {
                    tracing::debug!(event = %event_name, "host event with no subscribers");
                }
                for handler in handlers {
                    handler(data.clone());
                }
            }
            Envelope::McpOutgoingMessage { message } => {
                let handler = self
                    .inner
                    .protocol
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .clone();
                match handler {
                    Some(handler) => handler(message),
                    None => tracing::warn!("protocol message with no protocol handler registered"),
                }
            }
            other @ (Envelope::ApiRequest { .. } | Envelope::LlmCallRequest { .. }) => {
                tracing::warn!(kind = %other.kind(), "dropping envelope a sandbox does not accept");
            }
        }
    }

    /// Feed envelopes from `rx` until the host side closes, then shut down.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<Value>) {
        while let Some(raw) = rx.recv().await {
            self.handle_inbound(&raw);
        }
        self.shutdown("host channel closed");
    }

    /// Tear down: reject every outstanding call with `reason` and release the
    /// outbound channel. Idempotent.
    pub fn shutdown(&self, reason: &str) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained = self.inner.pending.drain_all(reason);
        self.clear_protocol_handler();
        self.inner.outbound.close();
        tracing::debug!(drained, reason = %reason, "sandbox runtime shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ChannelSink;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn runtime() -> (SandboxRuntime, mpsc::UnboundedReceiver<Value>) {
        let (sink, rx) = ChannelSink::pair();
        (SandboxRuntime::new(sink, Duration::from_millis(15_000)), rx)
    }

    #[test]
    fn handlers_holding_a_weak_handle_do_not_keep_the_runtime_alive() {
        let (rt, _rx) = runtime();
        let weak = rt.downgrade();
        let handle = rt.downgrade();
        rt.register_sync_function("names", move |_ctx, _args| {
            let rt = handle.upgrade().ok_or_else(|| anyhow::anyhow!("runtime gone"))?;
            Ok(json!(rt.functions().names()))
        });
        assert!(weak.upgrade().is_some());
        drop(rt);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out() {
        let (rt, mut rx) = runtime();
        let err = rt
            .call("getOwnConfig", json!({}), Some(Duration::from_millis(1000)))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout { timeout_ms: 1000, .. }));
        assert!(rt.pending_calls().is_empty());

        let sent = Envelope::decode(&rx.recv().await.unwrap()).unwrap();
        assert!(matches!(sent, Envelope::ApiRequest { ref api_name, .. } if api_name == "getOwnConfig"));
    }

    #[tokio::test]
    async fn call_resolves_with_empty_response() {
        let (rt, mut rx) = runtime();
        let caller = rt.clone();
        let call = tokio::spawn(async move { caller.call("log", json!(["hello"]), None).await });

        let request = rx.recv().await.unwrap();
        let id = request["correlationId"].as_str().unwrap().to_string();
        rt.handle_inbound(&json!({"type": "apiResponse", "correlationId": id}));
        assert_eq!(call.await.unwrap().unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn execute_function_answers_once() {
        let (rt, mut rx) = runtime();
        rt.register_sync_function("ping", |_, _| Ok(json!("pong")));
        rt.handle_inbound(
            &Envelope::ExecuteFunction {
                correlation_id: "host:ping_1".into(),
                call: FunctionCall::new("ping", Value::Null),
            }
            .to_value(),
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            json!({"type": "functionResponse", "payload": "pong", "correlationId": "host:ping_1"})
        );
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn host_events_reach_subscribers() {
        let (rt, _rx) = runtime();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        rt.on_host_event("theme-changed", move |data| {
            assert_eq!(data, json!({"theme": "dark"}));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        rt.handle_inbound(
            &Envelope::HostEvent {
                event_name: "theme-changed".into(),
                data: json!({"theme": "dark"}),
            }
            .to_value(),
        );
        rt.handle_inbound(
            &Envelope::HostEvent {
                event_name: "other".into(),
                data: Value::Null,
            }
            .to_value(),
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn protocol_messages_reach_handler_and_go_out_wrapped() {
        let (rt, mut rx) = runtime();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        rt.register_protocol_handler(move |m| sink.lock().unwrap().push(m));
        rt.handle_inbound(&Envelope::McpOutgoingMessage { message: json!({"id": 1}) }.to_value());
        assert_eq!(*seen.lock().unwrap(), vec![json!({"id": 1})]);

        rt.send_protocol(json!({"id": 1, "result": {}})).unwrap();
        assert_eq!(rx.recv().await.unwrap()["type"], "mcpOutgoingMessage");
    }

    #[tokio::test]
    async fn llm_chunks_arrive_before_result() {
        let (rt, mut rx) = runtime();
        let (reply, mut chunks) = rt.call_llm_streaming(json!({"prompt": "hi"}), None).unwrap();
        let request = rx.recv().await.unwrap();
        assert_eq!(request["type"], "llmCallRequest");
        let id = reply.correlation_id().to_string();

        rt.handle_inbound(&Envelope::LlmCallChunk { correlation_id: id.clone(), chunk: json!("he") }.to_value());
        rt.handle_inbound(&Envelope::LlmCallResponse { correlation_id: id, result: Ok(json!("hello")) }.to_value());

        assert_eq!(chunks.recv().await, Some(json!("he")));
        assert_eq!(chunks.recv().await, None);
        assert_eq!(reply.await.unwrap(), json!("hello"));
    }

    #[tokio::test]
    async fn shutdown_drains_and_refuses_new_calls() {
        let (rt, _rx) = runtime();
        let caller = rt.clone();
        let call = tokio::spawn(async move { caller.call("slow", Value::Null, None).await });
        tokio::task::yield_now().await;
        while rt.pending_calls().is_empty() {
            tokio::task::yield_now().await;
        }

        rt.shutdown("instance unloaded");
        rt.shutdown("again");
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::Drained { ref reason } if reason == "instance unloaded"));
        assert!(rt.is_closed());
        assert!(matches!(
            rt.call("log", Value::Null, None).await,
            Err(BridgeError::ChannelClosed(_))
        ));
    }

    #[tokio::test]
    async fn run_shuts_down_when_host_goes_away() {
        let (rt, _rx) = runtime();
        let (tx, host_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(rt.clone().run(host_rx));
        tx.send(Envelope::HostEvent { event_name: "x".into(), data: Value::Null }.to_value())
            .unwrap();
        drop(tx);
        task.await.unwrap();
        assert!(rt.is_closed());
    }
}
