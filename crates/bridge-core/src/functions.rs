//! Function registry: named handlers callable from the other side of a bridge.
//!
//! Sandboxes use it for functions the host or peers may invoke via
//! `executeFunction`; the host uses a second instance for the APIs sandboxes
//! invoke via `apiRequest`. A handler may be synchronous or asynchronous.
//! Whatever it does (returns, fails, panics) the caller gets exactly one
//! answer.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use bridge_error::{find_similar_name, BridgeError};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::envelope::{Envelope, FunctionCall};

/// Who is invoking a handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    /// Instance the request came from, if known.
    pub caller_instance_id: Option<String>,
    /// Logical id of that instance, if known.
    pub caller_logical_id: Option<String>,
}

impl CallContext {
    /// Context for a request coming from `instance_id`.
    pub fn from_instance(instance_id: impl Into<String>, logical_id: Option<String>) -> Self {
        Self {
            caller_instance_id: Some(instance_id.into()),
            caller_logical_id: logical_id,
        }
    }
}

type SyncFn = dyn Fn(CallContext, Value) -> anyhow::Result<Value> + Send + Sync;
type AsyncFn = dyn Fn(CallContext, Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// A registered handler.
#[derive(Clone)]
pub enum Handler {
    /// Runs to completion inline.
    Sync(Arc<SyncFn>),
    /// Returns a future that is awaited before replying.
    Async(Arc<AsyncFn>),
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Handler::Sync"),
            Self::Async(_) => f.write_str("Handler::Async"),
        }
    }
}

impl Handler {
    /// Wrap a synchronous closure.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(CallContext, Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    /// Wrap an asynchronous closure.
    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::Async(Arc::new(move |ctx, args| f(ctx, args).boxed()))
    }

    /// Run the handler. Errors and panics become the error message sent back
    /// on the wire.
    pub async fn invoke(&self, ctx: CallContext, args: Value) -> Result<Value, String> {
        let outcome = match self {
            Self::Sync(f) => std::panic::catch_unwind(AssertUnwindSafe(|| f(ctx, args)))
                .map_err(panic_message),
            Self::Async(f) => {
                match std::panic::catch_unwind(AssertUnwindSafe(|| f(ctx, args))) {
                    Ok(fut) => AssertUnwindSafe(fut)
                        .catch_unwind()
                        .await
                        .map_err(panic_message),
                    Err(panic) => Err(panic_message(panic)),
                }
            }
        };
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(message) => Err(message),
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("handler panicked: {detail}")
}

/// What a registry holds; decides the not-found error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    /// Sandbox functions reached through `executeFunction`.
    Function,
    /// Host APIs reached through `apiRequest`.
    Api,
}

/// Name → handler map.
#[derive(Debug, Clone)]
pub struct FunctionRegistry {
    kind: RegistryKind,
    handlers: Arc<Mutex<HashMap<String, Handler>>>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionRegistry {
    /// Registry for sandbox functions.
    pub fn new() -> Self {
        Self::with_kind(RegistryKind::Function)
    }

    /// Registry for host APIs.
    pub fn apis() -> Self {
        Self::with_kind(RegistryKind::Api)
    }

    fn with_kind(kind: RegistryKind) -> Self {
        Self {
            kind,
            handlers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn handlers(&self) -> std::sync::MutexGuard<'_, HashMap<String, Handler>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `handler` under `name`, silently replacing any previous one.
    pub fn register(&self, name: impl Into<String>, handler: Handler) {
        let name = name.into();
        tracing::debug!(function = %name, "registered handler");
        self.handlers().insert(name, handler);
    }

    /// Register a synchronous handler.
    pub fn register_sync<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(CallContext, Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(name, Handler::sync(f));
    }

    /// Register an asynchronous handler.
    pub fn register_async<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(name, Handler::from_async(f));
    }

    /// Remove a handler. Returns whether one was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.handlers().remove(name).is_some()
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers().keys().cloned().collect();
        names.sort();
        names
    }

    fn not_found(&self, name: &str) -> String {
        let error = match self.kind {
            RegistryKind::Function => BridgeError::FunctionNotFound { name: name.into() },
            RegistryKind::Api => BridgeError::ApiNotFound { name: name.into() },
        };
        let names = self.names();
        let known: Vec<&str> = names.iter().map(String::as_str).collect();
        match find_similar_name(name, &known) {
            Some(hint) => format!("{error}. {hint}"),
            None => error.to_string(),
        }
    }

    /// Run the handler registered under `name`.
    ///
    /// The lock is released before the handler runs, so handlers may freely
    /// register or unregister others.
    pub async fn execute(&self, ctx: CallContext, name: &str, args: Value) -> Result<Value, String> {
        let handler = self.handlers().get(name).cloned();
        match handler {
            Some(handler) => handler.invoke(ctx, args).await,
            None => Err(self.not_found(name)),
        }
    }

    /// Answer one `executeFunction`. Always yields exactly one
    /// `functionResponse` carrying the same correlation id.
    pub async fn respond(&self, ctx: CallContext, correlation_id: String, call: FunctionCall) -> Envelope {
        let result = self.execute(ctx, &call.function_name, call.args).await;
        if let Err(message) = &result {
            tracing::debug!(
                function = %call.function_name,
                correlation_id = %correlation_id,
                error = %message,
                "function call failed"
            );
        }
        Envelope::FunctionResponse {
            correlation_id,
            result,
        }
    }
}
