//! Transport adapter: one tunneled-protocol session bound to one sandbox
//! instance.
//!
//! A [`TransportSession`] is created for a logical id and presents the
//! ordinary start / send / close / on-message lifecycle. Outbound messages
//! are wrapped as `mcpOutgoingMessage` envelopes and handed to the bound
//! instance's send capability; inbound ones arrive through the router via
//! the [`TransportBindings`] table.
//!
//! ```text
//! Idle ──start()──▶ Starting ──▶ Connected ──peer gone / replaced──▶ Errored
//!   │                  │  ▲          │                        │
//!   │          (failed start, retry) │                                   │
//!   └──────────────────┴─────────────┴──────close()──────────────────────┴──▶ Closed
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bridge_error::BridgeError;
use serde_json::{json, Value};

use crate::directory::InstanceDirectory;
use crate::envelope::Envelope;
use crate::registry::BridgeRegistry;

/// Lifecycle state of a [`TransportSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, never started.
    Idle,
    /// `start()` is running, or the last attempt failed.
    Starting,
    /// Bound to an instance; messages flow.
    Connected,
    /// The bound instance went away, or a newer session took over its
    /// binding; only `close()` is meaningful.
    Errored,
    /// Terminal.
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Connected => "connected",
            Self::Errored => "errored",
            Self::Closed => "closed",
        })
    }
}

/// Called with each inbound protocol message.
pub type MessageCallback = Arc<dyn Fn(Value) + Send + Sync>;
/// Called when the session fails.
pub type ErrorCallback = Arc<dyn Fn(BridgeError) + Send + Sync>;
/// Called once after the session closes.
pub type CloseCallback = Box<dyn FnOnce() + Send>;

struct SessionInner {
    state: SessionState,
    target_instance_id: Option<String>,
    ever_connected: bool,
    start_in_flight: bool,
    on_message: Option<MessageCallback>,
    on_error: Option<ErrorCallback>,
    on_close: Option<CloseCallback>,
}

pub(crate) struct SessionShared {
    session_id: String,
    target_logical_id: String,
    registry: BridgeRegistry,
    directory: Arc<dyn InstanceDirectory>,
    bindings: TransportBindings,
    retry_delay: Duration,
    inner: Mutex<SessionInner>,
}

impl SessionShared {
    fn inner(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A tunneled-protocol session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TransportSession {
    shared: Arc<SessionShared>,
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("session_id", &self.shared.session_id)
            .field("target_logical_id", &self.shared.target_logical_id)
            .field("state", &self.state())
            .finish()
    }
}

impl TransportSession {
    /// A new `Idle` session for `target_logical_id`.
    pub fn new(
        target_logical_id: impl Into<String>,
        registry: BridgeRegistry,
        directory: Arc<dyn InstanceDirectory>,
        bindings: TransportBindings,
        retry_delay: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                session_id: uuid::Uuid::new_v4().to_string(),
                target_logical_id: target_logical_id.into(),
                registry,
                directory,
                bindings,
                retry_delay,
                inner: Mutex::new(SessionInner {
                    state: SessionState::Idle,
                    target_instance_id: None,
                    ever_connected: false,
                    start_in_flight: false,
                    on_message: None,
                    on_error: None,
                    on_close: None,
                }),
            }),
        }
    }

    /// Per-session id, independent of any correlation id.
    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// The miniapp definition this session talks to.
    pub fn target_logical_id(&self) -> &str {
        &self.shared.target_logical_id
    }

    /// The concrete instance, once connected.
    pub fn target_instance_id(&self) -> Option<String> {
        self.shared.inner().target_instance_id.clone()
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.shared.inner().state
    }

    /// Install the inbound message callback. Ignored once closed.
    pub fn set_on_message<F>(&self, f: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let mut inner = self.shared.inner();
        if inner.state != SessionState::Closed {
            inner.on_message = Some(Arc::new(f));
        }
    }

    /// Install the error callback. Ignored once closed.
    pub fn set_on_error<F>(&self, f: F)
    where
        F: Fn(BridgeError) + Send + Sync + 'static,
    {
        let mut inner = self.shared.inner();
        if inner.state != SessionState::Closed {
            inner.on_error = Some(Arc::new(f));
        }
    }

    /// Install the close callback. Ignored once closed.
    pub fn set_on_close<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.shared.inner();
        if inner.state != SessionState::Closed {
            inner.on_close = Some(Box::new(f));
        }
    }

    /// Bind the session to the live instance of its logical id.
    ///
    /// Fails with [`BridgeError::NoActiveInstance`] when nothing runs the
    /// logical id. When the instance exists but has not registered its
    /// channel yet, waits the retry delay once and checks again before
    /// failing with [`BridgeError::BridgeNotReady`]. A failed start leaves the
    /// session in `Starting`, from which `start()` may be called again.
    pub async fn start(&self) -> Result<(), BridgeError> {
        {
            let mut inner = self.shared.inner();
            match inner.state {
                SessionState::Connected => return Ok(()),
                SessionState::Idle => {}
                SessionState::Starting if !inner.start_in_flight => {}
                state => {
                    return Err(BridgeError::NotConnected {
                        state: state.to_string(),
                    })
                }
            }
            inner.state = SessionState::Starting;
            inner.start_in_flight = true;
        }

        let outcome = self.locate().await;

        let mut inner = self.shared.inner();
        inner.start_in_flight = false;
        let instance_id = outcome?;
        if inner.state == SessionState::Closed {
            return Err(BridgeError::NotConnected {
                state: SessionState::Closed.to_string(),
            });
        }
        inner.state = SessionState::Connected;
        inner.ever_connected = true;
        inner.target_instance_id = Some(instance_id.clone());
        let displaced = self.shared.bindings.bind(&instance_id, &self.shared);
        drop(inner);

        if let Some(previous) = displaced {
            tracing::warn!(
                instance_id = %instance_id,
                previous = %previous.session_id(),
                session_id = %self.shared.session_id,
                "transport session replaced by a newer one"
            );
            previous.fail(BridgeError::SessionReplaced {
                instance_id: instance_id.clone(),
            });
        }
        tracing::debug!(
            session_id = %self.shared.session_id,
            instance_id = %instance_id,
            logical_id = %self.shared.target_logical_id,
            "transport connected"
        );
        Ok(())
    }

    async fn locate(&self) -> Result<String, BridgeError> {
        let logical_id = &self.shared.target_logical_id;
        let instance_id = self.shared.directory.resolve(logical_id).ok_or_else(|| {
            BridgeError::NoActiveInstance {
                logical_id: logical_id.clone(),
            }
        })?;
        if self.shared.registry.contains(&instance_id) {
            return Ok(instance_id);
        }

        tracing::debug!(
            session_id = %self.shared.session_id,
            instance_id = %instance_id,
            delay_ms = self.shared.retry_delay.as_millis() as u64,
            "instance channel not registered yet; retrying once"
        );
        tokio::time::sleep(self.shared.retry_delay).await;
        if self.shared.registry.contains(&instance_id) {
            Ok(instance_id)
        } else {
            Err(BridgeError::BridgeNotReady { instance_id })
        }
    }

    fn connected_target(&self) -> Result<String, BridgeError> {
        let inner = self.shared.inner();
        match (&inner.state, &inner.target_instance_id) {
            (SessionState::Connected, Some(id)) => Ok(id.clone()),
            (state, _) => Err(BridgeError::NotConnected {
                state: state.to_string(),
            }),
        }
    }

    /// Send one protocol message to the bound instance. Returns once the
    /// message is handed to the instance's channel.
    pub fn send(&self, message: Value) -> Result<(), BridgeError> {
        let instance_id = self.connected_target()?;
        self.shared
            .registry
            .send_to(&instance_id, &Envelope::McpOutgoingMessage { message })
    }

    /// Ask the peer to abort an in-progress request.
    pub fn send_cancel(&self, request_id: Value, reason: Option<&str>) -> Result<(), BridgeError> {
        let mut params = json!({ "requestId": request_id });
        if let Some(reason) = reason {
            params["reason"] = Value::String(reason.to_string());
        }
        self.send(json!({
            "jsonrpc": "2.0",
            "method": "notifications/cancelled",
            "params": params,
        }))
    }

    /// Deliver an inbound protocol message. Returns `false` (and warns) when
    /// the session is not connected.
    pub fn receive_from_bridge(&self, message: Value) -> bool {
        let callback = {
            let inner = self.shared.inner();
            if inner.state != SessionState::Connected {
                tracing::warn!(
                    session_id = %self.shared.session_id,
                    state = %inner.state,
                    "dropping protocol message for a session that is not connected"
                );
                return false;
            }
            inner.on_message.clone()
        };
        match callback {
            Some(on_message) => on_message(message),
            None => tracing::debug!(
                session_id = %self.shared.session_id,
                "protocol message arrived before a message handler was set"
            ),
        }
        true
    }

    /// The bound instance went away.
    pub fn notify_peer_disconnected(&self) {
        let instance_id = self.target_instance_id().unwrap_or_default();
        if self.fail(BridgeError::PeerDisconnected {
            instance_id: instance_id.clone(),
        }) {
            tracing::warn!(
                session_id = %self.shared.session_id,
                instance_id = %instance_id,
                "transport peer disconnected"
            );
        }
    }

    /// Move a connected session to `Errored` and report `error` through
    /// `on_error`. Returns `false` when the session was not connected.
    fn fail(&self, error: BridgeError) -> bool {
        let callback = {
            let mut inner = self.shared.inner();
            if inner.state != SessionState::Connected {
                return false;
            }
            inner.state = SessionState::Errored;
            inner.on_error.clone()
        };
        if let Some(on_error) = callback {
            on_error(error);
        }
        true
    }

    /// Close the session. Idempotent.
    ///
    /// Releases the binding and all callbacks. If the session ever reached
    /// `Connected`, `on_close` runs exactly once on a separate task.
    pub fn close(&self) {
        let (target, on_close) = {
            let mut inner = self.shared.inner();
            if inner.state == SessionState::Closed {
                return;
            }
            inner.state = SessionState::Closed;
            inner.on_message = None;
            inner.on_error = None;
            let on_close = inner.on_close.take();
            let on_close = if inner.ever_connected { on_close } else { None };
            (inner.target_instance_id.clone(), on_close)
        };

        if let Some(instance_id) = target {
            self.shared.bindings.unbind_if(&instance_id, &self.shared);
        }
        tracing::debug!(session_id = %self.shared.session_id, "transport closed");

        if let Some(on_close) = on_close {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { on_close() });
                }
                Err(_) => on_close(),
            }
        }
    }
}

/// Instance id → the transport session bound to it.
///
/// Holds weak references: a session dropped without `close()` disappears
/// from the table on the next lookup.
#[derive(Clone, Default)]
pub struct TransportBindings {
    sessions: Arc<Mutex<HashMap<String, Weak<SessionShared>>>>,
}

impl std::fmt::Debug for TransportBindings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportBindings")
            .field("bound", &self.len())
            .finish()
    }
}

impl TransportBindings {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Weak<SessionShared>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bind `session` to `instance_id`. Returns the live session it
    /// displaced, if any; the caller must fail it once no session lock is
    /// held.
    fn bind(&self, instance_id: &str, session: &Arc<SessionShared>) -> Option<TransportSession> {
        let weak = Arc::downgrade(session);
        let previous = self.sessions().insert(instance_id.to_string(), weak.clone())?;
        if Weak::ptr_eq(&previous, &weak) {
            return None;
        }
        previous.upgrade().map(|shared| TransportSession { shared })
    }

    fn unbind_if(&self, instance_id: &str, session: &Arc<SessionShared>) {
        let mut sessions = self.sessions();
        let bound_here = sessions
            .get(instance_id)
            .is_some_and(|w| Weak::ptr_eq(w, &Arc::downgrade(session)));
        if bound_here {
            sessions.remove(instance_id);
        }
    }

    /// The live session bound to `instance_id`.
    pub fn get(&self, instance_id: &str) -> Option<TransportSession> {
        let mut sessions = self.sessions();
        let shared = sessions.get(instance_id)?.upgrade();
        if shared.is_none() {
            sessions.remove(instance_id);
        }
        shared.map(|shared| TransportSession { shared })
    }

    /// Remove and return the session bound to `instance_id`.
    pub fn take(&self, instance_id: &str) -> Option<TransportSession> {
        self.sessions()
            .remove(instance_id)?
            .upgrade()
            .map(|shared| TransportSession { shared })
    }

    /// Number of bindings, including ones whose session has been dropped.
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    /// Whether nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
