//! Pending-call table: correlates outbound calls with their responses.
//!
//! Both the host and every sandbox runtime own one. An entry is created by
//! [`PendingCalls::issue`] and removed exactly once, by whichever of
//! resolve / reject / timeout / drain runs first. Every settle path removes
//! the entry under the lock and delivers the outcome after releasing it, so
//! the loser of a race always finds the entry gone and becomes a no-op.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bridge_error::BridgeError;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

/// Outcome delivered to a waiting caller.
pub type CallResult = Result<Value, BridgeError>;

struct PendingEntry {
    name: String,
    target: Option<String>,
    tx: oneshot::Sender<CallResult>,
    chunks: Option<mpsc::UnboundedSender<Value>>,
    timer: Option<AbortHandle>,
    timeout: Duration,
    created_at: tokio::time::Instant,
}

#[derive(Default)]
struct PendingState {
    next_seq: u64,
    calls: HashMap<String, PendingEntry>,
}

/// Table of in-flight outbound calls for one endpoint.
#[derive(Clone)]
pub struct PendingCalls {
    prefix: Arc<str>,
    default_timeout: Duration,
    state: Arc<Mutex<PendingState>>,
}

impl std::fmt::Debug for PendingCalls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCalls")
            .field("prefix", &self.prefix)
            .field("default_timeout", &self.default_timeout)
            .field("pending", &self.len())
            .finish()
    }
}

/// Future resolving to the outcome of one issued call.
#[derive(Debug)]
pub struct PendingReply {
    correlation_id: String,
    rx: oneshot::Receiver<CallResult>,
}

impl PendingReply {
    /// The correlation id this reply is waiting on.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Future for PendingReply {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(outcome) => outcome,
            Err(_) => Err(BridgeError::drained("pending table dropped")),
        })
    }
}

fn lock(state: &Mutex<PendingState>) -> std::sync::MutexGuard<'_, PendingState> {
    // A poisoned table is still structurally valid: entries are only ever
    // inserted or removed whole.
    state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PendingCalls {
    /// An empty table with unprefixed correlation ids.
    pub fn new(default_timeout: Duration) -> Self {
        Self::with_prefix("", default_timeout)
    }

    /// An empty table whose correlation ids all start with `prefix`.
    pub fn with_prefix(prefix: &str, default_timeout: Duration) -> Self {
        Self {
            prefix: Arc::from(prefix),
            default_timeout,
            state: Arc::new(Mutex::new(PendingState::default())),
        }
    }

    /// Deadline used when a call does not specify one.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Issue a call.
    ///
    /// Generates a fresh correlation id `"{prefix}{name}_{seq}"`, records the
    /// entry, hands the id to `send` (which must put the request envelope on
    /// the wire) and starts the timeout timer. If `send` fails the entry is
    /// removed and the error returned.
    ///
    /// `target` names the instance expected to answer; responses arriving
    /// from any other instance are treated as stale (see [`settle_from`]).
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// [`settle_from`]: PendingCalls::settle_from
    pub fn issue<F>(
        &self,
        name: &str,
        timeout: Option<Duration>,
        target: Option<&str>,
        send: F,
    ) -> Result<PendingReply, BridgeError>
    where
        F: FnOnce(&str) -> Result<(), BridgeError>,
    {
        self.issue_inner(name, timeout, target, None, send)
    }

    /// Issue a call that also receives out-of-band chunks before it settles.
    pub fn issue_streaming<F>(
        &self,
        name: &str,
        timeout: Option<Duration>,
        target: Option<&str>,
        send: F,
    ) -> Result<(PendingReply, mpsc::UnboundedReceiver<Value>), BridgeError>
    where
        F: FnOnce(&str) -> Result<(), BridgeError>,
    {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let reply = self.issue_inner(name, timeout, target, Some(chunk_tx), send)?;
        Ok((reply, chunk_rx))
    }

    fn issue_inner<F>(
        &self,
        name: &str,
        timeout: Option<Duration>,
        target: Option<&str>,
        chunks: Option<mpsc::UnboundedSender<Value>>,
        send: F,
    ) -> Result<PendingReply, BridgeError>
    where
        F: FnOnce(&str) -> Result<(), BridgeError>,
    {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let (tx, rx) = oneshot::channel();

        let correlation_id = {
            let mut state = lock(&self.state);
            state.next_seq += 1;
            let id = format!("{}{}_{}", self.prefix, name, state.next_seq);
            state.calls.insert(
                id.clone(),
                PendingEntry {
                    name: name.to_string(),
                    target: target.map(str::to_string),
                    tx,
                    chunks,
                    timer: None,
                    timeout,
                    created_at: tokio::time::Instant::now(),
                },
            );
            id
        };

        if let Err(e) = send(&correlation_id) {
            lock(&self.state).calls.remove(&correlation_id);
            tracing::debug!(correlation_id = %correlation_id, error = %e, "call not sent");
            return Err(e);
        }

        self.arm_timer(&correlation_id, timeout);
        tracing::trace!(correlation_id = %correlation_id, timeout_ms = timeout.as_millis() as u64, "call issued");

        Ok(PendingReply { correlation_id, rx })
    }

    fn arm_timer(&self, correlation_id: &str, timeout: Duration) {
        let mut state = lock(&self.state);
        // The response may already have arrived during `send`.
        let Some(entry) = state.calls.get_mut(correlation_id) else {
            return;
        };
        let weak: Weak<Mutex<PendingState>> = Arc::downgrade(&self.state);
        let id = correlation_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(state) = weak.upgrade() {
                Self::expire(&state, &id);
            }
        });
        entry.timer = Some(task.abort_handle());
    }

    fn expire(state: &Mutex<PendingState>, correlation_id: &str) -> bool {
        let Some(entry) = lock(state).calls.remove(correlation_id) else {
            return false;
        };
        tracing::debug!(
            correlation_id = %correlation_id,
            name = %entry.name,
            "call timed out"
        );
        let error = BridgeError::Timeout {
            name: entry.name,
            timeout_ms: entry.timeout.as_millis() as u64,
        };
        let _ = entry.tx.send(Err(error));
        true
    }

    fn take(&self, correlation_id: &str) -> Option<PendingEntry> {
        let entry = lock(&self.state).calls.remove(correlation_id)?;
        if let Some(timer) = &entry.timer {
            timer.abort();
        }
        Some(entry)
    }

    fn deliver(entry: PendingEntry, correlation_id: &str, outcome: CallResult) {
        tracing::trace!(
            correlation_id = %correlation_id,
            ok = outcome.is_ok(),
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            "call settled"
        );
        // The caller may have stopped waiting; that is not an error.
        let _ = entry.tx.send(outcome);
    }

    /// Fulfil a pending call. Returns `false` for an unknown (late or
    /// duplicate) id, which is a no-op.
    pub fn resolve(&self, correlation_id: &str, payload: Value) -> bool {
        self.settle(correlation_id, Ok(payload))
    }

    /// Reject a pending call with the peer's error message.
    pub fn reject(&self, correlation_id: &str, message: impl Into<String>) -> bool {
        self.settle(correlation_id, Err(message.into()))
    }

    /// Settle from a wire result: `Err` becomes [`BridgeError::Peer`].
    pub fn settle(&self, correlation_id: &str, result: Result<Value, String>) -> bool {
        self.fail_or_resolve(correlation_id, result.map_err(BridgeError::peer))
    }

    /// Settle with an arbitrary outcome.
    pub fn fail_or_resolve(&self, correlation_id: &str, outcome: CallResult) -> bool {
        match self.take(correlation_id) {
            Some(entry) => {
                Self::deliver(entry, correlation_id, outcome);
                true
            }
            None => {
                tracing::debug!(correlation_id = %correlation_id, "dropping stale response");
                false
            }
        }
    }

    /// Settle only if the response came from the instance the call was sent
    /// to. A response from anyone else is treated as stale and leaves the
    /// entry untouched.
    pub fn settle_from(
        &self,
        correlation_id: &str,
        from_instance: &str,
        result: Result<Value, String>,
    ) -> bool {
        let entry = {
            let mut state = lock(&self.state);
            match state.calls.get(correlation_id) {
                Some(entry)
                    if entry
                        .target
                        .as_deref()
                        .is_none_or(|target| target == from_instance) => {}
                Some(_) => {
                    tracing::warn!(
                        correlation_id = %correlation_id,
                        instance_id = %from_instance,
                        "ignoring response from an instance the call was not sent to"
                    );
                    return false;
                }
                None => {
                    tracing::debug!(correlation_id = %correlation_id, "dropping stale response");
                    return false;
                }
            }
            state.calls.remove(correlation_id)
        };
        let Some(entry) = entry else {
            return false;
        };
        if let Some(timer) = &entry.timer {
            timer.abort();
        }
        Self::deliver(entry, correlation_id, result.map_err(BridgeError::peer));
        true
    }

    /// Force the timeout path for a call. Idempotent.
    pub fn on_timeout(&self, correlation_id: &str) -> bool {
        if let Some(timer) = lock(&self.state)
            .calls
            .get(correlation_id)
            .and_then(|e| e.timer.as_ref())
        {
            timer.abort();
        }
        Self::expire(&self.state, correlation_id)
    }

    /// Forward a partial result to a streaming call without settling it.
    pub fn push_chunk(&self, correlation_id: &str, chunk: Value) -> bool {
        let state = lock(&self.state);
        match state.calls.get(correlation_id).and_then(|e| e.chunks.as_ref()) {
            Some(chunks) => chunks.send(chunk).is_ok(),
            None => {
                tracing::debug!(correlation_id = %correlation_id, "dropping chunk for unknown call");
                false
            }
        }
    }

    /// Reject every outstanding call with `reason` and clear the table.
    pub fn drain_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, PendingEntry)> = lock(&self.state).calls.drain().collect();
        self.reject_drained(drained, reason)
    }

    /// Reject every outstanding call that was sent to `instance_id`.
    pub fn drain_target(&self, instance_id: &str, reason: &str) -> usize {
        let drained: Vec<(String, PendingEntry)> = {
            let mut state = lock(&self.state);
            let ids: Vec<String> = state
                .calls
                .iter()
                .filter(|(_, e)| e.target.as_deref() == Some(instance_id))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| state.calls.remove(&id).map(|e| (id, e)))
                .collect()
        };
        self.reject_drained(drained, reason)
    }

    fn reject_drained(&self, drained: Vec<(String, PendingEntry)>, reason: &str) -> usize {
        let count = drained.len();
        for (id, entry) in drained {
            if let Some(timer) = &entry.timer {
                timer.abort();
            }
            Self::deliver(entry, &id, Err(BridgeError::drained(reason)));
        }
        if count > 0 {
            tracing::debug!(count, reason = %reason, "drained pending calls");
        }
        count
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        lock(&self.state).calls.len()
    }

    /// Whether no call is outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `correlation_id` is outstanding.
    pub fn contains(&self, correlation_id: &str) -> bool {
        lock(&self.state).calls.contains_key(correlation_id)
    }

    /// How long `correlation_id` has been outstanding, on the Tokio clock.
    pub fn age(&self, correlation_id: &str) -> Option<Duration> {
        lock(&self.state)
            .calls
            .get(correlation_id)
            .map(|entry| entry.created_at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn table() -> PendingCalls {
        PendingCalls::new(Duration::from_millis(15_000))
    }

    fn sent() -> impl FnOnce(&str) -> Result<(), BridgeError> {
        |_| Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn age_follows_the_tokio_clock() {
        let pending = table();
        let reply = pending.issue("slowApi", None, None, sent()).unwrap();
        let id = reply.correlation_id().to_string();
        assert_eq!(pending.age(&id), Some(Duration::ZERO));

        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(pending.age(&id), Some(Duration::from_millis(250)));

        assert!(pending.resolve(&id, Value::Null));
        assert!(pending.age(&id).is_none());
        assert_eq!(reply.await.unwrap(), Value::Null);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_and_removes_entry() {
        let pending = table();
        let reply = pending
            .issue("getOwnConfig", Some(Duration::from_millis(1000)), None, sent())
            .unwrap();
        let id = reply.correlation_id().to_string();
        assert!(pending.contains(&id));

        let err = reply.await.unwrap_err();
        assert!(
            matches!(err, BridgeError::Timeout { ref name, timeout_ms: 1000 } if name == "getOwnConfig"),
            "got: {err:?}"
        );
        assert!(err.is_local_failure());
        assert!(!pending.contains(&id));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn resolve_with_null_payload() {
        let pending = table();
        let reply = pending.issue("log", None, None, sent()).unwrap();
        assert!(pending.resolve(reply.correlation_id(), Value::Null));
        assert_eq!(reply.await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn peer_error_is_propagated_verbatim() {
        let pending = table();
        let reply = pending.issue("save", None, None, sent()).unwrap();
        assert!(pending.reject(reply.correlation_id(), "disk full"));
        let err = reply.await.unwrap_err();
        assert!(matches!(err, BridgeError::Peer { .. }));
        assert_eq!(err.to_string(), "disk full");
        assert!(!err.is_local_failure());
    }

    #[tokio::test]
    async fn correlation_ids_are_unique() {
        let pending = table();
        let mut ids = HashSet::new();
        let mut replies = Vec::new();
        for i in 0..200 {
            let name = if i % 2 == 0 { "log" } else { "fetch" };
            let reply = pending.issue(name, None, None, sent()).unwrap();
            assert!(ids.insert(reply.correlation_id().to_string()));
            replies.push(reply);
        }
        assert_eq!(pending.len(), 200);
    }

    #[tokio::test]
    async fn prefix_is_applied() {
        let pending = PendingCalls::with_prefix("host:", Duration::from_secs(1));
        let reply = pending.issue("ping", None, None, sent()).unwrap();
        assert_eq!(reply.correlation_id(), "host:ping_1");
    }

    #[tokio::test]
    async fn stale_response_is_a_noop() {
        let pending = table();
        let reply = pending.issue("a", None, None, sent()).unwrap();
        assert!(!pending.resolve("a_999", Value::Bool(true)));
        assert!(!pending.reject("nope", "x"));
        assert_eq!(pending.len(), 1);
        assert!(pending.resolve(reply.correlation_id(), Value::from(1)));
        assert_eq!(reply.await.unwrap(), Value::from(1));
    }

    #[tokio::test]
    async fn duplicate_response_settles_once() {
        let pending = table();
        let reply = pending.issue("a", None, None, sent()).unwrap();
        let id = reply.correlation_id().to_string();
        assert!(pending.resolve(&id, Value::from("first")));
        assert!(!pending.resolve(&id, Value::from("second")));
        assert!(!pending.reject(&id, "late"));
        assert_eq!(reply.await.unwrap(), Value::from("first"));
    }

    #[tokio::test(start_paused = true)]
    async fn response_before_deadline_beats_timer() {
        let pending = table();
        let reply = pending
            .issue("slow", Some(Duration::from_millis(100)), None, sent())
            .unwrap();
        let id = reply.correlation_id().to_string();

        tokio::time::advance(Duration::from_millis(99)).await;
        assert!(pending.resolve(&id, Value::from("ok")));
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(!pending.on_timeout(&id));
        assert_eq!(reply.await.unwrap(), Value::from("ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn timer_beats_late_response() {
        let pending = table();
        let reply = pending
            .issue("slow", Some(Duration::from_millis(100)), None, sent())
            .unwrap();
        let id = reply.correlation_id().to_string();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!pending.resolve(&id, Value::from("late")));
        assert!(matches!(reply.await, Err(BridgeError::Timeout { .. })));
    }

    #[tokio::test]
    async fn forced_timeout_is_idempotent() {
        let pending = table();
        let reply = pending.issue("x", None, None, sent()).unwrap();
        let id = reply.correlation_id().to_string();
        assert!(pending.on_timeout(&id));
        assert!(!pending.on_timeout(&id));
        assert!(!pending.resolve(&id, Value::Null));
        assert!(matches!(reply.await, Err(BridgeError::Timeout { .. })));
    }

    #[tokio::test]
    async fn response_during_send_is_kept() {
        let pending = table();
        let inner = pending.clone();
        let reply = pending
            .issue("echo", None, None, move |id| {
                inner.resolve(id, Value::from("instant"));
                Ok(())
            })
            .unwrap();
        assert!(pending.is_empty());
        assert_eq!(reply.await.unwrap(), Value::from("instant"));
    }

    #[tokio::test]
    async fn failed_send_removes_entry() {
        let pending = table();
        let err = pending
            .issue("x", None, None, |_| {
                Err(BridgeError::ChannelClosed("gone".into()))
            })
            .unwrap_err();
        assert!(matches!(err, BridgeError::ChannelClosed(_)));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn drain_all_rejects_everything() {
        let pending = table();
        let a = pending.issue("a", None, None, sent()).unwrap();
        let b = pending.issue("b", None, None, sent()).unwrap();
        assert_eq!(pending.drain_all("instance unloaded"), 2);
        assert!(pending.is_empty());
        for reply in [a, b] {
            let err = reply.await.unwrap_err();
            assert!(matches!(err, BridgeError::Drained { ref reason } if reason == "instance unloaded"));
        }
        assert_eq!(pending.drain_all("again"), 0);
    }

    #[tokio::test]
    async fn drain_target_only_touches_that_instance() {
        let pending = table();
        let to_a = pending.issue("f", None, Some("inst-a"), sent()).unwrap();
        let to_b = pending.issue("f", None, Some("inst-b"), sent()).unwrap();
        assert_eq!(pending.drain_target("inst-a", "detached"), 1);
        assert!(matches!(to_a.await, Err(BridgeError::Drained { .. })));
        assert!(pending.contains(to_b.correlation_id()));
    }

    #[tokio::test]
    async fn settle_from_checks_the_responder() {
        let pending = table();
        let reply = pending.issue("f", None, Some("inst-a"), sent()).unwrap();
        let id = reply.correlation_id().to_string();
        assert!(!pending.settle_from(&id, "inst-b", Ok(Value::from("spoofed"))));
        assert!(pending.contains(&id));
        assert!(pending.settle_from(&id, "inst-a", Ok(Value::from("real"))));
        assert_eq!(reply.await.unwrap(), Value::from("real"));
    }

    #[tokio::test]
    async fn chunks_flow_until_settled() {
        let pending = table();
        let (reply, mut chunks) = pending.issue_streaming("llm", None, None, sent()).unwrap();
        let id = reply.correlation_id().to_string();
        assert!(pending.push_chunk(&id, Value::from("he")));
        assert!(pending.push_chunk(&id, Value::from("llo")));
        assert!(pending.resolve(&id, Value::from("hello")));
        assert!(!pending.push_chunk(&id, Value::from("!")));

        assert_eq!(chunks.recv().await, Some(Value::from("he")));
        assert_eq!(chunks.recv().await, Some(Value::from("llo")));
        assert_eq!(chunks.recv().await, None);
        assert_eq!(reply.await.unwrap(), Value::from("hello"));
    }

    #[tokio::test]
    async fn plain_call_ignores_chunks() {
        let pending = table();
        let reply = pending.issue("x", None, None, sent()).unwrap();
        assert!(!pending.push_chunk(reply.correlation_id(), Value::Null));
        assert_eq!(pending.len(), 1);
    }
}
