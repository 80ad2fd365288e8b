//! Bridge registry: which sandbox instances can receive a message, and how.
//!
//! The registry maps an instance id to that instance's [`SendCapability`].
//! It is owned by the host context and mutated only on instance attach and
//! detach.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bridge_error::BridgeError;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::envelope::Envelope;

/// Something that can deliver envelopes to one sandbox instance.
pub trait EnvelopeSink: Send + Sync {
    /// Hand an envelope to the instance's channel. Does not wait for the
    /// instance to process it.
    fn send(&self, envelope: &Envelope) -> Result<(), BridgeError>;

    /// Release the channel. Called once when the instance is detached.
    fn close(&self) {}
}

/// Shared handle to an [`EnvelopeSink`].
pub type SendCapability = Arc<dyn EnvelopeSink>;

/// Sink that pushes encoded envelopes into an unbounded channel.
pub struct ChannelSink {
    tx: Mutex<Option<mpsc::UnboundedSender<Value>>>,
}

impl ChannelSink {
    /// Wrap a sender.
    pub fn new(tx: mpsc::UnboundedSender<Value>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    /// A sink together with the receiving end of its channel.
    pub fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self::new(tx)), rx)
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Value>> {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl EnvelopeSink for ChannelSink {
    fn send(&self, envelope: &Envelope) -> Result<(), BridgeError> {
        let tx = self
            .sender()
            .ok_or_else(|| BridgeError::ChannelClosed("sink closed".into()))?;
        tx.send(envelope.to_value())
            .map_err(|_| BridgeError::ChannelClosed("receiver dropped".into()))
    }

    fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }
}

/// Sink backed by a closure.
pub struct FnSink<F>(pub F);

impl<F> EnvelopeSink for FnSink<F>
where
    F: Fn(&Envelope) -> Result<(), BridgeError> + Send + Sync,
{
    fn send(&self, envelope: &Envelope) -> Result<(), BridgeError> {
        (self.0)(envelope)
    }
}

/// Result of a [`BridgeRegistry::broadcast`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Instances that accepted the event.
    pub delivered: usize,
    /// Instances whose channel refused it.
    pub failed: Vec<String>,
}

impl BroadcastReport {
    /// True when nothing was registered to receive the event.
    pub fn is_noop(&self) -> bool {
        self.delivered == 0 && self.failed.is_empty()
    }
}

/// Instance id → send capability.
#[derive(Clone, Default)]
pub struct BridgeRegistry {
    routes: Arc<Mutex<HashMap<String, SendCapability>>>,
}

impl std::fmt::Debug for BridgeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeRegistry")
            .field("instances", &self.instance_ids())
            .finish()
    }
}

impl BridgeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn routes(&self) -> std::sync::MutexGuard<'_, HashMap<String, SendCapability>> {
        self.routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `sink` for `instance_id`, replacing any previous one.
    /// A replaced sink is closed. Returns `true` if a registration was
    /// replaced.
    pub fn register(&self, instance_id: impl Into<String>, sink: SendCapability) -> bool {
        let instance_id = instance_id.into();
        let previous = self.routes().insert(instance_id.clone(), sink.clone());
        match previous {
            Some(previous) => {
                tracing::warn!(instance_id = %instance_id, "instance registered twice; replacing previous route");
                if !Arc::ptr_eq(&previous, &sink) {
                    previous.close();
                }
                true
            }
            None => {
                tracing::debug!(instance_id = %instance_id, "instance registered");
                false
            }
        }
    }

    /// Remove the registration for `instance_id`. No-op if absent.
    pub fn unregister(&self, instance_id: &str) -> Option<SendCapability> {
        let removed = self.routes().remove(instance_id);
        if removed.is_some() {
            tracing::debug!(instance_id = %instance_id, "instance unregistered");
        }
        removed
    }

    /// Look up the send capability for `instance_id`.
    pub fn get(&self, instance_id: &str) -> Option<SendCapability> {
        self.routes().get(instance_id).cloned()
    }

    /// Whether `instance_id` is registered.
    pub fn contains(&self, instance_id: &str) -> bool {
        self.routes().contains_key(instance_id)
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.routes().len()
    }

    /// Whether no instance is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered instance ids, sorted.
    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.routes().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Send an envelope to one instance.
    pub fn send_to(&self, instance_id: &str, envelope: &Envelope) -> Result<(), BridgeError> {
        let sink = self.get(instance_id).ok_or_else(|| BridgeError::InstanceNotFound {
            instance_id: instance_id.to_string(),
        })?;
        sink.send(envelope)
    }

    /// Send a `hostEvent` to every registered instance.
    pub fn broadcast(&self, event_name: &str, data: Value) -> BroadcastReport {
        let targets: Vec<(String, SendCapability)> = self
            .routes()
            .iter()
            .map(|(id, sink)| (id.clone(), sink.clone()))
            .collect();

        let mut report = BroadcastReport::default();
        if targets.is_empty() {
            tracing::warn!(event = %event_name, "broadcast with no registered instances");
            return report;
        }

        let envelope = Envelope::HostEvent {
            event_name: event_name.to_string(),
            data,
        };
        for (instance_id, sink) in targets {
            match sink.send(&envelope) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(instance_id = %instance_id, event = %event_name, error = %e, "broadcast delivery failed");
                    report.failed.push(instance_id);
                }
            }
        }
        report.failed.sort();
        report
    }
}
