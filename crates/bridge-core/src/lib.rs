#![warn(missing_docs)]

//! # bridge-core
//!
//! Correlated message bridge between one host process and the sandboxed
//! miniapp instances it runs.
//!
//! Every exchange is an [`Envelope`]. Sandboxes call host APIs and peer
//! functions through a [`SandboxRuntime`]; the host calls sandbox functions,
//! broadcasts events and tunnels protocol sessions through a [`HostBridge`].
//! Both sides correlate calls with a [`PendingCalls`] table and bound every
//! wait with a timeout.
//!
//! ## Trust model
//!
//! - The host trusts instances it registered; an envelope claiming to come
//!   from an unregistered instance is dropped
//! - Instances are semi-trusted: malformed envelopes are logged and dropped,
//!   responses from an instance a call was not sent to are ignored
//! - Nothing inspects tunneled protocol payloads

pub mod child;
pub mod directory;
pub mod envelope;
pub mod functions;
pub mod host;
pub mod ipc;
pub mod llm;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod pending;
pub mod registry;
pub mod router;
pub mod sandbox;
pub mod transport;

pub use bridge_error::BridgeError;
pub use directory::{ActiveInstance, InstanceDirectory, InstanceTable};
pub use envelope::{encode, Envelope, EnvelopeKind, FunctionCall, PeerTarget, WireEnvelope};
pub use functions::{CallContext, FunctionRegistry, Handler};
pub use host::{HostBridge, InProcessInstance};
pub use llm::{ChunkSender, LlmProvider};
pub use pending::{PendingCalls, PendingReply};
pub use registry::{BridgeRegistry, BroadcastReport, ChannelSink, EnvelopeSink, FnSink, SendCapability};
pub use router::{MessageRouter, RouteOutcome};
pub use sandbox::{SandboxRuntime, WeakSandboxRuntime};
pub use transport::{SessionState, TransportBindings, TransportSession};
