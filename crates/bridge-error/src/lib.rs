#![warn(missing_docs)]

//! Typed error types for the miniapp bridge.
//!
//! Provides [`BridgeError`], the canonical error type returned by every
//! correlated call, transport session and routing operation in the bridge.

use thiserror::Error;

/// Canonical error type for bridge operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BridgeError {
    /// No response arrived before the call's deadline.
    #[error("timeout after {timeout_ms}ms waiting for '{name}'")]
    Timeout {
        /// Logical name of the call that timed out.
        name: String,
        /// The deadline in milliseconds.
        timeout_ms: u64,
    },

    /// The responding side set `error` on its response.
    #[error("{message}")]
    Peer {
        /// The error string reported by the peer, verbatim.
        message: String,
    },

    /// An `executeFunction` named a function that is not registered.
    #[error("function not found: '{name}'")]
    FunctionNotFound {
        /// The requested function name.
        name: String,
    },

    /// An `apiRequest` named an API the host does not expose.
    #[error("api not found: '{name}'")]
    ApiNotFound {
        /// The requested API name.
        name: String,
    },

    /// No running instance exists for a logical id.
    #[error("no active instance for '{logical_id}'")]
    NoActiveInstance {
        /// The logical (definition) id that was looked up.
        logical_id: String,
    },

    /// A concrete instance id has no live registration.
    #[error("instance not found: {instance_id}")]
    InstanceNotFound {
        /// The instance id that was looked up.
        instance_id: String,
    },

    /// The instance exists but its send capability is not registered yet.
    #[error("bridge not ready for instance {instance_id}")]
    BridgeNotReady {
        /// The instance whose channel is not ready.
        instance_id: String,
    },

    /// The call was rejected because its endpoint was torn down.
    #[error("call drained: {reason}")]
    Drained {
        /// Why the endpoint was torn down.
        reason: String,
    },

    /// The instance bound to a transport session went away.
    #[error("peer disconnected: instance {instance_id}")]
    PeerDisconnected {
        /// The instance that disappeared.
        instance_id: String,
    },

    /// A newer transport session was bound to the same instance.
    #[error("transport session replaced for instance {instance_id}")]
    SessionReplaced {
        /// The instance the session was bound to.
        instance_id: String,
    },

    /// A transport session was used outside the `Connected` state.
    #[error("transport not connected (state: {state})")]
    NotConnected {
        /// The session state at the time of the call.
        state: String,
    },

    /// Inbound data did not decode into a known envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The channel to a peer is closed.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BridgeError {
    /// Build a [`BridgeError::Peer`] from a peer-reported error string.
    pub fn peer(message: impl Into<String>) -> Self {
        Self::Peer {
            message: message.into(),
        }
    }

    /// Build a [`BridgeError::Drained`] with the given teardown reason.
    pub fn drained(reason: impl Into<String>) -> Self {
        Self::Drained {
            reason: reason.into(),
        }
    }

    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "TIMEOUT",
            Self::Peer { .. } => "PEER_ERROR",
            Self::FunctionNotFound { .. } => "FUNCTION_NOT_FOUND",
            Self::ApiNotFound { .. } => "API_NOT_FOUND",
            Self::NoActiveInstance { .. } => "NO_ACTIVE_INSTANCE",
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::BridgeNotReady { .. } => "BRIDGE_NOT_READY",
            Self::Drained { .. } => "DRAINED",
            Self::PeerDisconnected { .. } => "PEER_DISCONNECTED",
            Self::SessionReplaced { .. } => "SESSION_REPLACED",
            Self::NotConnected { .. } => "NOT_CONNECTED",
            Self::MalformedEnvelope(_) => "MALFORMED_ENVELOPE",
            Self::ChannelClosed(_) => "CHANNEL_CLOSED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns whether the operation that produced this error may succeed if retried.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::BridgeNotReady { .. } => true,
            Self::NoActiveInstance { .. } => true,
            Self::Peer { .. } => false,
            Self::FunctionNotFound { .. } => false,
            Self::ApiNotFound { .. } => false,
            Self::InstanceNotFound { .. } => false,
            Self::Drained { .. } => false,
            Self::PeerDisconnected { .. } => false,
            Self::SessionReplaced { .. } => false,
            Self::NotConnected { .. } => false,
            Self::MalformedEnvelope(_) => false,
            Self::ChannelClosed(_) => false,
            Self::Internal(_) => false,
        }
    }

    /// True for errors produced locally by a deadline or a teardown, as
    /// opposed to failures reported by the peer.
    pub fn is_local_failure(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Drained { .. })
    }
}

/// Find the closest registered name using Levenshtein distance.
///
/// Returns a suggestion string if a name within edit distance 3 is found.
pub fn find_similar_name(name: &str, known: &[&str]) -> Option<String> {
    let mut best: Option<(usize, &str)> = None;
    for &candidate in known {
        let dist = strsim::levenshtein(name, candidate);
        if dist <= 3 && best.is_none_or(|(d, _)| dist < d) {
            best = Some((dist, candidate));
        }
    }
    best.map(|(_, candidate)| format!("Did you mean '{candidate}'?"))
}

// Compile-time assertion: BridgeError must be Send + Sync + 'static
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<BridgeError>();
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_timeout() {
        let err = BridgeError::Timeout {
            name: "getOwnConfig".into(),
            timeout_ms: 1000,
        };
        assert_eq!(
            err.to_string(),
            "timeout after 1000ms waiting for 'getOwnConfig'"
        );
    }

    #[test]
    fn display_peer_is_verbatim() {
        let err = BridgeError::peer("disk full");
        assert_eq!(err.to_string(), "disk full");
    }

    #[test]
    fn display_function_not_found() {
        let err = BridgeError::FunctionNotFound {
            name: "ping".into(),
        };
        assert_eq!(err.to_string(), "function not found: 'ping'");
    }

    #[test]
    fn display_no_active_instance() {
        let err = BridgeError::NoActiveInstance {
            logical_id: "notes".into(),
        };
        assert_eq!(err.to_string(), "no active instance for 'notes'");
    }

    #[test]
    fn display_not_connected() {
        let err = BridgeError::NotConnected {
            state: "idle".into(),
        };
        assert_eq!(err.to_string(), "transport not connected (state: idle)");
    }

    #[test]
    fn display_internal() {
        let err = BridgeError::Internal(anyhow::anyhow!("something broke"));
        assert_eq!(err.to_string(), "something broke");
    }

    #[test]
    fn code_exhaustive() {
        let cases: Vec<(BridgeError, &str)> = vec![
            (
                BridgeError::Timeout {
                    name: "x".into(),
                    timeout_ms: 1,
                },
                "TIMEOUT",
            ),
            (BridgeError::peer("x"), "PEER_ERROR"),
            (
                BridgeError::FunctionNotFound { name: "x".into() },
                "FUNCTION_NOT_FOUND",
            ),
            (
                BridgeError::ApiNotFound { name: "x".into() },
                "API_NOT_FOUND",
            ),
            (
                BridgeError::NoActiveInstance {
                    logical_id: "x".into(),
                },
                "NO_ACTIVE_INSTANCE",
            ),
            (
                BridgeError::InstanceNotFound {
                    instance_id: "x".into(),
                },
                "INSTANCE_NOT_FOUND",
            ),
            (
                BridgeError::BridgeNotReady {
                    instance_id: "x".into(),
                },
                "BRIDGE_NOT_READY",
            ),
            (BridgeError::drained("x"), "DRAINED"),
            (
                BridgeError::PeerDisconnected {
                    instance_id: "x".into(),
                },
                "PEER_DISCONNECTED",
            ),
            (
                BridgeError::SessionReplaced {
                    instance_id: "x".into(),
                },
                "SESSION_REPLACED",
            ),
            (
                BridgeError::NotConnected { state: "x".into() },
                "NOT_CONNECTED",
            ),
            (
                BridgeError::MalformedEnvelope("x".into()),
                "MALFORMED_ENVELOPE",
            ),
            (BridgeError::ChannelClosed("x".into()), "CHANNEL_CLOSED"),
            (BridgeError::Internal(anyhow::anyhow!("x")), "INTERNAL"),
        ];
        for (err, expected_code) in &cases {
            assert_eq!(err.code(), *expected_code, "wrong code for {err}");
        }
    }

    #[test]
    fn timeout_and_drain_are_local_failures() {
        assert!(BridgeError::Timeout {
            name: "x".into(),
            timeout_ms: 1
        }
        .is_local_failure());
        assert!(BridgeError::drained("teardown").is_local_failure());
        assert!(!BridgeError::peer("boom").is_local_failure());
    }

    #[test]
    fn retryable_cases() {
        assert!(BridgeError::Timeout {
            name: "x".into(),
            timeout_ms: 1
        }
        .retryable());
        assert!(BridgeError::BridgeNotReady {
            instance_id: "i".into()
        }
        .retryable());
        assert!(!BridgeError::peer("x").retryable());
        assert!(!BridgeError::FunctionNotFound { name: "x".into() }.retryable());
        assert!(!BridgeError::Internal(anyhow::anyhow!("x")).retryable());
    }

    #[test]
    fn from_anyhow_error() {
        let err: BridgeError = anyhow::anyhow!("test anyhow").into();
        assert!(matches!(err, BridgeError::Internal(_)));
        assert_eq!(err.code(), "INTERNAL");
    }

    #[test]
    fn fuzzy_match_picks_closest() {
        let result = find_similar_name("getConfig", &["getOwnConfig", "getConfg", "log"]);
        assert_eq!(result.as_deref(), Some("Did you mean 'getConfg'?"));
    }

    #[test]
    fn fuzzy_match_no_match_beyond_threshold() {
        assert!(find_similar_name("zzzzzz", &["ping", "pong"]).is_none());
    }
}
