//! Envelope codec: the wire message shape shared by every exchange.
//!
//! On the wire an envelope is a JSON object
//! `{ "type": string, "payload": any, "correlationId"?: string, "error"?: string }`.
//! In memory it is the closed [`Envelope`] sum type. Unknown tags and
//! missing fields are a [`BridgeError::MalformedEnvelope`] from
//! [`Envelope::try_decode`]; [`Envelope::decode`] logs them and yields `None`.

use bridge_error::BridgeError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The closed set of envelope type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvelopeKind {
    /// sandbox → host: invoke a host API.
    ApiRequest,
    /// host → sandbox: answer to an `apiRequest`.
    ApiResponse,
    /// host → sandbox (or relayed peer → peer): invoke a registered function.
    ExecuteFunction,
    /// sandbox → host: answer to an `executeFunction`.
    FunctionResponse,
    /// host → sandbox: fire-and-forget broadcast.
    HostEvent,
    /// either direction: opaque tunneled protocol message.
    McpOutgoingMessage,
    /// sandbox → host: start an LLM completion.
    LlmCallRequest,
    /// host → sandbox: partial LLM output for a pending completion.
    LlmCallChunk,
    /// host → sandbox: final LLM result.
    LlmCallResponse,
}

impl EnvelopeKind {
    /// Every defined kind.
    pub const ALL: [EnvelopeKind; 9] = [
        EnvelopeKind::ApiRequest,
        EnvelopeKind::ApiResponse,
        EnvelopeKind::ExecuteFunction,
        EnvelopeKind::FunctionResponse,
        EnvelopeKind::HostEvent,
        EnvelopeKind::McpOutgoingMessage,
        EnvelopeKind::LlmCallRequest,
        EnvelopeKind::LlmCallChunk,
        EnvelopeKind::LlmCallResponse,
    ];

    /// The wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiRequest => "apiRequest",
            Self::ApiResponse => "apiResponse",
            Self::ExecuteFunction => "executeFunction",
            Self::FunctionResponse => "functionResponse",
            Self::HostEvent => "hostEvent",
            Self::McpOutgoingMessage => "mcpOutgoingMessage",
            Self::LlmCallRequest => "llmCallRequest",
            Self::LlmCallChunk => "llmCallChunk",
            Self::LlmCallResponse => "llmCallResponse",
        }
    }

    /// Parse a wire tag.
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == tag)
    }

    /// Whether this kind settles a pending call on the receiving side.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::ApiResponse | Self::FunctionResponse | Self::LlmCallResponse
        )
    }

    /// Whether a correlation id is mandatory for this kind.
    pub fn requires_correlation_id(&self) -> bool {
        !matches!(self, Self::HostEvent | Self::McpOutgoingMessage)
    }
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The untyped wire form of an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    /// The type tag.
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Type-dependent payload.
    #[serde(default)]
    pub payload: Value,
    /// Correlation id linking a response to its request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Failure message, present only on failed responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WireEnvelope {
    /// Render as a JSON object.
    pub fn into_value(self) -> Value {
        let mut obj = Map::new();
        obj.insert("type".into(), Value::String(self.kind.as_str().into()));
        obj.insert("payload".into(), self.payload);
        if let Some(id) = self.correlation_id {
            obj.insert("correlationId".into(), Value::String(id));
        }
        if let Some(error) = self.error {
            obj.insert("error".into(), Value::String(error));
        }
        Value::Object(obj)
    }
}

/// Construct a wire envelope. Pure; performs no validation.
pub fn encode(
    kind: EnvelopeKind,
    payload: Value,
    correlation_id: Option<String>,
    error: Option<String>,
) -> WireEnvelope {
    WireEnvelope {
        kind,
        payload,
        correlation_id,
        error,
    }
}

/// Who a relayed `executeFunction` is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerTarget {
    /// The most recent running instance of a miniapp definition.
    Logical(String),
    /// A specific running instance.
    Instance(String),
}

/// Payload of an `executeFunction` envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    /// Registered function name.
    pub function_name: String,
    /// Arguments passed to the handler.
    pub args: Value,
    /// Set when a sandbox asks the host to relay the call to a peer.
    pub target: Option<PeerTarget>,
}

impl FunctionCall {
    /// A call addressed to whoever receives the envelope.
    pub fn new(function_name: impl Into<String>, args: Value) -> Self {
        Self {
            function_name: function_name.into(),
            args,
            target: None,
        }
    }
}

/// A decoded, well-formed envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Invoke a host API.
    ApiRequest {
        /// Correlation id.
        correlation_id: String,
        /// API name.
        api_name: String,
        /// API arguments.
        args: Value,
    },
    /// Answer to an `apiRequest`.
    ApiResponse {
        /// Correlation id of the request.
        correlation_id: String,
        /// Payload, or the peer's error message.
        result: Result<Value, String>,
    },
    /// Invoke a registered function.
    ExecuteFunction {
        /// Correlation id.
        correlation_id: String,
        /// Function name, arguments and optional relay target.
        call: FunctionCall,
    },
    /// Answer to an `executeFunction`.
    FunctionResponse {
        /// Correlation id of the request.
        correlation_id: String,
        /// Payload, or the handler's error message.
        result: Result<Value, String>,
    },
    /// Broadcast event.
    HostEvent {
        /// Event name.
        event_name: String,
        /// Event data.
        data: Value,
    },
    /// Tunneled protocol message, opaque to the bridge.
    McpOutgoingMessage {
        /// The inner protocol message.
        message: Value,
    },
    /// Start an LLM completion.
    LlmCallRequest {
        /// Correlation id.
        correlation_id: String,
        /// Provider-specific request.
        request: Value,
    },
    /// Partial LLM output.
    LlmCallChunk {
        /// Correlation id of the request.
        correlation_id: String,
        /// The chunk.
        chunk: Value,
    },
    /// Final LLM result.
    LlmCallResponse {
        /// Correlation id of the request.
        correlation_id: String,
        /// Result, or the provider's error message.
        result: Result<Value, String>,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiRequestPayload {
    api_name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteFunctionPayload {
    function_name: String,
    #[serde(default)]
    args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_logical_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_instance_id: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostEventPayload {
    event_name: String,
    #[serde(default)]
    data: Value,
}

fn split_result(result: &Result<Value, String>) -> (Value, Option<String>) {
    match result {
        Ok(value) => (value.clone(), None),
        Err(message) => (Value::Null, Some(message.clone())),
    }
}

fn join_result(payload: Value, error: Option<String>) -> Result<Value, String> {
    match error {
        Some(message) => Err(message),
        None => Ok(payload),
    }
}

impl Envelope {
    /// The envelope's type tag.
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::ApiRequest { .. } => EnvelopeKind::ApiRequest,
            Self::ApiResponse { .. } => EnvelopeKind::ApiResponse,
            Self::ExecuteFunction { .. } => EnvelopeKind::ExecuteFunction,
            Self::FunctionResponse { .. } => EnvelopeKind::FunctionResponse,
            Self::HostEvent { .. } => EnvelopeKind::HostEvent,
            Self::McpOutgoingMessage { .. } => EnvelopeKind::McpOutgoingMessage,
            Self::LlmCallRequest { .. } => EnvelopeKind::LlmCallRequest,
            Self::LlmCallChunk { .. } => EnvelopeKind::LlmCallChunk,
            Self::LlmCallResponse { .. } => EnvelopeKind::LlmCallResponse,
        }
    }

    /// The correlation id, if this kind carries one.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::ApiRequest { correlation_id, .. }
            | Self::ApiResponse { correlation_id, .. }
            | Self::ExecuteFunction { correlation_id, .. }
            | Self::FunctionResponse { correlation_id, .. }
            | Self::LlmCallRequest { correlation_id, .. }
            | Self::LlmCallChunk { correlation_id, .. }
            | Self::LlmCallResponse { correlation_id, .. } => Some(correlation_id),
            Self::HostEvent { .. } | Self::McpOutgoingMessage { .. } => None,
        }
    }

    /// Convert to the wire form.
    pub fn to_wire(&self) -> WireEnvelope {
        let kind = self.kind();
        let correlation_id = self.correlation_id().map(str::to_string);
        let (payload, error) = match self {
            Self::ApiRequest { api_name, args, .. } => (
                serde_json::json!({ "apiName": api_name, "args": args }),
                None,
            ),
            Self::ExecuteFunction { call, .. } => {
                let mut obj = Map::new();
                obj.insert(
                    "functionName".into(),
                    Value::String(call.function_name.clone()),
                );
                obj.insert("args".into(), call.args.clone());
                match &call.target {
                    Some(PeerTarget::Logical(id)) => {
                        obj.insert("targetLogicalId".into(), Value::String(id.clone()));
                    }
                    Some(PeerTarget::Instance(id)) => {
                        obj.insert("targetInstanceId".into(), Value::String(id.clone()));
                    }
                    None => {}
                }
                (Value::Object(obj), None)
            }
            Self::HostEvent { event_name, data } => (
                serde_json::json!({ "eventName": event_name, "data": data }),
                None,
            ),
            Self::McpOutgoingMessage { message } => (message.clone(), None),
            Self::LlmCallRequest { request, .. } => (request.clone(), None),
            Self::LlmCallChunk { chunk, .. } => (chunk.clone(), None),
            Self::ApiResponse { result, .. }
            | Self::FunctionResponse { result, .. }
            | Self::LlmCallResponse { result, .. } => split_result(result),
        };
        encode(kind, payload, correlation_id, error)
    }

    /// Convert to a JSON object ready to be sent.
    pub fn to_value(&self) -> Value {
        self.to_wire().into_value()
    }

    /// Decode a raw inbound value, reporting why it was rejected.
    ///
    /// Fails with [`BridgeError::MalformedEnvelope`] when the value is not an
    /// envelope object, the tag is unknown, or a field required by that tag
    /// is missing.
    pub fn try_decode(raw: &Value) -> Result<Self, BridgeError> {
        let wire = WireEnvelope::deserialize(raw)
            .map_err(|e| BridgeError::MalformedEnvelope(e.to_string()))?;
        Self::from_wire(wire).map_err(BridgeError::MalformedEnvelope)
    }

    /// Decode a raw inbound value. Returns `None` (and logs) when it is
    /// malformed.
    pub fn decode(raw: &Value) -> Option<Self> {
        match Self::try_decode(raw) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed envelope");
                None
            }
        }
    }

    /// Decode raw JSON bytes.
    pub fn decode_slice(bytes: &[u8]) -> Option<Self> {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(raw) => Self::decode(&raw),
            Err(e) => {
                tracing::warn!(error = %e, "dropping envelope that is not valid JSON");
                None
            }
        }
    }

    /// Validate a wire envelope against the contract of its tag.
    pub fn from_wire(wire: WireEnvelope) -> Result<Self, String> {
        let kind = wire.kind;
        let correlation_id = match (kind.requires_correlation_id(), wire.correlation_id) {
            (true, Some(id)) if !id.is_empty() => id,
            (true, _) => return Err(format!("{kind} requires a correlationId")),
            (false, _) => String::new(),
        };

        let envelope = match kind {
            EnvelopeKind::ApiRequest => {
                let p: ApiRequestPayload = serde_json::from_value(wire.payload)
                    .map_err(|e| format!("invalid apiRequest payload: {e}"))?;
                Self::ApiRequest {
                    correlation_id,
                    api_name: p.api_name,
                    args: p.args,
                }
            }
            EnvelopeKind::ApiResponse => Self::ApiResponse {
                correlation_id,
                result: join_result(wire.payload, wire.error),
            },
            EnvelopeKind::ExecuteFunction => {
                let p: ExecuteFunctionPayload = serde_json::from_value(wire.payload)
                    .map_err(|e| format!("invalid executeFunction payload: {e}"))?;
                let target = match (p.target_instance_id, p.target_logical_id) {
                    (Some(instance), _) => Some(PeerTarget::Instance(instance)),
                    (None, Some(logical)) => Some(PeerTarget::Logical(logical)),
                    (None, None) => None,
                };
                Self::ExecuteFunction {
                    correlation_id,
                    call: FunctionCall {
                        function_name: p.function_name,
                        args: p.args,
                        target,
                    },
                }
            }
            EnvelopeKind::FunctionResponse => Self::FunctionResponse {
                correlation_id,
                result: join_result(wire.payload, wire.error),
            },
            EnvelopeKind::HostEvent => {
                let p: HostEventPayload = serde_json::from_value(wire.payload)
                    .map_err(|e| format!("invalid hostEvent payload: {e}"))?;
                Self::HostEvent {
                    event_name: p.event_name,
                    data: p.data,
                }
            }
            EnvelopeKind::McpOutgoingMessage => Self::McpOutgoingMessage {
                message: wire.payload,
            },
            EnvelopeKind::LlmCallRequest => Self::LlmCallRequest {
                correlation_id,
                request: wire.payload,
            },
            EnvelopeKind::LlmCallChunk => Self::LlmCallChunk {
                correlation_id,
                chunk: wire.payload,
            },
            EnvelopeKind::LlmCallResponse => Self::LlmCallResponse {
                correlation_id,
                result: join_result(wire.payload, wire.error),
            },
        };
        Ok(envelope)
    }
}
