//! MCP client sessions tunneled to a sandbox instance.

use std::borrow::Cow;

use anyhow::{Context, Result};
use bridge_core::{SessionState, TransportSession};
use rmcp::model::{CallToolRequestParams, CallToolResult, Content, RawContent};
use rmcp::service::RunningService;
use rmcp::{RoleClient, ServiceExt};
use serde_json::Value;

use crate::tunnel::TunnelIo;

/// A tool exposed by the MCP server inside a sandbox instance.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    /// Tool name.
    pub name: String,
    /// Tool description.
    pub description: Option<String>,
    /// JSON Schema for the tool's input parameters.
    pub input_schema: Value,
}

/// An rmcp client talking to the MCP server inside a sandbox instance
/// through a [`TransportSession`].
pub struct McpTunnelClient {
    session: TransportSession,
    service: RunningService<RoleClient, ()>,
}

impl std::fmt::Debug for McpTunnelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpTunnelClient")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl McpTunnelClient {
    /// Start `session` if it is idle and run the MCP handshake over it.
    pub async fn connect(session: TransportSession) -> Result<Self> {
        let logical_id = session.target_logical_id().to_string();
        if session.state() != SessionState::Connected {
            session
                .start()
                .await
                .with_context(|| format!("failed to start tunnel to '{logical_id}'"))?;
        }

        tracing::info!(
            logical_id = %logical_id,
            session_id = %session.session_id(),
            "connecting to tunneled MCP server"
        );

        let io = TunnelIo::for_session(&session);
        let service: RunningService<RoleClient, ()> = ()
            .serve(io.into_split())
            .await
            .with_context(|| format!("MCP handshake failed for '{logical_id}'"))?;

        tracing::info!(logical_id = %logical_id, "connected to tunneled MCP server");
        Ok(Self { session, service })
    }

    /// The session carrying this client.
    pub fn session(&self) -> &TransportSession {
        &self.session
    }

    /// List all tools the sandbox's server exposes.
    pub async fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let tools = self
            .service
            .list_all_tools()
            .await
            .with_context(|| {
                format!("failed to list tools for '{}'", self.session.target_logical_id())
            })?;

        Ok(tools
            .into_iter()
            .map(|t| ToolInfo {
                name: t.name.to_string(),
                description: t.description.map(|d: Cow<'_, str>| d.to_string()),
                input_schema: serde_json::to_value(&*t.input_schema)
                    .unwrap_or(Value::Object(Default::default())),
            })
            .collect())
    }

    /// Call a tool. Object arguments pass through; `null` becomes `{}`.
    pub async fn call_tool(&self, tool: &str, args: Value) -> Result<Value> {
        let arguments = match args {
            Value::Object(map) => Some(map),
            Value::Null => Some(serde_json::Map::new()),
            other => anyhow::bail!("tool arguments must be an object, got: {other}"),
        };

        let result: CallToolResult = self
            .service
            .call_tool(CallToolRequestParams {
                meta: None,
                name: Cow::Owned(tool.to_string()),
                arguments,
                task: None,
            })
            .await
            .with_context(|| {
                format!(
                    "tool call failed: instance='{}', tool='{}'",
                    self.session.target_logical_id(),
                    tool
                )
            })?;

        tool_result_value(tool, result)
    }

    /// End the MCP session and close the tunnel.
    pub async fn disconnect(self) -> Result<()> {
        tracing::info!(
            logical_id = %self.session.target_logical_id(),
            "disconnecting from tunneled MCP server"
        );
        let _ = self.service.cancel().await;
        self.session.close();
        Ok(())
    }
}

/// The value a tool call hands back to its caller.
///
/// Error results fail with their text. Structured content wins over the
/// content list; a single content item is returned bare.
fn tool_result_value(tool: &str, result: CallToolResult) -> Result<Value> {
    if result.is_error == Some(true) {
        let message: Vec<&str> = result
            .content
            .iter()
            .filter_map(|c| match &c.raw {
                RawContent::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect();
        anyhow::bail!("tool '{tool}' reported an error: {}", message.join("\n"));
    }
    if let Some(structured) = result.structured_content {
        return Ok(structured);
    }

    let mut values = result
        .content
        .iter()
        .map(content_value)
        .collect::<Result<Vec<_>>>()?;
    Ok(match values.len() {
        0 => Value::Null,
        1 => values.remove(0),
        _ => Value::Array(values),
    })
}

/// Text that parses as JSON becomes that JSON; other content keeps the shape
/// rmcp gives it on the wire.
fn content_value(content: &Content) -> Result<Value> {
    match &content.raw {
        RawContent::Text(t) => {
            Ok(serde_json::from_str(&t.text).unwrap_or_else(|_| Value::String(t.text.clone())))
        }
        other => serde_json::to_value(other).context("tool content could not be encoded"),
    }
}
