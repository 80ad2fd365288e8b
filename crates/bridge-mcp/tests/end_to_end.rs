//! End-to-end tests for MCP tunneled through the miniapp bridge.
//!
//! An rmcp server runs on the sandbox side of an in-process instance; the
//! host connects an `McpTunnelClient` to it through a transport session and
//! exercises tool discovery and tool calls.

use std::time::Duration;

use bridge_core::{HostBridge, InProcessInstance, SessionState};
use bridge_mcp::{McpTunnelClient, TunnelIo};
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars::JsonSchema;
use rmcp::{tool, tool_handler, tool_router, ServerHandler, ServiceExt};
use serde::Deserialize;
use serde_json::json;

#[derive(Clone)]
struct NotesServer {
    tool_router: ToolRouter<Self>,
}

impl NotesServer {
    fn new() -> Self {
        Self {
            tool_router: Self::tool_router(),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct EchoInput {
    /// The message to echo back.
    message: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct AddInput {
    /// First number.
    a: f64,
    /// Second number.
    b: f64,
}

#[tool_router(router = tool_router)]
impl NotesServer {
    /// Echo a message back.
    #[tool(name = "echo", description = "Echo a message back unchanged")]
    async fn echo(&self, Parameters(input): Parameters<EchoInput>) -> Result<String, String> {
        Ok(json!({ "echoed": input.message }).to_string())
    }

    /// Add two numbers.
    #[tool(name = "math.add", description = "Add two numbers together")]
    async fn add(&self, Parameters(input): Parameters<AddInput>) -> Result<String, String> {
        Ok(json!({ "result": input.a + input.b }).to_string())
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for NotesServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            instructions: Some("Notes miniapp test server".into()),
            server_info: Implementation {
                name: "notes-test-server".into(),
                version: "0.1.0".into(),
                title: None,
                description: None,
                icons: None,
                website_url: None,
            },
            ..Default::default()
        }
    }
}

/// Attach an in-process `notes` instance running the test server.
fn notes_instance(host: &HostBridge) -> InProcessInstance {
    let notes = host.connect_in_process("notes");
    let io = TunnelIo::for_sandbox(&notes.runtime);
    tokio::spawn(async move {
        let service = NotesServer::new().serve(io.into_split()).await?;
        service.waiting().await?;
        Ok::<_, anyhow::Error>(())
    });
    notes
}

#[tokio::test]
async fn client_discovers_and_calls_tunneled_tools() {
    let host = HostBridge::default();
    let _notes = notes_instance(&host);

    let client = McpTunnelClient::connect(host.transport("notes")).await.unwrap();
    assert_eq!(client.session().state(), SessionState::Connected);

    let tools = client.list_tools().await.unwrap();
    let mut names: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();
    names.sort();
    assert_eq!(names, vec!["echo".to_string(), "math.add".to_string()]);
    let echo = tools.iter().find(|t| t.name == "echo").unwrap();
    assert!(echo.input_schema["properties"]["message"].is_object());

    let echoed = client.call_tool("echo", json!({"message": "hi"})).await.unwrap();
    assert_eq!(echoed, json!({"echoed": "hi"}));

    let sum = client.call_tool("math.add", json!({"a": 2, "b": 3})).await.unwrap();
    assert_eq!(sum, json!({"result": 5.0}));

    let session = client.session().clone();
    client.disconnect().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(host.bindings().is_empty());
}

#[tokio::test]
async fn non_object_arguments_are_rejected_locally() {
    let host = HostBridge::default();
    let _notes = notes_instance(&host);
    let client = McpTunnelClient::connect(host.transport("notes")).await.unwrap();

    let err = client.call_tool("echo", json!([1, 2])).await.unwrap_err();
    assert!(err.to_string().contains("must be an object"), "got: {err}");
    client.disconnect().await.unwrap();
}

#[tokio::test]
async fn connect_without_instance_fails() {
    let host = HostBridge::default();
    let err = McpTunnelClient::connect(host.transport("weather")).await.unwrap_err();
    assert!(format!("{err:#}").contains("no active instance for 'weather'"), "got: {err:#}");
}

#[tokio::test]
async fn tool_calls_fail_after_instance_detaches() {
    let host = HostBridge::default();
    let notes = notes_instance(&host);
    let client = McpTunnelClient::connect(host.transport("notes")).await.unwrap();

    host.detach_instance(&notes.instance_id);
    assert_eq!(client.session().state(), SessionState::Errored);

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        client.call_tool("echo", json!({"message": "late"})),
    )
    .await
    .expect("call should fail promptly once the tunnel is gone");
    assert!(result.is_err());
}
