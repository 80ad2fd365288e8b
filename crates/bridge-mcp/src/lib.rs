#![warn(missing_docs)]

//! # bridge-mcp
//!
//! MCP plumbing for the miniapp bridge.
//!
//! A miniapp may run an MCP server inside its sandbox. The host reaches it
//! through a [`TransportSession`](bridge_core::TransportSession): [`TunnelIo`]
//! turns either end of that tunnel into the byte streams rmcp expects, and
//! [`McpTunnelClient`] runs an rmcp client over it. MCP servers that live
//! outside any sandbox run as plain stdio processes managed by
//! [`ExternalProcessRegistry`].

pub mod client;
pub mod process;
pub mod tunnel;

pub use client::{McpTunnelClient, ToolInfo};
pub use process::{ExternalProcessRegistry, ProcessEvent};
pub use tunnel::TunnelIo;
