#![warn(missing_docs)]

//! miniapp-bridge host
//!
//! Runs the configured sandbox instances as worker children, relays the
//! configured external MCP processes to them, and serves the host APIs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bridge_config::{BridgeConfig, InstanceConfig, ServerConfig};
use bridge_core::child::{find_worker_binary, spawn_instance, ChildInstance, WORKER_BINARY_NAME};
use bridge_core::HostBridge;
use bridge_mcp::{ExternalProcessRegistry, ProcessEvent};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Event broadcast once every configured instance has been started.
const HOST_READY_EVENT: &str = "host-ready";

/// Environment variable naming the config file.
const CONFIG_ENV: &str = "MINIAPP_BRIDGE_CONFIG";

/// Config file picked up from the working directory.
const DEFAULT_CONFIG_FILE: &str = "bridge.toml";

/// The config file to load, if any.
///
/// An explicit [`CONFIG_ENV`] must name an existing file; without it,
/// `./bridge.toml` is used when present.
fn find_config_file() -> Result<Option<PathBuf>> {
    if let Some(path) = std::env::var_os(CONFIG_ENV).map(PathBuf::from) {
        anyhow::ensure!(
            path.is_file(),
            "{CONFIG_ENV} points at {}, which is not a file",
            path.display()
        );
        return Ok(Some(path));
    }
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    Ok(local.is_file().then_some(local))
}

/// Resolve the program for an instance entry.
///
/// The bare worker name is looked up with [`find_worker_binary`]; anything
/// else must be an absolute path because instances start with an empty
/// environment.
fn resolve_instance_program(instance: &InstanceConfig) -> Result<PathBuf> {
    if instance.command == WORKER_BINARY_NAME {
        return Ok(find_worker_binary()?);
    }
    let path = Path::new(&instance.command);
    if !path.is_absolute() {
        anyhow::bail!(
            "instance command must be an absolute path or '{}', got: {}",
            WORKER_BINARY_NAME,
            instance.command
        );
    }
    Ok(path.to_path_buf())
}

/// Spawn every configured instance. Failures are logged and skipped.
fn spawn_instances(host: &HostBridge, instances: &HashMap<String, InstanceConfig>) -> Vec<ChildInstance> {
    let mut logical_ids: Vec<&String> = instances.keys().collect();
    logical_ids.sort();

    let mut children = Vec::new();
    for logical_id in logical_ids {
        let instance = &instances[logical_id];
        let spawned = resolve_instance_program(instance)
            .and_then(|program| Ok(spawn_instance(host, logical_id, &program, &instance.args)?));
        match spawned {
            Ok(child) => children.push(child),
            Err(e) => {
                tracing::error!(logical_id = %logical_id, error = %e, "failed to start instance");
            }
        }
    }
    children
}

/// Register the host APIs every sandbox may call.
fn register_host_apis(
    host: &HostBridge,
    config: &BridgeConfig,
    processes: &ExternalProcessRegistry,
) {
    host.register_sync_api("log", |ctx, args| {
        tracing::info!(
            instance_id = ctx.caller_instance_id.as_deref().unwrap_or("-"),
            logical_id = ctx.caller_logical_id.as_deref().unwrap_or("-"),
            message = %args,
            "miniapp log"
        );
        Ok(Value::Null)
    });

    let instances = config.instances.clone();
    host.register_sync_api("getOwnConfig", move |ctx, _args| {
        let logical_id = ctx
            .caller_logical_id
            .context("caller has no logical id")?;
        let description = instances
            .get(&logical_id)
            .and_then(|i| i.description.clone());
        Ok(json!({
            "logicalId": logical_id,
            "instanceId": ctx.caller_instance_id,
            "description": description,
        }))
    });

    let servers = config.servers.clone();
    let registry = processes.clone();
    host.register_sync_api("startServer", move |_ctx, args| {
        let name = required_str(&args, "name")?;
        let server = servers
            .get(name)
            .with_context(|| format!("no server configured under '{name}'"))?;
        let process_id = registry.start(&server.command, &server.args)?;
        Ok(json!({ "processId": process_id }))
    });

    let registry = processes.clone();
    host.register_sync_api("sendToProcess", move |_ctx, args| {
        let process_id = required_str(&args, "processId")?;
        let message = match &args["message"] {
            Value::String(s) => s.clone(),
            Value::Null => anyhow::bail!("missing 'message'"),
            other => other.to_string(),
        };
        registry.send(process_id, &message)?;
        Ok(Value::Null)
    });

    let registry = processes.clone();
    host.register_sync_api("stopProcess", move |_ctx, args| {
        registry.stop(required_str(&args, "processId")?)?;
        Ok(Value::Null)
    });
}

fn required_str<'a>(args: &'a Value, field: &str) -> Result<&'a str> {
    args[field]
        .as_str()
        .with_context(|| format!("missing string field '{field}'"))
}

/// Start every configured external process. Returns name → process id.
fn start_servers(
    processes: &ExternalProcessRegistry,
    servers: &HashMap<String, ServerConfig>,
) -> HashMap<String, String> {
    let mut started = HashMap::new();
    for (name, server) in servers {
        match processes.start(&server.command, &server.args) {
            Ok(process_id) => {
                tracing::info!(server = %name, process_id = %process_id, "external server started");
                started.insert(name.clone(), process_id);
            }
            Err(e) => tracing::error!(server = %name, error = %e, "failed to start external server"),
        }
    }
    started
}

/// The host event name and payload announcing a process event.
fn process_event_broadcast(event: ProcessEvent) -> (&'static str, Value) {
    match event {
        ProcessEvent::Message { process_id, line } => {
            ("process-message", json!({ "processId": process_id, "line": line }))
        }
        ProcessEvent::Stderr { process_id, line } => {
            ("process-stderr", json!({ "processId": process_id, "line": line }))
        }
        ProcessEvent::Error { process_id, message } => {
            ("process-error", json!({ "processId": process_id, "message": message }))
        }
        ProcessEvent::Closed {
            process_id,
            exit_code,
        } => ("process-closed", json!({ "processId": process_id, "exitCode": exit_code })),
    }
}

/// Relay process events to every instance until the registry goes away.
async fn relay_process_events(host: HostBridge, mut events: mpsc::UnboundedReceiver<ProcessEvent>) {
    while let Some(event) = events.recv().await {
        let (name, data) = process_event_broadcast(event);
        host.broadcast(name, data);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("miniapp-bridge {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match find_config_file()? {
        Some(path) => {
            tracing::info!(path = %path.display(), "loading config");
            BridgeConfig::from_file_with_env(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?
        }
        None => {
            tracing::info!("no config file found, starting with no instances");
            BridgeConfig::from_toml("")?
        }
    };

    let host = HostBridge::new(config.settings());
    let (processes, process_events) = ExternalProcessRegistry::new();
    register_host_apis(&host, &config, &processes);
    let relay = tokio::spawn(relay_process_events(host.clone(), process_events));

    let servers = start_servers(&processes, &config.servers);
    let mut children = spawn_instances(&host, &config.instances);
    tracing::info!(
        instances = children.len(),
        servers = servers.len(),
        "miniapp bridge running"
    );
    host.broadcast(
        HOST_READY_EVENT,
        json!({ "servers": servers, "version": env!("CARGO_PKG_VERSION") }),
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("received shutdown signal, stopping gracefully");

    host.shutdown("host shutting down");
    processes.stop_all();
    for child in &mut children {
        if let Err(e) = child.kill().await {
            tracing::debug!(instance_id = %child.instance_id(), error = %e, "instance already gone");
        }
    }
    relay.abort();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn instance(command: &str) -> InstanceConfig {
        InstanceConfig {
            command: command.into(),
            args: vec![],
            description: Some("Notes miniapp".into()),
        }
    }

    #[test]
    fn absolute_instance_command_is_used_as_is() {
        let program = resolve_instance_program(&instance("/usr/local/bin/notes")).unwrap();
        assert_eq!(program, PathBuf::from("/usr/local/bin/notes"));
    }

    #[test]
    fn relative_instance_command_is_rejected() {
        let err = resolve_instance_program(&instance("notes-worker")).unwrap_err();
        assert!(err.to_string().contains("absolute path"), "got: {err}");
    }

    #[test]
    #[serial]
    fn config_file_from_env_var() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(&path, "[bridge]\ndefault_timeout_ms = 500\n").unwrap();

        std::env::set_var(CONFIG_ENV, &path);
        let found = find_config_file();
        std::env::remove_var(CONFIG_ENV);

        assert_eq!(found.unwrap(), Some(path));
    }

    #[test]
    #[serial]
    fn config_env_var_to_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(CONFIG_ENV, dir.path().join("absent.toml"));
        let found = find_config_file();
        std::env::remove_var(CONFIG_ENV);

        let err = found.unwrap_err();
        assert!(err.to_string().contains("not a file"), "got: {err}");
    }

    #[test]
    fn process_events_map_to_host_events() {
        let (name, data) = process_event_broadcast(ProcessEvent::Closed {
            process_id: "p1".into(),
            exit_code: Some(0),
        });
        assert_eq!(name, "process-closed");
        assert_eq!(data, json!({"processId": "p1", "exitCode": 0}));

        let (name, data) = process_event_broadcast(ProcessEvent::Message {
            process_id: "p1".into(),
            line: "{}".into(),
        });
        assert_eq!(name, "process-message");
        assert_eq!(data["line"], "{}");
    }

    #[tokio::test]
    async fn own_config_reports_the_caller() {
        let config = BridgeConfig::from_toml(
            "[instances.notes]\ncommand = \"/bin/notes\"\ndescription = \"Notes miniapp\"\n",
        )
        .unwrap();
        let host = HostBridge::default();
        let (processes, _events) = ExternalProcessRegistry::new();
        register_host_apis(&host, &config, &processes);

        let notes = host.connect_in_process("notes");
        let own = notes.runtime.call("getOwnConfig", Value::Null, None).await.unwrap();
        assert_eq!(own["logicalId"], "notes");
        assert_eq!(own["description"], "Notes miniapp");
        assert_eq!(own["instanceId"], json!(notes.instance_id));
    }

    #[tokio::test]
    async fn unknown_server_name_is_an_error() {
        let host = HostBridge::default();
        let (processes, _events) = ExternalProcessRegistry::new();
        register_host_apis(&host, &BridgeConfig::default(), &processes);

        let notes = host.connect_in_process("notes");
        let err = notes
            .runtime
            .call("startServer", json!({"name": "fs"}), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no server configured under 'fs'"), "got: {err}");
        assert!(processes.is_empty());
    }

    #[test]
    fn version_matches_workspace() {
        assert_eq!(env!("CARGO_PKG_VERSION"), "0.3.0");
    }
}
