//! miniapp sandbox worker: one sandbox instance in its own process.
//!
//! Spawned by the host through `bridge_core::child::spawn_instance`. Stdin
//! carries envelope frames from the host, stdout carries frames back; logs go
//! to stderr, which the host discards unless `MINIAPP_BRIDGE_DEBUG` is set.
//!
//! **Security**: This process runs with a clean environment, no credentials
//! and no inherited file descriptors beyond stdio.

use anyhow::{Context, Result};
use bridge_config::DEFAULT_CALL_TIMEOUT;
use bridge_core::ipc::{read_frame_with_limit, write_frame, DEFAULT_MAX_IPC_MESSAGE_SIZE};
use bridge_core::{ChannelSink, SandboxRuntime};
use serde_json::{json, Value};
use tokio::io::{self, BufReader};

/// Install the functions every worker exposes to the host and its peers.
fn register_builtin_functions(runtime: &SandboxRuntime) {
    runtime.register_sync_function("ping", |_ctx, _args| Ok(json!("pong")));
    runtime.register_sync_function("echo", |_ctx, args| Ok(args));

    let inspected = runtime.downgrade();
    runtime.register_sync_function("describe", move |_ctx, _args| {
        let runtime = inspected.upgrade().context("worker runtime is shutting down")?;
        Ok(json!({
            "worker": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "functions": runtime.functions().names(),
        }))
    });
}

/// Log host events and acknowledge the host becoming ready.
fn subscribe_host_events(runtime: &SandboxRuntime) {
    let announcer = runtime.downgrade();
    runtime.on_host_event("host-ready", move |data| {
        tracing::debug!(data = %data, "host ready");
        let Some(runtime) = announcer.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = runtime.call("log", json!({"event": "worker-ready"}), None).await {
                tracing::warn!(error = %e, "host did not acknowledge readiness");
            }
        });
    });
    runtime.on_host_event("theme-changed", |data| {
        tracing::debug!(data = %data, "theme changed");
    });
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .init();

    let (sink, mut outbound) = ChannelSink::pair();
    let runtime = SandboxRuntime::new(sink, DEFAULT_CALL_TIMEOUT);
    register_builtin_functions(&runtime);
    subscribe_host_events(&runtime);

    let writer = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(raw) = outbound.recv().await {
            write_frame(&mut stdout, &raw)
                .await
                .context("failed to write frame to host")?;
        }
        Ok::<_, anyhow::Error>(())
    });

    let mut stdin = BufReader::new(io::stdin());
    loop {
        match read_frame_with_limit(&mut stdin, DEFAULT_MAX_IPC_MESSAGE_SIZE).await {
            Ok(Some(raw)) => runtime.handle_inbound(&raw),
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "failed to read from host");
                break;
            }
        }
    }

    runtime.shutdown("host closed stdin");
    writer.await.context("writer task panicked")??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::{Envelope, FunctionCall};
    use tokio::sync::mpsc;

    fn worker() -> (SandboxRuntime, mpsc::UnboundedReceiver<Value>) {
        let (sink, rx) = ChannelSink::pair();
        let runtime = SandboxRuntime::new(sink, DEFAULT_CALL_TIMEOUT);
        register_builtin_functions(&runtime);
        subscribe_host_events(&runtime);
        (runtime, rx)
    }

    fn execute(name: &str, args: Value) -> Value {
        Envelope::ExecuteFunction {
            correlation_id: format!("host:{name}_1"),
            call: FunctionCall::new(name, args),
        }
        .to_value()
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        let (runtime, mut rx) = worker();
        runtime.handle_inbound(&execute("ping", Value::Null));
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply["type"], "functionResponse");
        assert_eq!(reply["payload"], "pong");
        assert_eq!(reply["correlationId"], "host:ping_1");
    }

    #[tokio::test]
    async fn echo_returns_its_arguments() {
        let (runtime, mut rx) = worker();
        runtime.handle_inbound(&execute("echo", json!({"a": [1, 2]})));
        assert_eq!(rx.recv().await.unwrap()["payload"], json!({"a": [1, 2]}));
    }

    #[tokio::test]
    async fn describe_lists_functions() {
        let (runtime, mut rx) = worker();
        runtime.handle_inbound(&execute("describe", Value::Null));
        let payload = rx.recv().await.unwrap()["payload"].clone();
        assert_eq!(payload["functions"], json!(["describe", "echo", "ping"]));
    }

    #[test]
    fn builtin_handlers_do_not_keep_the_runtime_alive() {
        let (runtime, _rx) = worker();
        let weak = runtime.downgrade();
        drop(runtime);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn host_ready_is_acknowledged_through_log() {
        let (runtime, mut rx) = worker();
        runtime.handle_inbound(
            &Envelope::HostEvent {
                event_name: "host-ready".into(),
                data: json!({}),
            }
            .to_value(),
        );
        let request = rx.recv().await.unwrap();
        assert_eq!(request["type"], "apiRequest");
        assert_eq!(request["payload"]["apiName"], "log");
    }
}
