//! Sandbox instances running as child processes.
//!
//! The child speaks length-delimited envelope frames over stdin/stdout (see
//! [`crate::ipc`]). The host side attaches it like any other instance: a
//! writer task drains the instance's channel into the child's stdin, a
//! reader task feeds the child's stdout into [`HostBridge::handle_inbound`]
//! and detaches the instance when stdout closes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bridge_error::BridgeError;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::host::HostBridge;
use crate::ipc::{read_frame_with_limit, write_frame};
use crate::registry::ChannelSink;

/// File name of the sandbox worker binary.
pub const WORKER_BINARY_NAME: &str = "miniapp-bridge-worker";

/// Environment variable naming the worker binary (absolute path).
pub const WORKER_BIN_ENV: &str = "MINIAPP_BRIDGE_WORKER_BIN";

/// Environment variable that, when set, lets child stderr through.
pub const DEBUG_ENV: &str = "MINIAPP_BRIDGE_DEBUG";

/// A sandbox instance hosted in a child process.
#[derive(Debug)]
pub struct ChildInstance {
    instance_id: String,
    logical_id: String,
    child: Child,
}

impl ChildInstance {
    /// The instance id assigned by the host.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The miniapp definition this instance runs.
    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    /// OS process id, while the child is running.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kill the child. Its stdout closes, which detaches the instance.
    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }

    /// Wait for the child to exit on its own.
    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }
}

/// Spawn `program` with a clean environment and attach it to `host` as an
/// instance of `logical_id`.
///
/// Must be called within a Tokio runtime.
pub fn spawn_instance(
    host: &HostBridge,
    logical_id: &str,
    program: &Path,
    args: &[String],
) -> Result<ChildInstance, BridgeError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(if std::env::var(DEBUG_ENV).is_ok() {
            std::process::Stdio::inherit()
        } else {
            std::process::Stdio::null()
        })
        .env_clear()
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            BridgeError::Internal(anyhow::anyhow!(
                "failed to spawn instance at {}: {}",
                program.display(),
                e
            ))
        })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| BridgeError::Internal(anyhow::anyhow!("no stdin on child")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BridgeError::Internal(anyhow::anyhow!("no stdout on child")))?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let instance_id = host.attach_instance(logical_id, Arc::new(ChannelSink::new(tx)));

    let id = instance_id.clone();
    tokio::spawn(async move {
        while let Some(raw) = rx.recv().await {
            if let Err(e) = write_frame(&mut stdin, &raw).await {
                tracing::warn!(instance_id = %id, error = %e, "write to child failed");
                break;
            }
        }
    });

    let host = host.clone();
    let id = instance_id.clone();
    let max_size = host.settings().max_ipc_message_size;
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        loop {
            match read_frame_with_limit(&mut reader, max_size).await {
                Ok(Some(raw)) => {
                    host.handle_inbound(&id, &raw);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(instance_id = %id, error = %e, "read from child failed");
                    break;
                }
            }
        }
        host.detach_instance(&id);
    });

    tracing::info!(
        instance_id = %instance_id,
        logical_id = %logical_id,
        program = %program.display(),
        pid = child.id(),
        "spawned child instance"
    );

    Ok(ChildInstance {
        instance_id,
        logical_id: logical_id.to_string(),
        child,
    })
}

fn lookup_error(message: String) -> BridgeError {
    BridgeError::Internal(anyhow::Error::msg(message))
}

/// Find the sandbox worker binary.
///
/// [`WORKER_BIN_ENV`], when set, must name an existing absolute path.
/// Otherwise the worker is looked up next to the current executable and
/// one directory up (the `target/<profile>/deps` layout of test binaries).
pub fn find_worker_binary() -> Result<PathBuf, BridgeError> {
    if let Some(path) = std::env::var_os(WORKER_BIN_ENV).map(PathBuf::from) {
        if !path.is_absolute() {
            return Err(lookup_error(format!(
                "{WORKER_BIN_ENV} must be an absolute path, got: {}",
                path.display()
            )));
        }
        if !path.exists() {
            return Err(lookup_error(format!(
                "{WORKER_BIN_ENV} points at {}, which does not exist",
                path.display()
            )));
        }
        check_worker_binary(&path)?;
        return Ok(path);
    }

    let exe = std::env::current_exe().ok();
    let found = exe
        .iter()
        .flat_map(|exe| exe.ancestors().skip(1).take(2))
        .map(|dir| dir.join(WORKER_BINARY_NAME))
        .find(|candidate| candidate.is_file());
    match found {
        Some(worker) => {
            check_worker_binary(&worker)?;
            Ok(worker)
        }
        None => Err(lookup_error(format!(
            "{WORKER_BINARY_NAME} binary not found. Set {WORKER_BIN_ENV} or install it alongside miniapp-bridge"
        ))),
    }
}

/// A worker binary must be executable and must not be world-writable.
#[cfg(unix)]
fn check_worker_binary(path: &Path) -> Result<(), BridgeError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)
        .map_err(|e| lookup_error(format!("cannot inspect worker binary {}: {e}", path.display())))?
        .permissions()
        .mode();
    if mode & 0o002 != 0 {
        return Err(lookup_error(format!(
            "insecure permissions on worker binary {}: mode {mode:o} is world-writable",
            path.display()
        )));
    }
    if mode & 0o111 == 0 {
        return Err(lookup_error(format!(
            "worker binary {} is not executable (mode {mode:o})",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_worker_binary(_path: &Path) -> Result<(), BridgeError> {
    Ok(())
}
