//! External stdio MCP processes relayed by the host.
//!
//! Each process gets a UUID. Lines the host sends are written to its stdin;
//! every stdout line, stderr line, read failure and the final exit surface
//! on one [`ProcessEvent`] channel. An entry is removed when its process
//! exits, whether it was stopped or died on its own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

/// Something observed on an external process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// One non-empty stdout line, trimmed.
    Message {
        /// Process the line came from.
        process_id: String,
        /// The line.
        line: String,
    },
    /// One non-empty stderr line, trimmed.
    Stderr {
        /// Process the line came from.
        process_id: String,
        /// The line.
        line: String,
    },
    /// Reading stdout failed.
    Error {
        /// Process that failed.
        process_id: String,
        /// What went wrong.
        message: String,
    },
    /// The process exited and its entry was removed.
    Closed {
        /// Process that exited.
        process_id: String,
        /// Exit code, when the process exited normally.
        exit_code: Option<i32>,
    },
}

struct ProcessEntry {
    stdin: mpsc::UnboundedSender<String>,
    stop: Option<oneshot::Sender<()>>,
}

/// Table of running external processes.
#[derive(Clone)]
pub struct ExternalProcessRegistry {
    entries: Arc<Mutex<HashMap<String, ProcessEntry>>>,
    events: mpsc::UnboundedSender<ProcessEvent>,
}

impl std::fmt::Debug for ExternalProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalProcessRegistry")
            .field("processes", &self.ids())
            .finish()
    }
}

impl ExternalProcessRegistry {
    /// An empty registry and the receiver for its events.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProcessEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                entries: Arc::new(Mutex::new(HashMap::new())),
                events,
            },
            rx,
        )
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProcessEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn `command` with `args` and return its process id.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start(&self, command: &str, args: &[String]) -> Result<String> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start external process '{command}'"))?;

        let process_id = uuid::Uuid::new_v4().to_string();
        let mut stdin = child.stdin.take().context("no stdin on external process")?;
        let stdout = child.stdout.take().context("no stdout on external process")?;
        let stderr = child.stderr.take().context("no stderr on external process")?;

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        let (stop_tx, stop_rx) = oneshot::channel();
        self.entries().insert(
            process_id.clone(),
            ProcessEntry {
                stdin: stdin_tx,
                stop: Some(stop_tx),
            },
        );

        let id = process_id.clone();
        tokio::spawn(async move {
            while let Some(message) = stdin_rx.recv().await {
                if let Err(e) = stdin.write_all(message.as_bytes()).await {
                    tracing::warn!(process_id = %id, error = %e, "write to external process failed");
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        tokio::spawn(forward_lines(stdout, process_id.clone(), self.events.clone(), true));
        tokio::spawn(forward_lines(stderr, process_id.clone(), self.events.clone(), false));

        let registry = self.clone();
        let id = process_id.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = stop_rx => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(process_id = %id, error = %e, "failed to kill external process");
                    }
                    child.wait().await
                }
            };
            registry.entries().remove(&id);
            let exit_code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(process_id = %id, error = %e, "waiting for external process failed");
                    None
                }
            };
            tracing::info!(process_id = %id, ?exit_code, "external process exited");
            let _ = registry.events.send(ProcessEvent::Closed {
                process_id: id,
                exit_code,
            });
        });

        tracing::info!(process_id = %process_id, command = %command, args = ?args, "external process started");
        Ok(process_id)
    }

    /// Write `message` to the process's stdin, newline-terminated.
    pub fn send(&self, process_id: &str, message: &str) -> Result<()> {
        let entries = self.entries();
        let entry = entries
            .get(process_id)
            .with_context(|| format!("process not found: {process_id}"))?;
        let mut line = message.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        entry
            .stdin
            .send(line)
            .map_err(|_| anyhow::anyhow!("stdin of process {process_id} is closed"))
    }

    /// Kill the process. Its entry is removed once it has exited.
    pub fn stop(&self, process_id: &str) -> Result<()> {
        let stop = self
            .entries()
            .get_mut(process_id)
            .with_context(|| format!("process not found: {process_id}"))?
            .stop
            .take();
        match stop {
            Some(stop) => {
                let _ = stop.send(());
                Ok(())
            }
            None => {
                tracing::debug!(process_id = %process_id, "stop already requested");
                Ok(())
            }
        }
    }

    /// Ids of the running processes, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of running processes.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether no process is running.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Kill every running process.
    pub fn stop_all(&self) {
        for id in self.ids() {
            let _ = self.stop(&id);
        }
    }
}

async fn forward_lines<R>(
    stream: R,
    process_id: String,
    events: mpsc::UnboundedSender<ProcessEvent>,
    is_stdout: bool,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let line = line.to_string();
                let event = if is_stdout {
                    ProcessEvent::Message {
                        process_id: process_id.clone(),
                        line,
                    }
                } else {
                    tracing::debug!(process_id = %process_id, line = %line, "external process stderr");
                    ProcessEvent::Stderr {
                        process_id: process_id.clone(),
                        line,
                    }
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                if is_stdout {
                    let _ = events.send(ProcessEvent::Error {
                        process_id: process_id.clone(),
                        message: format!("error reading stdout: {e}"),
                    });
                }
                break;
            }
        }
    }
}
