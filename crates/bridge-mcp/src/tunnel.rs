//! Byte-stream view of a tunneled protocol channel.
//!
//! rmcp speaks newline-delimited JSON over an `AsyncRead`/`AsyncWrite` pair.
//! [`TunnelIo`] provides that pair on top of either end of the tunnel: a
//! host-side [`TransportSession`] or a sandbox's protocol channel. Two pump
//! tasks sit between an in-memory duplex pipe and the tunnel, one per
//! direction.

use std::sync::{Arc, Mutex};

use bridge_core::{BridgeError, SandboxRuntime, TransportSession};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

const TUNNEL_BUFFER_SIZE: usize = 64 * 1024;

type Gate = Arc<Mutex<Option<mpsc::UnboundedSender<Value>>>>;

/// An `AsyncRead`/`AsyncWrite` pair carrying one tunneled protocol session.
///
/// Reading yields the messages the peer sent, one JSON document per line.
/// Each line written is parsed and sent to the peer. Dropping the writer
/// ends the session on this side.
#[derive(Debug)]
pub struct TunnelIo {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
}

impl TunnelIo {
    /// Tunnel over a host-side session.
    ///
    /// Installs the session's message, error and close callbacks. The read
    /// side ends when the session errors or closes; closing the write side
    /// closes the session. Must be called within a Tokio runtime.
    pub fn for_session(session: &TransportSession) -> Self {
        let sender = session.clone();
        let closer = session.clone();
        let (io, tx) = Self::pipe(move |message| sender.send(message), move || closer.close());

        let gate: Gate = Arc::new(Mutex::new(Some(tx)));
        let inbound = gate.clone();
        session.set_on_message(move |message| {
            if let Some(tx) = lock(&inbound).as_ref() {
                let _ = tx.send(message);
            }
        });
        let errored = gate.clone();
        session.set_on_error(move |e| {
            tracing::debug!(error = %e, "ending tunnel after session error");
            lock(&errored).take();
        });
        session.set_on_close(move || {
            lock(&gate).take();
        });
        io
    }

    /// Tunnel over a sandbox's protocol channel.
    ///
    /// Installs the runtime's protocol handler. The read side ends when the
    /// runtime shuts down; closing the write side removes the handler. Must
    /// be called within a Tokio runtime.
    pub fn for_sandbox(runtime: &SandboxRuntime) -> Self {
        let sender = runtime.clone();
        let closer = runtime.clone();
        let (io, tx) = Self::pipe(
            move |message| sender.send_protocol(message),
            move || closer.clear_protocol_handler(),
        );
        runtime.register_protocol_handler(move |message| {
            let _ = tx.send(message);
        });
        io
    }

    /// Split into the read and write halves rmcp consumes.
    pub fn into_split(self) -> (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
        (self.reader, self.writer)
    }

    /// Spawn both pumps. Lines written to the returned io go to `send`;
    /// messages pushed into the returned sender become readable lines.
    /// `on_end` runs once the write side is closed or `send` fails.
    fn pipe<S, E>(send: S, on_end: E) -> (Self, mpsc::UnboundedSender<Value>)
    where
        S: Fn(Value) -> Result<(), BridgeError> + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        let (local, remote) = tokio::io::duplex(TUNNEL_BUFFER_SIZE);
        let (reader, writer) = tokio::io::split(remote);
        let (local_read, mut local_write) = tokio::io::split(local);
        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let mut line = match serde_json::to_vec(&message) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping unserializable protocol message");
                        continue;
                    }
                };
                line.push(b'\n');
                if local_write.write_all(&line).await.is_err() {
                    break;
                }
            }
            let _ = local_write.shutdown().await;
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(local_read).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match serde_json::from_str::<Value>(&line) {
                        Ok(message) => {
                            if let Err(e) = send(message) {
                                tracing::warn!(error = %e, "protocol message could not enter the tunnel");
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "dropping unparsable protocol line"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "tunnel read failed");
                        break;
                    }
                }
            }
            on_end();
        });

        (Self { reader, writer }, tx)
    }
}

fn lock(gate: &Gate) -> std::sync::MutexGuard<'_, Option<mpsc::UnboundedSender<Value>>> {
    gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
