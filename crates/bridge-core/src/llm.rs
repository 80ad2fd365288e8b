//! LLM completion seam.
//!
//! Sandboxes ask the host for completions with `llmCallRequest`. The host
//! forwards the request to an [`LlmProvider`], streams any partial output
//! back as `llmCallChunk` envelopes and settles the call with one
//! `llmCallResponse`.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::functions::CallContext;

/// Sends partial output for one completion back to the requesting sandbox.
#[derive(Debug, Clone)]
pub struct ChunkSender {
    tx: mpsc::UnboundedSender<Value>,
}

impl ChunkSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Value>) -> Self {
        Self { tx }
    }

    /// Emit one chunk. Returns `false` once the requester is gone.
    pub fn send(&self, chunk: Value) -> bool {
        self.tx.send(chunk).is_ok()
    }
}

/// Produces completions for sandbox requests.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Complete `request` on behalf of the caller in `ctx`. Partial output may
    /// be pushed through `chunks` before returning the final result.
    async fn complete(
        &self,
        ctx: CallContext,
        request: Value,
        chunks: ChunkSender,
    ) -> anyhow::Result<Value>;
}
