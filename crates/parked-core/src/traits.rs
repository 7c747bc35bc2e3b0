//! Contracts between the pending call core and its collaborators.
//!
//! Tool handlers and the durable ledger live outside this crate
//! (parked-daemon for built-in tools, parked-ledger for the JSONL ledger).

use crate::types::{LedgerRecord, ToolCall, ToolDispatch};
use anyhow::Result;
use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Tool execution
// ---------------------------------------------------------------------------

/// Context available to a tool during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub conversation_id: String,
    pub turn_id: String,
}

/// A tool handler. It either answers right away or signals that the result
/// will be delivered later.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolDispatch>;
}

/// Dispatches tool calls to the right handler by name.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCall, ctx: &ToolContext) -> Result<ToolDispatch>;

    /// Names of all tools this executor can run.
    fn tool_names(&self) -> Vec<String>;
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Durable, append-only sink for pending call lifecycle records.
///
/// `append` must not return before the record is on stable storage; the
/// registry calls it synchronously on every register/resolve/cancel.
pub trait LedgerSink: Send + Sync {
    fn append(&self, record: &LedgerRecord) -> Result<()>;
}
