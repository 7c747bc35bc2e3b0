//! Fake implementations for testing.
#![allow(clippy::unwrap_used)]

use crate::traits::{LedgerSink, Tool, ToolContext};
use crate::types::{LedgerRecord, PendingSignal, ToolCall, ToolDispatch, ToolOutput};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// MemoryLedger
// ---------------------------------------------------------------------------

/// In-memory ledger for testing.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: Mutex<Vec<LedgerRecord>>,
    fail: Mutex<bool>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LedgerRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Make subsequent appends fail, as a full disk would.
    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

impl LedgerSink for MemoryLedger {
    fn append(&self, record: &LedgerRecord) -> Result<()> {
        if *self.fail.lock().unwrap() {
            anyhow::bail!("ledger unavailable");
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeTool
// ---------------------------------------------------------------------------

/// Tool that answers immediately with a canned output.
#[derive(Debug)]
pub struct FakeTool {
    pub name: String,
    pub output: Mutex<ToolOutput>,
}

impl FakeTool {
    pub fn new(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: Mutex::new(ToolOutput::success(output)),
        }
    }
}

#[async_trait]
impl Tool for FakeTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _call: &ToolCall, _ctx: &ToolContext) -> Result<ToolDispatch> {
        Ok(ToolDispatch::Ready(self.output.lock().unwrap().clone()))
    }
}

// ---------------------------------------------------------------------------
// PendingTool
// ---------------------------------------------------------------------------

/// Tool that always reports its result as pending.
#[derive(Debug)]
pub struct PendingTool {
    pub name: String,
    pub note: Option<String>,
}

impl PendingTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            note: None,
        }
    }

    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

#[async_trait]
impl Tool for PendingTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> Result<ToolDispatch> {
        Ok(ToolDispatch::Pending(PendingSignal {
            call_id: call.id.clone(),
            tool_name: self.name.clone(),
            note: self.note.clone(),
        }))
    }
}

// ---------------------------------------------------------------------------
// FailingTool
// ---------------------------------------------------------------------------

/// Tool whose handler errors out.
#[derive(Debug)]
pub struct FailingTool {
    pub name: String,
}

impl FailingTool {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _call: &ToolCall, _ctx: &ToolContext) -> Result<ToolDispatch> {
        anyhow::bail!("{} handler crashed", self.name)
    }
}
