use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of a pending call. Transitions only move forward:
/// `Waiting -> Resolved` or `Waiting -> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Waiting,
    Resolved,
    Cancelled,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CallStatus::Waiting)
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallStatus::Waiting => write!(f, "waiting"),
            CallStatus::Resolved => write!(f, "resolved"),
            CallStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The final result of a pending call, as supplied by the outside world.
///
/// `content` is opaque: the registry stores and forwards it without looking
/// inside. Interpreting it is the tool handler's business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPayload {
    pub content: Value,
    pub success: bool,
}

impl ToolPayload {
    pub fn new(content: Value, success: bool) -> Self {
        Self { content, success }
    }

    /// Render the payload as tool output text. Strings are passed through
    /// verbatim, everything else is serialized as compact JSON.
    pub fn to_text(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

/// What a suspended waiter observes when it wakes.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Resolved(ToolPayload),
    Cancelled(String),
    /// The deadline elapsed. The entry is still `Waiting`.
    Timeout,
}

/// Read-only view of a registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCallInfo {
    pub call_id: String,
    pub conversation_id: String,
    pub turn_id: String,
    pub tool_name: String,
    pub registered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub status: CallStatus,
}

/// Lifecycle notification for observers (UI, logs). Never a control path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub call_id: String,
    pub conversation_id: String,
    pub status: CallStatus,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Ledger records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerPhase {
    Registered,
    Resolved,
    Cancelled,
}

impl LedgerPhase {
    pub fn is_terminal(self) -> bool {
        !matches!(self, LedgerPhase::Registered)
    }
}

impl std::fmt::Display for LedgerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerPhase::Registered => write!(f, "registered"),
            LedgerPhase::Resolved => write!(f, "resolved"),
            LedgerPhase::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One line of the recovery ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub call_id: String,
    pub conversation_id: String,
    pub turn_id: String,
    pub tool_name: String,
    pub phase: LedgerPhase,
    pub timestamp: DateTime<Utc>,
    /// Set on terminal records written by an operator through the repair path.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub repaired: bool,
}

impl LedgerRecord {
    pub fn from_info(info: &PendingCallInfo, phase: LedgerPhase) -> Self {
        Self {
            call_id: info.call_id.clone(),
            conversation_id: info.conversation_id.clone(),
            turn_id: info.turn_id.clone(),
            tool_name: info.tool_name.clone(),
            phase,
            timestamp: Utc::now(),
            repaired: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tool dispatch
// ---------------------------------------------------------------------------

/// A tool invocation requested by the model for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Output of a tool call as the model will see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

impl From<ToolPayload> for ToolOutput {
    fn from(payload: ToolPayload) -> Self {
        Self {
            content: payload.to_text(),
            is_error: !payload.success,
        }
    }
}

/// Tagged signal from a handler: the result will arrive out of band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSignal {
    pub call_id: String,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// What a handler returns for a tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolDispatch {
    Ready(ToolOutput),
    Pending(PendingSignal),
}

// ---------------------------------------------------------------------------
// Turn events
// ---------------------------------------------------------------------------

/// Progress notifications emitted while a turn executes its tool calls.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    ToolStart {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolWaiting {
        id: String,
        name: String,
        note: Option<String>,
    },
    ToolResult {
        id: String,
        output: ToolOutput,
    },
    Done(TurnResult),
}

/// Tool outputs of a finished turn, in the order the calls were issued.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    pub turn_id: String,
    pub outputs: Vec<(String, ToolOutput)>,
    pub aborted: bool,
}
