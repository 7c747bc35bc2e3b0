use parked_core::{
    DeliveryAck, LedgerPhase, LedgerRecord, PendingCallInfo, StatusEvent, ToolCall, ToolOutput,
    TurnEvent,
};
use parked_ledger::OrphanedCall;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;

fn default_success() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello {
        version: u32,
    },
    /// Hand the final result of a pending call to its conversation.
    Deliver {
        conversation_id: String,
        call_id: String,
        payload: Value,
        #[serde(default = "default_success")]
        success: bool,
    },
    Cancel {
        conversation_id: String,
        call_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Waiting calls, optionally limited to one conversation.
    ListPending {
        #[serde(default)]
        conversation_id: Option<String>,
    },
    ListOrphans,
    /// Close an orphan from an earlier run with a terminal ledger record.
    /// Calls registered by the running daemon are refused.
    Repair {
        conversation_id: String,
        call_id: String,
        phase: LedgerPhase,
    },
    /// Run one turn's tool calls. The connection receives the turn's events
    /// and finally `turn_done`.
    RunTurn {
        conversation_id: String,
        #[serde(default)]
        turn_id: Option<String>,
        calls: Vec<ToolCall>,
    },
    EndConversation {
        conversation_id: String,
    },
    /// Stream status events, optionally limited to one conversation.
    Subscribe {
        #[serde(default)]
        conversation_id: Option<String>,
    },
}

/// One tool output of a finished turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnOutput {
    pub id: String,
    pub output: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello {
        version: u32,
        daemon_id: String,
    },
    Delivery {
        conversation_id: String,
        call_id: String,
        ack: DeliveryAck,
    },
    Pending {
        calls: Vec<PendingCallInfo>,
    },
    Orphans {
        orphans: Vec<OrphanedCall>,
        /// Startup recovery could not read the ledger; the list is empty
        /// because it is unknown, not because nothing is orphaned.
        degraded: bool,
    },
    Repaired {
        record: LedgerRecord,
    },
    ToolWaiting {
        conversation_id: String,
        id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    ToolResult {
        conversation_id: String,
        id: String,
        output: String,
        is_error: bool,
    },
    TurnDone {
        conversation_id: String,
        turn_id: String,
        outputs: Vec<TurnOutput>,
        aborted: bool,
    },
    Status {
        event: StatusEvent,
    },
    ConversationEnded {
        conversation_id: String,
        cancelled: usize,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn from_turn_event(conversation_id: impl Into<String>, event: TurnEvent) -> Option<Self> {
        let conversation_id = conversation_id.into();

        match event {
            TurnEvent::ToolStart { .. } => None,
            TurnEvent::ToolWaiting { id, name, note } => Some(Self::ToolWaiting {
                conversation_id,
                id,
                name,
                note,
            }),
            TurnEvent::ToolResult { id, output } => Some(Self::ToolResult {
                conversation_id,
                id,
                output: output.content,
                is_error: output.is_error,
            }),
            TurnEvent::Done(result) => Some(Self::TurnDone {
                conversation_id,
                turn_id: result.turn_id,
                outputs: result
                    .outputs
                    .into_iter()
                    .map(|(id, output)| turn_output(id, output))
                    .collect(),
                aborted: result.aborted,
            }),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

fn turn_output(id: String, output: ToolOutput) -> TurnOutput {
    TurnOutput {
        id,
        output: output.content,
        is_error: output.is_error,
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use parked_core::TurnResult;
    use serde_json::json;

    #[test]
    fn deliver_defaults_to_success() {
        let parsed: ClientMessage = serde_json::from_value(json!({
            "type": "deliver",
            "conversation_id": "conv-A",
            "call_id": "c1",
            "payload": {"status": "approved"}
        }))
        .unwrap();
        assert_eq!(
            parsed,
            ClientMessage::Deliver {
                conversation_id: "conv-A".into(),
                call_id: "c1".into(),
                payload: json!({"status": "approved"}),
                success: true,
            }
        );
    }

    #[test]
    fn run_turn_round_trip() {
        let message = ClientMessage::RunTurn {
            conversation_id: "conv".into(),
            turn_id: None,
            calls: vec![ToolCall::new("c1", "mail_wait", json!({"to": "ops"}))],
        };
        let json = serde_json::to_string(&message).unwrap();
        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn delivery_ack_is_nested() {
        let message = ServerMessage::Delivery {
            conversation_id: "conv".into(),
            call_id: "c1".into(),
            ack: DeliveryAck::Delivered {
                turn_id: "t1".into(),
            },
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "delivery");
        assert_eq!(value["ack"]["result"], "delivered");
        assert_eq!(value["ack"]["turn_id"], "t1");

        let parsed: ServerMessage = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn repair_carries_phase_in_snake_case() {
        let parsed: ClientMessage = serde_json::from_value(json!({
            "type": "repair",
            "conversation_id": "conv",
            "call_id": "c1",
            "phase": "cancelled"
        }))
        .unwrap();
        assert_eq!(
            parsed,
            ClientMessage::Repair {
                conversation_id: "conv".into(),
                call_id: "c1".into(),
                phase: LedgerPhase::Cancelled,
            }
        );
    }

    #[test]
    fn tool_start_is_not_forwarded() {
        let event = TurnEvent::ToolStart {
            id: "c1".into(),
            name: "echo".into(),
            arguments: json!({}),
        };
        assert!(ServerMessage::from_turn_event("conv", event).is_none());
    }

    #[test]
    fn maps_done_event_in_call_order() {
        let event = TurnEvent::Done(TurnResult {
            turn_id: "t1".into(),
            outputs: vec![
                ("c1".into(), ToolOutput::success("reply")),
                ("c2".into(), ToolOutput::error("boom")),
            ],
            aborted: false,
        });

        let mapped = ServerMessage::from_turn_event("conv", event).unwrap();
        assert_eq!(
            mapped,
            ServerMessage::TurnDone {
                conversation_id: "conv".into(),
                turn_id: "t1".into(),
                outputs: vec![
                    TurnOutput {
                        id: "c1".into(),
                        output: "reply".into(),
                        is_error: false,
                    },
                    TurnOutput {
                        id: "c2".into(),
                        output: "boom".into(),
                        is_error: true,
                    },
                ],
                aborted: false,
            }
        );
    }

    #[test]
    fn maps_waiting_event() {
        let event = TurnEvent::ToolWaiting {
            id: "c1".into(),
            name: "mail_wait".into(),
            note: Some("waiting on reply".into()),
        };
        let mapped = ServerMessage::from_turn_event("conv", event).unwrap();
        let value = serde_json::to_value(&mapped).unwrap();
        assert_eq!(value["type"], "tool_waiting");
        assert_eq!(value["note"], "waiting on reply");
    }
}
