use crate::error::PendingCallError;
use crate::registry::Conversations;
use crate::types::ToolPayload;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{Instrument, info, info_span, warn};

/// Answer to a delivery (or operator cancel) request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DeliveryAck {
    /// The result was accepted and the waiting turn woken.
    Delivered { turn_id: String },
    /// Someone got there first. Nothing changed; retriers should stop.
    AlreadyResolved,
    UnknownCallId,
    /// The conversation is gone (ended, or the process restarted). Use the
    /// ledger repair path instead.
    ConversationNotFound,
}

impl DeliveryAck {
    /// Delivered and AlreadyResolved both mean the caller's job is done.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            DeliveryAck::Delivered { .. } | DeliveryAck::AlreadyResolved
        )
    }
}

impl std::fmt::Display for DeliveryAck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryAck::Delivered { turn_id } => write!(f, "delivered (turn {turn_id})"),
            DeliveryAck::AlreadyResolved => write!(f, "already resolved"),
            DeliveryAck::UnknownCallId => write!(f, "unknown call id"),
            DeliveryAck::ConversationNotFound => write!(f, "conversation not found"),
        }
    }
}

impl From<PendingCallError> for DeliveryAck {
    fn from(error: PendingCallError) -> Self {
        match error {
            PendingCallError::AlreadyResolved { .. } => DeliveryAck::AlreadyResolved,
            PendingCallError::ConversationNotFound { .. } => DeliveryAck::ConversationNotFound,
            PendingCallError::UnknownCallId { .. }
            | PendingCallError::DuplicateCallId { .. }
            | PendingCallError::WaiterBusy { .. } => DeliveryAck::UnknownCallId,
        }
    }
}

/// Entry point for results that arrive from outside a conversation's own
/// execution context: webhooks, the control socket, the CLI.
///
/// Holds no lock of its own. Routing takes the conversation map lock just
/// long enough to find the registry; the write itself only contends with
/// that one conversation.
#[allow(missing_debug_implementations)]
#[derive(Clone)]
pub struct DeliveryGateway {
    conversations: Arc<Conversations>,
}

impl DeliveryGateway {
    pub fn new(conversations: Arc<Conversations>) -> Self {
        Self { conversations }
    }

    pub fn deliver(
        &self,
        conversation_id: &str,
        call_id: &str,
        payload: Value,
        success: bool,
    ) -> DeliveryAck {
        let span = info_span!("deliver", conversation = conversation_id, call_id);
        let _enter = span.enter();

        let Some(registry) = self.conversations.get(conversation_id) else {
            warn!("delivery for unknown conversation");
            return DeliveryAck::ConversationNotFound;
        };

        match registry.resolve(call_id, ToolPayload::new(payload, success)) {
            Ok(info) => {
                info!(turn = %info.turn_id, success, "delivery accepted");
                DeliveryAck::Delivered {
                    turn_id: info.turn_id,
                }
            }
            Err(error) => {
                if error.is_benign() {
                    info!("duplicate delivery ignored");
                } else {
                    warn!(error = %error, "delivery rejected");
                }
                DeliveryAck::from(error)
            }
        }
    }

    /// Operator-initiated cancellation of a waiting call.
    pub fn cancel(&self, conversation_id: &str, call_id: &str, reason: &str) -> DeliveryAck {
        let Some(registry) = self.conversations.get(conversation_id) else {
            return DeliveryAck::ConversationNotFound;
        };
        match registry.cancel(call_id, reason) {
            Ok(info) => DeliveryAck::Delivered {
                turn_id: info.turn_id,
            },
            Err(error) => DeliveryAck::from(error),
        }
    }

    /// Deliver from async code without blocking the caller's task on the
    /// ledger write.
    pub async fn deliver_async(
        &self,
        conversation_id: String,
        call_id: String,
        payload: Value,
        success: bool,
    ) -> DeliveryAck {
        let gateway = self.clone();
        let span = info_span!("deliver_async");
        tokio::task::spawn_blocking(move || {
            gateway.deliver(&conversation_id, &call_id, payload, success)
        })
        .instrument(span)
        .await
        .unwrap_or_else(|error| {
            warn!(error = %error, "delivery task failed");
            DeliveryAck::UnknownCallId
        })
    }
}
