use thiserror::Error;

/// Errors returned by registry and delivery operations.
///
/// None of these are fatal to the process. They go back to whoever made the
/// call (a delivery caller, a suspended turn) and get logged there.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PendingCallError {
    #[error("call {call_id} is already registered")]
    DuplicateCallId { call_id: String },
    #[error("no pending call with id {call_id}")]
    UnknownCallId { call_id: String },
    #[error("conversation {conversation_id} not found")]
    ConversationNotFound { conversation_id: String },
    #[error("call {call_id} was already resolved")]
    AlreadyResolved { call_id: String },
    #[error("call {call_id} already has a waiter")]
    WaiterBusy { call_id: String },
}

impl PendingCallError {
    /// Late or duplicate deliveries are benign; callers treat them as success.
    pub fn is_benign(&self) -> bool {
        matches!(self, PendingCallError::AlreadyResolved { .. })
    }
}
