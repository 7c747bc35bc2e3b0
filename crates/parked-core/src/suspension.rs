//! Turn-side integration of pending calls.
//!
//! A turn hands its tool calls to [`TurnSuspensionPoint::run_turn`]. Calls
//! run concurrently; any call whose handler reports `Pending` is registered
//! and parked on its own, so siblings and other conversations keep going.
//! When the result arrives the parked call wakes and its output slots back
//! into the turn in the original call order.

use crate::error::PendingCallError;
use crate::registry::{Conversations, RegistrationHandle};
use crate::traits::{ToolContext, ToolExecutor};
use crate::types::{Outcome, PendingSignal, ToolCall, ToolDispatch, ToolOutput, TurnEvent, TurnResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

pub const TURN_ABORTED: &str = "turn aborted";
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(300);

/// What a parked call does when its wait deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Wait forever. `heartbeat` only controls how often a still-waiting
    /// call is logged.
    Indefinite { heartbeat: Duration },
    /// Give the model a timeout error after `after`. The entry stays
    /// `Waiting`, so a late delivery is still accepted and recorded, and is
    /// consumed on arrival since the turn has moved on.
    Report { after: Duration },
    /// Cancel the entry after `after`. A payload that raced in first wins.
    Cancel { after: Duration },
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        TimeoutPolicy::Indefinite {
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }
}

impl TimeoutPolicy {
    fn deadline(self) -> Duration {
        match self {
            TimeoutPolicy::Indefinite { heartbeat } => heartbeat,
            TimeoutPolicy::Report { after } | TimeoutPolicy::Cancel { after } => after,
        }
    }
}

pub fn new_turn_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Bridges handler results into turn control flow.
#[allow(missing_debug_implementations)]
pub struct TurnSuspensionPoint {
    conversations: Arc<Conversations>,
    executor: Arc<dyn ToolExecutor>,
    policy: TimeoutPolicy,
}

impl TurnSuspensionPoint {
    pub fn new(
        conversations: Arc<Conversations>,
        executor: Arc<dyn ToolExecutor>,
        policy: TimeoutPolicy,
    ) -> Self {
        Self {
            conversations,
            executor,
            policy,
        }
    }

    /// Execute every tool call of a turn and collect the outputs in call
    /// order. Cancelling `abort` cancels the turn's parked calls; each of
    /// them still produces an output, so the turn always completes.
    pub async fn run_turn(
        &self,
        conversation_id: &str,
        turn_id: &str,
        calls: Vec<ToolCall>,
        events: Option<mpsc::Sender<TurnEvent>>,
        abort: CancellationToken,
    ) -> TurnResult {
        let span = info_span!(
            "turn",
            conversation = conversation_id,
            turn = turn_id,
            calls = calls.len()
        );
        async {
            let ctx = ToolContext {
                conversation_id: conversation_id.to_owned(),
                turn_id: turn_id.to_owned(),
            };

            let outputs = futures::future::join_all(
                calls
                    .iter()
                    .map(|call| self.run_call(&ctx, call, events.as_ref(), &abort)),
            )
            .await;

            let result = TurnResult {
                turn_id: turn_id.to_owned(),
                outputs: calls
                    .iter()
                    .map(|call| call.id.clone())
                    .zip(outputs)
                    .collect(),
                aborted: abort.is_cancelled(),
            };
            info!(aborted = result.aborted, "turn finished");
            send_event(events.as_ref(), TurnEvent::Done(result.clone())).await;
            result
        }
        .instrument(span)
        .await
    }

    async fn run_call(
        &self,
        ctx: &ToolContext,
        call: &ToolCall,
        events: Option<&mpsc::Sender<TurnEvent>>,
        abort: &CancellationToken,
    ) -> ToolOutput {
        send_event(
            events,
            TurnEvent::ToolStart {
                id: call.id.clone(),
                name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        )
        .await;

        let output = match self.executor.execute(call, ctx).await {
            Ok(ToolDispatch::Ready(output)) => output,
            Ok(ToolDispatch::Pending(signal)) => self.suspend(ctx, signal, events, abort).await,
            Err(error) => {
                warn!(tool = %call.name, call_id = %call.id, error = %error, "tool handler failed");
                ToolOutput::error(format!("tool {} failed: {error}", call.name))
            }
        };

        send_event(
            events,
            TurnEvent::ToolResult {
                id: call.id.clone(),
                output: output.clone(),
            },
        )
        .await;
        output
    }

    /// Register a pending call and park until its outcome is known.
    pub async fn suspend(
        &self,
        ctx: &ToolContext,
        signal: PendingSignal,
        events: Option<&mpsc::Sender<TurnEvent>>,
        abort: &CancellationToken,
    ) -> ToolOutput {
        let handle = match self.conversations.register(
            signal.call_id.clone(),
            &ctx.conversation_id,
            ctx.turn_id.clone(),
            signal.tool_name.clone(),
            signal.note.clone(),
        ) {
            Ok(handle) => handle,
            Err(error) => {
                warn!(call_id = %signal.call_id, error = %error, "failed to register pending call");
                return ToolOutput::error(format!("failed to suspend tool call: {error}"));
            }
        };

        send_event(
            events,
            TurnEvent::ToolWaiting {
                id: signal.call_id.clone(),
                name: signal.tool_name.clone(),
                note: signal.note.clone(),
            },
        )
        .await;

        let outcome = self.wait(&handle, abort).await;
        match outcome {
            Ok(Outcome::Resolved(payload)) => ToolOutput::from(payload),
            Ok(Outcome::Cancelled(reason)) => {
                ToolOutput::error(format!("the operation was cancelled: {reason}"))
            }
            Ok(Outcome::Timeout) => {
                handle.detach();
                ToolOutput::error(format!(
                    "timed out after {:?} waiting for {}; the call is still pending and may complete later",
                    self.policy.deadline(),
                    signal.tool_name
                ))
            }
            Err(error) => {
                warn!(call_id = %signal.call_id, error = %error, "lost track of pending call");
                ToolOutput::error(format!("pending call failed: {error}"))
            }
        }
    }

    async fn wait(
        &self,
        handle: &RegistrationHandle,
        abort: &CancellationToken,
    ) -> Result<Outcome, PendingCallError> {
        let deadline = self.policy.deadline();
        let mut waited = Duration::ZERO;

        loop {
            let outcome = tokio::select! {
                outcome = handle.await_resolution(Some(deadline)) => outcome?,
                () = abort.cancelled() => {
                    return settle_with_cancel(handle, TURN_ABORTED).await;
                }
            };

            if outcome != Outcome::Timeout {
                return Ok(outcome);
            }
            waited += deadline;

            match self.policy {
                TimeoutPolicy::Indefinite { .. } => {
                    info!(
                        call_id = handle.call_id(),
                        waited_secs = waited.as_secs(),
                        "still waiting for pending call"
                    );
                }
                TimeoutPolicy::Report { .. } => {
                    info!(call_id = handle.call_id(), "pending call timed out, entry left waiting");
                    return Ok(Outcome::Timeout);
                }
                TimeoutPolicy::Cancel { after } => {
                    let reason = format!("timed out after {after:?}");
                    return settle_with_cancel(handle, &reason).await;
                }
            }
        }
    }
}

/// Cancel the entry, then take whichever terminal value won. If a payload
/// got there first the cancel is refused and the payload comes back.
async fn settle_with_cancel(
    handle: &RegistrationHandle,
    reason: &str,
) -> Result<Outcome, PendingCallError> {
    if let Err(error) = handle.cancel(reason) {
        debug!(call_id = handle.call_id(), error = %error, "cancel lost the race");
    }
    handle.await_resolution(None).await
}

async fn send_event(events: Option<&mpsc::Sender<TurnEvent>>, event: TurnEvent) {
    if let Some(events) = events {
        let _ = events.send(event).await;
    }
}
