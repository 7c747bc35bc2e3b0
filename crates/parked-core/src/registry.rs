//! Per-conversation table of pending calls and the process-scoped map that
//! owns those tables.
//!
//! Every entry carries a oneshot channel. The write path (`resolve`,
//! `cancel`) sends into it exactly once; the read path (`await_resolution`)
//! is the only suspension point and never holds the entry lock while parked.

use crate::broadcaster::StatusBroadcaster;
use crate::error::PendingCallError;
use crate::traits::LedgerSink;
use crate::types::{CallStatus, LedgerPhase, LedgerRecord, Outcome, PendingCallInfo, ToolPayload};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// Reason handed to waiters whose conversation was torn down under them.
pub const CONVERSATION_ENDED: &str = "conversation ended";

#[derive(Debug)]
enum Resolution {
    Payload(ToolPayload),
    Cancelled(String),
}

struct PendingCallEntry {
    info: PendingCallInfo,
    sender: Option<oneshot::Sender<Resolution>>,
    receiver: Option<oneshot::Receiver<Resolution>>,
    /// No turn will read the result; settling goes straight to a tombstone.
    detached: bool,
}

impl PendingCallEntry {
    fn new(info: PendingCallInfo) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            info,
            sender: Some(tx),
            receiver: Some(rx),
            detached: false,
        }
    }
}

#[derive(Default)]
struct Entries {
    live: HashMap<String, PendingCallEntry>,
    /// Terminal status of entries whose resolution has been consumed.
    settled: HashMap<String, CallStatus>,
    /// Set once the conversation has ended; no further registrations.
    closed: bool,
}

impl Entries {
    fn tombstone(&mut self, call_id: &str) {
        if let Some(entry) = self.live.remove(call_id) {
            self.settled.insert(call_id.to_owned(), entry.info.status);
        }
    }
}

// ---------------------------------------------------------------------------
// PendingCallRegistry
// ---------------------------------------------------------------------------

/// Pending calls of a single conversation, keyed by `call_id`.
#[allow(missing_debug_implementations)]
pub struct PendingCallRegistry {
    conversation_id: String,
    entries: Mutex<Entries>,
    ledger: Option<Arc<dyn LedgerSink>>,
    status: StatusBroadcaster,
}

impl PendingCallRegistry {
    pub fn new(
        conversation_id: impl Into<String>,
        status: StatusBroadcaster,
        ledger: Option<Arc<dyn LedgerSink>>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            entries: Mutex::new(Entries::default()),
            ledger,
            status,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Register a call the handler reported as pending.
    ///
    /// A `call_id` may be registered again only after its previous entry
    /// resolved and was consumed. Cancelled ids are never reused. Fails with
    /// `ConversationNotFound` once the registry has been closed.
    pub fn register(
        self: &Arc<Self>,
        call_id: impl Into<String>,
        turn_id: impl Into<String>,
        tool_name: impl Into<String>,
        note: Option<String>,
    ) -> Result<RegistrationHandle, PendingCallError> {
        let call_id = call_id.into();
        let info = PendingCallInfo {
            call_id: call_id.clone(),
            conversation_id: self.conversation_id.clone(),
            turn_id: turn_id.into(),
            tool_name: tool_name.into(),
            registered_at: Utc::now(),
            note,
            status: CallStatus::Waiting,
        };

        {
            let mut entries = self.lock();
            if entries.closed {
                return Err(PendingCallError::ConversationNotFound {
                    conversation_id: self.conversation_id.clone(),
                });
            }
            let reused_cancelled = entries.settled.get(&call_id) == Some(&CallStatus::Cancelled);
            if entries.live.contains_key(&call_id) || reused_cancelled {
                return Err(PendingCallError::DuplicateCallId { call_id });
            }
            entries.settled.remove(&call_id);
            entries
                .live
                .insert(call_id.clone(), PendingCallEntry::new(info.clone()));
        }

        debug!(
            conversation = %self.conversation_id,
            call_id = %call_id,
            tool = %info.tool_name,
            turn = %info.turn_id,
            "pending call registered"
        );
        self.status
            .emit(&self.conversation_id, &call_id, CallStatus::Waiting);
        self.record(&info, LedgerPhase::Registered);

        Ok(RegistrationHandle {
            registry: Arc::clone(self),
            info,
        })
    }

    /// Deliver the final payload. First writer wins.
    ///
    /// Returns the metadata of the resolved entry so callers can tell which
    /// turn the result belongs to.
    pub fn resolve(
        &self,
        call_id: &str,
        payload: ToolPayload,
    ) -> Result<PendingCallInfo, PendingCallError> {
        let success = payload.success;
        let info = self.settle(call_id, CallStatus::Resolved, Resolution::Payload(payload))?;

        info!(
            conversation = %self.conversation_id,
            call_id,
            success,
            "pending call resolved"
        );
        self.status
            .emit(&self.conversation_id, call_id, CallStatus::Resolved);
        self.record(&info, LedgerPhase::Resolved);
        Ok(info)
    }

    /// Wake the waiter with a cancellation signal. Never overwrites a payload
    /// that already arrived.
    pub fn cancel(&self, call_id: &str, reason: &str) -> Result<PendingCallInfo, PendingCallError> {
        let info = self.settle(
            call_id,
            CallStatus::Cancelled,
            Resolution::Cancelled(reason.to_owned()),
        )?;

        info!(
            conversation = %self.conversation_id,
            call_id,
            reason,
            "pending call cancelled"
        );
        self.status
            .emit(&self.conversation_id, call_id, CallStatus::Cancelled);
        self.record(&info, LedgerPhase::Cancelled);
        Ok(info)
    }

    /// Refuse further registrations, then cancel everything still waiting.
    /// Returns how many were cancelled.
    ///
    /// The flag is set under the entry lock, so a registration racing with
    /// the close either lands first and is cancelled here, or fails.
    pub fn close(&self, reason: &str) -> usize {
        let waiting: Vec<String> = {
            let mut entries = self.lock();
            entries.closed = true;
            entries
                .live
                .values()
                .filter(|entry| entry.info.status == CallStatus::Waiting)
                .map(|entry| entry.info.call_id.clone())
                .collect()
        };
        waiting
            .iter()
            .filter(|call_id| self.cancel(call_id, reason).is_ok())
            .count()
    }

    /// Give up on a call without cancelling it. The entry keeps waiting and
    /// a later result is still accepted and recorded, but it is consumed on
    /// arrival since no turn will read it.
    pub fn detach(&self, call_id: &str) {
        let mut guard = self.lock();
        let entries = &mut *guard;
        let Some(entry) = entries.live.get_mut(call_id) else {
            return;
        };
        if !entry.info.status.is_terminal() {
            entry.detached = true;
            return;
        }
        entries.tombstone(call_id);
    }

    /// Suspend until the call is resolved or cancelled, or until `timeout`
    /// elapses.
    ///
    /// A terminal outcome consumes the entry: it is removed and only a
    /// tombstone remains. `Outcome::Timeout` leaves the entry `Waiting` so
    /// the caller can wait again or cancel.
    pub async fn await_resolution(
        &self,
        call_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Outcome, PendingCallError> {
        let receiver = {
            let mut guard = self.lock();
            let entries = &mut *guard;
            match entries.live.get_mut(call_id) {
                Some(entry) => entry
                    .receiver
                    .take()
                    .ok_or_else(|| PendingCallError::WaiterBusy {
                        call_id: call_id.to_owned(),
                    })?,
                None if entries.settled.contains_key(call_id) => {
                    return Err(PendingCallError::AlreadyResolved {
                        call_id: call_id.to_owned(),
                    });
                }
                None => {
                    return Err(PendingCallError::UnknownCallId {
                        call_id: call_id.to_owned(),
                    });
                }
            }
        };

        let mut slot = WaitSlot {
            registry: self,
            call_id,
            receiver: Some(receiver),
        };

        let Some(received) = slot.wait(timeout).await else {
            debug!(conversation = %self.conversation_id, call_id, "wait for pending call timed out");
            return Ok(Outcome::Timeout);
        };

        let outcome = match received {
            Ok(Resolution::Payload(payload)) => Outcome::Resolved(payload),
            Ok(Resolution::Cancelled(reason)) => Outcome::Cancelled(reason),
            Err(_) => Outcome::Cancelled(CONVERSATION_ENDED.to_owned()),
        };
        self.consume(call_id);
        Ok(outcome)
    }

    /// Current status of a call, including consumed ones.
    pub fn status(&self, call_id: &str) -> Option<CallStatus> {
        let entries = self.lock();
        entries
            .live
            .get(call_id)
            .map(|entry| entry.info.status)
            .or_else(|| entries.settled.get(call_id).copied())
    }

    /// All live entries, oldest first.
    pub fn snapshot(&self) -> Vec<PendingCallInfo> {
        let mut infos: Vec<PendingCallInfo> = self
            .lock()
            .live
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        infos.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        infos
    }

    /// Live entries still waiting for a result.
    pub fn waiting(&self) -> Vec<PendingCallInfo> {
        self.snapshot()
            .into_iter()
            .filter(|info| info.status == CallStatus::Waiting)
            .collect()
    }

    fn settle(
        &self,
        call_id: &str,
        status: CallStatus,
        resolution: Resolution,
    ) -> Result<PendingCallInfo, PendingCallError> {
        let (info, sender) = {
            let mut guard = self.lock();
            let entries = &mut *guard;
            let Some(entry) = entries.live.get_mut(call_id) else {
                return Err(if entries.settled.contains_key(call_id) {
                    PendingCallError::AlreadyResolved {
                        call_id: call_id.to_owned(),
                    }
                } else {
                    PendingCallError::UnknownCallId {
                        call_id: call_id.to_owned(),
                    }
                });
            };
            if entry.info.status.is_terminal() {
                return Err(PendingCallError::AlreadyResolved {
                    call_id: call_id.to_owned(),
                });
            }
            entry.info.status = status;
            let info = entry.info.clone();
            let detached = entry.detached;
            let sender = if detached { None } else { entry.sender.take() };
            if detached {
                entries.tombstone(call_id);
            }
            (info, sender)
        };

        // The receiver lives either in the entry or with the current waiter,
        // so this only fails if the registry itself is being dropped.
        if let Some(sender) = sender
            && sender.send(resolution).is_err()
        {
            debug!(call_id, "pending call receiver already gone");
        }
        Ok(info)
    }

    fn consume(&self, call_id: &str) {
        self.lock().tombstone(call_id);
    }

    /// Appends wait for the ledger to sync. On a multi-threaded runtime the
    /// worker hands its other tasks off for the duration.
    fn record(&self, info: &PendingCallInfo, phase: LedgerPhase) {
        let Some(ledger) = &self.ledger else {
            return;
        };
        let record = LedgerRecord::from_info(info, phase);
        let append = || ledger.append(&record);
        let appended = match tokio::runtime::Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(append)
            }
            _ => append(),
        };
        if let Err(error) = appended {
            error!(
                conversation = %info.conversation_id,
                call_id = %info.call_id,
                %phase,
                error = %error,
                "failed to append ledger record"
            );
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries> {
        self.entries.lock().expect("pending call registry poisoned")
    }
}

/// Holds the receiver while a waiter is parked. If the wait ends without a
/// value (timeout, or the waiting future is dropped) the receiver goes back
/// into the entry so a later wait can pick it up.
struct WaitSlot<'a> {
    registry: &'a PendingCallRegistry,
    call_id: &'a str,
    receiver: Option<oneshot::Receiver<Resolution>>,
}

impl WaitSlot<'_> {
    async fn wait(
        &mut self,
        timeout: Option<Duration>,
    ) -> Option<Result<Resolution, oneshot::error::RecvError>> {
        let receiver = self.receiver.as_mut()?;
        let received = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, receiver).await.ok()?,
            None => receiver.await,
        };
        self.receiver = None;
        Some(received)
    }
}

impl Drop for WaitSlot<'_> {
    fn drop(&mut self) {
        let Some(receiver) = self.receiver.take() else {
            return;
        };
        if let Ok(mut entries) = self.registry.entries.lock()
            && let Some(entry) = entries.live.get_mut(self.call_id)
        {
            entry.receiver = Some(receiver);
        }
    }
}

/// Returned by `register`. Ties a registered call to its registry so the
/// turn can wait on it without looking the conversation up again.
#[allow(missing_debug_implementations)]
pub struct RegistrationHandle {
    registry: Arc<PendingCallRegistry>,
    info: PendingCallInfo,
}

impl RegistrationHandle {
    pub fn call_id(&self) -> &str {
        &self.info.call_id
    }

    pub async fn await_resolution(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Outcome, PendingCallError> {
        self.registry
            .await_resolution(&self.info.call_id, timeout)
            .await
    }

    pub fn cancel(&self, reason: &str) -> Result<PendingCallInfo, PendingCallError> {
        self.registry.cancel(&self.info.call_id, reason)
    }

    /// See [`PendingCallRegistry::detach`].
    pub fn detach(self) {
        self.registry.detach(&self.info.call_id);
    }
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

/// Process-scoped map of conversation registries.
///
/// A registry is created the first time a conversation registers a call (or
/// is explicitly opened) and torn down by `end`, which cancels whatever is
/// still waiting. The outer lock only covers insert/lookup/remove of whole
/// conversations.
#[allow(missing_debug_implementations)]
pub struct Conversations {
    registries: Mutex<HashMap<String, Arc<PendingCallRegistry>>>,
    ledger: Option<Arc<dyn LedgerSink>>,
    status: StatusBroadcaster,
}

impl Conversations {
    pub fn new(status: StatusBroadcaster) -> Self {
        Self {
            registries: Mutex::new(HashMap::new()),
            ledger: None,
            status,
        }
    }

    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn LedgerSink>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn status(&self) -> &StatusBroadcaster {
        &self.status
    }

    /// Registry for `conversation_id`, creating it on first use.
    pub fn open(&self, conversation_id: &str) -> Arc<PendingCallRegistry> {
        let mut registries = self.lock();
        Arc::clone(
            registries
                .entry(conversation_id.to_owned())
                .or_insert_with(|| {
                    debug!(conversation = conversation_id, "conversation registry created");
                    Arc::new(PendingCallRegistry::new(
                        conversation_id,
                        self.status.clone(),
                        self.ledger.clone(),
                    ))
                }),
        )
    }

    pub fn get(&self, conversation_id: &str) -> Option<Arc<PendingCallRegistry>> {
        self.lock().get(conversation_id).cloned()
    }

    pub fn register(
        &self,
        call_id: impl Into<String>,
        conversation_id: &str,
        turn_id: impl Into<String>,
        tool_name: impl Into<String>,
        note: Option<String>,
    ) -> Result<RegistrationHandle, PendingCallError> {
        self.open(conversation_id)
            .register(call_id, turn_id, tool_name, note)
    }

    /// Tear down a conversation. Waiting calls are cancelled so their turns
    /// wake up with a coherent failure, and a registration still holding the
    /// old registry is refused. Returns `None` if the conversation was
    /// unknown.
    pub fn end(&self, conversation_id: &str) -> Option<usize> {
        let registry = self.lock().remove(conversation_id)?;
        let cancelled = registry.close(CONVERSATION_ENDED);
        info!(
            conversation = conversation_id,
            cancelled, "conversation ended"
        );
        Some(cancelled)
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Waiting calls across every conversation.
    pub fn waiting(&self) -> Vec<PendingCallInfo> {
        let registries: Vec<Arc<PendingCallRegistry>> = self.lock().values().cloned().collect();
        let mut waiting: Vec<PendingCallInfo> = registries
            .iter()
            .flat_map(|registry| registry.waiting())
            .collect();
        waiting.sort_by(|a, b| a.registered_at.cmp(&b.registered_at));
        waiting
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<PendingCallRegistry>>> {
        self.registries
            .lock()
            .expect("conversation map poisoned")
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::MemoryLedger;
    use serde_json::json;

    fn registry() -> Arc<PendingCallRegistry> {
        Arc::new(PendingCallRegistry::new(
            "conv",
            StatusBroadcaster::default(),
            None,
        ))
    }

    fn payload(value: serde_json::Value) -> ToolPayload {
        ToolPayload::new(value, true)
    }

    #[tokio::test]
    async fn resolve_wakes_waiter_on_another_task() {
        let registry = registry();
        let handle = registry.register("c1", "t1", "mail_wait", None).unwrap();

        let waiter = tokio::spawn(async move { handle.await_resolution(None).await });

        let resolver = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.resolve("c1", payload(json!("P"))) })
        };
        resolver.await.unwrap().unwrap();

        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome, Outcome::Resolved(payload(json!("P"))));
        assert_eq!(registry.status("c1"), Some(CallStatus::Resolved));
        assert!(registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn resolve_before_wait_is_not_lost() {
        let registry = registry();
        let handle = registry.register("c1", "t1", "tool", None).unwrap();
        registry.resolve("c1", payload(json!(1))).unwrap();

        let outcome = handle.await_resolution(None).await.unwrap();
        assert_eq!(outcome, Outcome::Resolved(payload(json!(1))));
    }

    #[tokio::test]
    async fn only_first_writer_wins() {
        let registry = registry();
        let handle = registry.register("c1", "t1", "tool", None).unwrap();

        registry.resolve("c1", payload(json!("first"))).unwrap();
        let second = registry.resolve("c1", payload(json!("second")));
        let cancel = registry.cancel("c1", "too late");
        assert!(matches!(
            second,
            Err(PendingCallError::AlreadyResolved { .. })
        ));
        assert!(matches!(cancel, Err(PendingCallError::AlreadyResolved { .. })));

        let outcome = handle.await_resolution(None).await.unwrap();
        assert_eq!(outcome, Outcome::Resolved(payload(json!("first"))));

        // Still rejected after the entry was consumed.
        let third = registry.resolve("c1", payload(json!("third")));
        assert!(matches!(third, Err(PendingCallError::AlreadyResolved { .. })));
    }

    #[tokio::test]
    async fn concurrent_writers_apply_exactly_once() {
        let registry = registry();
        let handle = registry.register("c1", "t1", "tool", None).unwrap();

        let mut tasks = Vec::new();
        for i in 0..16 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    registry.resolve("c1", payload(json!(i))).is_ok()
                } else {
                    registry.cancel("c1", "racing").is_ok()
                }
            }));
        }

        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert!(!matches!(
            handle.await_resolution(None).await.unwrap(),
            Outcome::Timeout
        ));
    }

    #[tokio::test]
    async fn cancel_before_resolve_yields_cancelled() {
        let registry = registry();
        let handle = registry.register("c1", "t1", "tool", None).unwrap();

        registry.cancel("c1", "user stopped the turn").unwrap();
        let late = registry.resolve("c1", payload(json!("late")));
        assert!(matches!(late, Err(PendingCallError::AlreadyResolved { .. })));

        let outcome = handle.await_resolution(None).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Cancelled("user stopped the turn".to_owned())
        );
    }

    #[tokio::test]
    async fn unknown_call_has_no_side_effects() {
        let ledger = Arc::new(MemoryLedger::new());
        let status = StatusBroadcaster::default();
        let mut events = status.subscribe();
        let registry = Arc::new(PendingCallRegistry::new(
            "conv",
            status,
            Some(Arc::clone(&ledger) as Arc<dyn LedgerSink>),
        ));

        let result = registry.resolve("ghost", payload(json!(null)));
        assert!(matches!(
            result,
            Err(PendingCallError::UnknownCallId { .. })
        ));
        assert!(registry.snapshot().is_empty());
        assert!(ledger.records().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = registry();
        let _handle = registry.register("c1", "t1", "tool", None).unwrap();
        let dup = registry.register("c1", "t1", "tool", None);
        assert!(matches!(
            dup,
            Err(PendingCallError::DuplicateCallId { .. })
        ));

        // Resolved but not yet consumed: still a duplicate.
        registry.resolve("c1", payload(json!(1))).unwrap();
        assert!(registry.register("c1", "t2", "tool", None).is_err());
    }

    #[tokio::test]
    async fn consumed_resolved_id_can_be_registered_again_but_cancelled_cannot() {
        let registry = registry();
        let handle = registry.register("c1", "t1", "tool", None).unwrap();
        registry.resolve("c1", payload(json!(1))).unwrap();
        handle.await_resolution(None).await.unwrap();
        assert!(registry.register("c1", "t2", "tool", None).is_ok());

        let handle = registry.register("c2", "t1", "tool", None).unwrap();
        registry.cancel("c2", "nope").unwrap();
        handle.await_resolution(None).await.unwrap();
        assert!(matches!(
            registry.register("c2", "t2", "tool", None),
            Err(PendingCallError::DuplicateCallId { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_leaves_entry_waiting() {
        let registry = registry();
        let handle = registry.register("c1", "t1", "tool", None).unwrap();

        let outcome = handle
            .await_resolution(Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Timeout);
        assert_eq!(registry.status("c1"), Some(CallStatus::Waiting));

        registry.resolve("c1", payload(json!("late but legit"))).unwrap();
        let outcome = handle.await_resolution(None).await.unwrap();
        assert_eq!(outcome, Outcome::Resolved(payload(json!("late but legit"))));
    }

    #[tokio::test]
    async fn second_waiter_is_rejected() {
        let registry = registry();
        let _handle = registry.register("c1", "t1", "tool", None).unwrap();

        let first = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.await_resolution("c1", None).await })
        };
        tokio::task::yield_now().await;

        let second = registry
            .await_resolution("c1", Some(Duration::from_millis(10)))
            .await;
        assert!(matches!(second, Err(PendingCallError::WaiterBusy { .. })));

        registry.resolve("c1", payload(json!("ok"))).unwrap();
        assert!(matches!(
            first.await.unwrap().unwrap(),
            Outcome::Resolved(_)
        ));
    }

    #[tokio::test]
    async fn dropped_waiter_returns_receiver() {
        let registry = registry();
        let handle = registry.register("c1", "t1", "tool", None).unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.await_resolution("c1", None).await })
        };
        tokio::task::yield_now().await;
        waiter.abort();
        let _ = waiter.await;

        registry.resolve("c1", payload(json!("after abort"))).unwrap();
        let outcome = handle.await_resolution(None).await.unwrap();
        assert_eq!(outcome, Outcome::Resolved(payload(json!("after abort"))));
    }

    #[tokio::test]
    async fn lifecycle_is_recorded_in_ledger_and_status_stream() {
        let ledger = Arc::new(MemoryLedger::new());
        let conversations =
            Conversations::new(StatusBroadcaster::default()).with_ledger(Arc::clone(&ledger) as Arc<dyn LedgerSink>);
        let mut events = conversations.status().subscribe();

        let handle = conversations
            .register("c1", "conv", "t1", "mail_wait", Some("waiting on reply".into()))
            .unwrap();
        conversations
            .get("conv")
            .unwrap()
            .resolve("c1", payload(json!("done")))
            .unwrap();
        handle.await_resolution(None).await.unwrap();

        let phases: Vec<LedgerPhase> = ledger.records().iter().map(|r| r.phase).collect();
        assert_eq!(phases, vec![LedgerPhase::Registered, LedgerPhase::Resolved]);
        assert_eq!(events.recv().await.unwrap().status, CallStatus::Waiting);
        assert_eq!(events.recv().await.unwrap().status, CallStatus::Resolved);
    }

    #[tokio::test]
    async fn conversations_are_isolated() {
        let conversations = Conversations::new(StatusBroadcaster::default());
        let a = conversations
            .register("same", "conv-A", "t1", "tool", None)
            .unwrap();
        let b = conversations
            .register("same", "conv-B", "t1", "tool", None)
            .unwrap();

        conversations
            .get("conv-A")
            .unwrap()
            .resolve("same", payload(json!("for A")))
            .unwrap();

        assert_eq!(
            a.await_resolution(None).await.unwrap(),
            Outcome::Resolved(payload(json!("for A")))
        );
        let registry_b = conversations.get("conv-B").unwrap();
        assert_eq!(registry_b.status("same"), Some(CallStatus::Waiting));
        assert_eq!(
            b.await_resolution(Some(Duration::from_millis(5)))
                .await
                .unwrap(),
            Outcome::Timeout
        );
    }

    #[tokio::test]
    async fn late_result_for_detached_call_is_consumed() {
        let registry = registry();
        let handle = registry.register("c1", "t1", "tool", None).unwrap();
        let outcome = handle
            .await_resolution(Some(Duration::from_millis(1)))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Timeout);
        handle.detach();
        assert_eq!(registry.status("c1"), Some(CallStatus::Waiting));

        registry.resolve("c1", payload(json!("late"))).unwrap();
        assert!(registry.snapshot().is_empty());
        assert_eq!(registry.status("c1"), Some(CallStatus::Resolved));
        assert!(matches!(
            registry.resolve("c1", payload(json!("again"))),
            Err(PendingCallError::AlreadyResolved { .. })
        ));
        assert!(registry.register("c1", "t2", "tool", None).is_ok());
    }

    #[tokio::test]
    async fn detaching_an_already_settled_call_consumes_it() {
        let registry = registry();
        let handle = registry.register("c1", "t1", "tool", None).unwrap();
        registry.resolve("c1", payload(json!("raced in"))).unwrap();

        handle.detach();
        assert!(registry.snapshot().is_empty());
        assert_eq!(registry.status("c1"), Some(CallStatus::Resolved));
    }

    #[tokio::test]
    async fn registration_on_ended_conversation_is_refused() {
        let conversations = Conversations::new(StatusBroadcaster::default());
        // A turn looked the registry up just before the conversation ended.
        let stale = conversations.open("conv");
        assert_eq!(conversations.end("conv"), Some(0));

        let err = stale.register("c1", "t1", "tool", None).err().unwrap();
        assert_eq!(
            err,
            PendingCallError::ConversationNotFound {
                conversation_id: "conv".to_owned()
            }
        );
        assert!(stale.snapshot().is_empty());

        // The id starts a fresh registry afterwards.
        assert!(
            conversations
                .register("c1", "conv", "t2", "tool", None)
                .is_ok()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn slow_ledger_does_not_stall_other_tasks() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct SlowLedger;
        impl LedgerSink for SlowLedger {
            fn append(&self, _record: &LedgerRecord) -> anyhow::Result<()> {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            }
        }

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    ticks.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
        };

        let registry = Arc::new(PendingCallRegistry::new(
            "conv",
            StatusBroadcaster::default(),
            Some(Arc::new(SlowLedger) as Arc<dyn LedgerSink>),
        ));
        let ticked = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                let before = ticks.load(Ordering::SeqCst);
                registry.register("c1", "t1", "tool", None).unwrap();
                ticks.load(Ordering::SeqCst) - before
            })
            .await
            .unwrap()
        };
        ticker.abort();
        assert!(ticked >= 3, "ticker only advanced {ticked} times");
    }

    #[tokio::test]
    async fn ending_conversation_cancels_waiters() {
        let conversations = Conversations::new(StatusBroadcaster::default());
        let handle = conversations
            .register("c1", "conv", "t1", "tool", None)
            .unwrap();

        assert_eq!(conversations.end("conv"), Some(1));
        assert!(conversations.get("conv").is_none());
        assert_eq!(conversations.end("conv"), None);

        let outcome = handle.await_resolution(None).await.unwrap();
        assert_eq!(outcome, Outcome::Cancelled(CONVERSATION_ENDED.to_owned()));
    }
}
