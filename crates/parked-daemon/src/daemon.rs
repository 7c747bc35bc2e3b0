use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parked_core::suspension::new_turn_id;
use parked_core::{
    CallStatus, Conversations, DeliveryAck, DeliveryGateway, LedgerPhase, LedgerRecord,
    LedgerSink, StatusBroadcaster, ToolCall, ToolExecutor, TurnSuspensionPoint,
};
use parked_ipc::{ClientMessage, IpcConnection, PROTOCOL_VERSION, ServerMessage};
use parked_ledger::{JsonlLedger, LedgerError, OrphanedCall};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::builtin_tools::builtin_tools;
use crate::config::Config;

const OPERATOR_CANCEL: &str = "cancelled by operator";

/// Everything a running daemon shares across client connections.
#[allow(missing_debug_implementations)]
pub(crate) struct Daemon {
    id: String,
    conversations: Arc<Conversations>,
    gateway: DeliveryGateway,
    turns: Arc<TurnSuspensionPoint>,
    ledger: Arc<JsonlLedger>,
    started_at: DateTime<Utc>,
    shutdown: CancellationToken,
}

/// Orphans left behind by earlier processes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct OrphanScan {
    pub orphans: Vec<OrphanedCall>,
    pub degraded: bool,
}

impl Daemon {
    pub(crate) fn new(config: &Config, config_dir: &Path) -> Result<Self> {
        let ledger_path = config.ledger_path(config_dir);
        let ledger = Arc::new(
            JsonlLedger::open(&ledger_path)
                .with_context(|| format!("failed to open ledger {}", ledger_path.display()))?,
        );
        Ok(Self::with_parts(
            config,
            ledger,
            Arc::new(builtin_tools()),
        ))
    }

    pub(crate) fn with_parts(
        config: &Config,
        ledger: Arc<JsonlLedger>,
        executor: Arc<dyn ToolExecutor>,
    ) -> Self {
        let sink: Arc<dyn LedgerSink> = Arc::clone(&ledger) as Arc<dyn LedgerSink>;
        let conversations = Arc::new(
            Conversations::new(StatusBroadcaster::new(config.status.capacity)).with_ledger(sink),
        );
        let turns = Arc::new(TurnSuspensionPoint::new(
            Arc::clone(&conversations),
            executor,
            config.timeout_policy(),
        ));
        Self {
            id: config.daemon.id.clone(),
            gateway: DeliveryGateway::new(Arc::clone(&conversations)),
            conversations,
            turns,
            ledger,
            started_at: Utc::now(),
            shutdown: CancellationToken::new(),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// Startup scan of the ledger. Orphans are logged; a corrupt ledger is
    /// logged and otherwise ignored so the daemon keeps serving.
    pub(crate) fn recover(&self) -> OrphanScan {
        let scan = self.scan_orphans();
        if scan.degraded {
            return scan;
        }
        for orphan in &scan.orphans {
            warn!(
                conversation = %orphan.conversation_id,
                call_id = %orphan.call_id,
                tool = %orphan.tool_name,
                turn = %orphan.turn_id,
                registered_at = %orphan.registered_at,
                "orphaned pending call from a previous run"
            );
        }
        if !scan.orphans.is_empty() {
            info!(
                count = scan.orphans.len(),
                "orphans can be closed with `parked repair`"
            );
        }
        scan
    }

    /// Calls registered before this process started that never closed.
    /// Calls registered by this process are live, not orphaned.
    pub(crate) fn scan_orphans(&self) -> OrphanScan {
        match self.ledger.recover() {
            Ok(report) => OrphanScan {
                orphans: report
                    .orphans
                    .into_iter()
                    .filter(|orphan| orphan.registered_at < self.started_at)
                    .collect(),
                degraded: false,
            },
            Err(error @ LedgerError::Corrupt { .. }) => {
                error!(error = %error, "ledger is corrupt, orphan detection disabled");
                OrphanScan {
                    orphans: Vec::new(),
                    degraded: true,
                }
            }
            Err(error) => {
                error!(error = %error, "failed to read ledger");
                OrphanScan {
                    orphans: Vec::new(),
                    degraded: true,
                }
            }
        }
    }

    /// Close an orphan on behalf of an operator. Calls this daemon is still
    /// waiting on must be delivered or cancelled instead.
    pub(crate) fn repair(
        &self,
        conversation_id: &str,
        call_id: &str,
        phase: LedgerPhase,
    ) -> Result<LedgerRecord> {
        let live = self
            .conversations
            .get(conversation_id)
            .and_then(|registry| registry.status(call_id));
        if live == Some(CallStatus::Waiting) {
            anyhow::bail!(
                "call {call_id} in {conversation_id} is still pending in this daemon; deliver or cancel it instead"
            );
        }
        let record = self
            .ledger
            .repair(conversation_id, call_id, phase, self.started_at)?;
        Ok(record)
    }

    /// Wake every parked turn with a cancellation and stop subscriptions.
    pub(crate) fn shutdown(&self) {
        self.shutdown.cancel();
        for conversation_id in self.conversations.conversation_ids() {
            if let Some(cancelled) = self.conversations.end(&conversation_id)
                && cancelled > 0
            {
                info!(conversation = %conversation_id, cancelled, "conversation closed at shutdown");
            }
        }
    }
}

pub(crate) async fn handle_client(
    mut connection: IpcConnection,
    daemon: Arc<Daemon>,
) -> Result<()> {
    while let Some(message) = connection.recv().await? {
        match message {
            ClientMessage::Hello { version } => {
                if version != PROTOCOL_VERSION {
                    warn!(
                        client_version = version,
                        server_version = PROTOCOL_VERSION,
                        "ipc version mismatch"
                    );
                }
                connection
                    .send(ServerMessage::Hello {
                        version: PROTOCOL_VERSION,
                        daemon_id: daemon.id.clone(),
                    })
                    .await?;
            }
            ClientMessage::Deliver {
                conversation_id,
                call_id,
                payload,
                success,
            } => {
                let ack = daemon
                    .gateway
                    .deliver_async(conversation_id.clone(), call_id.clone(), payload, success)
                    .await;
                connection
                    .send(ServerMessage::Delivery {
                        conversation_id,
                        call_id,
                        ack,
                    })
                    .await?;
            }
            ClientMessage::Cancel {
                conversation_id,
                call_id,
                reason,
            } => {
                let reason = reason.unwrap_or_else(|| OPERATOR_CANCEL.to_owned());
                let ack = cancel_blocking(&daemon, &conversation_id, &call_id, reason).await;
                connection
                    .send(ServerMessage::Delivery {
                        conversation_id,
                        call_id,
                        ack,
                    })
                    .await?;
            }
            ClientMessage::ListPending { conversation_id } => {
                let calls = daemon
                    .conversations
                    .waiting()
                    .into_iter()
                    .filter(|info| {
                        conversation_id
                            .as_deref()
                            .is_none_or(|id| info.conversation_id == id)
                    })
                    .collect();
                connection.send(ServerMessage::Pending { calls }).await?;
            }
            ClientMessage::ListOrphans => {
                let scan = daemon.scan_orphans();
                connection
                    .send(ServerMessage::Orphans {
                        orphans: scan.orphans,
                        degraded: scan.degraded,
                    })
                    .await?;
            }
            ClientMessage::Repair {
                conversation_id,
                call_id,
                phase,
            } => {
                let reply = match repair_blocking(&daemon, conversation_id, call_id, phase).await {
                    Ok(record) => ServerMessage::Repaired { record },
                    Err(error) => {
                        warn!(error = %error, "repair refused");
                        ServerMessage::error(format!("{error:#}"))
                    }
                };
                connection.send(reply).await?;
            }
            ClientMessage::RunTurn {
                conversation_id,
                turn_id,
                calls,
            } => {
                let turn_id = turn_id.unwrap_or_else(new_turn_id);
                run_turn(&mut connection, &daemon, conversation_id, turn_id, calls).await?;
            }
            ClientMessage::EndConversation { conversation_id } => {
                let reply = match daemon.conversations.end(&conversation_id) {
                    Some(cancelled) => ServerMessage::ConversationEnded {
                        conversation_id,
                        cancelled,
                    },
                    None => ServerMessage::error(format!("unknown conversation: {conversation_id}")),
                };
                connection.send(reply).await?;
            }
            ClientMessage::Subscribe { conversation_id } => {
                return forward_status(connection, &daemon, conversation_id).await;
            }
        }
    }
    debug!("client disconnected");
    Ok(())
}

async fn cancel_blocking(
    daemon: &Arc<Daemon>,
    conversation_id: &str,
    call_id: &str,
    reason: String,
) -> DeliveryAck {
    let gateway = daemon.gateway.clone();
    let conversation_id = conversation_id.to_owned();
    let call_id = call_id.to_owned();
    tokio::task::spawn_blocking(move || gateway.cancel(&conversation_id, &call_id, &reason))
        .await
        .unwrap_or_else(|error| {
            warn!(error = %error, "cancel task failed");
            DeliveryAck::UnknownCallId
        })
}

async fn repair_blocking(
    daemon: &Arc<Daemon>,
    conversation_id: String,
    call_id: String,
    phase: LedgerPhase,
) -> Result<LedgerRecord> {
    let daemon = Arc::clone(daemon);
    tokio::task::spawn_blocking(move || daemon.repair(&conversation_id, &call_id, phase))
        .await
        .context("repair task failed")?
}

/// Run a turn and stream its events to the requesting client. If the client
/// goes away mid-turn the turn is aborted.
async fn run_turn(
    connection: &mut IpcConnection,
    daemon: &Arc<Daemon>,
    conversation_id: String,
    turn_id: String,
    calls: Vec<ToolCall>,
) -> Result<()> {
    let abort = daemon.shutdown.child_token();
    let _abort_on_disconnect = abort.clone().drop_guard();

    let (event_tx, mut event_rx) = mpsc::channel(64);
    let turns = Arc::clone(&daemon.turns);
    let span = info_span!("ipc_turn", conversation = %conversation_id, turn = %turn_id);
    let turn_conversation = conversation_id.clone();
    let turn_task = tokio::spawn(
        async move {
            turns
                .run_turn(&turn_conversation, &turn_id, calls, Some(event_tx), abort)
                .await
        }
        .instrument(span),
    );

    while let Some(event) = event_rx.recv().await {
        if let Some(message) = ServerMessage::from_turn_event(conversation_id.clone(), event) {
            connection.send(message).await?;
        }
    }

    if let Err(error) = turn_task.await {
        connection
            .send(ServerMessage::error(format!("internal server error: {error}")))
            .await?;
    }
    Ok(())
}

async fn forward_status(
    mut connection: IpcConnection,
    daemon: &Arc<Daemon>,
    conversation_id: Option<String>,
) -> Result<()> {
    let mut events = daemon.conversations.status().subscribe();
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    if conversation_id
                        .as_deref()
                        .is_some_and(|id| event.conversation_id != id)
                    {
                        continue;
                    }
                    connection.send(ServerMessage::Status { event }).await?;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "status subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            () = daemon.shutdown.cancelled() => return Ok(()),
        }
    }
}
