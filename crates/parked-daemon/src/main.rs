#![allow(clippy::print_stdout, clippy::print_stderr)] // CLI binary: stdout/stderr is the UI

mod builtin_tools;
mod cli;
mod config;
mod daemon;
mod tracing_setup;

use anyhow::{Context, Result, bail};
use clap::Parser;
use chrono::Utc;
use parked_core::{DeliveryAck, LedgerPhase, LedgerRecord, ToolCall};
use parked_ipc::{ClientMessage, IpcClient, IpcServer, ServerMessage};
use parked_ledger::{JsonlLedger, OrphanedCall};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cli::{Cli, Commands};
use crate::config::{Config, config_dir};
use crate::daemon::{Daemon, handle_client};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _tracing_guard = tracing_setup::init(matches!(cli.command, Commands::Start));

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Start => cmd_start(config_path).await,
        Commands::Deliver {
            conversation,
            call_id,
            payload,
            failed,
        } => cmd_deliver(config_path, conversation, call_id, &payload, !failed).await,
        Commands::Cancel {
            conversation,
            call_id,
            reason,
        } => cmd_cancel(config_path, conversation, call_id, reason).await,
        Commands::Pending { conversation } => cmd_pending(config_path, conversation).await,
        Commands::Watch { conversation } => cmd_watch(config_path, conversation).await,
        Commands::Run {
            conversation,
            calls,
            turn,
        } => cmd_run(config_path, conversation, &calls, turn).await,
        Commands::End { conversation } => cmd_end(config_path, conversation).await,
        Commands::Orphans => cmd_orphans(config_path).await,
        Commands::Repair {
            conversation,
            call_id,
            phase,
        } => cmd_repair(config_path, conversation, call_id, phase.into()).await,
        Commands::Version => {
            println!("parked {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_config(config_path: Option<&str>) -> Result<(Config, PathBuf)> {
    let config_file = Config::find_config_path(config_path);
    let config = if config_path.is_some() {
        Config::load(&config_file)?
    } else {
        Config::load_or_default(&config_file)?
    };
    Ok((config, config_dir(&config_file)))
}

async fn connect(config_path: Option<&str>) -> Result<IpcClient> {
    let (config, _) = load_config(config_path)?;
    let socket = config.socket_path();
    let (client, _) = IpcClient::connect_with_handshake(&socket)
        .await
        .with_context(|| format!("is the daemon running? (socket {})", socket.display()))?;
    Ok(client)
}

// ---------------------------------------------------------------------------
// cmd_start: run the daemon
// ---------------------------------------------------------------------------

async fn cmd_start(config_path: Option<&str>) -> Result<()> {
    let (config, config_dir) = load_config(config_path)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "parked starting"
    );

    let daemon = Arc::new(Daemon::new(&config, &config_dir)?);
    daemon.recover();

    let server = IpcServer::bind(config.socket_path())?;
    info!(
        daemon = daemon.id(),
        socket = %server.socket_path().display(),
        policy = ?config.timeout_policy(),
        "daemon started"
    );
    println!("parked listening on {}", server.socket_path().display());

    loop {
        tokio::select! {
            accepted = server.accept() => {
                match accepted {
                    Ok(connection) => {
                        let daemon = Arc::clone(&daemon);
                        tokio::spawn(async move {
                            if let Err(error) = handle_client(connection, daemon).await {
                                warn!(error = %error, "control client disconnected with error");
                            }
                        });
                    }
                    Err(error) => {
                        warn!(error = %error, "failed to accept control client");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    daemon.shutdown();
    Ok(())
}

// ---------------------------------------------------------------------------
// Client commands
// ---------------------------------------------------------------------------

/// JSON if it parses, otherwise the raw text as a JSON string.
fn parse_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}

fn report_ack(ack: &DeliveryAck) -> Result<()> {
    match ack {
        DeliveryAck::Delivered { .. } | DeliveryAck::AlreadyResolved => {
            println!("{ack}");
            Ok(())
        }
        DeliveryAck::UnknownCallId => bail!("{ack}"),
        DeliveryAck::ConversationNotFound => bail!(
            "{ack}; if the daemon restarted, close the call with `parked repair`"
        ),
    }
}

async fn expect_delivery(client: &mut IpcClient, message: ClientMessage) -> Result<()> {
    match client.request(message).await? {
        ServerMessage::Delivery { ack, .. } => report_ack(&ack),
        ServerMessage::Error { message } => bail!(message),
        other => bail!("unexpected reply: {other:?}"),
    }
}

async fn cmd_deliver(
    config_path: Option<&str>,
    conversation_id: String,
    call_id: String,
    payload: &str,
    success: bool,
) -> Result<()> {
    let mut client = connect(config_path).await?;
    expect_delivery(
        &mut client,
        ClientMessage::Deliver {
            conversation_id,
            call_id,
            payload: parse_payload(payload),
            success,
        },
    )
    .await
}

async fn cmd_cancel(
    config_path: Option<&str>,
    conversation_id: String,
    call_id: String,
    reason: String,
) -> Result<()> {
    let mut client = connect(config_path).await?;
    expect_delivery(
        &mut client,
        ClientMessage::Cancel {
            conversation_id,
            call_id,
            reason: Some(reason),
        },
    )
    .await
}

async fn cmd_pending(config_path: Option<&str>, conversation_id: Option<String>) -> Result<()> {
    let mut client = connect(config_path).await?;
    let calls = match client
        .request(ClientMessage::ListPending { conversation_id })
        .await?
    {
        ServerMessage::Pending { calls } => calls,
        other => bail!("unexpected reply: {other:?}"),
    };

    if calls.is_empty() {
        println!("no pending calls");
    }
    for call in calls {
        let note = call.note.as_deref().unwrap_or("");
        println!(
            "{}  {}  {}  turn={}  since={}  {note}",
            call.conversation_id,
            call.call_id,
            call.tool_name,
            call.turn_id,
            call.registered_at.to_rfc3339()
        );
    }
    Ok(())
}

async fn cmd_watch(config_path: Option<&str>, conversation_id: Option<String>) -> Result<()> {
    let mut client = connect(config_path).await?;
    client
        .send(ClientMessage::Subscribe { conversation_id })
        .await?;
    loop {
        tokio::select! {
            message = client.recv() => match message? {
                ServerMessage::Status { event } => println!(
                    "{}  {}  {}  {}",
                    event.timestamp.to_rfc3339(),
                    event.conversation_id,
                    event.call_id,
                    event.status
                ),
                other => warn!(?other, "unexpected message while watching"),
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

/// `NAME` or `NAME=JSON_ARGS`.
fn parse_call_spec(spec: &str) -> Result<ToolCall> {
    let (name, arguments) = match spec.split_once('=') {
        Some((name, raw)) => (
            name,
            serde_json::from_str(raw)
                .with_context(|| format!("invalid JSON arguments for {name}"))?,
        ),
        None => (spec, Value::Object(serde_json::Map::new())),
    };
    if name.is_empty() {
        bail!("empty tool name in --call {spec}");
    }
    let id = format!("call_{}", uuid::Uuid::new_v4().simple());
    Ok(ToolCall::new(id, name, arguments))
}

async fn cmd_run(
    config_path: Option<&str>,
    conversation_id: String,
    specs: &[String],
    turn_id: Option<String>,
) -> Result<()> {
    let calls = specs
        .iter()
        .map(|spec| parse_call_spec(spec))
        .collect::<Result<Vec<_>>>()?;

    let mut client = connect(config_path).await?;
    client
        .send(ClientMessage::RunTurn {
            conversation_id: conversation_id.clone(),
            turn_id,
            calls,
        })
        .await?;

    loop {
        match client.recv().await? {
            ServerMessage::ToolWaiting { id, name, note, .. } => {
                let note = note.map(|n| format!(" ({n})")).unwrap_or_default();
                println!("waiting  {name} {id}{note}");
                println!(
                    "         deliver with: parked deliver {conversation_id} {id} '<json>'"
                );
            }
            ServerMessage::ToolResult {
                id,
                output,
                is_error,
                ..
            } => {
                let marker = if is_error { "error " } else { "result" };
                println!("{marker}   {id}: {output}");
            }
            ServerMessage::TurnDone {
                turn_id, aborted, ..
            } => {
                let suffix = if aborted { " (aborted)" } else { "" };
                println!("turn {turn_id} done{suffix}");
                return Ok(());
            }
            ServerMessage::Error { message } => bail!(message),
            other => warn!(?other, "unexpected message during turn"),
        }
    }
}

async fn cmd_end(config_path: Option<&str>, conversation_id: String) -> Result<()> {
    let mut client = connect(config_path).await?;
    match client
        .request(ClientMessage::EndConversation { conversation_id })
        .await?
    {
        ServerMessage::ConversationEnded {
            conversation_id,
            cancelled,
        } => {
            println!("ended {conversation_id}, cancelled {cancelled} waiting call(s)");
            Ok(())
        }
        ServerMessage::Error { message } => bail!(message),
        other => bail!("unexpected reply: {other:?}"),
    }
}

fn print_orphans(orphans: &[OrphanedCall]) {
    if orphans.is_empty() {
        println!("no orphaned calls");
    }
    for orphan in orphans {
        println!(
            "{}  {}  {}  turn={}  since={}",
            orphan.conversation_id,
            orphan.call_id,
            orphan.tool_name,
            orphan.turn_id,
            orphan.registered_at.to_rfc3339()
        );
    }
}

/// Ask the running daemon; without one, read the ledger directly.
async fn cmd_orphans(config_path: Option<&str>) -> Result<()> {
    if let Ok(mut client) = connect(config_path).await {
        match client.request(ClientMessage::ListOrphans).await? {
            ServerMessage::Orphans { orphans, degraded } => {
                if degraded {
                    bail!("the daemon could not read its ledger; see its log");
                }
                print_orphans(&orphans);
                return Ok(());
            }
            other => bail!("unexpected reply: {other:?}"),
        }
    }

    let (config, config_dir) = load_config(config_path)?;
    let ledger = JsonlLedger::open(config.ledger_path(&config_dir))?;
    let report = ledger.recover()?;
    if report.torn_tail {
        eprintln!("note: the last ledger line was incomplete and was ignored");
    }
    print_orphans(&report.orphans);
    Ok(())
}

/// A running daemon owns the ledger and does the repair itself, so calls it
/// is still serving are refused. The file is only written here when no
/// daemon answers.
async fn cmd_repair(
    config_path: Option<&str>,
    conversation_id: String,
    call_id: String,
    phase: LedgerPhase,
) -> Result<()> {
    let record = if let Ok(mut client) = connect(config_path).await {
        match client
            .request(ClientMessage::Repair {
                conversation_id,
                call_id,
                phase,
            })
            .await?
        {
            ServerMessage::Repaired { record } => record,
            ServerMessage::Error { message } => bail!(message),
            other => bail!("unexpected reply: {other:?}"),
        }
    } else {
        let (config, config_dir) = load_config(config_path)?;
        let ledger = JsonlLedger::open(config.ledger_path(&config_dir))?;
        ledger.repair(&conversation_id, &call_id, phase, Utc::now())?
    };
    print_repaired(&record);
    Ok(())
}

fn print_repaired(record: &LedgerRecord) {
    println!(
        "marked {} in {} as {} (turn {})",
        record.call_id, record.conversation_id, record.phase, record.turn_id
    );
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_falls_back_to_string() {
        assert_eq!(parse_payload(r#"{"ok":true}"#), json!({"ok": true}));
        assert_eq!(parse_payload("42"), json!(42));
        assert_eq!(parse_payload("approved"), json!("approved"));
    }

    #[test]
    fn call_spec_with_and_without_arguments() {
        let call = parse_call_spec("echo").unwrap();
        assert_eq!(call.name, "echo");
        assert_eq!(call.arguments, json!({}));
        assert!(call.id.starts_with("call_"));

        let call = parse_call_spec(r#"mail_wait={"message_id":"m-1"}"#).unwrap();
        assert_eq!(call.name, "mail_wait");
        assert_eq!(call.arguments, json!({"message_id": "m-1"}));

        assert!(parse_call_spec("mail_wait={oops").is_err());
        assert!(parse_call_spec("=1").is_err());
    }

    #[test]
    fn generated_call_ids_differ() {
        let a = parse_call_spec("echo").unwrap();
        let b = parse_call_spec("echo").unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn failure_acks_become_errors() {
        assert!(report_ack(&DeliveryAck::AlreadyResolved).is_ok());
        assert!(report_ack(&DeliveryAck::UnknownCallId).is_err());
        let err = report_ack(&DeliveryAck::ConversationNotFound).unwrap_err();
        assert!(err.to_string().contains("parked repair"));
    }
}
