use clap::{Parser, Subcommand, ValueEnum};
use parked_core::LedgerPhase;

#[derive(Parser)]
#[command(
    name = "parked",
    version,
    about = "Keeps agent turns parked while their tool calls finish elsewhere"
)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the daemon in the foreground.
    Start,
    /// Deliver the final result of a pending call.
    Deliver {
        conversation: String,
        call_id: String,
        /// JSON payload. Anything that does not parse is sent as a string.
        payload: String,
        /// Mark the result as a failure.
        #[arg(long)]
        failed: bool,
    },
    /// Cancel a waiting call.
    Cancel {
        conversation: String,
        call_id: String,
        #[arg(short, long, default_value = "cancelled by operator")]
        reason: String,
    },
    /// List waiting calls.
    Pending {
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Stream call status changes.
    Watch {
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Run one turn of tool calls and print its outputs.
    Run {
        conversation: String,
        /// Tool call as `NAME` or `NAME=JSON_ARGS`. Repeat for concurrent calls.
        #[arg(long = "call", value_name = "NAME[=ARGS]", required = true)]
        calls: Vec<String>,
        #[arg(long)]
        turn: Option<String>,
    },
    /// End a conversation, cancelling anything still waiting in it.
    End { conversation: String },
    /// List calls a previous process left waiting.
    Orphans,
    /// Close an orphaned call in the ledger by hand.
    Repair {
        conversation: String,
        call_id: String,
        #[arg(long, value_enum, default_value = "cancelled")]
        phase: RepairPhase,
    },
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum RepairPhase {
    Resolved,
    Cancelled,
}

impl From<RepairPhase> for LedgerPhase {
    fn from(phase: RepairPhase) -> Self {
        match phase {
            RepairPhase::Resolved => LedgerPhase::Resolved,
            RepairPhase::Cancelled => LedgerPhase::Cancelled,
        }
    }
}
