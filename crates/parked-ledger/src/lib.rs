//! Durable, append-only record of pending call lifecycles.
//!
//! The in-memory registry does not survive a restart. This ledger does, so
//! a fresh process can list calls that were still waiting when the old one
//! died and let an operator close them out by hand.

mod error;
mod jsonl;
mod recovery;

pub use error::LedgerError;
pub use jsonl::{JsonlLedger, read_records};
pub use recovery::{OrphanedCall, RecoveryReport, find_orphans};
