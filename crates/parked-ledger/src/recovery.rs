use chrono::{DateTime, Utc};
use parked_core::{LedgerPhase, LedgerRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A call that was registered but never reached a terminal record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanedCall {
    pub call_id: String,
    pub conversation_id: String,
    pub turn_id: String,
    pub tool_name: String,
    pub registered_at: DateTime<Utc>,
}

impl From<&LedgerRecord> for OrphanedCall {
    fn from(record: &LedgerRecord) -> Self {
        Self {
            call_id: record.call_id.clone(),
            conversation_id: record.conversation_id.clone(),
            turn_id: record.turn_id.clone(),
            tool_name: record.tool_name.clone(),
            registered_at: record.timestamp,
        }
    }
}

/// Result of scanning the ledger at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub records: usize,
    pub orphans: Vec<OrphanedCall>,
    /// The last line was cut short, most likely by a crash mid-append.
    pub torn_tail: bool,
}

/// Registrations without a matching terminal record.
///
/// Matching is by count per `(conversation_id, call_id)` rather than by
/// position: a terminal record written by another thread may land before
/// its registration line. When an id was registered more than once, the
/// oldest registrations are the ones considered closed.
pub fn find_orphans(records: &[LedgerRecord]) -> Vec<OrphanedCall> {
    let mut registrations: HashMap<(&str, &str), Vec<&LedgerRecord>> = HashMap::new();
    let mut terminals: HashMap<(&str, &str), usize> = HashMap::new();

    for record in records {
        let key = (record.conversation_id.as_str(), record.call_id.as_str());
        match record.phase {
            LedgerPhase::Registered => registrations.entry(key).or_default().push(record),
            LedgerPhase::Resolved | LedgerPhase::Cancelled => {
                *terminals.entry(key).or_default() += 1;
            }
        }
    }

    let mut orphans: Vec<OrphanedCall> = registrations
        .into_iter()
        .flat_map(|(key, registered)| {
            let closed = terminals.get(&key).copied().unwrap_or(0);
            registered
                .into_iter()
                .skip(closed)
                .map(OrphanedCall::from)
                .collect::<Vec<_>>()
        })
        .collect();
    orphans.sort_by(|a, b| {
        a.registered_at
            .cmp(&b.registered_at)
            .then_with(|| a.call_id.cmp(&b.call_id))
    });
    orphans
}
