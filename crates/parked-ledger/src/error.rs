use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode ledger record: {0}")]
    Encode(#[from] serde_json::Error),
    /// An unreadable line that is not the last one. A torn final line is
    /// tolerated; anything else means the file cannot be trusted.
    #[error("ledger {path} is corrupt at line {line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("no orphaned call {call_id} in conversation {conversation_id}")]
    NoSuchOrphan {
        conversation_id: String,
        call_id: String,
    },
    #[error("repair must close a call as resolved or cancelled")]
    NotTerminal,
}

impl LedgerError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LedgerError::Io {
            path: path.into(),
            source,
        }
    }
}
