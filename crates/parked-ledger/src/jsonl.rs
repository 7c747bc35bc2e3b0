use crate::error::LedgerError;
use crate::recovery::{RecoveryReport, find_orphans};
use chrono::{DateTime, Utc};
use parked_core::{LedgerPhase, LedgerRecord, LedgerSink};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Ledger stored as one JSON record per line.
///
/// Appends are serialized through a mutex and synced before returning, so a
/// record the registry was told about survives a crash right after. Each
/// record goes out in a single write, newline included.
#[derive(Debug)]
pub struct JsonlLedger {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| LedgerError::io(parent, e))?;
        }
        seal_tail(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LedgerError::io(&path, e))?;
        debug!(path = %path.display(), "opened ledger");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, record: &LedgerRecord) -> Result<(), LedgerError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = self.file.lock().expect("ledger file poisoned");
        file.write_all(line.as_bytes())
            .map_err(|e| LedgerError::io(&self.path, e))?;
        file.sync_data().map_err(|e| LedgerError::io(&self.path, e))?;
        Ok(())
    }

    /// Scan the whole file and report calls that never reached a terminal
    /// record.
    pub fn recover(&self) -> Result<RecoveryReport, LedgerError> {
        let (records, torn_tail) = read_records(&self.path)?;
        let orphans = find_orphans(&records);
        info!(
            path = %self.path.display(),
            records = records.len(),
            orphans = orphans.len(),
            torn_tail,
            "ledger recovered"
        );
        Ok(RecoveryReport {
            records: records.len(),
            orphans,
            torn_tail,
        })
    }

    /// Close an orphan by hand. Writes a terminal record marked as repaired;
    /// no turn is resumed.
    ///
    /// Only registrations older than `registered_before` count. A running
    /// daemon passes its start time so calls it is still serving stay out of
    /// reach.
    pub fn repair(
        &self,
        conversation_id: &str,
        call_id: &str,
        phase: LedgerPhase,
        registered_before: DateTime<Utc>,
    ) -> Result<LedgerRecord, LedgerError> {
        if !phase.is_terminal() {
            return Err(LedgerError::NotTerminal);
        }

        let report = self.recover()?;
        let Some(orphan) = report
            .orphans
            .iter()
            .rev()
            .filter(|o| o.registered_at < registered_before)
            .find(|o| o.conversation_id == conversation_id && o.call_id == call_id)
        else {
            return Err(LedgerError::NoSuchOrphan {
                conversation_id: conversation_id.to_owned(),
                call_id: call_id.to_owned(),
            });
        };

        let record = LedgerRecord {
            call_id: orphan.call_id.clone(),
            conversation_id: orphan.conversation_id.clone(),
            turn_id: orphan.turn_id.clone(),
            tool_name: orphan.tool_name.clone(),
            phase,
            timestamp: Utc::now(),
            repaired: true,
        };
        self.write(&record)?;
        info!(conversation = conversation_id, call_id, %phase, "orphan repaired");
        Ok(record)
    }
}

impl LedgerSink for JsonlLedger {
    fn append(&self, record: &LedgerRecord) -> anyhow::Result<()> {
        self.write(record)?;
        Ok(())
    }
}

/// Leave the file ending on a line boundary so the next append starts a
/// fresh line.
///
/// A final line that parses as a record only lost its newline and gets one.
/// Anything else after the last newline is a torn write and is cut off.
fn seal_tail(path: &Path) -> Result<(), LedgerError> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(LedgerError::io(path, e)),
    };
    if content.last().is_none_or(|b| *b == b'\n') {
        return Ok(());
    }

    let start = content
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |i| i + 1);
    let tail = &content[start..];
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| LedgerError::io(path, e))?;

    if serde_json::from_slice::<LedgerRecord>(tail).is_ok() {
        file.seek(SeekFrom::End(0))
            .and_then(|_| file.write_all(b"\n"))
            .map_err(|e| LedgerError::io(path, e))?;
        warn!(path = %path.display(), "terminated unfinished final ledger line");
    } else {
        file.set_len(start as u64)
            .map_err(|e| LedgerError::io(path, e))?;
        warn!(
            path = %path.display(),
            dropped_bytes = tail.len(),
            "truncated torn final ledger line"
        );
    }
    file.sync_data().map_err(|e| LedgerError::io(path, e))
}

/// Read every record in a ledger file. A missing file is an empty ledger.
///
/// Returns the records and whether the final line was torn. Blank lines are
/// skipped. An unparseable line anywhere but the end is an error.
pub fn read_records(path: &Path) -> Result<(Vec<LedgerRecord>, bool), LedgerError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), false)),
        Err(e) => return Err(LedgerError::io(path, e)),
    };

    let lines: Vec<(usize, &str)> = content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .collect();

    let mut records = Vec::with_capacity(lines.len());
    let mut torn_tail = false;
    for (pos, (index, line)) in lines.iter().enumerate() {
        match serde_json::from_str::<LedgerRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) if pos + 1 == lines.len() => {
                warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %e,
                    "ignoring torn final ledger line"
                );
                torn_tail = true;
            }
            Err(e) => {
                return Err(LedgerError::Corrupt {
                    path: path.to_path_buf(),
                    line: index + 1,
                    source: e,
                });
            }
        }
    }
    Ok((records, torn_tail))
}
