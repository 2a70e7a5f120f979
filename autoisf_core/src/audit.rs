//! Append-only decision audit log.
//!
//! One decision record per line (JSONL). Appends take an exclusive lock so
//! that overlapping cycles and a rollup cannot interleave writes. A cycle
//! that died mid-write leaves a torn last line; the next append starts on a
//! fresh line so only the torn record is lost, and readers skip it.

use crate::{DecisionRecord, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Destination for assembled decisions
pub trait DecisionSink {
    fn append(&mut self, record: &DecisionRecord) -> Result<()>;
}

/// Audit log file shared by every cycle
pub struct JsonlAuditLog {
    path: PathBuf,
}

impl JsonlAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// True when the file is non-empty and its last byte is not a newline
fn ends_mid_line(file: &mut File) -> Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

impl DecisionSink for JsonlAuditLog {
    fn append(&mut self, record: &DecisionRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // serialize before locking; the line goes out in one write
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;

        let torn = ends_mid_line(&mut file)?;
        if torn {
            tracing::warn!("Audit log {:?} ends with a torn line; starting a new one", self.path);
            line.insert(0, '\n');
        }
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        file.unlock()?;

        tracing::debug!("Appended decision {} to audit log", record.id);
        Ok(())
    }
}

/// Parsed audit log plus the 1-based numbers of lines that could not be read
#[derive(Debug, Default)]
pub struct AuditContents {
    pub records: Vec<DecisionRecord>,
    pub skipped_lines: Vec<usize>,
}

/// Read the whole audit log under a shared lock, oldest first
pub fn read_audit(path: &Path) -> Result<AuditContents> {
    if !path.exists() {
        return Ok(AuditContents::default());
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let mut contents = AuditContents::default();
    for (index, line) in BufReader::new(&file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<DecisionRecord>(&line) {
            Ok(record) => contents.records.push(record),
            Err(e) => {
                tracing::warn!("Skipping audit line {}: {}", index + 1, e);
                contents.skipped_lines.push(index + 1);
            }
        }
    }

    file.unlock()?;
    tracing::debug!(
        "Read {} decisions from audit log ({} unreadable lines)",
        contents.records.len(),
        contents.skipped_lines.len()
    );
    Ok(contents)
}

/// Read all readable decisions, oldest first
pub fn read_decisions(path: &Path) -> Result<Vec<DecisionRecord>> {
    Ok(read_audit(path)?.records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DosingOverride, Policy};
    use chrono::Utc;

    fn create_test_record() -> DecisionRecord {
        let mut record = DecisionRecord::neutral(Utc::now(), true, &Policy::default());
        record.sensitivity_ratio = 0.85;
        record.basal_override = Some(DosingOverride::B30Boost {
            rate: 5.6,
            factor: 7.0,
            duration_minutes: 25.0,
        });
        record.reason_trail = vec!["autoISF ratio 0.85".to_string()];
        record
    }

    #[test]
    fn test_append_and_read_single_decision() {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_path = temp_dir.path().join("decisions.jsonl");

        let record = create_test_record();
        let mut log = JsonlAuditLog::new(&log_path);
        log.append(&record).unwrap();

        let records = read_decisions(&log_path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, record.id);
        assert_eq!(records[0].basal_override, record.basal_override);
        assert_eq!(records[0].reason_trail, record.reason_trail);
    }

    #[test]
    fn test_append_creates_parent_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_path = temp_dir.path().join("audit").join("decisions.jsonl");

        let mut log = JsonlAuditLog::new(&log_path);
        for _ in 0..3 {
            log.append(&create_test_record()).unwrap();
        }
        assert_eq!(read_decisions(&log_path).unwrap().len(), 3);
    }

    #[test]
    fn test_corrupt_line_is_skipped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_path = temp_dir.path().join("decisions.jsonl");

        let mut log = JsonlAuditLog::new(&log_path);
        log.append(&create_test_record()).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
            writeln!(file, "{{\"id\": \"truncated").unwrap();
        }
        log.append(&create_test_record()).unwrap();

        let contents = read_audit(&log_path).unwrap();
        assert_eq!(contents.records.len(), 2);
        assert_eq!(contents.skipped_lines, vec![2]);
    }

    #[test]
    fn test_append_after_torn_line_starts_fresh() {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_path = temp_dir.path().join("decisions.jsonl");

        let mut log = JsonlAuditLog::new(&log_path);
        let first = create_test_record();
        log.append(&first).unwrap();
        {
            // crash mid-write: no trailing newline
            let mut file = OpenOptions::new().append(true).open(&log_path).unwrap();
            write!(file, "{{\"id\":\"partial").unwrap();
        }
        let second = create_test_record();
        log.append(&second).unwrap();

        let contents = read_audit(&log_path).unwrap();
        let ids: Vec<_> = contents.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert_eq!(contents.skipped_lines, vec![2]);
    }

    #[test]
    fn test_read_missing_log() {
        let temp_dir = tempfile::tempdir().unwrap();
        let records = read_decisions(&temp_dir.path().join("nonexistent.jsonl")).unwrap();
        assert!(records.is_empty());
    }
}
