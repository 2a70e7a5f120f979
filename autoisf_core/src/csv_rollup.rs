//! CSV rollup of the decision audit log.
//!
//! Flattens decision records into an appendable CSV for spreadsheets and
//! troubleshooting, then archives the JSONL log so it is never rolled up
//! twice.

use crate::{DecisionRecord, Result, SensitivityFactor};
use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// A row in the CSV output
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct CsvRow {
    pub id: String,
    pub timestamp: String,
    pub glucose: Option<f64>,
    pub sensitivity_ratio: f64,
    pub acce_isf: f64,
    pub bg_isf: f64,
    pub delta_isf: f64,
    pub dura_isf: f64,
    pub pp_isf: f64,
    pub adjusted_isf: Option<f64>,
    pub smb_enabled: bool,
    pub smb_delivery_ratio: f64,
    pub override_kind: Option<String>,
    pub override_rate: Option<f64>,
    pub override_minutes: Option<f64>,
    pub reasons: String,
}

impl From<&DecisionRecord> for CsvRow {
    fn from(record: &DecisionRecord) -> Self {
        let factor = |f: SensitivityFactor| record.contribution(f).map_or(1.0, |c| c.ratio);
        let o = record.basal_override.as_ref();
        CsvRow {
            id: record.id.to_string(),
            timestamp: record.timestamp.to_rfc3339(),
            glucose: record.glucose,
            sensitivity_ratio: record.sensitivity_ratio,
            acce_isf: factor(SensitivityFactor::Acceleration),
            bg_isf: factor(SensitivityFactor::BgLevel),
            delta_isf: factor(SensitivityFactor::Delta),
            dura_isf: factor(SensitivityFactor::Duration),
            pp_isf: factor(SensitivityFactor::PostMeal),
            adjusted_isf: record.adjusted_isf,
            smb_enabled: record.smb_enabled,
            smb_delivery_ratio: record.smb_delivery_ratio,
            override_kind: o.map(|o| o.kind_name().to_string()),
            override_rate: o.map(|o| o.rate()),
            override_minutes: o.map(|o| o.duration_minutes()),
            reasons: record.reason_trail.join("; "),
        }
    }
}

/// Archive path for a log rolled up at `at`:
/// `decisions.jsonl` -> `decisions.jsonl.20240501T120000123456789Z.processed`
pub fn processed_path(log_path: &Path, at: DateTime<Utc>) -> PathBuf {
    let name = log_path
        .file_name()
        .map_or_else(|| "audit".into(), |n| n.to_string_lossy());
    log_path.with_file_name(format!(
        "{}.{}.processed",
        name,
        at.format("%Y%m%dT%H%M%S%9fZ")
    ))
}

/// First archive path for `log_path` that does not exist yet
fn free_processed_path(log_path: &Path) -> PathBuf {
    let mut at = Utc::now();
    loop {
        let path = processed_path(log_path, at);
        if !path.exists() {
            return path;
        }
        at += chrono::Duration::nanoseconds(1);
    }
}

/// Roll up the audit log into CSV and archive the log
///
/// 1. Reads all decisions from the log
/// 2. Appends them to the CSV file (headers only when the file is new)
/// 3. Syncs the CSV to disk
/// 4. Renames the log to a timestamped `.processed` archive
///
/// The CSV is fsynced before the rename, and the log is renamed rather than
/// deleted so it can be recovered by hand. Earlier archives are never
/// replaced.
pub fn audit_to_csv_and_archive(log_path: &Path, csv_path: &Path) -> Result<usize> {
    let contents = crate::audit::read_audit(log_path)?;
    if !contents.skipped_lines.is_empty() {
        tracing::warn!(
            "Rolling up {:?} without unreadable lines {:?}",
            log_path,
            contents.skipped_lines
        );
    }
    let records = contents.records;

    if records.is_empty() {
        tracing::info!("No decisions in audit log to roll up");
        return Ok(0);
    }

    if let Some(parent) = csv_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(csv_path)?;
    let needs_headers = file.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_headers)
        .from_writer(file);

    for record in &records {
        writer.serialize(CsvRow::from(record))?;
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.sync_all()?;

    tracing::info!("Wrote {} decisions to CSV", records.len());

    let archived = free_processed_path(log_path);
    std::fs::rename(log_path, &archived)?;
    tracing::info!("Archived audit log to {:?}", archived);

    Ok(records.len())
}

/// Remove every `.processed` archive in `dir`
pub fn cleanup_processed_logs(dir: &Path) -> Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "processed") {
            std::fs::remove_file(&path)?;
            tracing::debug!("Removed processed log: {:?}", path);
            count += 1;
        }
    }

    if count > 0 {
        tracing::info!("Cleaned up {} processed audit logs", count);
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{DecisionSink, JsonlAuditLog};
    use crate::{DosingOverride, KetoFloorMode, Policy};
    use chrono::Utc;
    use std::fs::File;

    fn archives(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "processed"))
            .collect()
    }

    fn create_test_record(ratio: f64) -> DecisionRecord {
        let mut record = DecisionRecord::neutral(Utc::now(), true, &Policy::default());
        record.sensitivity_ratio = ratio;
        record.glucose = Some(142.0);
        record.reason_trail = vec!["first".to_string(), "second".to_string()];
        record
    }

    #[test]
    fn test_rollup_creates_csv_and_archives() {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_path = temp_dir.path().join("decisions.jsonl");
        let csv_path = temp_dir.path().join("decisions.csv");

        let mut log = JsonlAuditLog::new(&log_path);
        for i in 0..3 {
            log.append(&create_test_record(0.8 + i as f64 * 0.1)).unwrap();
        }

        let count = audit_to_csv_and_archive(&log_path, &csv_path).unwrap();
        assert_eq!(count, 3);
        assert!(csv_path.exists());
        assert!(!log_path.exists());
        assert_eq!(archives(temp_dir.path()).len(), 1);
    }

    #[test]
    fn test_second_rollup_keeps_first_archive() {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_path = temp_dir.path().join("decisions.jsonl");
        let csv_path = temp_dir.path().join("decisions.csv");

        for ratio in [0.9, 1.1] {
            JsonlAuditLog::new(&log_path)
                .append(&create_test_record(ratio))
                .unwrap();
            audit_to_csv_and_archive(&log_path, &csv_path).unwrap();
        }

        let archived = archives(temp_dir.path());
        assert_eq!(archived.len(), 2);
        let total: usize = archived
            .iter()
            .map(|p| crate::audit::read_decisions(p).unwrap().len())
            .sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn test_processed_path_format() {
        let at = DateTime::parse_from_rfc3339("2024-05-01T12:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);
        let path = processed_path(Path::new("/data/audit/decisions.jsonl"), at);
        assert_eq!(
            path,
            PathBuf::from("/data/audit/decisions.jsonl.20240501T120000500000000Z.processed")
        );
    }

    #[test]
    fn test_rollup_appends_without_second_header() {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_path = temp_dir.path().join("decisions.jsonl");
        let csv_path = temp_dir.path().join("decisions.csv");

        let mut log = JsonlAuditLog::new(&log_path);
        log.append(&create_test_record(0.9)).unwrap();
        audit_to_csv_and_archive(&log_path, &csv_path).unwrap();

        let mut log = JsonlAuditLog::new(&log_path);
        log.append(&create_test_record(1.1)).unwrap();
        audit_to_csv_and_archive(&log_path, &csv_path).unwrap();

        let mut reader = csv::Reader::from_path(&csv_path).unwrap();
        let rows: Vec<CsvRow> = reader.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].sensitivity_ratio, 0.9);
        assert_eq!(rows[1].sensitivity_ratio, 1.1);
        assert_eq!(rows[0].reasons, "first; second");
    }

    #[test]
    fn test_override_columns() {
        let mut record = create_test_record(1.0);
        record.basal_override = Some(DosingOverride::KetoProtectFloor {
            rate: 0.2,
            mode: KetoFloorMode::Percent,
            duration_minutes: 30.0,
        });
        let row = CsvRow::from(&record);
        assert_eq!(row.override_kind.as_deref(), Some("keto_protect"));
        assert_eq!(row.override_rate, Some(0.2));
        assert_eq!(row.acce_isf, 1.0);
    }

    #[test]
    fn test_empty_log() {
        let temp_dir = tempfile::tempdir().unwrap();
        let log_path = temp_dir.path().join("decisions.jsonl");
        File::create(&log_path).unwrap();

        let count =
            audit_to_csv_and_archive(&log_path, &temp_dir.path().join("decisions.csv")).unwrap();
        assert_eq!(count, 0);
        assert!(log_path.exists());
    }

    #[test]
    fn test_cleanup_processed_logs() {
        let temp_dir = tempfile::tempdir().unwrap();
        File::create(temp_dir.path().join("a.jsonl.processed")).unwrap();
        File::create(temp_dir.path().join("b.jsonl.processed")).unwrap();
        File::create(temp_dir.path().join("decisions.jsonl")).unwrap();

        let count = cleanup_processed_logs(temp_dir.path()).unwrap();
        assert_eq!(count, 2);
        assert!(temp_dir.path().join("decisions.jsonl").exists());
    }
}
