//! Recent decision history.
//!
//! Loads the decisions of the last N hours from the audit log for display
//! and troubleshooting.

use crate::{DecisionRecord, DosingOverride, Result};
use chrono::{Duration, Utc};
use std::path::Path;

/// Load decisions from the last `hours` hours
///
/// Returns records sorted by timestamp (newest first).
pub fn load_recent_decisions(path: &Path, hours: i64) -> Result<Vec<DecisionRecord>> {
    let cutoff = Utc::now() - Duration::hours(hours);

    let mut records: Vec<DecisionRecord> = crate::audit::read_decisions(path)?
        .into_iter()
        .filter(|r| r.timestamp >= cutoff)
        .collect();
    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    tracing::info!(
        "Loaded {} decisions from last {} hours",
        records.len(),
        hours
    );
    Ok(records)
}

/// Most recent basal override in a newest-first list
pub fn last_override(records: &[DecisionRecord]) -> Option<&DosingOverride> {
    records.iter().find_map(|r| r.basal_override.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{DecisionSink, JsonlAuditLog};
    use crate::Policy;

    fn create_test_record(hours_ago: i64, ratio: f64) -> DecisionRecord {
        let mut record = DecisionRecord::neutral(
            Utc::now() - Duration::hours(hours_ago),
            true,
            &Policy::default(),
        );
        record.sensitivity_ratio = ratio;
        record
    }

    #[test]
    fn test_load_recent_filters_by_window() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("decisions.jsonl");

        let mut log = JsonlAuditLog::new(&path);
        log.append(&create_test_record(1, 0.9)).unwrap();
        log.append(&create_test_record(5, 1.0)).unwrap();
        log.append(&create_test_record(30, 1.1)).unwrap(); // Too old

        let records = load_recent_decisions(&path, 24).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_sorted_newest_first() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("decisions.jsonl");

        let mut log = JsonlAuditLog::new(&path);
        log.append(&create_test_record(3, 0.8)).unwrap();
        log.append(&create_test_record(1, 1.2)).unwrap();
        log.append(&create_test_record(2, 1.0)).unwrap();

        let records = load_recent_decisions(&path, 24).unwrap();
        let ratios: Vec<f64> = records.iter().map(|r| r.sensitivity_ratio).collect();
        assert_eq!(ratios, vec![1.2, 1.0, 0.8]);
    }

    #[test]
    fn test_last_override() {
        let mut with_override = create_test_record(2, 1.0);
        with_override.basal_override = Some(DosingOverride::B30Boost {
            rate: 7.0,
            factor: 7.0,
            duration_minutes: 30.0,
        });
        let records = vec![create_test_record(1, 1.0), with_override];
        assert_eq!(last_override(&records).map(|o| o.kind_name()), Some("b30"));
        assert!(last_override(&records[..1]).is_none());
    }
}
