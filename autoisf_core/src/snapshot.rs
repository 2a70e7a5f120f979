//! Cycle snapshot loader.
//!
//! The external scheduler writes one JSON snapshot per control cycle. A
//! missing or unreadable snapshot is not an error here: the caller gets
//! `None` and the assembler answers with the neutral decision.

use crate::{CycleSnapshot, Result};
use std::path::Path;

/// Load a cycle snapshot from a JSON file
///
/// Returns None if the file doesn't exist or can't be parsed.
pub fn load_snapshot(path: &Path) -> Result<Option<CycleSnapshot>> {
    if !path.exists() {
        tracing::warn!("No snapshot file found at {:?}", path);
        return Ok(None);
    }

    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::warn!(
                "Failed to read snapshot at {:?}: {}. Treating as absent.",
                path,
                e
            );
            return Ok(None);
        }
    };

    let snapshot: CycleSnapshot = match serde_json::from_str(&contents) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            tracing::warn!(
                "Failed to parse snapshot at {:?}: {}. Treating as absent.",
                path,
                e
            );
            return Ok(None);
        }
    };

    tracing::info!(
        "Loaded snapshot for {} with {} glucose readings",
        snapshot.now,
        snapshot.glucose.as_ref().map_or(0, Vec::len)
    );

    Ok(Some(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TempTargetKind;

    const SNAPSHOT: &str = r#"{
        "now": "2024-05-01T12:00:00Z",
        "glucose": [
            { "value": 120, "timestamp": "2024-05-01T11:45:00Z" },
            { "value": 180, "timestamp": "2024-05-01T11:50:00Z" },
            { "value": 240, "timestamp": "2024-05-01T11:55:00Z" },
            { "value": 300, "timestamp": "2024-05-01T12:00:00Z" }
        ],
        "policy": { "autoisf": { "enabled": true, "bg_accel_weight": 0.15 } },
        "iob": { "iob": 1.2 },
        "temp_target": {
            "target": 90,
            "kind": "eating_soon",
            "activated_at": "2024-05-01T11:40:00Z",
            "duration_minutes": 60
        },
        "profile": { "target_low": 100, "target_high": 100, "sens": 50, "current_basal": 0.8 }
    }"#;

    #[test]
    fn test_load_snapshot() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("snapshot.json");
        std::fs::write(&path, SNAPSHOT).unwrap();

        let snapshot = load_snapshot(&path).unwrap().unwrap();
        assert_eq!(snapshot.glucose.as_ref().unwrap().len(), 4);
        assert!(snapshot.smb_enabled_default);
        assert!(snapshot.boluses.is_empty());
        assert_eq!(snapshot.iob.iob, 1.2);
        let policy = snapshot.policy.as_ref().unwrap();
        assert!(policy.autoisf.enabled);
        assert_eq!(policy.autoisf.max_ratio, 1.3);
        let tt = snapshot.active_temp_target().unwrap();
        assert_eq!(tt.kind, TempTargetKind::EatingSoon);
    }

    #[test]
    fn test_missing_snapshot_returns_none() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nonexistent.json");
        assert!(load_snapshot(&path).unwrap().is_none());
    }

    #[test]
    fn test_malformed_snapshot_returns_none() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(load_snapshot(&path).unwrap().is_none());
    }

    #[test]
    fn test_other_temp_target_kind() {
        let json = SNAPSHOT.replace("\"eating_soon\"", "{ \"other\": \"activity\" }");
        let snapshot: CycleSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(
            snapshot.temp_target.unwrap().kind,
            TempTargetKind::Other("activity".to_string())
        );
    }
}
