use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Progress marker for a migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationCheckpoint {
    pub last_offset: u64,
    #[serde(default)]
    pub migrated: BTreeMap<String, String>,
    #[serde(default)]
    pub failed: BTreeMap<String, String>,
    /// Records stored with a fallback vector, by checksum. They never count
    /// as unchanged, so the next run embeds them with the real provider.
    #[serde(default)]
    pub degraded: BTreeMap<String, String>,
    /// Set when a run reached the end of the source. The next run rescans
    /// from offset 0 and relies on checksums to skip unchanged records.
    #[serde(default)]
    pub completed: bool,
}

impl MigrationCheckpoint {
    pub fn is_unchanged(&self, id: &str, checksum: &str) -> bool {
        self.migrated.get(id).map(String::as_str) == Some(checksum)
    }

    pub fn record_migrated(&mut self, id: &str, checksum: &str) {
        self.failed.remove(id);
        self.degraded.remove(id);
        self.migrated.insert(id.to_string(), checksum.to_string());
    }

    pub fn record_degraded(&mut self, id: &str, checksum: &str) {
        self.failed.remove(id);
        self.migrated.remove(id);
        self.degraded.insert(id.to_string(), checksum.to_string());
    }

    pub fn record_failed(&mut self, id: &str, error: &str) {
        self.failed.insert(id.to_string(), error.to_string());
    }

    /// Offset the next run should start from.
    pub fn resume_offset(&self) -> u64 {
        if self.completed {
            0
        } else {
            self.last_offset
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterStats {
    pub added: u64,
    pub written: u64,
    pub flushes: u64,
    pub retries: u64,
    pub failed_writes: u64,
    pub dropped_writes: u64,
    pub transactions: u64,
    pub rollbacks: u64,
}

/// Resume point for a long-running document writer job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterCheckpoint {
    pub last_processed_id: String,
    pub timestamp: DateTime<Utc>,
    pub stats: WriterStats,
    #[serde(default)]
    pub extra: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_migrated_clears_previous_failure() {
        let mut ckpt = MigrationCheckpoint::default();
        ckpt.record_failed("r1", "timeout");
        ckpt.record_migrated("r1", "abc");

        assert!(ckpt.failed.is_empty());
        assert!(ckpt.is_unchanged("r1", "abc"));
        assert!(!ckpt.is_unchanged("r1", "def"));
        assert!(!ckpt.is_unchanged("r2", "abc"));
    }

    #[test]
    fn test_degraded_record_is_never_unchanged() {
        let mut ckpt = MigrationCheckpoint::default();
        ckpt.record_migrated("r1", "abc");
        ckpt.record_degraded("r1", "abc");

        assert!(!ckpt.is_unchanged("r1", "abc"));
        assert!(ckpt.migrated.is_empty());

        ckpt.record_migrated("r1", "abc");
        assert!(ckpt.degraded.is_empty());
        assert!(ckpt.is_unchanged("r1", "abc"));
    }

    #[test]
    fn test_completed_run_rescans_from_start() {
        let mut ckpt = MigrationCheckpoint {
            last_offset: 5,
            ..Default::default()
        };
        assert_eq!(ckpt.resume_offset(), 5);
        ckpt.completed = true;
        assert_eq!(ckpt.resume_offset(), 0);

        let legacy: MigrationCheckpoint =
            serde_json::from_str(r#"{"last_offset": 3}"#).unwrap();
        assert!(!legacy.completed);
        assert_eq!(legacy.resume_offset(), 3);
    }

    #[test]
    fn test_checkpoint_json_shape() {
        let mut ckpt = MigrationCheckpoint {
            last_offset: 4,
            ..Default::default()
        };
        ckpt.record_migrated("r1", "c1");
        ckpt.record_failed("r2", "boom");

        let json = serde_json::to_value(&ckpt).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "last_offset": 4,
                "migrated": { "r1": "c1" },
                "failed": { "r2": "boom" },
                "degraded": {},
                "completed": false
            })
        );
    }
}
