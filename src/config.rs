//! Reader configuration.
//!
//! One [`StreamDef`] per metadata server; the remaining knobs tune queue
//! drainage, the upstream acknowledgment batch, and the cadence at which
//! the last-committed watermark is persisted.
//!
//! Configuration is TOML, deserialized with serde:
//!
//! ```toml
//! [[stream]]
//! name = "meta0000"
//! reader_id = "cl1"
//!
//! batch_ack_count = 1024
//! queue_max_size = 1000
//! queue_max_age_secs = 5
//! ```

use serde::Deserialize;
use std::time::Duration;

use crate::error::FsMirrorError;

/// One metadata-server change-log stream.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamDef {
    /// Stable stream name (the server identifier), used in persisted
    /// variable names and stat reports.
    pub name: String,
    /// Reader-identity token; the upstream server keys its per-consumer
    /// cursor on it.
    #[serde(default = "default_reader_id")]
    pub reader_id: String,
}

fn default_reader_id() -> String {
    "cl1".to_string()
}

/// Configuration for the change-log ingestion core.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReaderConfig {
    /// Streams to read; one reader task per entry.
    #[serde(rename = "stream")]
    pub streams: Vec<StreamDef>,

    /// Number of committed records aggregated into one upstream clear.
    /// 1 acknowledges every record individually.
    pub batch_ack_count: u64,

    /// Reopen-and-poll instead of relying on the source's follow mode.
    pub force_polling: bool,
    /// Sleep between reopens when polling is forced.
    pub polling_interval_secs: u64,

    /// Queue size that triggers drainage to the pipeline.
    pub queue_max_size: usize,
    /// Staged operations older than this are drained regardless of queue
    /// size.
    pub queue_max_age_secs: u64,
    /// Wall-clock cadence of the drain checks.
    pub queue_check_interval_secs: u64,

    /// Persist `last_committed` when it is this much older than the
    /// persisted copy.
    pub commit_update_max_delay_secs: u64,
    /// Persist `last_committed` when it is this many records ahead of the
    /// persisted copy.
    pub commit_update_max_delta: u64,

    /// Initial guess: the server emits last-link information on renames.
    /// Refined upward by observation, never downward.
    pub server_has_rename_last: bool,
    /// Initial guess: the server reports the overwritten target of a
    /// rename. Refined upward by observation.
    pub server_has_last_exists: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            streams: Vec::new(),
            batch_ack_count: 1024,
            force_polling: false,
            polling_interval_secs: 1,
            queue_max_size: 1000,
            queue_max_age_secs: 5,
            queue_check_interval_secs: 1,
            commit_update_max_delay_secs: 5,
            commit_update_max_delta: 4096,
            server_has_rename_last: false,
            server_has_last_exists: false,
        }
    }
}

impl ReaderConfig {
    /// Parse and validate a TOML configuration document.
    pub fn from_toml_str(s: &str) -> Result<Self, FsMirrorError> {
        let cfg: ReaderConfig =
            toml::from_str(s).map_err(|e| FsMirrorError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check invariants the rest of the core relies on.
    pub fn validate(&self) -> Result<(), FsMirrorError> {
        if self.streams.is_empty() {
            return Err(FsMirrorError::Config(
                "no change-log stream defined".to_string(),
            ));
        }
        for (i, s) in self.streams.iter().enumerate() {
            if s.name.is_empty() {
                return Err(FsMirrorError::Config(format!("stream #{i} has an empty name")));
            }
            if s.reader_id.is_empty() {
                return Err(FsMirrorError::Config(format!(
                    "stream '{}' has an empty reader_id",
                    s.name
                )));
            }
            if self.streams[..i].iter().any(|p| p.name == s.name) {
                return Err(FsMirrorError::Config(format!(
                    "duplicate stream name '{}'",
                    s.name
                )));
            }
        }
        if self.batch_ack_count == 0 {
            return Err(FsMirrorError::Config("batch_ack_count must be >= 1".to_string()));
        }
        if self.queue_max_size == 0 {
            return Err(FsMirrorError::Config("queue_max_size must be >= 1".to_string()));
        }
        if self.polling_interval_secs == 0 || self.queue_check_interval_secs == 0 {
            return Err(FsMirrorError::Config(
                "polling and queue-check intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    pub fn queue_check_interval(&self) -> Duration {
        Duration::from_secs(self.queue_check_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ReaderConfig::default();
        assert_eq!(cfg.batch_ack_count, 1024);
        assert_eq!(cfg.queue_max_size, 1000);
        assert_eq!(cfg.queue_max_age_secs, 5);
        assert_eq!(cfg.commit_update_max_delta, 4096);
        assert!(!cfg.force_polling);
        assert!(!cfg.server_has_rename_last);
    }

    #[test]
    fn test_parse_minimal() {
        let cfg = ReaderConfig::from_toml_str(
            r#"
            [[stream]]
            name = "meta0000"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.streams.len(), 1);
        assert_eq!(cfg.streams[0].name, "meta0000");
        assert_eq!(cfg.streams[0].reader_id, "cl1");
    }

    #[test]
    fn test_parse_full() {
        let cfg = ReaderConfig::from_toml_str(
            r#"
            batch_ack_count = 64
            force_polling = true
            polling_interval_secs = 10
            queue_max_size = 500
            queue_max_age_secs = 30
            queue_check_interval_secs = 2
            commit_update_max_delay_secs = 60
            commit_update_max_delta = 100
            server_has_rename_last = true
            server_has_last_exists = true

            [[stream]]
            name = "meta0000"
            reader_id = "cl2"

            [[stream]]
            name = "meta0001"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.batch_ack_count, 64);
        assert!(cfg.force_polling);
        assert_eq!(cfg.polling_interval(), Duration::from_secs(10));
        assert_eq!(cfg.streams.len(), 2);
        assert_eq!(cfg.streams[0].reader_id, "cl2");
        assert_eq!(cfg.streams[1].reader_id, "cl1");
        assert!(cfg.server_has_rename_last);
    }

    #[test]
    fn test_rejects_no_streams() {
        let err = ReaderConfig::from_toml_str("batch_ack_count = 4").unwrap_err();
        assert!(err.to_string().contains("no change-log stream"));
    }

    #[test]
    fn test_rejects_duplicate_stream_names() {
        let err = ReaderConfig::from_toml_str(
            r#"
            [[stream]]
            name = "meta0000"
            [[stream]]
            name = "meta0000"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate stream name"));
    }

    #[test]
    fn test_rejects_zero_thresholds() {
        let err = ReaderConfig::from_toml_str(
            r#"
            queue_max_size = 0
            [[stream]]
            name = "meta0000"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("queue_max_size"));

        let err = ReaderConfig::from_toml_str(
            r#"
            batch_ack_count = 0
            [[stream]]
            name = "meta0000"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("batch_ack_count"));
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let err = ReaderConfig::from_toml_str(
            r#"
            batch_ack_size = 4
            [[stream]]
            name = "meta0000"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, FsMirrorError::Config(_)));
    }
}
