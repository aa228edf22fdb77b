//! Stream-position watermarks.
//!
//! A watermark is a `(record_id, record_time, step_time)` triple marking
//! the position of a stream in some processing phase: last read, last
//! pushed, last committed, last persisted, last cleared. Between
//! operations the chain `last_cleared ≤ last_committed_persisted ≤
//! last_committed ≤ last_pushed ≤ last_read` holds per stream.
//!
//! Watermarks persist in the variable store as
//! `rec_id:rec_secs.rec_usecs:step_secs.step_usecs`, microseconds
//! zero-padded to six digits (e.g. `12345:1700000000.123456:1700000001.654321`).

use chrono::{DateTime, TimeZone, Utc};

use crate::error::FsMirrorError;

/// Position of a stream in one processing phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    /// Record id, 0 when no record has reached this phase yet.
    pub rec_id: u64,
    /// Server-side timestamp of the record.
    pub rec_time: DateTime<Utc>,
    /// When the record reached this processing phase.
    pub step_time: DateTime<Utc>,
}

impl Default for Watermark {
    fn default() -> Self {
        Watermark {
            rec_id: 0,
            rec_time: DateTime::UNIX_EPOCH,
            step_time: DateTime::UNIX_EPOCH,
        }
    }
}

fn format_ts(t: &DateTime<Utc>) -> String {
    format!("{}.{:06}", t.timestamp(), t.timestamp_subsec_micros())
}

fn parse_ts(s: &str, value: &str) -> Result<DateTime<Utc>, FsMirrorError> {
    let bad = |reason: &str| FsMirrorError::VarFormat {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    let (secs, usecs) = match s.split_once('.') {
        Some((sec, usec)) => (
            sec.parse::<i64>().map_err(|_| bad("bad seconds"))?,
            usec.parse::<u32>().map_err(|_| bad("bad microseconds"))?,
        ),
        None => (s.parse::<i64>().map_err(|_| bad("bad seconds"))?, 0),
    };
    if usecs >= 1_000_000 {
        return Err(bad("microseconds out of range"));
    }

    Utc.timestamp_opt(secs, usecs * 1_000)
        .single()
        .ok_or_else(|| bad("timestamp out of range"))
}

impl Watermark {
    pub fn new(rec_id: u64, rec_time: DateTime<Utc>, step_time: DateTime<Utc>) -> Self {
        Watermark {
            rec_id,
            rec_time,
            step_time,
        }
    }

    /// Advance to the given record, stamping the step time with `now`.
    ///
    /// Watermarks never move backwards; a regression is a programming
    /// error in the caller's ordering logic.
    pub fn advance(&mut self, rec_id: u64, rec_time: DateTime<Utc>, now: DateTime<Utc>) {
        assert!(
            rec_id >= self.rec_id,
            "watermark regression: {} -> {}",
            self.rec_id,
            rec_id
        );
        self.rec_id = rec_id;
        self.rec_time = rec_time;
        self.step_time = now;
    }

    /// Encode for the variable store.
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}",
            self.rec_id,
            format_ts(&self.rec_time),
            format_ts(&self.step_time)
        )
    }

    /// Decode a persisted value. Tolerates a bare record id (the
    /// deprecated encoding) by zeroing both timestamps.
    pub fn decode(value: &str) -> Result<Self, FsMirrorError> {
        let mut parts = value.splitn(3, ':');
        let id_part = parts.next().unwrap_or("");
        let rec_id = id_part.parse::<u64>().map_err(|_| FsMirrorError::VarFormat {
            value: value.to_string(),
            reason: "bad record id".to_string(),
        })?;

        let rec_time = match parts.next() {
            Some(s) => parse_ts(s, value)?,
            None => DateTime::UNIX_EPOCH,
        };
        let step_time = match parts.next() {
            Some(s) => parse_ts(s, value)?,
            None => DateTime::UNIX_EPOCH,
        };

        Ok(Watermark {
            rec_id,
            rec_time,
            step_time,
        })
    }
}

// ── Report-aware stats ─────────────────────────────────────────────────────

/// A watermark plus the snapshot taken at the previous stat report, used
/// to compute processing speed and the log-time/real-time ratio.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecStats {
    pub mark: Watermark,
    /// Record id at the last report (0 until anything was observed).
    pub last_report_rec_id: u64,
    /// Record time at the last report.
    pub last_report_rec_time: DateTime<Utc>,
}

impl RecStats {
    /// Record that a record reached this phase.
    pub fn observe(&mut self, rec_id: u64, rec_time: DateTime<Utc>, now: DateTime<Utc>) {
        self.mark.advance(rec_id, rec_time, now);

        // First observation since start: report speeds relative to the
        // record just before it.
        if self.last_report_rec_id == 0 {
            self.last_report_rec_id = rec_id.saturating_sub(1);
            self.last_report_rec_time = rec_time;
        }
    }

    /// Records per second and log/real time ratio since the previous
    /// report, then reset the report snapshot. Returns `None` when no
    /// record was observed or no wall time elapsed.
    pub fn take_report(&mut self, interval_secs: f64) -> Option<(f64, f64)> {
        if self.mark.rec_id == 0 || self.last_report_rec_id == 0 || interval_secs <= 0.0 {
            return None;
        }

        let speed = (self.mark.rec_id - self.last_report_rec_id) as f64 / interval_secs;
        let log_span = (self.mark.rec_time - self.last_report_rec_time)
            .num_microseconds()
            .unwrap_or(0) as f64
            / 1e6;
        let ratio = log_span / interval_secs;

        self.last_report_rec_id = self.mark.rec_id;
        self.last_report_rec_time = self.mark.rec_time;

        Some((speed, ratio))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64, usecs: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, usecs * 1_000).unwrap()
    }

    #[test]
    fn test_encode_matches_persisted_layout() {
        let wm = Watermark::new(12345, ts(1_700_000_000, 123_456), ts(1_700_000_001, 654_321));
        assert_eq!(wm.encode(), "12345:1700000000.123456:1700000001.654321");
    }

    #[test]
    fn test_encode_pads_microseconds() {
        let wm = Watermark::new(7, ts(100, 42), ts(100, 0));
        assert_eq!(wm.encode(), "7:100.000042:100.000000");
    }

    #[test]
    fn test_decode_roundtrip() {
        let wm = Watermark::new(99, ts(1_600_000_000, 1), ts(1_600_000_100, 999_999));
        assert_eq!(Watermark::decode(&wm.encode()).unwrap(), wm);
    }

    #[test]
    fn test_decode_bare_record_id() {
        let wm = Watermark::decode("4711").unwrap();
        assert_eq!(wm.rec_id, 4711);
        assert_eq!(wm.rec_time, DateTime::UNIX_EPOCH);
        assert_eq!(wm.step_time, DateTime::UNIX_EPOCH);
    }

    #[test]
    fn test_decode_unpadded_microseconds() {
        // Older writers formatted microseconds without zero padding.
        let wm = Watermark::decode("5:100.42:200.7").unwrap();
        assert_eq!(wm.rec_id, 5);
        assert_eq!(wm.rec_time.timestamp(), 100);
        assert_eq!(wm.step_time.timestamp(), 200);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Watermark::decode("").is_err());
        assert!(Watermark::decode("abc").is_err());
        assert!(Watermark::decode("1:xyz:2.0").is_err());
        assert!(Watermark::decode("-1:1.0:2.0").is_err());
    }

    #[test]
    #[should_panic(expected = "watermark regression")]
    fn test_advance_panics_on_regression() {
        let mut wm = Watermark::new(10, ts(1, 0), ts(1, 0));
        wm.advance(9, ts(2, 0), ts(2, 0));
    }

    #[test]
    fn test_rec_stats_first_observation_seeds_report() {
        let mut rs = RecStats::default();
        rs.observe(100, ts(50, 0), ts(60, 0));
        assert_eq!(rs.last_report_rec_id, 99);

        rs.observe(110, ts(55, 0), ts(61, 0));
        let (speed, ratio) = rs.take_report(5.0).unwrap();
        // 11 records over 5 seconds of wall time.
        assert!((speed - 2.2).abs() < 1e-9);
        // 5 seconds of log time over 5 seconds of wall time.
        assert!((ratio - 1.0).abs() < 1e-9);

        // Snapshot was reset.
        assert_eq!(rs.last_report_rec_id, 110);
    }

    #[test]
    fn test_rec_stats_no_report_without_records() {
        let mut rs = RecStats::default();
        assert!(rs.take_report(10.0).is_none());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn encode_decode_roundtrip(
                rec_id in 0u64..u64::MAX / 2,
                rec_secs in 0i64..4_000_000_000,
                rec_us in 0u32..1_000_000,
                step_secs in 0i64..4_000_000_000,
                step_us in 0u32..1_000_000,
            ) {
                let wm = Watermark::new(rec_id, ts(rec_secs, rec_us), ts(step_secs, step_us));
                prop_assert_eq!(Watermark::decode(&wm.encode()).unwrap(), wm);
            }
        }
    }
}
