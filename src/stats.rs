//! Record-processing statistics: periodic checkpoint and operator dump.
//!
//! Per-kind counters are persisted as absolute counts (previous stored
//! value plus the delta since the last persist) together with the delta
//! itself and the interval between persists, so reporting tools can
//! derive rates without scanning history. Watermarks for read, push, and
//! clear are checkpointed here; the last-committed watermark is persisted
//! only by the commit callback path.

use chrono::Utc;

use crate::config::ReaderConfig;
use crate::db::{self, VarStore};
use crate::error::FsMirrorError;
use crate::record::RecordKind;
use crate::stream::StreamState;
use crate::watermark::RecStats;

/// Persist watermarks, per-kind counters, and the diff interval for one
/// stream. The reported snapshot only advances for counters whose write
/// succeeded, so a failed checkpoint leaves the delta pending for the
/// next one.
pub async fn store_stream_stats(
    store: &dyn VarStore,
    st: &mut StreamState,
) -> Result<(), FsMirrorError> {
    let stream = st.def.name.clone();

    db::store_watermark(store, db::VAR_LAST_READ, &stream, &st.last_read.mark).await?;
    db::store_watermark(store, db::VAR_LAST_PUSHED, &stream, &st.last_pushed.mark).await?;
    let cleared = st.commit.wm.lock().await.last_cleared.mark;
    db::store_watermark(store, db::VAR_LAST_CLEARED, &stream, &cleared).await?;
    // The last-committed watermark is written by the commit callback.

    for kind in RecordKind::ALL {
        let idx = kind as usize;
        let current = st.counters.per_kind[idx];
        let diff = current - st.counters.reported[idx];

        let count_name = db::count_var(&stream, kind);
        let last = match store.get_var(&count_name).await? {
            Some(v) => v.parse::<u64>().unwrap_or(0),
            None => 0,
        };
        if store
            .set_var(&count_name, Some(&(last + diff).to_string()))
            .await
            .is_ok()
        {
            st.counters.reported[idx] = current;
        }

        store
            .set_var(&db::diff_var(&stream, kind), Some(&diff.to_string()))
            .await?;
    }

    let now = Utc::now();
    let interval = (now - st.last_report).num_seconds();
    store
        .set_var(
            &db::diff_interval_var(&stream),
            Some(&interval.to_string()),
        )
        .await?;

    st.last_report = now;
    st.reopen_at_report = st.nb_reopen;

    Ok(())
}

/// Log one watermark with its speeds since the previous report.
fn dump_rec_stats(verb: &str, verb_ed: &str, stream: &str, rs: &mut RecStats, interval_secs: f64) {
    // Nothing processed, nothing to report.
    if rs.mark.rec_id == 0 {
        return;
    }

    tracing::info!(
        stream,
        "last {verb_ed}: rec_id={}, rec_time={}, {verb_ed} at {}",
        rs.mark.rec_id,
        rs.mark.rec_time.format("%Y/%m/%d %T%.6f"),
        rs.mark.step_time.format("%Y/%m/%d %T%.6f"),
    );

    if let Some((speed, ratio)) = rs.take_report(interval_secs) {
        tracing::info!(
            stream,
            "{verb} speed: {speed:.2} rec/sec, log/real time ratio: {ratio:.2}"
        );
    }
}

/// Log the full stat block for one stream, in the shape operators expect:
/// counts, reader status, watermark positions with speeds, and the
/// per-kind counter line.
pub async fn dump_stream_stats(cfg: &ReaderConfig, st: &mut StreamState) {
    let stream = st.def.name.clone();

    tracing::info!(
        stream,
        reader_id = %st.def.reader_id,
        records_read = st.counters.nb_read,
        interesting_records = st.counters.interesting,
        suppressed_records = st.counters.suppressed,
        records_pending = st.queue.len(),
        reopens = st.nb_reopen,
        pairing_violations = st.counters.pairing_violations,
        unlink_synthesis_failures = st.counters.unlink_synthesis_failures,
        "changelog reader stats"
    );

    let interval_secs = (Utc::now() - st.last_report).num_seconds() as f64;

    let reopen_delta = st.nb_reopen - st.reopen_at_report;
    let polling_secs = reopen_delta as f64 * cfg.polling_interval_secs as f64;
    let status = if st.stopping {
        "terminating"
    } else if reopen_delta == 0 {
        // No reopen since the last report: busy reading records.
        "busy"
    } else if polling_secs >= interval_secs {
        // The whole interval went into polling sleeps.
        if st.last_read.mark.rec_id.saturating_sub(st.last_read.last_report_rec_id) > 1 {
            "almost idle"
        } else {
            "idle"
        }
    } else {
        "busy"
    };
    tracing::info!(stream, status, "reader status");

    if st.counters.nb_read > 0 {
        dump_rec_stats("receive", "received", &stream, &mut st.last_read, interval_secs);
        dump_rec_stats("push", "pushed", &stream, &mut st.last_pushed, interval_secs);
        let mut wm = st.commit.wm.lock().await;
        dump_rec_stats(
            "commit",
            "committed",
            &stream,
            &mut wm.last_committed,
            interval_secs,
        );
        dump_rec_stats("clear", "cleared", &stream, &mut wm.last_cleared, interval_secs);
    }

    // Per-kind counter line, only for kinds that occurred.
    let counters: Vec<String> = RecordKind::ALL
        .iter()
        .filter(|k| st.counters.per_kind[**k as usize] > 0)
        .map(|k| format!("{}: {}", k.as_str(), st.counters.per_kind[*k as usize]))
        .collect();
    if !counters.is_empty() {
        tracing::info!(stream, "changelog stats: {}", counters.join(", "));
    }
}
