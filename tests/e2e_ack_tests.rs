//! End-to-end acknowledgment tests: batching of upstream clears, restart
//! idempotence, and the per-stream watermark chain.

mod common;

use common::*;
use std::sync::Arc;

use fsmirror::db::{MemVarStore, VarStore};
use fsmirror::pipeline::EntryPipeline;
use fsmirror::record::RecordKind;
use fsmirror::service::{ChangelogReaders, RunMode};
use fsmirror::source::ChangelogEndpoint;

fn build(
    cfg: fsmirror::config::ReaderConfig,
    endpoint: &Arc<SimEndpoint>,
    pipeline: &Arc<SimPipeline>,
    store: &Arc<MemVarStore>,
) -> ChangelogReaders {
    ChangelogReaders::new(
        cfg,
        vec![endpoint.clone() as Arc<dyn ChangelogEndpoint>],
        pipeline.clone() as Arc<dyn EntryPipeline>,
        store.clone() as Arc<dyn VarStore>,
    )
    .expect("coordinator")
}

#[tokio::test(start_paused = true)]
async fn test_batched_acknowledgment() {
    init_tracing();
    let store = Arc::new(MemVarStore::new());
    let records: Vec<_> = (1..=9)
        .map(|i| rec(i, RecordKind::Create, fid(i as u32)))
        .collect();
    let endpoint = SimEndpoint::from_records(records);
    // Manual pipeline: the test decides when each record commits.
    let pipeline = SimPipeline::manual(store.clone());

    let cfg = fsmirror::config::ReaderConfig {
        batch_ack_count: 4,
        ..one_stream_config()
    };
    let mut readers = build(cfg, &endpoint, &pipeline, &store);

    readers.start(RunMode::Follow, None).await.unwrap();
    wait_for_reads(&readers, 0, 9).await;
    readers.terminate();
    readers.join().await;
    assert_eq!(pipeline.buffered_len().await, 9);

    // Commits 1..3: within the batch and behind the last push, no clear.
    for _ in 0..3 {
        pipeline.commit_one().await.unwrap();
        assert!(endpoint.clear_ids().is_empty());
    }

    // Commit 4 fills the batch: clear fires with exactly id 4.
    pipeline.commit_one().await.unwrap();
    assert_eq!(endpoint.clear_ids(), vec![4]);

    // Commits 5..7: deferred again.
    for _ in 0..3 {
        pipeline.commit_one().await.unwrap();
    }
    assert_eq!(endpoint.clear_ids(), vec![4]);

    // Commit 8: second batch.
    pipeline.commit_one().await.unwrap();
    assert_eq!(endpoint.clear_ids(), vec![4, 8]);

    // Commit 9 catches up with everything ever pushed: clears early.
    pipeline.commit_one().await.unwrap();
    assert_eq!(endpoint.clear_ids(), vec![4, 8, 9]);

    // Every clear stayed within the pushed window and moved forward.
    for pair in endpoint.clear_ids().windows(2) {
        assert!(pair[0] < pair[1]);
    }

    readers.done().await.unwrap();
    let state = readers.stream_state(0).unwrap();
    assert_watermark_chain(&*state.lock().await).await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_resumes_after_last_committed() {
    init_tracing();
    let store = Arc::new(MemVarStore::new());

    // First run: records 1..5, all committed and acknowledged.
    let endpoint1 = SimEndpoint::from_records(
        (1..=5).map(|i| rec(i, RecordKind::Create, fid(i as u32))).collect(),
    );
    let pipeline1 = SimPipeline::new(store.clone());
    let mut readers1 = build(one_stream_config(), &endpoint1, &pipeline1, &store);
    readers1.start(RunMode::Follow, None).await.unwrap();
    wait_for_reads(&readers1, 0, 5).await;
    readers1.terminate();
    readers1.join().await;
    readers1.done().await.unwrap();

    assert_eq!(pipeline1.pushed_ids(), vec![1, 2, 3, 4, 5]);
    let vars = store.snapshot();
    assert!(vars.get("cl_last_committed_meta0000").unwrap().starts_with("5:"));

    // Second run against the same store. The server still holds records
    // beyond the cleared cursor; the reader must resume at 6.
    let endpoint2 = SimEndpoint::from_records(
        (1..=10).map(|i| rec(i, RecordKind::Create, fid(i as u32))).collect(),
    );
    let pipeline2 = SimPipeline::new(store.clone());
    let mut readers2 = build(one_stream_config(), &endpoint2, &pipeline2, &store);
    readers2.start(RunMode::Follow, None).await.unwrap();
    wait_for_reads(&readers2, 0, 5).await;
    readers2.terminate();
    readers2.join().await;
    readers2.done().await.unwrap();

    // Opened at last_committed + 1.
    assert_eq!(endpoint2.opens.lock().unwrap()[0].0, 6);

    // Across the two runs the pipeline saw exactly the source ids, no
    // gap and no duplicate.
    let mut delivered = pipeline1.pushed_ids();
    delivered.extend(pipeline2.pushed_ids());
    assert_eq!(delivered, (1..=10).collect::<Vec<u64>>());

    let vars = store.snapshot();
    assert!(vars.get("cl_last_committed_meta0000").unwrap().starts_with("10:"));
}

#[tokio::test(start_paused = true)]
async fn test_clear_failure_retries_on_next_commit() {
    init_tracing();
    let store = Arc::new(MemVarStore::new());
    let endpoint = SimEndpoint::from_records(
        (1..=2).map(|i| rec(i, RecordKind::Create, fid(i as u32))).collect(),
    );
    let pipeline = SimPipeline::manual(store.clone());
    let mut readers = build(one_stream_config(), &endpoint, &pipeline, &store);

    readers.start(RunMode::Follow, None).await.unwrap();
    wait_for_reads(&readers, 0, 2).await;
    readers.terminate();
    readers.join().await;

    // First commit: the upstream clear fails, last_cleared stays put.
    endpoint.set_fail_clear(true);
    assert!(pipeline.commit_one().await.is_err());
    assert!(endpoint.clear_ids().is_empty());

    // Next commit retries and sweeps both records.
    endpoint.set_fail_clear(false);
    pipeline.commit_one().await.unwrap();
    assert_eq!(endpoint.clear_ids(), vec![2]);

    readers.done().await.unwrap();
    let state = readers.stream_state(0).unwrap();
    assert_watermark_chain(&*state.lock().await).await;
}

#[tokio::test(start_paused = true)]
async fn test_stats_checkpoint_written_at_done() {
    init_tracing();
    let store = Arc::new(MemVarStore::new());
    let endpoint = SimEndpoint::from_records(vec![
        rec(1, RecordKind::Create, fid(1)),
        rec(2, RecordKind::Mkdir, fid(2)),
        rec(3, RecordKind::Unlink, fid(1)),
    ]);
    let pipeline = SimPipeline::new(store.clone());
    let mut readers = build(one_stream_config(), &endpoint, &pipeline, &store);

    readers.start(RunMode::Follow, None).await.unwrap();
    wait_for_reads(&readers, 0, 3).await;
    readers.terminate();
    readers.join().await;
    readers.done().await.unwrap();

    let vars = store.snapshot();
    assert_eq!(vars.get("cl_count_meta0000_CREATE").unwrap(), "1");
    assert_eq!(vars.get("cl_count_meta0000_MKDIR").unwrap(), "1");
    assert_eq!(vars.get("cl_count_meta0000_UNLINK").unwrap(), "1");
    assert!(vars.get("cl_last_read_meta0000").unwrap().starts_with("3:"));
    assert!(vars.get("cl_last_pushed_meta0000").unwrap().starts_with("3:"));
    assert!(vars.get("cl_last_cleared_meta0000").unwrap().starts_with("3:"));
    assert!(vars.contains_key("cl_diff_interval_meta0000"));
}

#[tokio::test(start_paused = true)]
async fn test_single_stream_start_leaves_others_alone() {
    init_tracing();
    let store = Arc::new(MemVarStore::new());
    let endpoint_a = SimEndpoint::from_records(vec![rec(1, RecordKind::Create, fid(1))]);
    let endpoint_b = SimEndpoint::from_records(vec![rec(7, RecordKind::Mkdir, fid(2))]);
    let pipeline = SimPipeline::new(store.clone());

    let cfg = fsmirror::config::ReaderConfig {
        streams: vec![
            fsmirror::config::StreamDef {
                name: "meta0000".to_string(),
                reader_id: "cl1".to_string(),
            },
            fsmirror::config::StreamDef {
                name: "meta0001".to_string(),
                reader_id: "cl2".to_string(),
            },
        ],
        ..one_stream_config()
    };
    let mut readers = ChangelogReaders::new(
        cfg,
        vec![
            endpoint_a.clone() as Arc<dyn ChangelogEndpoint>,
            endpoint_b.clone() as Arc<dyn ChangelogEndpoint>,
        ],
        pipeline.clone() as Arc<dyn EntryPipeline>,
        store.clone() as Arc<dyn VarStore>,
    )
    .unwrap();

    readers.start(RunMode::Follow, Some(1)).await.unwrap();
    wait_for_reads(&readers, 1, 1).await;
    readers.terminate();
    readers.join().await;
    readers.done().await.unwrap();

    // Only the selected stream was opened and processed.
    assert!(endpoint_a.opens.lock().unwrap().is_empty());
    assert_eq!(endpoint_b.opens.lock().unwrap().len(), 1);
    assert_eq!(pipeline.pushed_ids(), vec![7]);
    assert_eq!(endpoint_b.last_clear_id(), Some(7));

    // An out-of-range index is rejected.
    assert!(readers.start(RunMode::Follow, Some(5)).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_multiple_streams_are_independent() {
    init_tracing();
    let store = Arc::new(MemVarStore::new());

    let endpoint_a = SimEndpoint::from_records(vec![
        rec(1, RecordKind::Create, fid(1)),
        rec(2, RecordKind::Close, fid(1)), // suppressed by the CREATE
    ]);
    let endpoint_b = SimEndpoint::from_records(vec![rec(100, RecordKind::Mkdir, fid(9))]);
    let pipeline = SimPipeline::new(store.clone());

    let cfg = fsmirror::config::ReaderConfig {
        streams: vec![
            fsmirror::config::StreamDef {
                name: "meta0000".to_string(),
                reader_id: "cl1".to_string(),
            },
            fsmirror::config::StreamDef {
                name: "meta0001".to_string(),
                reader_id: "cl2".to_string(),
            },
        ],
        ..one_stream_config()
    };
    let mut readers = ChangelogReaders::new(
        cfg,
        vec![
            endpoint_a.clone() as Arc<dyn ChangelogEndpoint>,
            endpoint_b.clone() as Arc<dyn ChangelogEndpoint>,
        ],
        pipeline.clone() as Arc<dyn EntryPipeline>,
        store.clone() as Arc<dyn VarStore>,
    )
    .unwrap();

    readers.start(RunMode::Follow, None).await.unwrap();
    wait_for_reads(&readers, 0, 2).await;
    wait_for_reads(&readers, 1, 1).await;
    readers.terminate();
    readers.join().await;
    readers.done().await.unwrap();

    // Stream A: CREATE with the CLOSE merged in; stream B: its MKDIR.
    assert_eq!(endpoint_a.last_clear_id(), Some(2));
    assert_eq!(endpoint_b.last_clear_id(), Some(100));
    let clears_a = endpoint_a.clears.lock().unwrap().clone();
    assert!(clears_a.iter().all(|(reader, _)| reader == "cl1"));
    let clears_b = endpoint_b.clears.lock().unwrap().clone();
    assert!(clears_b.iter().all(|(reader, _)| reader == "cl2"));

    let vars = store.snapshot();
    assert!(vars.contains_key("cl_last_committed_meta0000"));
    assert!(vars.contains_key("cl_last_committed_meta0001"));
}
