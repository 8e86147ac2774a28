//! Integration test: flushes moving between storage tiers.

use eddy_client::ClientError;
use eddy_integration_tests::{
    APP, ClusterOptions, IntegrationCluster, JobOptions, ShuffleJob, map_records, sorted_pairs,
};
use eddy_rpc::FinishShuffleRequest;
use eddy_types::StorageTierKind;

/// A memory tier too small for the shuffle hands flushes to local files.
#[tokio::test]
async fn test_full_memory_tier_falls_back_to_local_files() {
    let mut options = ClusterOptions::default();
    options.memory_tier_bytes = 8 * 1024;
    let c = IntegrationCluster::with_options(2, options).await;
    let assignment = c.assign(0, 4, 1);
    let job = ShuffleJob::new(&c, 0, assignment.clone(), 2, JobOptions::default(), None);

    let mut written = Vec::new();
    for map in 0..2 {
        let records = map_records(map, 2000, 64);
        written.extend(records.iter().cloned());
        job.run_map(map, records).await.unwrap();
    }

    assert!(c.stored_bytes(StorageTierKind::Memory).await <= 2 * 8 * 1024);
    assert!(c.stored_bytes(StorageTierKind::LocalFile).await > 0);
    let read = c.read_all(0, &assignment).await.unwrap();
    assert_eq!(sorted_pairs(read.iter().map(|(_, r)| r)), sorted_pairs(&written));
}

/// A local tier that fails writes is skipped for the remote tier.
#[tokio::test]
async fn test_failing_local_tier_falls_back_to_remote() {
    let mut options = ClusterOptions::default();
    options.tiers = "LOCALFILE_REMOTE".to_string();
    options.server.cold_flush_threshold = None;
    let c = IntegrationCluster::with_options(2, options).await;
    for i in 0..2 {
        c.tier(i, StorageTierKind::LocalFile).fail_writes(true);
    }
    let assignment = c.assign(1, 3, 2);
    let job = ShuffleJob::new(&c, 1, assignment.clone(), 1, JobOptions::default(), None);

    let records = map_records(0, 800, 48);
    job.run_map(0, records.clone()).await.unwrap();

    assert_eq!(c.stored_bytes(StorageTierKind::LocalFile).await, 0);
    assert!(c.stored_bytes(StorageTierKind::Remote).await > 0);
    assert!(c.tier(0, StorageTierKind::LocalFile).write_attempts() > 0);
    let read = c.read_all(1, &assignment).await.unwrap();
    assert_eq!(sorted_pairs(read.iter().map(|(_, r)| r)), sorted_pairs(&records));
}

/// Flushes above the cold threshold go straight to the remote tier.
#[tokio::test]
async fn test_large_flushes_go_to_remote() {
    let mut options = ClusterOptions::default();
    options.tiers = "MEMORY_REMOTE".to_string();
    options.server.cold_flush_threshold = Some(1024);
    let c = IntegrationCluster::with_options(1, options).await;
    let assignment = c.assign(2, 1, 1);
    let job = ShuffleJob::new(&c, 2, assignment.clone(), 1, JobOptions::default(), None);

    let records = map_records(0, 500, 64);
    job.run_map(0, records.clone()).await.unwrap();

    assert_eq!(c.stored_bytes(StorageTierKind::Memory).await, 0);
    assert!(c.stored_bytes(StorageTierKind::Remote).await > 0);
    let read = c.read_all(2, &assignment).await.unwrap();
    assert_eq!(read.len(), records.len());
}

/// When every tier fails the commit fails, the data stays buffered, and a
/// later commit after the tiers recover persists it.
#[tokio::test]
async fn test_failed_flushes_keep_data_until_tiers_recover() {
    let mut options = ClusterOptions::default();
    options.tiers = "LOCALFILE".to_string();
    let c = IntegrationCluster::with_options(1, options).await;
    let tier = c.tier(0, StorageTierKind::LocalFile).clone();
    tier.fail_writes(true);
    let assignment = c.assign(3, 2, 1);
    let job = ShuffleJob::new(&c, 3, assignment, 1, JobOptions::default(), None);

    let err = job.run_map(0, map_records(0, 300, 32)).await.unwrap_err();
    assert!(matches!(err, ClientError::CommitFailed { .. }), "unexpected error: {err}");
    let store = c.server(0).store();
    assert!(store.used_bytes() > 0);

    tier.fail_writes(false);
    c.server(0)
        .handle_finish(FinishShuffleRequest {
            app_id: APP.to_string(),
            shuffle_id: 3,
            expected_task_count: 1,
        })
        .await
        .unwrap();
    assert_eq!(store.used_bytes(), 0);
    assert!(c.stored_bytes(StorageTierKind::LocalFile).await > 0);
}
