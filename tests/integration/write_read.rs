//! Integration test: shuffle write then read.
//!
//! Map tasks write through the full client pipeline into an in-process
//! cluster; every partition is read back and compared with what was written.

use std::collections::BTreeSet;

use eddy_client::{HashPartitioner, Partitioner, ReadOptions, Record};
use eddy_integration_tests::{
    ClusterOptions, IntegrationCluster, JobOptions, ShuffleJob, map_records, sorted_pairs,
};
use eddy_store::SegmentReadOptions;

/// 3 servers, replica 2, 4 maps of 1000 records over 6 partitions.
#[tokio::test]
async fn test_multi_map_round_trip() {
    let c = IntegrationCluster::new(3).await;
    let assignment = c.assign(0, 6, 2);
    let job = ShuffleJob::new(&c, 0, assignment.clone(), 4, JobOptions::default(), None);

    let mut written: Vec<Record> = Vec::new();
    for map in 0..4 {
        let records = map_records(map, 1000, 64);
        written.extend(records.iter().cloned());
        let output = job.run_map(map, records).await.unwrap();
        assert_eq!(output.task_attempt_id, map as u64);
        assert!(!output.partition_to_block_ids.is_empty());
    }
    assert_eq!(job.pool.used(), 0);

    let read = c.read_all(0, &assignment).await.unwrap();
    let partitioner = HashPartitioner::new(6);
    for (partition, record) in &read {
        assert_eq!(partitioner.partition(&record.key), *partition);
    }
    assert_eq!(
        sorted_pairs(read.iter().map(|(_, r)| r)),
        sorted_pairs(&written)
    );
}

/// Every block id a map reported is read exactly once, even with 3 replicas.
#[tokio::test]
async fn test_blocks_read_once_across_replicas() {
    let c = IntegrationCluster::new(3).await;
    let assignment = c.assign(1, 2, 3);
    let job = ShuffleJob::new(&c, 1, assignment.clone(), 1, JobOptions::default(), None);

    let output = job.run_map(0, map_records(0, 2000, 32)).await.unwrap();

    for (partition, ids) in &output.partition_to_block_ids {
        let blocks = c
            .read_partition(1, *partition, &assignment, ReadOptions::default())
            .await
            .unwrap();
        let read_ids: Vec<_> = blocks.iter().map(|b| b.block_id).collect();
        let unique: BTreeSet<_> = read_ids.iter().copied().collect();
        assert_eq!(read_ids.len(), unique.len(), "partition {partition} read a block twice");
        assert_eq!(&unique, ids);
    }
}

/// Blocks are only readable after the map commits; the result registry is
/// filled by the report at stop.
#[tokio::test]
async fn test_partition_empty_until_reported() {
    let c = IntegrationCluster::new(2).await;
    let assignment = c.assign(2, 1, 1);
    let job = ShuffleJob::new(&c, 2, assignment.clone(), 1, JobOptions::default(), None);

    let mut writer = job.writer(0);
    writer.write(map_records(0, 100, 16)).await.unwrap();
    let before = c
        .read_partition(2, 0, &assignment, ReadOptions::default())
        .await
        .unwrap();
    assert!(before.is_empty());

    writer.stop(true).await.unwrap();
    let after = c
        .read_partition(2, 0, &assignment, ReadOptions::default())
        .await
        .unwrap();
    assert!(!after.is_empty());
}

/// Servers persisting ranges of four partitions per file pair.
#[tokio::test]
async fn test_partition_ranges_wider_than_one() {
    let mut options = ClusterOptions::default();
    options.tiers = "LOCALFILE".to_string();
    options.server.partition_range_width = 4;
    let c = IntegrationCluster::with_options(2, options).await;
    let assignment = c.assign(3, 8, 1);
    let job = ShuffleJob::new(&c, 3, assignment.clone(), 2, JobOptions::default(), None);

    let mut written = Vec::new();
    for map in 0..2 {
        let records = map_records(map, 500, 40);
        written.extend(records.iter().cloned());
        job.run_map(map, records).await.unwrap();
    }

    let read_options = ReadOptions {
        segment: SegmentReadOptions {
            read_buffer_size: 2048,
            partition_range_width: 4,
        },
        verify_checksums: true,
    };
    let mut read = Vec::new();
    for partition in 0..8 {
        let blocks = c
            .read_partition(3, partition, &assignment, read_options)
            .await
            .unwrap();
        read.extend(eddy_integration_tests::decode_records(&blocks));
    }
    assert_eq!(sorted_pairs(&read), sorted_pairs(&written));
}

/// Several shuffles of one app share the servers without mixing data.
#[tokio::test]
async fn test_concurrent_shuffles_stay_separate() {
    let c = IntegrationCluster::new(3).await;
    let a = c.assign(10, 3, 2);
    let b = c.assign(11, 3, 2);
    let job_a = ShuffleJob::new(&c, 10, a.clone(), 1, JobOptions::default(), None);
    let job_b = ShuffleJob::new(&c, 11, b.clone(), 1, JobOptions::default(), None);

    let records_a = map_records(1, 300, 24);
    let records_b = map_records(2, 300, 24);
    let (ra, rb) = tokio::join!(
        job_a.run_map(0, records_a.clone()),
        job_b.run_map(0, records_b.clone())
    );
    ra.unwrap();
    rb.unwrap();

    let read_a = c.read_all(10, &a).await.unwrap();
    let read_b = c.read_all(11, &b).await.unwrap();
    assert_eq!(sorted_pairs(read_a.iter().map(|(_, r)| r)), sorted_pairs(&records_a));
    assert_eq!(sorted_pairs(read_b.iter().map(|(_, r)| r)), sorted_pairs(&records_b));
}

/// Purging the app drops its stored data and results on every server.
#[tokio::test]
async fn test_purge_app_removes_everything() {
    let c = IntegrationCluster::new(2).await;
    let assignment = c.assign(4, 2, 2);
    let job = ShuffleJob::new(&c, 4, assignment.clone(), 1, JobOptions::default(), None);
    job.run_map(0, map_records(0, 200, 16)).await.unwrap();

    for i in 0..2 {
        c.server(i).purge_app(eddy_integration_tests::APP).await.unwrap();
    }
    assert!(c.read_all(4, &assignment).await.is_err());
}
