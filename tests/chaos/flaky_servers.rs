//! Chaos test: servers that randomly reject sends.
//!
//! 4-server cluster, replica 2. While map tasks run, a seeded background
//! task keeps switching random servers into short windows where every send
//! is rejected. Retries must absorb the windows: all maps succeed and every
//! record is read back exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use eddy_integration_tests::{
    IntegrationCluster, JobOptions, ShuffleJob, map_records, sorted_pairs,
};
use eddy_rpc::StatusCode;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rejection_windows_no_data_loss() {
    let c = Arc::new(IntegrationCluster::new(4).await);
    let assignment = c.assign(0, 8, 2);

    let mut options = JobOptions::default();
    options.dispatch.replica_write = 2;
    options.dispatch.retry_max = 100;
    options.dispatch.retry_interval = Duration::from_millis(5);
    options.dispatch.retry_interval_max = Duration::from_millis(20);
    let job = Arc::new(ShuffleJob::new(&c, 0, assignment.clone(), 6, options, None));

    // --- Chaos ---
    let stop = Arc::new(AtomicBool::new(false));
    let chaos = {
        let c = c.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(7);
            let mut windows = 0u32;
            loop {
                let victim = rng.random_range(0..4);
                let status = if rng.random_bool(0.5) {
                    StatusCode::NoBuffer
                } else {
                    StatusCode::InternalError
                };
                c.client().fail_sends_with(c.info(victim), Some(status)).await;
                time::sleep(Duration::from_millis(rng.random_range(5..30))).await;
                c.client().fail_sends_with(c.info(victim), None).await;
                time::sleep(Duration::from_millis(rng.random_range(5..20))).await;
                windows += 1;
                if stop.load(Ordering::Relaxed) {
                    break;
                }
            }
            windows
        })
    };

    // --- Maps ---
    let mut handles = Vec::new();
    for map in 0..6u32 {
        let job = job.clone();
        handles.push(tokio::spawn(async move {
            let records = map_records(map, 1500, 48);
            job.run_map(map, records.clone()).await.map(|_| records)
        }));
    }
    let mut written = Vec::new();
    for handle in handles {
        written.extend(handle.await.unwrap().unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    let windows = chaos.await.unwrap();
    assert!(windows > 0);
    assert_eq!(job.pool.used(), 0);

    let read = c.read_all(0, &assignment).await.unwrap();
    assert_eq!(read.len(), written.len());
    assert_eq!(sorted_pairs(read.iter().map(|(_, r)| r)), sorted_pairs(&written));
}

/// With replica 3, reads keep working while any single server is
/// unreachable, one at a time in random order.
#[tokio::test]
async fn test_reads_survive_rolling_outages() {
    let c = IntegrationCluster::new(4).await;
    let assignment = c.assign(1, 6, 3);
    let mut options = JobOptions::default();
    options.dispatch.replica_write = 3;
    let job = ShuffleJob::new(&c, 1, assignment.clone(), 2, options, None);

    let mut written = Vec::new();
    for map in 0..2 {
        let records = map_records(map, 800, 32);
        written.extend(records.iter().cloned());
        job.run_map(map, records).await.unwrap();
    }

    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..6 {
        let victim = rng.random_range(0..4);
        c.kill_server(victim).await;
        let read = c.read_all(1, &assignment).await.unwrap();
        assert_eq!(
            sorted_pairs(read.iter().map(|(_, r)| r)),
            sorted_pairs(&written),
            "read failed with server {victim} down"
        );
        c.revive_server(victim).await;
    }
}
