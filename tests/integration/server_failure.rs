//! Integration test: unreachable, rejecting and slow servers.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use eddy_client::{ClientError, ReadOptions};
use eddy_integration_tests::{
    IntegrationCluster, JobOptions, RecordingAuthority, ShuffleJob, map_records, sorted_pairs,
};
use eddy_rpc::StatusCode;
use eddy_types::StorageTierKind;

/// A map whose only replica is down fails with the server named, and
/// leaves no memory or task state behind.
#[tokio::test]
async fn test_down_replica_fails_map() {
    let c = IntegrationCluster::new(2).await;
    let assignment = c.assign(0, 2, 1);
    let down = assignment.replicas(0).unwrap()[0].clone();
    c.kill_server(c.index_of(&down)).await;
    let job = ShuffleJob::new(&c, 0, assignment, 1, JobOptions::default(), None);

    let err = job.run_map(0, map_records(0, 200, 32)).await.unwrap_err();
    match err {
        ClientError::SendFailed { servers, .. } => assert!(servers.contains(&down.id)),
        other => panic!("expected SendFailed, got {other}"),
    }
    assert_eq!(job.pool.used(), 0);
    assert_eq!(job.session.task_count(), 0);
}

/// With two replicas and one ack required, a rejecting replica does not
/// fail the sends; the commit to that server still has to succeed.
#[tokio::test]
async fn test_single_ack_tolerates_rejecting_replica() {
    let c = IntegrationCluster::new(2).await;
    let assignment = c.assign(1, 3, 2);
    c.client()
        .fail_sends_with(c.info(1), Some(StatusCode::InternalError))
        .await;
    let mut options = JobOptions::default();
    options.dispatch.replica_write = 1;
    let job = ShuffleJob::new(&c, 1, assignment.clone(), 1, options, None);

    let records = map_records(0, 500, 32);
    job.run_map(0, records.clone()).await.unwrap();

    let read = c.read_all(1, &assignment).await.unwrap();
    assert_eq!(sorted_pairs(read.iter().map(|(_, r)| r)), sorted_pairs(&records));
}

/// A commit that cannot reach every data server fails the map.
#[tokio::test]
async fn test_unreachable_commit_fails_map() {
    let c = IntegrationCluster::new(2).await;
    let assignment = c.assign(2, 2, 2);
    let mut options = JobOptions::default();
    options.dispatch.replica_write = 1;
    c.kill_server(1).await;
    let job = ShuffleJob::new(&c, 2, assignment, 1, options, None);

    let err = job.run_map(0, map_records(0, 100, 16)).await.unwrap_err();
    assert!(
        matches!(err, ClientError::CommitFailed { ref servers, .. } if servers.contains("server-1")),
        "unexpected error: {err}"
    );
}

/// Send failures escalate to a stage retry; the resubmitted stage avoids
/// the faulty server and succeeds.
#[tokio::test]
async fn test_stage_retry_excludes_faulty_server() {
    let c = IntegrationCluster::new(3).await;
    let first = c.assign(3, 4, 1);
    let faulty = first.replicas(0).unwrap()[0].clone();
    c.client()
        .fail_sends_with(&faulty, Some(StatusCode::NoBuffer))
        .await;

    let authority = Arc::new(RecordingAuthority::new(true));
    let mut options = JobOptions::default();
    options.commit.write_failure_retry = true;
    let job = ShuffleJob::new(&c, 3, first, 1, options.clone(), Some(authority.clone()));
    let records = map_records(0, 400, 32);

    let err = job.run_map(0, records.clone()).await.unwrap_err();
    assert!(matches!(err, ClientError::StageRetry { .. }), "unexpected error: {err}");
    let reports = authority.reports();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].faulty_servers.contains(&faulty));
    assert_eq!(reports[0].task_id, "map-0");

    let excluded = BTreeSet::from([faulty.clone()]);
    let second = c.assign_without(&excluded, 3, 4, 1);
    assert!(!second.servers().contains(&faulty));
    options.stage_attempt = 1;
    let retry = ShuffleJob::new(&c, 3, second.clone(), 1, options, Some(authority.clone()));
    retry.run_map(0, records.clone()).await.unwrap();

    let read = c.read_all(3, &second).await.unwrap();
    assert_eq!(sorted_pairs(read.iter().map(|(_, r)| r)), sorted_pairs(&records));
    assert_eq!(authority.reports().len(), 1);
}

/// Without write-failure retry the authority is never asked.
#[tokio::test]
async fn test_no_escalation_without_write_failure_retry() {
    let c = IntegrationCluster::new(1).await;
    let assignment = c.assign(4, 1, 1);
    c.client()
        .fail_sends_with(c.info(0), Some(StatusCode::NoBuffer))
        .await;
    let authority = Arc::new(RecordingAuthority::new(true));
    let job = ShuffleJob::new(&c, 4, assignment, 1, JobOptions::default(), Some(authority.clone()));

    let err = job.run_map(0, map_records(0, 50, 8)).await.unwrap_err();
    assert!(matches!(err, ClientError::SendFailed { .. }));
    assert!(authority.reports().is_empty());
}

/// A rejection that clears before the retries run out is absorbed.
#[tokio::test]
async fn test_transient_rejection_retried() {
    let c = Arc::new(IntegrationCluster::new(1).await);
    let assignment = c.assign(5, 2, 1);
    c.client()
        .fail_sends_with(c.info(0), Some(StatusCode::NoBuffer))
        .await;
    let mut options = JobOptions::default();
    options.dispatch.retry_max = 20;
    options.dispatch.retry_interval = Duration::from_millis(10);
    options.dispatch.retry_interval_max = Duration::from_millis(10);
    let job = ShuffleJob::new(&c, 5, assignment.clone(), 1, options, None);

    let healer = {
        let c = c.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            c.client().fail_sends_with(c.info(0), None).await;
        })
    };
    let records = map_records(0, 100, 16);
    job.run_map(0, records.clone()).await.unwrap();
    healer.await.unwrap();

    let read = c.read_all(5, &assignment).await.unwrap();
    assert_eq!(read.len(), records.len());
}

/// Sends slower than the check timeout fail the map with a wait timeout.
#[tokio::test]
async fn test_slow_sends_time_out() {
    let c = IntegrationCluster::new(1).await;
    let assignment = c.assign(6, 1, 1);
    c.client()
        .set_send_latency(Some(Duration::from_millis(500)))
        .await;
    let mut options = JobOptions::default();
    options.commit.send_check_timeout = Duration::from_millis(100);
    let job = ShuffleJob::new(&c, 6, assignment, 1, options, None);

    let err = job.run_map(0, map_records(0, 10, 8)).await.unwrap_err();
    assert!(matches!(err, ClientError::WaitTimeout { .. }), "unexpected error: {err}");
    assert_eq!(job.pool.used(), 0);
}

/// A replica whose storage fails reads is completed from the next replica.
#[tokio::test]
async fn test_read_survives_broken_replica_storage() {
    let c = IntegrationCluster::new(2).await;
    let assignment = c.assign(7, 2, 2);
    let mut options = JobOptions::default();
    options.dispatch.replica_write = 2;
    let job = ShuffleJob::new(&c, 7, assignment.clone(), 1, options, None);
    let records = map_records(0, 300, 24);
    job.run_map(0, records.clone()).await.unwrap();

    for kind in [StorageTierKind::Memory, StorageTierKind::LocalFile] {
        c.tier(0, kind).fail_reads(true);
    }
    let read = c.read_all(7, &assignment).await.unwrap();
    assert_eq!(sorted_pairs(read.iter().map(|(_, r)| r)), sorted_pairs(&records));

    for kind in [StorageTierKind::Memory, StorageTierKind::LocalFile] {
        c.tier(1, kind).fail_reads(true);
    }
    let err = c
        .read_partition(7, 0, &assignment, ReadOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::ReadIncomplete { .. }), "unexpected error: {err}");
}
