//! Stale-claim recovery: claims held by nodes that stopped heartbeating go
//! back to the queue, claims of live nodes stay put.


use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;

use markhive::error::NodeError;
use markhive::queue::{Completion, Coordinator, CoordinatorConfig, JobStatus, JobStore};
use markhive::registry::{NodeRegistration, NodeRegistry};
use test_harness::{recording_registry, TestDb};

const THRESHOLD: Duration = Duration::from_secs(60);
const HEARTBEAT: Duration = Duration::from_secs(5);
const WORK_TIMEOUT: Duration = Duration::from_secs(120);

fn config() -> CoordinatorConfig {
    CoordinatorConfig {
        poll_interval: Duration::from_millis(50),
        poll_jitter: Duration::ZERO,
        claim_batch: 1,
        max_attempts: 3,
        stale_after: THRESHOLD + HEARTBEAT,
        reap_interval: HEARTBEAT,
        work_timeout: WORK_TIMEOUT,
    }
}

async fn register(registry: &NodeRegistry) -> Uuid {
    let uuid = Uuid::new_v4();
    registry
        .register(&NodeRegistration {
            uuid,
            title: uuid.to_string(),
            rpc_endpoint: None,
        })
        .await
        .unwrap();
    uuid
}

#[tokio::test]
async fn test_dead_claimant_is_reclaimed_after_threshold_plus_grace() {
    let db = TestDb::new();
    let store = db.open().await;
    let registry = NodeRegistry::new(store.clone(), THRESHOLD);
    let jobs = JobStore::new(store);

    let dead = register(&registry).await;
    let id = jobs.insert("java", &json!({})).await.unwrap();
    let claimed = jobs.claim_next(dead, 1).await.unwrap();
    assert_eq!(claimed[0].id, id);

    let survivor = register(&registry).await;
    let log = Arc::new(Mutex::new(Vec::new()));
    let coordinator = Coordinator::new(
        survivor,
        jobs.clone(),
        Arc::new(recording_registry("java", survivor, log.clone())),
        Arc::new(Notify::new()),
        config(),
    );

    let now = Utc::now();
    // Last heartbeat 64 s ago: past the liveness threshold but inside the grace.
    registry
        .heartbeat_at(dead, now - chrono::Duration::seconds(64))
        .await
        .unwrap();
    assert_eq!(coordinator.reap_once_at(now).await.unwrap(), 0);
    assert_eq!(jobs.get(id).await.unwrap().unwrap().status, JobStatus::Claimed);

    // 66 s ago: beyond threshold + heartbeat interval.
    registry
        .heartbeat_at(dead, now - chrono::Duration::seconds(66))
        .await
        .unwrap();
    assert_eq!(coordinator.reap_once_at(now).await.unwrap(), 1);
    let job = jobs.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::AwaitingMarking);
    assert_eq!(job.claimed_by, None);

    // The survivor picks it up; the attempt counter carries over.
    assert_eq!(coordinator.run_once(0).await.unwrap(), 1);
    let job = jobs.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Marked);
    assert_eq!(job.claimed_by, Some(survivor));
    assert_eq!(job.attempts, 2);
    assert_eq!(log.lock().unwrap().as_slice(), &[(id, survivor)]);
}

#[tokio::test]
async fn test_live_claimant_keeps_its_claim() {
    let db = TestDb::new();
    let store = db.open().await;
    let registry = NodeRegistry::new(store.clone(), THRESHOLD);
    let jobs = JobStore::new(store);

    let owner = register(&registry).await;
    let id = jobs.insert("java", &json!({})).await.unwrap();
    jobs.claim_next(owner, 1).await.unwrap();

    let coordinator = Coordinator::new(
        Uuid::new_v4(),
        jobs.clone(),
        Arc::new(markhive::queue::ExecutorRegistry::new()),
        Arc::new(Notify::new()),
        config(),
    );
    assert_eq!(coordinator.reap_once().await.unwrap(), 0);
    assert_eq!(jobs.get(id).await.unwrap().unwrap().claimed_by, Some(owner));
}

#[tokio::test]
async fn test_claim_past_work_timeout_is_reclaimed_from_live_claimant() {
    let db = TestDb::new();
    let store = db.open().await;
    let registry = NodeRegistry::new(store.clone(), THRESHOLD);
    let jobs = JobStore::new(store);

    let owner = register(&registry).await;
    let id = jobs.insert("java", &json!({})).await.unwrap();
    jobs.claim_next(owner, 1).await.unwrap();

    let coordinator = Coordinator::new(
        Uuid::new_v4(),
        jobs.clone(),
        Arc::new(markhive::queue::ExecutorRegistry::new()),
        Arc::new(Notify::new()),
        config(),
    );

    // The owner keeps heartbeating while its executor hangs.
    let later = Utc::now() + chrono::Duration::from_std(WORK_TIMEOUT).unwrap();
    registry.heartbeat_at(owner, later).await.unwrap();
    assert_eq!(
        coordinator
            .reap_once_at(later - chrono::Duration::seconds(5))
            .await
            .unwrap(),
        0
    );

    let past_timeout = later + chrono::Duration::seconds(1);
    registry.heartbeat_at(owner, past_timeout).await.unwrap();
    assert_eq!(coordinator.reap_once_at(past_timeout).await.unwrap(), 1);
    let job = jobs.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::AwaitingMarking);
    assert_eq!(job.claimed_by, None);
}

#[tokio::test]
async fn test_late_completion_after_reclaim_is_discarded() {
    let db = TestDb::new();
    let store = db.open().await;
    let registry = NodeRegistry::new(store.clone(), THRESHOLD);
    let jobs = JobStore::new(store);

    let slow = register(&registry).await;
    let id = jobs.insert("java", &json!({})).await.unwrap();
    jobs.claim_next(slow, 1).await.unwrap();

    registry
        .heartbeat_at(slow, Utc::now() - chrono::Duration::minutes(10))
        .await
        .unwrap();
    let cutoff = Utc::now() - chrono::Duration::from_std(THRESHOLD + HEARTBEAT).unwrap();
    let hour_ago = Utc::now() - chrono::Duration::hours(1);
    assert_eq!(jobs.reclaim_stale(cutoff, hour_ago).await.unwrap(), 1);

    let fast = register(&registry).await;
    jobs.claim_next(fast, 1).await.unwrap();

    // The original claimant finishes late: its result must not land.
    let err = jobs
        .finish(id, slow, Completion::Marked(json!({"mark": 0})))
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::ClaimLost { .. }));

    jobs.finish(id, fast, Completion::Marked(json!({"mark": 90})))
        .await
        .unwrap();
    let job = jobs.get(id).await.unwrap().unwrap();
    assert_eq!(job.result, Some(json!({"mark": 90})));
}
