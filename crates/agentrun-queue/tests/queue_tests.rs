//! Integration tests for the execution queue over the in-memory backend

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use serde_json::json;

use agentrun_queue::{
    AdmissionError, AgentRecord, Clock, ErrorClass, ExecutionQueue, JobStatus, LeaseManager,
    ManualClock, MemoryCredentials, MemoryDirectory, MemoryQueue, MemoryRateLimitBackend, NewJob,
    Outcome, QueueError, RateLimitBackend, RateLimiter, RateLimits, RetryPolicies, RetryPolicy,
    TriggerType, Worker,
};

struct Harness {
    queue: Arc<ExecutionQueue>,
    clock: Arc<ManualClock>,
}

async fn harness(limits: RateLimits) -> Harness {
    let clock = Arc::new(ManualClock::starting_now());
    let directory = Arc::new(MemoryDirectory::new());
    directory
        .register(AgentRecord::new(
            "digest",
            "Daily Digest",
            "http://127.0.0.1:9/hook",
        ))
        .await;
    for user in ["alice", "bob"] {
        directory.install("digest", user).await;
    }

    let limiter = RateLimiter::new(
        Arc::new(MemoryRateLimitBackend::new()) as Arc<dyn RateLimitBackend>,
        limits,
        clock.clone(),
    );
    let queue = ExecutionQueue::builder(
        Arc::new(MemoryQueue::new()),
        directory,
        Arc::new(MemoryCredentials::new(clock.clone())),
    )
    .clock(clock.clone())
    .rate_limiter(limiter)
    .retry_policies(Arc::new(RetryPolicies::new(
        RetryPolicy::default().without_jitter(),
    )))
    .build();

    Harness {
        queue: Arc::new(queue),
        clock,
    }
}

fn request(user: &str) -> NewJob {
    NewJob::new("digest", user, TriggerType::Api, json!({"topic": "rust"}))
}

#[tokio::test]
async fn test_concurrent_claims_are_exclusive() {
    let h = harness(RateLimits::unlimited()).await;
    for _ in 0..50 {
        h.queue.enqueue(request("alice")).await.unwrap();
    }

    let mut handles = Vec::new();
    for worker in 0..10 {
        let queue = h.queue.clone();
        handles.push(tokio::spawn(async move {
            let worker_id = format!("worker-{}", worker);
            let mut claimed = Vec::new();
            while let Some(job) = queue.claim_next(&worker_id, 1).await.unwrap() {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let results = futures::future::join_all(handles).await;
    let mut seen = HashSet::new();
    let mut total = 0;
    for result in results {
        for id in result.unwrap() {
            total += 1;
            assert!(seen.insert(id), "job {} claimed twice", id);
        }
    }
    assert_eq!(total, 50);
}

#[tokio::test]
async fn test_priority_ordering() {
    let h = harness(RateLimits::unlimited()).await;
    for priority in [3, 1, 5] {
        h.queue
            .enqueue(request("alice").with_priority(priority))
            .await
            .unwrap();
    }

    let order: Vec<u8> = {
        let mut order = Vec::new();
        while let Some(job) = h.queue.claim_next("w1", 1).await.unwrap() {
            order.push(job.priority);
        }
        order
    };
    assert_eq!(order, vec![1, 3, 5]);
}

#[tokio::test]
async fn test_retry_exhaustion_at_max_attempts() {
    let h = harness(RateLimits::unlimited()).await;
    let id = h.queue.enqueue(request("alice")).await.unwrap();

    let mut statuses = Vec::new();
    for _ in 0..3 {
        h.clock.advance(Duration::minutes(10));
        let job = h.queue.claim_next("w1", 1).await.unwrap().expect("claimable");
        let status = h
            .queue
            .complete(job.id, "w1", Outcome::failure(ErrorClass::ServerError, "HTTP 500"))
            .await
            .unwrap();
        statuses.push(status);
    }
    assert_eq!(
        statuses,
        vec![JobStatus::Queued, JobStatus::Queued, JobStatus::Failed]
    );

    let job = h.queue.get_job(id).await.unwrap();
    assert_eq!(job.error_message.as_deref(), Some("HTTP 500"));
    assert_eq!(job.error_class, Some(ErrorClass::ServerError));

    h.clock.advance(Duration::minutes(10));
    assert!(h.queue.claim_next("w1", 1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_rate_limit_is_all_or_nothing() {
    let h = harness(RateLimits {
        per_minute: Some(10),
        per_hour: Some(3),
        per_day: None,
    })
    .await;

    for _ in 0..3 {
        h.queue.enqueue(request("alice")).await.unwrap();
    }
    let err = h.queue.enqueue(request("alice")).await.unwrap_err();
    assert!(matches!(
        err,
        QueueError::Admission(AdmissionError::RateLimitExceeded { .. })
    ));

    let counters = h.queue.rate_limiter().counters("digest", "alice").await.unwrap();
    assert!(counters.iter().all(|c| c.count == 3));

    // Other users keep their own budget
    h.queue.enqueue(request("bob")).await.unwrap();
}

#[tokio::test]
async fn test_lease_reaping_requeues_orphans() {
    let h = harness(RateLimits::unlimited()).await;
    let leases = LeaseManager::new(h.queue.clone());

    leases.heartbeat("crashy", 2, 0).await.unwrap();
    leases.heartbeat("healthy", 2, 0).await.unwrap();
    let orphan = h.queue.enqueue(request("alice")).await.unwrap();
    let kept = h.queue.enqueue(request("bob")).await.unwrap();
    assert_eq!(h.queue.claim_next("crashy", 2).await.unwrap().unwrap().id, orphan);
    assert_eq!(h.queue.claim_next("healthy", 2).await.unwrap().unwrap().id, kept);

    h.clock.advance(Duration::seconds(90));
    leases.heartbeat("healthy", 2, 1).await.unwrap();

    let report = leases.reap_expired_leases(Duration::seconds(60)).await.unwrap();
    assert_eq!(report.reclaimed, vec![orphan]);
    assert_eq!(report.workers_offline, vec!["crashy".to_string()]);

    let job = h.queue.get_job(orphan).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt, 1);
    assert_eq!(job.error_class, Some(ErrorClass::WorkerLost));
    assert!(job.lease_owner.is_none());

    assert_eq!(
        h.queue.get_job(kept).await.unwrap().status,
        JobStatus::Running
    );

    // The crashed worker's late completion is rejected
    let err = h
        .queue
        .complete(orphan, "crashy", Outcome::Success(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::LeaseLost(_)));
}

#[tokio::test]
async fn test_lease_reaping_fails_exhausted_job() {
    let h = harness(RateLimits::unlimited()).await;
    let leases = LeaseManager::new(h.queue.clone());
    let id = h
        .queue
        .enqueue(request("alice").with_max_attempts(2))
        .await
        .unwrap();

    // First attempt fails normally and leaves one attempt
    h.queue.claim_next("w1", 1).await.unwrap().unwrap();
    let status = h
        .queue
        .complete(id, "w1", Outcome::failure(ErrorClass::ServerError, "HTTP 502"))
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Queued);
    assert_eq!(h.queue.get_job(id).await.unwrap().attempt, 1);

    h.clock.advance(Duration::minutes(10));
    leases.heartbeat("crashy", 1, 0).await.unwrap();
    assert_eq!(h.queue.claim_next("crashy", 1).await.unwrap().unwrap().id, id);
    let crashy = |workers: Vec<Worker>| {
        workers.into_iter().find(|w| w.id == "crashy").unwrap()
    };
    assert_eq!(crashy(leases.workers().await.unwrap()).current_load, 1);

    h.clock.advance(Duration::seconds(90));
    let report = leases.reap_expired_leases(Duration::seconds(60)).await.unwrap();
    assert_eq!(report.reclaimed, vec![id]);

    let job = h.queue.get_job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_class, Some(ErrorClass::WorkerLost));
    assert!(job.lease_owner.is_none());
    assert_eq!(crashy(leases.workers().await.unwrap()).current_load, 0);

    h.clock.advance(Duration::minutes(10));
    assert!(h.queue.claim_next("w1", 1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_scheduled_for_delays_claim() {
    let h = harness(RateLimits::unlimited()).await;
    let later = h.clock.now() + Duration::minutes(5);
    h.queue
        .enqueue(request("alice").scheduled_for(later))
        .await
        .unwrap();

    assert!(h.queue.claim_next("w1", 1).await.unwrap().is_none());
    h.clock.advance(Duration::minutes(5));
    assert!(h.queue.claim_next("w1", 1).await.unwrap().is_some());
}
