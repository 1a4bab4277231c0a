//! SQLite stores exercised through the execution queue

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;

use agentrun_persist::{
    connect, load_retry_policies, save_retry_policy, SqliteConfig, SqliteCredentialVault,
    SqliteDirectory, SqliteHistoryStore, SqliteQueueBackend, SqliteRateLimitBackend,
    SqliteScheduleStore,
};
use agentrun_queue::{
    AdmissionError, AgentRecord, BackoffStrategy, Clock, CredentialError, CredentialResolver,
    ErrorClass, ExecutionQueue, JobStatus, LeaseGuard, ManualClock, NewJob, Outcome, Phase,
    QueueBackend, QueueError, RateLimitBackend, RateLimiter, RateLimits, RetryPolicy, Schedule,
    ScheduleStore, Transition, TriggerType,
};
use sqlx::SqlitePool;

async fn seeded_pool(config: SqliteConfig) -> SqlitePool {
    let pool = connect(&config).await.unwrap();
    let directory = SqliteDirectory::new(pool.clone());
    directory
        .register_agent(
            &AgentRecord::new("digest", "Daily Digest", "http://127.0.0.1:9/hook")
                .with_required_fields(["api_key"]),
        )
        .await
        .unwrap();
    for user in ["alice", "bob"] {
        directory.install("digest", user, Utc::now()).await.unwrap();
    }
    pool
}

async fn sqlite_queue(pool: &SqlitePool, clock: Arc<ManualClock>, limits: RateLimits) -> ExecutionQueue {
    let vault = SqliteCredentialVault::new(pool.clone(), &[9u8; 32])
        .unwrap()
        .with_clock(clock.clone());
    for user in ["alice", "bob"] {
        vault
            .store_secret("digest", user, "api_key", "sk-test", None)
            .await
            .unwrap();
    }

    ExecutionQueue::builder(
        Arc::new(SqliteQueueBackend::new(pool.clone())),
        Arc::new(SqliteDirectory::new(pool.clone())),
        Arc::new(vault),
    )
    .clock(clock.clone())
    .rate_limiter(RateLimiter::new(
        Arc::new(SqliteRateLimitBackend::new(pool.clone())),
        limits,
        clock,
    ))
    .history_store(Arc::new(SqliteHistoryStore::new(pool.clone())))
    .schedules(Arc::new(SqliteScheduleStore::new(pool.clone())))
    .build()
}

fn request(user: &str) -> NewJob {
    NewJob::new("digest", user, TriggerType::Api, json!({"topic": "sqlite"}))
}

#[tokio::test]
async fn test_enqueue_claim_complete_round_trip() {
    let pool = seeded_pool(SqliteConfig::memory()).await;
    let clock = Arc::new(ManualClock::starting_now());
    let queue = sqlite_queue(&pool, clock.clone(), RateLimits::unlimited()).await;

    let id = queue.enqueue(request("alice").with_priority(2)).await.unwrap();
    let job = queue.claim_next("w1", 1).await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.priority, 2);
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.lease_owner.as_deref(), Some("w1"));

    clock.advance(Duration::milliseconds(250));
    let status = queue
        .complete(id, "w1", Outcome::Success(json!({"ok": true})))
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Completed);

    let stored = queue.get_job(id).await.unwrap();
    assert_eq!(stored.result, Some(json!({"ok": true})));
    assert_eq!(stored.duration_ms(), Some(250));

    let phases: Vec<Phase> = queue
        .history()
        .entries_for_job(id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.phase)
        .collect();
    assert_eq!(phases.first(), Some(&Phase::Init));
    assert_eq!(phases.last(), Some(&Phase::Completed));
}

#[tokio::test]
async fn test_concurrent_claims_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let pool = seeded_pool(SqliteConfig::file(dir.path().join("race.db"))).await;
    let clock = Arc::new(ManualClock::starting_now());
    let queue = Arc::new(sqlite_queue(&pool, clock, RateLimits::unlimited()).await);

    let mut expected = HashSet::new();
    for _ in 0..30 {
        expected.insert(queue.enqueue(request("bob")).await.unwrap());
    }

    let workers = (0..6).map(|n| {
        let queue = queue.clone();
        tokio::spawn(async move {
            let worker = format!("w{}", n);
            let mut claimed = Vec::new();
            while let Some(job) = queue.claim_next(&worker, 1).await.unwrap() {
                claimed.push(job.id);
            }
            claimed
        })
    });

    let mut seen = HashSet::new();
    for handle in futures::future::join_all(workers).await {
        for id in handle.unwrap() {
            assert!(seen.insert(id), "job {} claimed twice", id);
        }
    }
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_stale_lease_transition_is_refused() {
    let pool = seeded_pool(SqliteConfig::memory()).await;
    let backend = SqliteQueueBackend::new(pool.clone());
    let clock = Arc::new(ManualClock::starting_now());
    let queue = sqlite_queue(&pool, clock.clone(), RateLimits::unlimited()).await;

    let id = queue.enqueue(request("alice")).await.unwrap();
    queue.claim_next("w1", 1).await.unwrap().unwrap();

    let stale = LeaseGuard {
        owner: "w2".to_string(),
        attempt: 0,
    };
    let applied = backend
        .transition(
            id,
            &stale,
            Transition::Finish {
                status: JobStatus::Completed,
                result: None,
                error_class: None,
                error_message: None,
                finished_at: clock.now(),
            },
        )
        .await
        .unwrap();
    assert!(!applied);
    assert_eq!(backend.get_job(id).await.unwrap().status, JobStatus::Running);

    assert!(matches!(
        queue.complete(id, "w2", Outcome::Timeout).await,
        Err(QueueError::LeaseLost(_))
    ));
}

#[tokio::test]
async fn test_rate_limit_counters_persist_all_or_nothing() {
    let pool = seeded_pool(SqliteConfig::memory()).await;
    let clock = Arc::new(ManualClock::starting_now());
    let limits = RateLimits {
        per_minute: Some(2),
        per_hour: Some(3),
        per_day: None,
    };
    let queue = sqlite_queue(&pool, clock.clone(), limits).await;

    queue.enqueue(request("alice")).await.unwrap();
    queue.enqueue(request("alice")).await.unwrap();
    let err = queue.enqueue(request("alice")).await.unwrap_err();
    assert!(matches!(
        err,
        QueueError::Admission(AdmissionError::RateLimitExceeded { .. })
    ));

    // The rejected request consumed nothing from the hourly window
    let counters = queue.rate_limiter().counters("digest", "alice").await.unwrap();
    let hourly = counters
        .iter()
        .find(|c| c.window.as_str() == "per_hour")
        .unwrap();
    assert_eq!(hourly.count, 2);
    assert_eq!(hourly.exceeded_count, 0);

    clock.advance(Duration::seconds(61));
    queue.enqueue(request("alice")).await.unwrap();
    let err = queue.enqueue(request("alice")).await.unwrap_err();
    match err {
        QueueError::Admission(AdmissionError::RateLimitExceeded { window, .. }) => {
            assert_eq!(window.as_str(), "per_hour");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // bob has an independent budget
    queue.enqueue(request("bob")).await.unwrap();
}

#[tokio::test]
async fn test_cancelled_reservation_releases_write_lock() {
    let dir = tempfile::tempdir().unwrap();
    let config = SqliteConfig {
        max_connections: 1,
        busy_timeout_secs: 1,
        ..SqliteConfig::file(dir.path().join("limits.db"))
    };
    let pool = seeded_pool(config).await;
    let backend = SqliteRateLimitBackend::new(pool.clone());
    let limits = RateLimits {
        per_minute: Some(5),
        per_hour: None,
        per_day: None,
    };

    // Cancel a reservation mid-flight, as a request timeout would
    let cancelled = tokio::time::timeout(
        std::time::Duration::ZERO,
        backend.check_and_reserve("digest", "alice", &limits, Utc::now()),
    )
    .await;
    assert!(cancelled.is_err());

    let decision = backend
        .check_and_reserve("digest", "alice", &limits, Utc::now())
        .await
        .unwrap();
    assert!(decision.is_allowed());

    // Other writers on the same pool are not blocked
    let queue = sqlite_queue(&pool, Arc::new(ManualClock::starting_now()), RateLimits::unlimited()).await;
    queue.enqueue(request("bob")).await.unwrap();

    let counters = backend.counters("digest", "alice").await.unwrap();
    assert_eq!(counters.len(), 1);
    assert_eq!(counters[0].count, 1);
}

#[tokio::test]
async fn test_schedule_mark_fired_and_auto_disable() {
    let pool = seeded_pool(SqliteConfig::memory()).await;
    let store = SqliteScheduleStore::new(pool);
    let now = Utc::now();

    let schedule = Schedule::new("digest", "alice", "*/5 * * * *", "UTC", json!({}), now).unwrap();
    let id = schedule.id;
    let due_at = schedule.next_run;
    store.insert(schedule).await.unwrap();

    assert!(store.due(now).await.unwrap().is_empty());
    assert_eq!(store.due(due_at).await.unwrap().len(), 1);

    let next = due_at + Duration::minutes(5);
    assert!(store.mark_fired(id, due_at, due_at, next).await.unwrap());
    // A second scheduler instance racing on the same occurrence loses
    assert!(!store.mark_fired(id, due_at, due_at, next).await.unwrap());

    for _ in 0..4 {
        let s = store.record_outcome(id, false).await.unwrap().unwrap();
        assert!(s.active);
    }
    let disabled = store.record_outcome(id, false).await.unwrap().unwrap();
    assert!(!disabled.active);
    assert_eq!(disabled.consecutive_failures, 5);
    assert!(store.due(next).await.unwrap().is_empty());

    assert!(store.set_active(id, true).await.unwrap());
    let revived = store.get(id).await.unwrap().unwrap();
    assert!(revived.active);
    assert_eq!(revived.consecutive_failures, 0);
}

#[tokio::test]
async fn test_vault_fails_closed() {
    let pool = seeded_pool(SqliteConfig::memory()).await;
    let clock = Arc::new(ManualClock::starting_now());
    let vault = SqliteCredentialVault::new(pool.clone(), &[3u8; 32])
        .unwrap()
        .with_clock(clock.clone());
    let fields = vec!["api_key".to_string()];

    vault
        .store_secret("digest", "alice", "api_key", "sk-1", Some(clock.now() + Duration::hours(1)))
        .await
        .unwrap();
    let bundle = vault.resolve("digest", "alice", &fields).await.unwrap();
    assert_eq!(bundle.get("api_key"), Some("sk-1"));

    let stored: String = sqlx::query_scalar("SELECT ciphertext FROM credentials WHERE user_id = 'alice'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(!stored.contains("sk-1"));

    clock.advance(Duration::hours(2));
    assert!(matches!(
        vault.resolve("digest", "alice", &fields).await,
        Err(CredentialError::Missing(_))
    ));

    vault
        .store_secret("digest", "alice", "api_key", "sk-2", None)
        .await
        .unwrap();
    assert!(vault.deactivate("digest", "alice", "api_key").await.unwrap());
    assert!(matches!(
        vault.resolve("digest", "alice", &fields).await,
        Err(CredentialError::Missing(_))
    ));

    // A different key cannot open existing secrets
    vault
        .store_secret("digest", "bob", "api_key", "sk-3", None)
        .await
        .unwrap();
    let other = SqliteCredentialVault::new(pool, &[4u8; 32]).unwrap();
    assert!(matches!(
        other.resolve("digest", "bob", &fields).await,
        Err(CredentialError::Decryption(_))
    ));
}

#[tokio::test]
async fn test_retry_policy_overrides_load() {
    let pool = seeded_pool(SqliteConfig::memory()).await;
    save_retry_policy(
        &pool,
        "digest",
        None,
        &RetryPolicy::fixed(1, std::time::Duration::from_secs(2)),
    )
    .await
    .unwrap();
    save_retry_policy(
        &pool,
        "digest",
        Some(ErrorClass::RateLimitedByRemote),
        &RetryPolicy {
            max_retries: 6,
            backoff: BackoffStrategy::Linear,
            initial_delay: std::time::Duration::from_secs(30),
            max_delay: std::time::Duration::from_secs(600),
            jitter: false,
        },
    )
    .await
    .unwrap();

    let policies = load_retry_policies(&pool, RetryPolicy::default()).await.unwrap();
    assert_eq!(policies.lookup("digest", ErrorClass::ServerError).max_retries, 1);
    let remote = policies.lookup("digest", ErrorClass::RateLimitedByRemote);
    assert_eq!(remote.backoff, BackoffStrategy::Linear);
    assert_eq!(remote.max_retries, 6);
    assert_eq!(policies.lookup("other", ErrorClass::ServerError), RetryPolicy::default());
}

#[tokio::test]
async fn test_missing_credential_rejects_admission() {
    let pool = seeded_pool(SqliteConfig::memory()).await;
    let clock = Arc::new(ManualClock::starting_now());
    let queue = sqlite_queue(&pool, clock, RateLimits::unlimited()).await;

    let directory = SqliteDirectory::new(pool.clone());
    directory.install("digest", "carol", Utc::now()).await.unwrap();

    let err = queue.enqueue(request("carol")).await.unwrap_err();
    assert!(matches!(
        err,
        QueueError::Admission(AdmissionError::MissingCredential(_))
    ));
    assert!(queue
        .backend()
        .list_jobs("carol", None, 10)
        .await
        .unwrap()
        .is_empty());
}
