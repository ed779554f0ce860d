use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use codedrop_transfer::{
    AbuseGuard, AbusePolicy, AbuseStore, BlobStore, BlockStatus, Clock, CodePolicy, Completion,
    FileMeta, Lookup, ManualClock, MemoryBlobStore, MemoryStore, RedeemOutcome, RedemptionDesk,
    TransferLifecycle, TransferPolicy, TransferStatus, TransferStore,
};

const CLIENT: &str = "203.0.113.7";

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
}

struct Harness {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    desk: RedemptionDesk,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let lifecycle = TransferLifecycle::new(
            store.clone(),
            CodePolicy::default(),
            TransferPolicy::default(),
            clock.clone(),
        );
        let guard = AbuseGuard::new(store.clone(), AbusePolicy::default(), clock.clone());
        Self {
            store,
            clock,
            desk: RedemptionDesk::new(lifecycle, guard),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn guard(&self) -> &AbuseGuard {
        self.desk.guard()
    }

    async fn fail(&self, times: u32) {
        for _ in 0..times {
            self.guard().record_failure(CLIENT).await.unwrap();
        }
    }

    async fn upload(&self, name: &str, uploader: &str, minutes: i64) -> (String, String) {
        let record = self
            .desk
            .lifecycle()
            .create(
                FileMeta {
                    file_name: name.to_string(),
                    content_type: "text/plain".to_string(),
                    size_bytes: 5,
                    storage_handle: format!("blob-{name}"),
                },
                uploader,
                minutes,
            )
            .await
            .unwrap();
        (record.transfer_id, record.connection_code)
    }
}

#[tokio::test]
async fn fresh_client_is_clear() {
    let harness = Harness::new();
    assert!(!harness.guard().is_blocked(CLIENT).await.unwrap());
    assert_eq!(harness.guard().remaining_block_seconds(CLIENT).await.unwrap(), 0);
    assert_eq!(harness.guard().check(CLIENT).await.unwrap(), BlockStatus::Clear);
}

#[tokio::test]
async fn block_starts_at_the_configured_failure_count() {
    let harness = Harness::new();

    harness.fail(2).await;
    assert!(!harness.guard().is_blocked(CLIENT).await.unwrap());

    harness.fail(1).await;
    assert!(harness.guard().is_blocked(CLIENT).await.unwrap());
    let remaining = harness.guard().remaining_block_seconds(CLIENT).await.unwrap();
    assert!(remaining > 0 && remaining <= 120);

    harness.clock.advance(Duration::seconds(45));
    let remaining = harness.guard().remaining_block_seconds(CLIENT).await.unwrap();
    assert_eq!(remaining, 75);
}

#[tokio::test]
async fn read_only_queries_do_not_release_expired_blocks() {
    let harness = Harness::new();
    harness.fail(3).await;
    harness.clock.advance(Duration::seconds(121));

    assert!(!harness.guard().is_blocked(CLIENT).await.unwrap());
    let stored = harness.store.get_abuse_record(CLIENT).await.unwrap().unwrap();
    assert_eq!(stored.failed_attempts, 3);
    assert!(stored.blocked_until.is_some());

    assert!(harness.guard().release_expired_block(CLIENT).await.unwrap());
    let stored = harness.store.get_abuse_record(CLIENT).await.unwrap().unwrap();
    assert_eq!(stored.failed_attempts, 0);
    assert_eq!(stored.blocked_until, None);
    assert_eq!(stored.last_block_secs, 0);
}

#[tokio::test]
async fn every_block_cycle_starts_at_the_initial_duration() {
    let harness = Harness::new();

    for _ in 0..3 {
        harness.fail(3).await;
        assert_eq!(harness.guard().remaining_block_seconds(CLIENT).await.unwrap(), 120);

        harness.clock.advance(Duration::seconds(120));
        assert_eq!(harness.guard().check(CLIENT).await.unwrap(), BlockStatus::Clear);
    }
}

#[tokio::test]
async fn failures_while_blocked_extend_the_block() {
    let harness = Harness::new();
    harness.fail(3).await;
    harness.clock.advance(Duration::seconds(60));

    harness.fail(1).await;
    assert_eq!(harness.guard().remaining_block_seconds(CLIENT).await.unwrap(), 240);
}

#[tokio::test]
async fn success_clears_failures_and_escalation() {
    let harness = Harness::new();
    harness.fail(3).await;
    harness.guard().record_success(CLIENT).await.unwrap();

    assert!(!harness.guard().is_blocked(CLIENT).await.unwrap());
    let stored = harness.store.get_abuse_record(CLIENT).await.unwrap().unwrap();
    assert_eq!(stored.failed_attempts, 0);
    assert_eq!(stored.last_block_secs, 0);

    harness.fail(3).await;
    assert_eq!(harness.guard().remaining_block_seconds(CLIENT).await.unwrap(), 120);
}

#[tokio::test]
async fn clients_are_tracked_independently() {
    let harness = Harness::new();
    harness.fail(3).await;
    assert!(harness.guard().is_blocked(CLIENT).await.unwrap());
    assert!(!harness.guard().is_blocked("198.51.100.1").await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_failures_are_all_counted() {
    let harness = Harness::new();
    let guard = harness.guard().clone();

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let guard = guard.clone();
            tokio::spawn(async move { guard.record_failure(CLIENT).await.unwrap() })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let stored = harness.store.get_abuse_record(CLIENT).await.unwrap().unwrap();
    assert_eq!(stored.failed_attempts, 10);
    assert!(harness.guard().is_blocked(CLIENT).await.unwrap());
}

#[tokio::test]
async fn wrong_codes_count_down_then_block() {
    let harness = Harness::new();

    let first = harness.desk.redeem("ZZZZ", Some("bob"), CLIENT).await.unwrap();
    assert_eq!(first, RedeemOutcome::Rejected { attempts_left: 2 });

    let second = harness.desk.redeem("ZZZZ", Some("bob"), CLIENT).await.unwrap();
    assert_eq!(second, RedeemOutcome::Rejected { attempts_left: 1 });

    let third = harness.desk.redeem("ZZZZ", Some("bob"), CLIENT).await.unwrap();
    assert_eq!(third, RedeemOutcome::Blocked { retry_after_secs: 120 });
}

#[tokio::test]
async fn second_block_after_expiry_is_not_longer() {
    let harness = Harness::new();
    for _ in 0..3 {
        harness.desk.redeem("ZZZZ", Some("bob"), CLIENT).await.unwrap();
    }
    harness.clock.advance(Duration::seconds(121));

    let mut last = None;
    for _ in 0..3 {
        last = Some(harness.desk.redeem("ZZZZ", Some("bob"), CLIENT).await.unwrap());
    }
    assert_eq!(last, Some(RedeemOutcome::Blocked { retry_after_secs: 120 }));
    let remaining = harness.guard().remaining_block_seconds(CLIENT).await.unwrap();
    assert!(remaining <= 120);
}

#[tokio::test]
async fn blocked_client_cannot_redeem_even_a_valid_code() {
    let harness = Harness::new();
    let (_, code) = harness.upload("a.txt", "alice", 10).await;
    harness.fail(3).await;

    let outcome = harness.desk.redeem(&code, Some("bob"), CLIENT).await.unwrap();
    assert!(matches!(outcome, RedeemOutcome::Blocked { .. }));

    // the gate does not count blocked attempts as failures
    let stored = harness.store.get_abuse_record(CLIENT).await.unwrap().unwrap();
    assert_eq!(stored.failed_attempts, 3);
}

#[tokio::test]
async fn self_redeem_counts_as_a_failure() {
    let harness = Harness::new();
    let (_, code) = harness.upload("a.txt", "alice", 10).await;

    let outcome = harness.desk.redeem(&code, Some("alice"), CLIENT).await.unwrap();
    assert_eq!(outcome, RedeemOutcome::Rejected { attempts_left: 2 });
}

#[tokio::test]
async fn upload_then_download_end_to_end() {
    let harness = Harness::new();
    let blobs = MemoryBlobStore::new();
    let handle = blobs.put(b"hello".to_vec()).await.unwrap();

    let record = harness
        .desk
        .lifecycle()
        .create(
            FileMeta {
                file_name: "a.txt".to_string(),
                content_type: "text/plain".to_string(),
                size_bytes: 5,
                storage_handle: handle.clone(),
            },
            "alice",
            10,
        )
        .await
        .unwrap();
    assert_eq!(record.connection_code.len(), 4);
    assert_eq!(record.expires_at, start() + Duration::minutes(10));

    harness.clock.advance(Duration::minutes(1));
    let RedeemOutcome::Granted { record: granted, token } = harness
        .desk
        .redeem(&record.connection_code, Some("bob"), CLIENT)
        .await
        .unwrap()
    else {
        panic!("redeem should be granted");
    };
    assert_eq!(granted.transfer_id, record.transfer_id);
    assert_eq!(token.expires_at, harness.now() + Duration::minutes(3));

    harness.clock.advance(Duration::seconds(30));
    let Lookup::Found(fetched) = harness
        .desk
        .lifecycle()
        .fetch_by_token(&token.token)
        .await
        .unwrap()
    else {
        panic!("token should resolve");
    };
    assert_eq!(blobs.get(&fetched.storage_handle).await.unwrap(), b"hello");

    let completion = harness
        .desk
        .lifecycle()
        .complete(&fetched.transfer_id, "bob")
        .await
        .unwrap();
    assert_eq!(completion, Completion::Completed);

    let stored = harness
        .store
        .get_transfer(&record.transfer_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, TransferStatus::Downloaded);
    assert_eq!(stored.downloader_id.as_deref(), Some("bob"));

    let again = harness
        .desk
        .redeem(&record.connection_code, Some("carol"), "198.51.100.1")
        .await
        .unwrap();
    assert_eq!(again, RedeemOutcome::Rejected { attempts_left: 2 });
}

#[tokio::test]
async fn brute_force_then_recovery() {
    let harness = Harness::new();
    let (_, code) = harness.upload("a.txt", "alice", 30).await;

    for _ in 0..3 {
        harness.desk.redeem("no-such-code", Some("bob"), CLIENT).await.unwrap();
    }
    assert!(harness.guard().is_blocked(CLIENT).await.unwrap());

    let blocked = harness.desk.redeem(&code, Some("bob"), CLIENT).await.unwrap();
    assert!(matches!(blocked, RedeemOutcome::Blocked { retry_after_secs } if retry_after_secs <= 120));

    harness.clock.advance(Duration::seconds(121));
    let granted = harness.desk.redeem(&code, Some("bob"), CLIENT).await.unwrap();
    assert!(matches!(granted, RedeemOutcome::Granted { .. }));

    let stored = harness.store.get_abuse_record(CLIENT).await.unwrap().unwrap();
    assert_eq!(stored.failed_attempts, 0);
    assert_eq!(stored.blocked_until, None);
}

#[tokio::test]
async fn uploader_redeemer_walkthrough() {
    let harness = Harness::new();
    let (transfer_id, code) = harness.upload("a.txt", "alice", 5).await;
    assert_eq!(code.len(), CodePolicy::default().min_length);

    let lifecycle = harness.desk.lifecycle();
    assert_eq!(lifecycle.redeem(&code, Some("alice")).await.unwrap(), Lookup::NotFound);
    assert!(lifecycle.redeem(&code, Some("bob")).await.unwrap().is_found());

    let token = lifecycle.issue_token(&transfer_id).await.unwrap().found().unwrap();
    assert_eq!(token.expires_at, start() + Duration::minutes(3));

    harness.clock.advance(Duration::minutes(2));
    assert!(lifecycle.fetch_by_token(&token.token).await.unwrap().is_found());

    assert_eq!(
        lifecycle.complete(&transfer_id, "bob").await.unwrap(),
        Completion::Completed
    );
    for anyone in [Some("alice"), Some("bob"), Some("carol"), None] {
        assert_eq!(lifecycle.redeem(&code, anyone).await.unwrap(), Lookup::NotFound);
    }
}

#[tokio::test]
async fn fifth_bad_code_blocks_and_sixth_never_reaches_lookup() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(start()));
    let policy = AbusePolicy {
        max_failed_attempts: 5,
        ..AbusePolicy::default()
    };
    let lifecycle = TransferLifecycle::new(
        store.clone(),
        CodePolicy::default(),
        TransferPolicy::default(),
        clock.clone(),
    );
    let guard = AbuseGuard::new(store.clone(), policy, clock.clone());
    let desk = RedemptionDesk::new(lifecycle, guard.clone());

    for attempt in 1..=4u32 {
        let outcome = desk.redeem("BAD1", None, CLIENT).await.unwrap();
        assert_eq!(outcome, RedeemOutcome::Rejected { attempts_left: 5 - attempt });
    }
    let fifth = desk.redeem("BAD1", None, CLIENT).await.unwrap();
    assert_eq!(fifth, RedeemOutcome::Blocked { retry_after_secs: 120 });
    assert!(guard.is_blocked(CLIENT).await.unwrap());

    clock.advance(Duration::seconds(1));
    let sixth = desk.redeem("BAD1", None, CLIENT).await.unwrap();
    assert_eq!(sixth, RedeemOutcome::Blocked { retry_after_secs: 119 });
    let stored = store.get_abuse_record(CLIENT).await.unwrap().unwrap();
    assert_eq!(stored.failed_attempts, 5);
}
