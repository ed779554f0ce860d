use std::sync::Arc;

use chrono::Duration;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::model::AbuseRecord;
use crate::policy::{AbusePolicy, MAX_BLOCK_SECS};
use crate::store::AbuseStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Clear,
    Blocked { remaining_secs: u64 },
}

/// Per-client failure counting with exponential backoff.
///
/// `is_blocked` and `remaining_block_seconds` never write. Lifting a block
/// whose time has run out is the separate `release_expired_block` step, which
/// `check` performs before reading.
#[derive(Clone)]
pub struct AbuseGuard {
    store: Arc<dyn AbuseStore>,
    policy: AbusePolicy,
    clock: Arc<dyn Clock>,
}

impl AbuseGuard {
    pub fn new(store: Arc<dyn AbuseStore>, policy: AbusePolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &AbusePolicy {
        &self.policy
    }

    pub async fn record_failure(&self, client_id: &str) -> Result<AbuseRecord> {
        let now = self.clock.now();
        let policy = self.policy.clone();
        let apply = move |record: &mut AbuseRecord| {
            record.failed_attempts = record.failed_attempts.saturating_add(1);
            record.last_attempt_at = now;
            if record.failed_attempts >= policy.max_failed_attempts {
                let block_secs = policy.next_block_secs(record.last_block_secs);
                record.blocked_until = Some(now + block_duration(block_secs));
                record.last_block_secs = block_secs;
            }
        };
        let record = self
            .store
            .update_abuse_record(client_id, now, &apply)
            .await?;

        if record.is_blocked(now) {
            warn!(
                client_id,
                failed_attempts = record.failed_attempts,
                block_secs = record.last_block_secs,
                "client blocked after repeated bad codes"
            );
        }
        Ok(record)
    }

    pub async fn record_success(&self, client_id: &str) -> Result<()> {
        self.store.clear_abuse_record(client_id).await?;
        Ok(())
    }

    pub async fn is_blocked(&self, client_id: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .store
            .get_abuse_record(client_id)
            .await?
            .is_some_and(|record| record.is_blocked(now)))
    }

    pub async fn remaining_block_seconds(&self, client_id: &str) -> Result<u64> {
        let now = self.clock.now();
        Ok(self
            .store
            .get_abuse_record(client_id)
            .await?
            .map_or(0, |record| record.remaining_block_secs(now)))
    }

    /// Lifts a block that has run out. The client starts over exactly as
    /// after `record_success`.
    pub async fn release_expired_block(&self, client_id: &str) -> Result<bool> {
        let released = self
            .store
            .release_expired_block(client_id, self.clock.now())
            .await?;
        if released {
            info!(client_id, "expired block released");
        }
        Ok(released)
    }

    /// The redemption gate.
    pub async fn check(&self, client_id: &str) -> Result<BlockStatus> {
        self.release_expired_block(client_id).await?;
        let remaining_secs = self.remaining_block_seconds(client_id).await?;
        Ok(if remaining_secs > 0 {
            BlockStatus::Blocked { remaining_secs }
        } else {
            BlockStatus::Clear
        })
    }

    /// Failures left before the client is blocked.
    pub fn attempts_left(&self, record: &AbuseRecord) -> u32 {
        self.policy
            .max_failed_attempts
            .saturating_sub(record.failed_attempts)
    }
}

fn block_duration(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_BLOCK_SECS) as i64)
}
