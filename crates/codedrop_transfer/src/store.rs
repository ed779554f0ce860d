//! Ports the core needs from its collaborators.
//!
//! Implementations must make every mutating call atomic for the row it
//! touches: the core never holds a lock across two store calls.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{BlobError, StoreError};
use crate::model::{AbuseRecord, Completion, TransferRecord};

/// Read-modify-write step applied to one abuse record while the store holds
/// that client's row exclusively.
pub type AbuseUpdate = dyn Fn(&mut AbuseRecord) + Send + Sync;

#[async_trait]
pub trait TransferStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Must fail with [`StoreError::Conflict`] when the connection code is
    /// already taken by any stored record.
    async fn insert_transfer(&self, record: &TransferRecord) -> Result<(), StoreError>;

    async fn get_transfer(&self, transfer_id: &str) -> Result<Option<TransferRecord>, StoreError>;

    async fn find_by_code(&self, code: &str) -> Result<Option<TransferRecord>, StoreError>;

    async fn find_by_token(&self, token: &str) -> Result<Option<TransferRecord>, StoreError>;

    /// Records in WAITING whose transfer expiry is after `now`.
    async fn count_active(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Replaces the download token of a WAITING record. Returns false when the
    /// record is missing or no longer WAITING.
    async fn attach_token(
        &self,
        transfer_id: &str,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Conditional WAITING -> DOWNLOADED. `None` when the record does not exist.
    async fn mark_downloaded(
        &self,
        transfer_id: &str,
        downloader_id: &str,
    ) -> Result<Option<Completion>, StoreError>;
}

#[async_trait]
pub trait AbuseStore: Send + Sync {
    async fn get_abuse_record(&self, client_id: &str) -> Result<Option<AbuseRecord>, StoreError>;

    /// Applies `update` to the client's record, creating a zeroed record at
    /// `now` first if none exists, and returns the stored result.
    async fn update_abuse_record(
        &self,
        client_id: &str,
        now: DateTime<Utc>,
        update: &AbuseUpdate,
    ) -> Result<AbuseRecord, StoreError>;

    /// Zeroes the failure count, block and block history. False if no record.
    async fn clear_abuse_record(&self, client_id: &str) -> Result<bool, StoreError>;

    /// Applies the `clear_abuse_record` reset to a client whose block ended at
    /// or before `now`. False if nothing was released.
    async fn release_expired_block(
        &self,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

/// Byte storage for uploads. Handles are opaque to the core.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, data: Vec<u8>) -> Result<String, BlobError>;

    async fn get(&self, handle: &str) -> Result<Vec<u8>, BlobError>;

    async fn delete(&self, handle: &str) -> Result<(), BlobError>;
}
