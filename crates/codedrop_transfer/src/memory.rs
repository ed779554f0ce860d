//! In-process implementations of the store ports, for tests and for running
//! without a database.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BlobError, StoreError};
use crate::model::{AbuseRecord, Completion, TransferRecord, TransferStatus};
use crate::store::{AbuseStore, AbuseUpdate, BlobStore, TransferStore};

#[derive(Default)]
struct TransferTable {
    by_id: HashMap<String, TransferRecord>,
    id_by_code: HashMap<String, String>,
}

/// Transfers sit behind one lock so the code index and the rows always agree.
/// Abuse records are sharded per client id.
#[derive(Clone, Default)]
pub struct MemoryStore {
    transfers: Arc<Mutex<TransferTable>>,
    abuse: Arc<DashMap<String, AbuseRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransferStore for MemoryStore {
    async fn insert_transfer(&self, record: &TransferRecord) -> Result<(), StoreError> {
        let mut table = self.transfers.lock().await;
        if table.id_by_code.contains_key(&record.connection_code) {
            return Err(StoreError::Conflict("connection_code"));
        }
        if table.by_id.contains_key(&record.transfer_id) {
            return Err(StoreError::Conflict("transfer_id"));
        }
        table
            .id_by_code
            .insert(record.connection_code.clone(), record.transfer_id.clone());
        table
            .by_id
            .insert(record.transfer_id.clone(), record.clone());
        Ok(())
    }

    async fn get_transfer(&self, transfer_id: &str) -> Result<Option<TransferRecord>, StoreError> {
        Ok(self.transfers.lock().await.by_id.get(transfer_id).cloned())
    }

    async fn find_by_code(&self, code: &str) -> Result<Option<TransferRecord>, StoreError> {
        let table = self.transfers.lock().await;
        Ok(table
            .id_by_code
            .get(code)
            .and_then(|id| table.by_id.get(id))
            .cloned())
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<TransferRecord>, StoreError> {
        let table = self.transfers.lock().await;
        Ok(table
            .by_id
            .values()
            .find(|record| record.download_token.as_deref() == Some(token))
            .cloned())
    }

    async fn count_active(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let table = self.transfers.lock().await;
        Ok(table
            .by_id
            .values()
            .filter(|record| record.is_active(now))
            .count() as u64)
    }

    async fn attach_token(
        &self,
        transfer_id: &str,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut table = self.transfers.lock().await;
        match table.by_id.get_mut(transfer_id) {
            Some(record) if record.status == TransferStatus::Waiting => {
                record.download_token = Some(token.to_string());
                record.token_expires_at = Some(expires_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_downloaded(
        &self,
        transfer_id: &str,
        downloader_id: &str,
    ) -> Result<Option<Completion>, StoreError> {
        let mut table = self.transfers.lock().await;
        let Some(record) = table.by_id.get_mut(transfer_id) else {
            return Ok(None);
        };
        if record.status != TransferStatus::Waiting {
            return Ok(Some(Completion::AlreadyDownloaded));
        }
        record.status = TransferStatus::Downloaded;
        record.downloader_id = Some(downloader_id.to_string());
        Ok(Some(Completion::Completed))
    }
}

#[async_trait]
impl AbuseStore for MemoryStore {
    async fn get_abuse_record(&self, client_id: &str) -> Result<Option<AbuseRecord>, StoreError> {
        Ok(self.abuse.get(client_id).map(|entry| entry.value().clone()))
    }

    async fn update_abuse_record(
        &self,
        client_id: &str,
        now: DateTime<Utc>,
        update: &AbuseUpdate,
    ) -> Result<AbuseRecord, StoreError> {
        let mut entry = self
            .abuse
            .entry(client_id.to_string())
            .or_insert_with(|| AbuseRecord::new(client_id, now));
        update(entry.value_mut());
        Ok(entry.value().clone())
    }

    async fn clear_abuse_record(&self, client_id: &str) -> Result<bool, StoreError> {
        Ok(match self.abuse.get_mut(client_id) {
            Some(mut entry) => {
                let record = entry.value_mut();
                record.failed_attempts = 0;
                record.blocked_until = None;
                record.last_block_secs = 0;
                true
            }
            None => false,
        })
    }

    async fn release_expired_block(
        &self,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(match self.abuse.get_mut(client_id) {
            Some(mut entry) if entry.value().block_expired(now) => {
                let record = entry.value_mut();
                record.failed_attempts = 0;
                record.blocked_until = None;
                record.last_block_secs = 0;
                true
            }
            _ => false,
        })
    }
}

#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, data: Vec<u8>) -> Result<String, BlobError> {
        let handle = Uuid::now_v7().to_string();
        self.blobs.insert(handle.clone(), data);
        Ok(handle)
    }

    async fn get(&self, handle: &str) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .get(handle)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BlobError::Missing(handle.to_string()))
    }

    async fn delete(&self, handle: &str) -> Result<(), BlobError> {
        self.blobs.remove(handle);
        Ok(())
    }
}
