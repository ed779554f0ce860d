use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Duration;
use rand::RngCore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::code::{normalize_code, CodeGenerator};
use crate::error::{Result, StoreError, TransferError};
use crate::model::{Completion, FileMeta, IssuedToken, Lookup, TransferRecord, TransferStatus};
use crate::policy::{token_ttl, CodePolicy, TransferPolicy};
use crate::store::TransferStore;

/// How many times `create` redraws after losing a code to a concurrent insert.
pub const MAX_CREATE_ATTEMPTS: usize = 8;

const TOKEN_BYTES: usize = 32;

/// Owns the WAITING -> DOWNLOADED state machine of a transfer.
#[derive(Clone)]
pub struct TransferLifecycle {
    store: Arc<dyn TransferStore>,
    codes: CodeGenerator,
    policy: TransferPolicy,
    clock: Arc<dyn Clock>,
}

impl TransferLifecycle {
    pub fn new(
        store: Arc<dyn TransferStore>,
        code_policy: CodePolicy,
        policy: TransferPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            codes: CodeGenerator::new(store.clone(), code_policy),
            store,
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &TransferPolicy {
        &self.policy
    }

    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await?;
        Ok(())
    }

    pub async fn create(
        &self,
        file: FileMeta,
        uploader_id: &str,
        expiry_minutes: i64,
    ) -> Result<TransferRecord> {
        let minutes = self.policy.effective_expiry_minutes(expiry_minutes);

        for attempt in 1..=MAX_CREATE_ATTEMPTS {
            let now = self.clock.now();
            let code = self.codes.generate_unique_code(now).await?;
            let record = TransferRecord {
                transfer_id: Uuid::now_v7().to_string(),
                file_name: file.file_name.clone(),
                content_type: file.content_type.clone(),
                size_bytes: file.size_bytes,
                storage_handle: file.storage_handle.clone(),
                connection_code: code,
                status: TransferStatus::Waiting,
                download_token: None,
                token_expires_at: None,
                expires_at: now + Duration::minutes(minutes),
                uploader_id: uploader_id.to_string(),
                downloader_id: None,
                created_at: now,
            };

            match self.store.insert_transfer(&record).await {
                Ok(()) => {
                    info!(
                        transfer_id = %record.transfer_id,
                        code_length = record.connection_code.len(),
                        expires_at = %record.expires_at,
                        "transfer created"
                    );
                    return Ok(record);
                }
                Err(StoreError::Conflict(_)) => {
                    warn!(attempt, "connection code taken at insert, drawing again");
                }
                Err(error) => return Err(error.into()),
            }
        }

        Err(TransferError::CodeSpaceExhausted {
            attempts: MAX_CREATE_ATTEMPTS,
        })
    }

    /// Finds a transfer the requester may download. Unknown, expired,
    /// already-downloaded and self-redeemed codes are indistinguishable.
    pub async fn redeem(
        &self,
        code: &str,
        requester_id: Option<&str>,
    ) -> Result<Lookup<TransferRecord>> {
        let Some(code) = normalize_code(code) else {
            return Ok(Lookup::NotFound);
        };
        let Some(record) = self.store.find_by_code(&code).await? else {
            return Ok(Lookup::NotFound);
        };

        let now = self.clock.now();
        let own_upload = requester_id.is_some_and(|id| id == record.uploader_id);
        if !record.is_active(now) || own_upload {
            return Ok(Lookup::NotFound);
        }
        Ok(Lookup::Found(record))
    }

    /// Mints a fresh download token, invalidating any earlier one.
    pub async fn issue_token(&self, transfer_id: &str) -> Result<Lookup<IssuedToken>> {
        let token = new_token();
        let expires_at = self.clock.now() + token_ttl();

        if !self
            .store
            .attach_token(transfer_id, &token, expires_at)
            .await?
        {
            return Ok(Lookup::NotFound);
        }

        info!(transfer_id, token_expires_at = %expires_at, "download token issued");
        Ok(Lookup::Found(IssuedToken { token, expires_at }))
    }

    pub async fn fetch_by_token(&self, token: &str) -> Result<Lookup<TransferRecord>> {
        let record = self.store.find_by_token(token).await?;
        let now = self.clock.now();
        Ok(record
            .filter(|record| record.token_valid(token, now))
            .into())
    }

    /// Exactly one of any number of concurrent callers sees `Completed`.
    pub async fn complete(&self, transfer_id: &str, downloader_id: &str) -> Result<Completion> {
        match self.store.mark_downloaded(transfer_id, downloader_id).await? {
            Some(Completion::Completed) => {
                info!(transfer_id, "transfer downloaded");
                Ok(Completion::Completed)
            }
            Some(Completion::AlreadyDownloaded) => Ok(Completion::AlreadyDownloaded),
            None => Err(TransferError::NotFound),
        }
    }
}

fn new_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
