use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Waiting,
    Downloaded,
}

impl TransferStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Waiting => "waiting",
            TransferStatus::Downloaded => "downloaded",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "waiting" => Some(TransferStatus::Waiting),
            "downloaded" => Some(TransferStatus::Downloaded),
            _ => None,
        }
    }
}

/// Describes the uploaded bytes. The core never looks at the bytes themselves,
/// only at the handle returned by the blob store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub storage_handle: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferRecord {
    pub transfer_id: String,
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub storage_handle: String,
    pub connection_code: String,
    pub status: TransferStatus,
    pub download_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub uploader_id: String,
    pub downloader_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TransferRecord {
    /// WAITING and not yet past its transfer expiry.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == TransferStatus::Waiting && self.expires_at > now
    }

    pub fn token_valid(&self, token: &str, now: DateTime<Utc>) -> bool {
        match (&self.download_token, self.token_expires_at) {
            (Some(current), Some(expires_at)) => current == token && expires_at > now,
            _ => false,
        }
    }
}

/// Failure bookkeeping for one client id. `last_block_secs == 0` means the
/// client has no block history to escalate from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AbuseRecord {
    pub client_id: String,
    pub failed_attempts: u32,
    pub last_attempt_at: DateTime<Utc>,
    pub blocked_until: Option<DateTime<Utc>>,
    pub last_block_secs: u64,
}

impl AbuseRecord {
    pub fn new(client_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            client_id: client_id.to_string(),
            failed_attempts: 0,
            last_attempt_at: now,
            blocked_until: None,
            last_block_secs: 0,
        }
    }

    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        matches!(self.blocked_until, Some(until) if until > now)
    }

    pub fn block_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.blocked_until, Some(until) if until <= now)
    }

    pub fn remaining_block_secs(&self, now: DateTime<Utc>) -> u64 {
        match self.blocked_until {
            Some(until) if until > now => {
                let millis = (until - now).num_milliseconds().max(0) as u64;
                millis.div_ceil(1000)
            }
            _ => 0,
        }
    }
}

/// Outcome of any lookup that must not tell the caller *why* nothing was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound => None,
        }
    }
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Lookup::Found(value),
            None => Lookup::NotFound,
        }
    }
}

/// Result of the conditional WAITING -> DOWNLOADED transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Completed,
    AlreadyDownloaded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn remaining_block_rounds_up_partial_seconds() {
        let mut record = AbuseRecord::new("10.0.0.1", at(0));
        record.blocked_until = Some(at(10));
        let now = at(0) + Duration::milliseconds(9_500);
        assert_eq!(record.remaining_block_secs(now), 1);
        assert_eq!(record.remaining_block_secs(at(10)), 0);
        assert!(record.block_expired(at(10)));
        assert!(!record.is_blocked(at(10)));
    }

    #[test]
    fn status_round_trips_through_storage_text() {
        for status in [TransferStatus::Waiting, TransferStatus::Downloaded] {
            assert_eq!(TransferStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TransferStatus::parse("expired"), None);
    }
}
