use chrono::Duration;
use serde::Deserialize;
use thiserror::Error;

/// Connection codes are drawn from upper-case letters and digits.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// 36^12 still fits in a u64; anything longer is not a code a person types.
pub const MAX_SUPPORTED_CODE_LENGTH: usize = 12;

/// Download tokens live for a fixed three minutes regardless of transfer expiry.
pub const TOKEN_TTL_SECS: i64 = 180;

/// Escalated blocks never exceed a year.
pub const MAX_BLOCK_SECS: u64 = 365 * 24 * 60 * 60;

/// Upper bound for a configured transfer expiry: one year.
pub const MAX_EXPIRY_MINUTES: i64 = 365 * 24 * 60;

pub fn token_ttl() -> Duration {
    Duration::seconds(TOKEN_TTL_SECS)
}

#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("code length bounds invalid: min {min}, max {max}")]
    CodeLength { min: usize, max: usize },
    #[error("usage threshold must be within (0, 1], got {0}")]
    UsageThreshold(f64),
    #[error("default expiry must be positive, got {0} minutes")]
    DefaultExpiry(i64),
    #[error("max expiry {max} is below default expiry {default}")]
    MaxExpiry { default: i64, max: i64 },
    #[error("max expiry {0} minutes exceeds the one-year limit")]
    ExpiryTooLong(i64),
    #[error("max failed attempts must be at least 1")]
    MaxFailedAttempts,
    #[error("initial block duration must be positive")]
    InitialBlock,
    #[error("block multiplier must be at least 1")]
    BlockMultiplier,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CodePolicy {
    pub min_length: usize,
    pub max_length: usize,
    pub usage_threshold: f64,
}

impl Default for CodePolicy {
    fn default() -> Self {
        Self {
            min_length: 4,
            max_length: 8,
            usage_threshold: 0.01,
        }
    }
}

impl CodePolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.min_length == 0
            || self.max_length < self.min_length
            || self.max_length > MAX_SUPPORTED_CODE_LENGTH
        {
            return Err(PolicyError::CodeLength {
                min: self.min_length,
                max: self.max_length,
            });
        }
        if !(self.usage_threshold > 0.0 && self.usage_threshold <= 1.0) {
            return Err(PolicyError::UsageThreshold(self.usage_threshold));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferPolicy {
    pub default_expiry_minutes: i64,
    pub max_expiry_minutes: i64,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            default_expiry_minutes: 10,
            max_expiry_minutes: 24 * 60,
        }
    }
}

impl TransferPolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.default_expiry_minutes <= 0 {
            return Err(PolicyError::DefaultExpiry(self.default_expiry_minutes));
        }
        if self.max_expiry_minutes < self.default_expiry_minutes {
            return Err(PolicyError::MaxExpiry {
                default: self.default_expiry_minutes,
                max: self.max_expiry_minutes,
            });
        }
        if self.max_expiry_minutes > MAX_EXPIRY_MINUTES {
            return Err(PolicyError::ExpiryTooLong(self.max_expiry_minutes));
        }
        Ok(())
    }

    /// Non-positive requests fall back to the default; large ones are capped.
    pub fn effective_expiry_minutes(&self, requested: i64) -> i64 {
        let minutes = if requested > 0 {
            requested.min(self.max_expiry_minutes)
        } else {
            self.default_expiry_minutes
        };
        minutes.clamp(1, MAX_EXPIRY_MINUTES)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AbusePolicy {
    pub max_failed_attempts: u32,
    pub initial_block_secs: u64,
    pub block_multiplier: u64,
}

impl Default for AbusePolicy {
    fn default() -> Self {
        Self {
            max_failed_attempts: 3,
            initial_block_secs: 120,
            block_multiplier: 2,
        }
    }
}

impl AbusePolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_failed_attempts == 0 {
            return Err(PolicyError::MaxFailedAttempts);
        }
        if self.initial_block_secs == 0 {
            return Err(PolicyError::InitialBlock);
        }
        if self.block_multiplier == 0 {
            return Err(PolicyError::BlockMultiplier);
        }
        Ok(())
    }

    /// Duration of the next block given the previous one.
    pub fn next_block_secs(&self, last_block_secs: u64) -> u64 {
        let secs = if last_block_secs > 0 {
            last_block_secs.saturating_mul(self.block_multiplier)
        } else {
            self.initial_block_secs
        };
        secs.min(MAX_BLOCK_SECS)
    }
}
