use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Result, TransferError};
use crate::policy::{CodePolicy, CODE_ALPHABET};
use crate::store::TransferStore;

/// Upper bound on random draws per generation before giving up.
pub const MAX_CODE_DRAWS: usize = 64;

#[derive(Clone)]
pub struct CodeGenerator {
    store: Arc<dyn TransferStore>,
    policy: CodePolicy,
}

impl CodeGenerator {
    pub fn new(store: Arc<dyn TransferStore>, policy: CodePolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &CodePolicy {
        &self.policy
    }

    /// Returns a code that no stored transfer used at the moment of the check.
    /// The store's unique index still has the final word.
    pub async fn generate_unique_code(&self, now: DateTime<Utc>) -> Result<String> {
        let active = self.store.count_active(now).await?;
        let length = code_length_for(&self.policy, active);
        if length == self.policy.max_length && load_exceeds(&self.policy, active, length) {
            warn!(
                active,
                code_length = length,
                "connection code space saturated at max length"
            );
        }

        for _ in 0..MAX_CODE_DRAWS {
            let candidate = random_code(length);
            if self.store.find_by_code(&candidate).await?.is_none() {
                debug!(active, code_length = length, "connection code drawn");
                return Ok(candidate);
            }
        }

        Err(TransferError::CodeSpaceExhausted {
            attempts: MAX_CODE_DRAWS,
        })
    }
}

/// Shortest length in `[min_length, max_length]` whose code space keeps the
/// share of active codes at or below the usage threshold.
pub fn code_length_for(policy: &CodePolicy, active: u64) -> usize {
    let mut length = policy.min_length;
    while load_exceeds(policy, active, length) && length < policy.max_length {
        length += 1;
    }
    length
}

fn load_exceeds(policy: &CodePolicy, active: u64, length: usize) -> bool {
    active as f64 / code_space(length) as f64 > policy.usage_threshold
}

pub fn code_space(length: usize) -> u64 {
    let base = CODE_ALPHABET.len() as u64;
    u32::try_from(length)
        .ok()
        .and_then(|exp| base.checked_pow(exp))
        .unwrap_or(u64::MAX)
}

/// Uniform draw over the alphabet from the thread-local CSPRNG.
pub fn random_code(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Trims and upper-cases user input. `None` if anything outside the alphabet
/// remains, so malformed input never reaches the store.
pub fn normalize_code(raw: &str) -> Option<String> {
    let code = raw.trim().to_ascii_uppercase();
    if code.is_empty() || !code.bytes().all(|byte| CODE_ALPHABET.contains(&byte)) {
        return None;
    }
    Some(code)
}
