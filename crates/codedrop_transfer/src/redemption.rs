use tracing::info;

use crate::error::Result;
use crate::guard::{AbuseGuard, BlockStatus};
use crate::lifecycle::TransferLifecycle;
use crate::model::{IssuedToken, Lookup, TransferRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedeemOutcome {
    Granted {
        record: TransferRecord,
        token: IssuedToken,
    },
    Rejected {
        attempts_left: u32,
    },
    Blocked {
        retry_after_secs: u64,
    },
}

/// Exchanges a connection code for a download token behind the abuse gate.
#[derive(Clone)]
pub struct RedemptionDesk {
    lifecycle: TransferLifecycle,
    guard: AbuseGuard,
}

impl RedemptionDesk {
    pub fn new(lifecycle: TransferLifecycle, guard: AbuseGuard) -> Self {
        Self { lifecycle, guard }
    }

    pub fn lifecycle(&self) -> &TransferLifecycle {
        &self.lifecycle
    }

    pub fn guard(&self) -> &AbuseGuard {
        &self.guard
    }

    pub async fn redeem(
        &self,
        code: &str,
        requester_id: Option<&str>,
        client_id: &str,
    ) -> Result<RedeemOutcome> {
        if let BlockStatus::Blocked { remaining_secs } = self.guard.check(client_id).await? {
            return Ok(RedeemOutcome::Blocked {
                retry_after_secs: remaining_secs,
            });
        }

        if let Lookup::Found(record) = self.lifecycle.redeem(code, requester_id).await? {
            // The record can stop being WAITING between the lookup and here.
            if let Lookup::Found(token) = self.lifecycle.issue_token(&record.transfer_id).await? {
                self.guard.record_success(client_id).await?;
                info!(transfer_id = %record.transfer_id, client_id, "connection code redeemed");
                return Ok(RedeemOutcome::Granted { record, token });
            }
        }

        let failures = self.guard.record_failure(client_id).await?;
        let remaining_secs = self.guard.remaining_block_seconds(client_id).await?;
        if remaining_secs > 0 {
            return Ok(RedeemOutcome::Blocked {
                retry_after_secs: remaining_secs,
            });
        }
        Ok(RedeemOutcome::Rejected {
            attempts_left: self.guard.attempts_left(&failures),
        })
    }
}
