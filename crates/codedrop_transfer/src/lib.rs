//! Connection codes, the transfer state machine, and per-client backoff.

pub mod clock;
pub mod code;
pub mod error;
pub mod guard;
pub mod lifecycle;
pub mod memory;
pub mod model;
pub mod policy;
pub mod redemption;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use code::{code_length_for, normalize_code, CodeGenerator};
pub use error::{BlobError, StoreError, TransferError};
pub use guard::{AbuseGuard, BlockStatus};
pub use lifecycle::TransferLifecycle;
pub use memory::{MemoryBlobStore, MemoryStore};
pub use model::{
    AbuseRecord, Completion, FileMeta, IssuedToken, Lookup, TransferRecord, TransferStatus,
};
pub use policy::{AbusePolicy, CodePolicy, PolicyError, TransferPolicy, TOKEN_TTL_SECS};
pub use redemption::{RedeemOutcome, RedemptionDesk};
pub use store::{AbuseStore, AbuseUpdate, BlobStore, TransferStore};
