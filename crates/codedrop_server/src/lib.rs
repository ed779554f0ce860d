mod app;
mod identity;

pub use app::{build_router, AppState, HttpPolicy};
pub use identity::{IdentityVerifier, TrustedHeaderIdentity, DEFAULT_IDENTITY_HEADER};
