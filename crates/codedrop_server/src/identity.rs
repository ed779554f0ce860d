use anyhow::Context;
use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName};

pub const DEFAULT_IDENTITY_HEADER: &str = "x-codedrop-user";

const MAX_IDENTITY_LEN: usize = 256;

/// Resolves the authenticated user behind a request, if any.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn identify(&self, headers: &HeaderMap) -> Option<String>;
}

/// Trusts a header set by an authenticating reverse proxy in front of the
/// daemon. Only safe when clients cannot reach the daemon directly.
#[derive(Debug, Clone)]
pub struct TrustedHeaderIdentity {
    header: HeaderName,
}

impl TrustedHeaderIdentity {
    pub fn new(header: &str) -> anyhow::Result<Self> {
        let header = HeaderName::try_from(header)
            .with_context(|| format!("invalid identity header name {header:?}"))?;
        Ok(Self { header })
    }

    pub fn header(&self) -> &HeaderName {
        &self.header
    }
}

impl Default for TrustedHeaderIdentity {
    fn default() -> Self {
        Self {
            header: HeaderName::from_static(DEFAULT_IDENTITY_HEADER),
        }
    }
}

#[async_trait]
impl IdentityVerifier for TrustedHeaderIdentity {
    async fn identify(&self, headers: &HeaderMap) -> Option<String> {
        let value = headers.get(&self.header)?.to_str().ok()?.trim();
        if value.is_empty() || value.len() > MAX_IDENTITY_LEN {
            return None;
        }
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[tokio::test]
    async fn reads_the_configured_header() {
        let identity = TrustedHeaderIdentity::new("X-Forwarded-User").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-user", HeaderValue::from_static(" alice "));
        assert_eq!(identity.identify(&headers).await.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn blank_or_missing_header_is_anonymous() {
        let identity = TrustedHeaderIdentity::default();
        let mut headers = HeaderMap::new();
        assert_eq!(identity.identify(&headers).await, None);

        headers.insert(DEFAULT_IDENTITY_HEADER, HeaderValue::from_static("   "));
        assert_eq!(identity.identify(&headers).await, None);

        let oversized = "u".repeat(MAX_IDENTITY_LEN + 1);
        headers.insert(
            DEFAULT_IDENTITY_HEADER,
            HeaderValue::from_str(&oversized).unwrap(),
        );
        assert_eq!(identity.identify(&headers).await, None);
    }

    #[test]
    fn rejects_invalid_header_names() {
        assert!(TrustedHeaderIdentity::new("not a header").is_err());
    }
}
