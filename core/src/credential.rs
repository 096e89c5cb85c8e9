//! Credential types and the authority trait

use crate::error::PluginError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Token kind carried in the `typ` claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    /// Short-lived token presented with telemetry
    Access,
    /// Long-lived token exchanged for a new access token
    Refresh,
}

impl TokenKind {
    /// Claim value
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
        }
    }
}

/// Verified token claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (device or user id)
    pub sub: u64,
    /// Token kind
    pub typ: TokenKind,
    /// Issued at, unix seconds
    pub iat: i64,
    /// Expiry, unix seconds
    pub exp: i64,
}

impl Claims {
    /// True if `now` (unix seconds) is at or past the expiry
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.exp
    }
}

/// External signed-token authority
///
/// The authority publishes a public key and knows how to check a token
/// against one. `Key` is an immutable snapshot; callers cache it and replace
/// it wholesale after a refetch.
#[async_trait]
pub trait CredentialAuthority: Send + Sync {
    /// Verification key material
    type Key: Send + Sync + 'static;

    /// Fetch the authority's current public key
    async fn fetch_public_key(&self) -> Result<Self::Key, PluginError>;

    /// Verify `token` against `key`
    ///
    /// Returns the claims on success and `PluginError::Auth` on any
    /// signature, format or expiry failure.
    fn verify(&self, key: &Self::Key, token: &str) -> Result<Claims, PluginError>;

    /// Release connections to the authority
    async fn close(&self) -> Result<(), PluginError> {
        Ok(())
    }
}
