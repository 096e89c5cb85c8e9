//! In-process credential authority backed by a rotatable issuer

use super::token::{TokenIssuer, decode_public_key, unix_now, verify_token};
use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use kanava_core::{Claims, CredentialAuthority, PluginError};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Credential authority that lives in the same process as the pipeline
///
/// Serves the issuer's public key the way a remote auth service would:
/// base64 on the wire, decoded on fetch. [`rotate`](Self::rotate) swaps in a
/// new signing key, after which tokens signed with the old key stop
/// verifying against freshly fetched keys.
pub struct LocalAuthority {
    issuer: RwLock<Arc<TokenIssuer>>,
    fetches: AtomicU64,
    unavailable: AtomicBool,
}

impl LocalAuthority {
    /// Authority with a generated key
    pub fn new() -> Self {
        Self::with_issuer(TokenIssuer::generate())
    }

    /// Authority serving `issuer`'s key
    pub fn with_issuer(issuer: TokenIssuer) -> Self {
        Self {
            issuer: RwLock::new(Arc::new(issuer)),
            fetches: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Current issuer
    pub fn issuer(&self) -> Arc<TokenIssuer> {
        Arc::clone(&self.issuer.read())
    }

    /// Replace the signing key, returning the new issuer
    pub fn rotate(&self) -> Arc<TokenIssuer> {
        self.rotate_to(TokenIssuer::generate())
    }

    /// Replace the signing key with `issuer`
    pub fn rotate_to(&self, issuer: TokenIssuer) -> Arc<TokenIssuer> {
        let issuer = Arc::new(issuer);
        *self.issuer.write() = Arc::clone(&issuer);
        issuer
    }

    /// Make key fetches fail, simulating an unreachable authority
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of key fetches served
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl Default for LocalAuthority {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialAuthority for LocalAuthority {
    type Key = VerifyingKey;

    async fn fetch_public_key(&self) -> Result<VerifyingKey, PluginError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PluginError::Connection("auth service unavailable".to_string()));
        }
        let encoded = self.issuer().public_key_b64();
        decode_public_key(&encoded)
    }

    fn verify(&self, key: &VerifyingKey, token: &str) -> Result<Claims, PluginError> {
        verify_token(key, token, unix_now())
    }
}
