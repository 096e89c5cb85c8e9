//! Per-message authentication
//!
//! [`AuthGate`] verifies device credentials against a cached public key
//! snapshot. The key is fetched lazily and refreshed at most once per
//! call, when a credential fails against the cached key (the authority
//! may have rotated its key since the last fetch).
//!
//! ```text
//! authenticate(token)
//!   no snapshot ─► fetch ─► verify ─► ok | AuthFailure
//!   snapshot    ─► verify ─► ok
//!                     └─ fail ─► fetch ─► verify ─► ok | AuthFailure
//! ```
//!
//! At most two fetches happen per call: never more than one refresh.

pub mod local;
pub mod token;

pub use local::LocalAuthority;
pub use token::{TokenIssuer, decode_public_key, verify_token};

use crate::metrics::Metrics;
use kanava_core::{Claims, CredentialAuthority, PluginError, TokenKind};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Immutable cached key; replaced wholesale on refresh
pub struct KeySnapshot<K> {
    /// Verification key
    pub key: K,
    /// Refresh counter taken at fetch start, starting at 1
    pub version: u64,
    /// When the key was fetched
    pub fetched_at: Instant,
}

/// Credential gate with a lazily fetched, self-refreshing key
pub struct AuthGate<A: CredentialAuthority> {
    authority: Arc<A>,
    snapshot: RwLock<Option<Arc<KeySnapshot<A::Key>>>>,
    versions: AtomicU64,
    timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl<A: CredentialAuthority> AuthGate<A> {
    /// Gate over `authority`; each key fetch is bounded by `timeout`
    pub fn new(authority: Arc<A>, timeout: Duration) -> Self {
        Self {
            authority,
            snapshot: RwLock::new(None),
            versions: AtomicU64::new(0),
            timeout,
            metrics: None,
        }
    }

    /// Count key fetches in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The authority behind this gate
    pub fn authority(&self) -> &Arc<A> {
        &self.authority
    }

    /// Current snapshot, if a key has been fetched
    pub fn snapshot(&self) -> Option<Arc<KeySnapshot<A::Key>>> {
        self.snapshot.read().clone()
    }

    /// Fetch the key ahead of the first message
    ///
    /// Failure is not fatal: the first `authenticate` will try again.
    pub async fn warm_up(&self) {
        match self.refresh().await {
            Ok(snapshot) => info!(version = snapshot.version, "Public key loaded"),
            Err(e) => warn!(error = %e, "Initial public key fetch failed, will retry lazily"),
        }
    }

    /// Verify `token`, refreshing the key at most once
    pub async fn authenticate(&self, token: &str) -> Result<Claims, PluginError> {
        let Some(snapshot) = self.snapshot() else {
            let snapshot = self.refresh().await?;
            return self.check(&snapshot, token);
        };

        match self.check(&snapshot, token) {
            Ok(claims) => Ok(claims),
            Err(first) => {
                debug!(version = snapshot.version, error = %first, "Credential failed, refreshing key");
                let fresh = self.refresh().await?;
                self.check(&fresh, token).map_err(|_| {
                    PluginError::Auth("unauthorized after refreshing public key".to_string())
                })
            }
        }
    }

    fn check(&self, snapshot: &KeySnapshot<A::Key>, token: &str) -> Result<Claims, PluginError> {
        let claims = self.authority.verify(&snapshot.key, token)?;
        if claims.typ != TokenKind::Access {
            return Err(PluginError::Auth(format!(
                "{} token presented, access token required",
                claims.typ.as_str()
            )));
        }
        Ok(claims)
    }

    /// Fetch a new key and swap it in
    ///
    /// Versions are taken when the fetch starts. A fetch that completes
    /// after a later-started one has already been stored is discarded and
    /// the stored snapshot is returned instead.
    async fn refresh(&self) -> Result<Arc<KeySnapshot<A::Key>>, PluginError> {
        if let Some(metrics) = &self.metrics {
            metrics.key_fetches.inc();
        }
        let version = self.versions.fetch_add(1, Ordering::Relaxed) + 1;

        let key = match tokio::time::timeout(self.timeout, self.authority.fetch_public_key()).await
        {
            Ok(Ok(key)) => key,
            Ok(Err(e)) => {
                return Err(PluginError::Auth(format!("failed to update public key: {e}")));
            }
            Err(_) => {
                return Err(PluginError::Auth(format!(
                    "failed to update public key: fetch timed out after {:?}",
                    self.timeout
                )));
            }
        };

        let mut current = self.snapshot.write();
        if let Some(newer) = current.as_ref().filter(|s| s.version > version) {
            debug!(version, stored = newer.version, "Discarding key from an older fetch");
            return Ok(Arc::clone(newer));
        }

        let snapshot = Arc::new(KeySnapshot {
            key,
            version,
            fetched_at: Instant::now(),
        });
        *current = Some(Arc::clone(&snapshot));
        drop(current);
        debug!(version, "Public key refreshed");
        Ok(snapshot)
    }
}
