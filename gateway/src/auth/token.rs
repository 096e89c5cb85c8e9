//! Signed device tokens
//!
//! Tokens are EdDSA (Ed25519) JWTs, `header.claims.sig`:
//!
//! ```text
//! {"typ":"JWT","alg":"EdDSA"} . {"sub":7,"typ":"access","iat":..,"exp":..} . ed25519(header.claims)
//! ```
//!
//! Public keys travel as standard base64 of the 32-byte verifying key.
//! Expiry is checked against the caller's clock, not the system clock.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::pkcs8::{EncodePrivateKey, KeypairBytes};
use ed25519_dalek::{SigningKey, VerifyingKey};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use kanava_core::{Claims, PluginError, TokenKind};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current unix time in seconds
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Issues and parses tokens with one Ed25519 key
pub struct TokenIssuer {
    signing_key: SigningKey,
}

impl TokenIssuer {
    /// Issuer with a freshly generated key
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut rand::thread_rng()),
        }
    }

    /// Issuer with a key derived from a fixed seed
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Issue a token for `sub` valid for `ttl` from now
    pub fn issue(&self, sub: u64, kind: TokenKind, ttl: Duration) -> Result<String, PluginError> {
        let iat = unix_now();
        self.issue_at(sub, kind, iat, iat + ttl.as_secs() as i64)
    }

    /// Issue a token with explicit timestamps
    pub fn issue_at(
        &self,
        sub: u64,
        kind: TokenKind,
        iat: i64,
        exp: i64,
    ) -> Result<String, PluginError> {
        let claims = Claims {
            sub,
            typ: kind,
            iat,
            exp,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::EdDSA), &claims, &self.encoding_key()?)
            .map_err(|e| PluginError::Init(format!("sign token: {e}")))
    }

    /// Signing key as PKCS#8 (v1, seed only)
    fn encoding_key(&self) -> Result<EncodingKey, PluginError> {
        let der = KeypairBytes {
            secret_key: self.signing_key.to_bytes(),
            public_key: None,
        }
        .to_pkcs8_der()
        .map_err(|e| PluginError::Init(format!("encode signing key: {e}")))?;
        Ok(EncodingKey::from_ed_der(der.as_bytes()))
    }

    /// Verifying half of this issuer's key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Public key in its exchange encoding
    pub fn public_key_b64(&self) -> String {
        STANDARD.encode(self.verifying_key().to_bytes())
    }

    /// Verify a token against this issuer's own key
    pub fn parse(&self, token: &str) -> Result<Claims, PluginError> {
        verify_token(&self.verifying_key(), token, unix_now())
    }
}

/// Decode a public key from its exchange encoding
pub fn decode_public_key(encoded: &str) -> Result<VerifyingKey, PluginError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| PluginError::Decode(format!("public key is not base64: {e}")))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| PluginError::Decode("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| PluginError::Decode(format!("invalid public key: {e}")))
}

/// Verify `token` against `key` at time `now` (unix seconds)
pub fn verify_token(key: &VerifyingKey, token: &str, now: i64) -> Result<Claims, PluginError> {
    // Only the algorithm is validated here; expiry uses `now` below
    let mut validation = Validation::new(Algorithm::EdDSA);
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    let claims = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_ed_der(key.as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        ErrorKind::InvalidSignature => PluginError::Auth("invalid token signature".to_string()),
        ErrorKind::InvalidAlgorithm => PluginError::Auth("unexpected signing method".to_string()),
        _ => PluginError::Auth(format!("malformed token: {e}")),
    })?
    .claims;

    if claims.is_expired_at(now) {
        return Err(PluginError::Auth("token expired".to_string()));
    }
    Ok(claims)
}
