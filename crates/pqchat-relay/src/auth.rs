//! Session token validation for the connection handshake.
//!
//! The login service (outside this crate) signs a short-lived identity claim
//! with its Ed25519 key. The relay pins the matching verifying key and only
//! ever learns a client's identity from a token that verifies against it.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use pqchat_crypto::Identity;

const TOKEN_DOMAIN: &[u8] = b"pqchat_session_token_v1";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("no credentials presented")]
    MissingCredentials,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("invalid issuer key")]
    InvalidIssuerKey,
}

/// A signed identity claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub identity: Identity,
    pub issued_at: u64,
    pub expires_at: u64,
    pub signature: [u8; 64],
}

#[derive(Serialize, Deserialize)]
struct TokenWire {
    sub: String,
    iat: u64,
    exp: u64,
    sig: String,
}

impl SessionToken {
    /// Compute signature input (all fields except signature)
    fn signature_input(identity: &Identity, issued_at: u64, expires_at: u64) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(TOKEN_DOMAIN);
        hasher.update((identity.as_str().len() as u32).to_be_bytes());
        hasher.update(identity.as_str().as_bytes());
        hasher.update(issued_at.to_le_bytes());
        hasher.update(expires_at.to_le_bytes());
        hasher.finalize().to_vec()
    }

    pub fn verify(&self, issuer: &VerifyingKey) -> Result<(), AuthError> {
        let message = Self::signature_input(&self.identity, self.issued_at, self.expires_at);
        let signature = Signature::from_bytes(&self.signature);
        issuer
            .verify_strict(&message, &signature)
            .map_err(|_| AuthError::InvalidSignature)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }

    /// Text form carried in the `hello` frame.
    pub fn encode(&self) -> String {
        let wire = TokenWire {
            sub: self.identity.to_string(),
            iat: self.issued_at,
            exp: self.expires_at,
            sig: hex::encode(self.signature),
        };
        // Serializing plain strings and integers cannot fail.
        let json = serde_json::to_vec(&wire).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(text: &str) -> Result<Self, AuthError> {
        let json = URL_SAFE_NO_PAD
            .decode(text.trim())
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        let wire: TokenWire =
            serde_json::from_slice(&json).map_err(|e| AuthError::Malformed(e.to_string()))?;
        let identity = Identity::parse(wire.sub).map_err(|e| AuthError::Malformed(e.to_string()))?;
        let signature: [u8; 64] = hex::decode(&wire.sig)
            .map_err(|e| AuthError::Malformed(e.to_string()))?
            .try_into()
            .map_err(|_| AuthError::Malformed("signature must be 64 bytes".to_string()))?;

        Ok(Self {
            identity,
            issued_at: wire.iat,
            expires_at: wire.exp,
            signature,
        })
    }
}

/// Signing side, held by the login service.
pub struct TokenIssuer {
    signing_key: SigningKey,
}

impl TokenIssuer {
    pub fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut rand_core::OsRng))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn issue(&self, identity: &Identity, now: u64, ttl_secs: u64) -> SessionToken {
        let expires_at = now.saturating_add(ttl_secs);
        let message = SessionToken::signature_input(identity, now, expires_at);
        let signature = self.signing_key.sign(&message).to_bytes();
        SessionToken {
            identity: identity.clone(),
            issued_at: now,
            expires_at,
            signature,
        }
    }
}

/// Resolves handshake credentials to a verified identity.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: Option<&str>) -> Result<Identity, AuthError>;
}

/// Cached verified token information
#[derive(Debug, Clone)]
struct VerifiedToken {
    identity: Identity,
    expires_at: u64,
}

/// Verifies session tokens against a pinned issuer key.
pub struct TokenAuthenticator {
    issuer: VerifyingKey,
    /// Keyed by signature to skip repeated verification on reconnect.
    verified_cache: DashMap<[u8; 64], VerifiedToken>,
}

impl TokenAuthenticator {
    pub fn new(issuer: VerifyingKey) -> Self {
        Self {
            issuer,
            verified_cache: DashMap::new(),
        }
    }

    pub fn from_hex(issuer_hex: &str) -> Result<Self, AuthError> {
        let bytes: [u8; 32] = hex::decode(issuer_hex.trim())
            .map_err(|_| AuthError::InvalidIssuerKey)?
            .try_into()
            .map_err(|_| AuthError::InvalidIssuerKey)?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|_| AuthError::InvalidIssuerKey)?;
        Ok(Self::new(key))
    }

    /// Verify a decoded token at time `now`.
    pub fn verify_at(&self, token: &SessionToken, now: u64) -> Result<Identity, AuthError> {
        if token.is_expired(now) {
            self.verified_cache.remove(&token.signature);
            return Err(AuthError::Expired);
        }

        if let Some(cached) = self.verified_cache.get(&token.signature) {
            if cached.identity == token.identity && cached.expires_at == token.expires_at {
                return Ok(cached.identity.clone());
            }
        }

        token.verify(&self.issuer)?;
        self.verified_cache.insert(
            token.signature,
            VerifiedToken {
                identity: token.identity.clone(),
                expires_at: token.expires_at,
            },
        );
        Ok(token.identity.clone())
    }

    /// Drop cache entries whose tokens have expired.
    pub fn cleanup_expired(&self, now: u64) {
        self.verified_cache.retain(|_, token| token.expires_at > now);
    }

    pub fn cached_tokens(&self) -> usize {
        self.verified_cache.len()
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, credentials: Option<&str>) -> Result<Identity, AuthError> {
        let text = credentials
            .filter(|t| !t.trim().is_empty())
            .ok_or(AuthError::MissingCredentials)?;
        let token = SessionToken::decode(text)?;
        self.verify_at(&token, unix_now())
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
