use std::time::Duration;

use chorus_models::UserId;
use futures_util::future::BoxFuture;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("token expired")]
    TokenExpired,
    #[error("invalid token")]
    InvalidToken,
    #[error("token belongs to user {verified}, not {claimed}")]
    IdentityMismatch { claimed: UserId, verified: UserId },
    #[error("unverified identity claims are disabled")]
    ClaimsDisabled,
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub exp: usize,
    pub iat: usize,
}

/// Who a verified session token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    /// Unix seconds; `None` for verifiers without expiring sessions.
    pub expires_at: Option<i64>,
}

impl Identity {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            expires_at: None,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|exp| exp <= chrono::Utc::now().timestamp())
    }
}

/// Consumed capability: turn an opaque session token into an identity.
///
/// The session issuer lives outside the relay; anything that can answer
/// this question (a JWT check, a session-store lookup) can be plugged in.
pub trait SessionVerifier: Send + Sync {
    fn verify<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<Identity, AuthError>>;
}

pub fn create_token(user_id: i64, secret: &str, expiry_secs: u64) -> Result<String, AuthError> {
    let now = chrono::Utc::now().timestamp() as usize;
    let claims = Claims {
        sub: user_id,
        iat: now,
        exp: now + expiry_secs as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::Internal(e.to_string()))
}

pub fn validate_token(token: &str, secret: &str) -> Result<Claims, AuthError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        _ => AuthError::InvalidToken,
    })
}

/// HS256 session tokens signed with a shared secret.
pub struct JwtSessionVerifier {
    secret: String,
}

impl JwtSessionVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl SessionVerifier for JwtSessionVerifier {
    fn verify<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<Identity, AuthError>> {
        Box::pin(async move {
            if token.is_empty() {
                return Err(AuthError::MissingToken);
            }
            let claims = validate_token(token, &self.secret)?;
            Ok(Identity {
                user_id: claims.sub,
                expires_at: Some(claims.exp as i64),
            })
        })
    }
}

/// Caches successful verifications for a short TTL. Failures are never
/// cached, and a cached identity past its own expiry is re-verified.
pub struct CachedSessionVerifier<V> {
    inner: V,
    cache: moka::future::Cache<String, Identity>,
}

impl<V: SessionVerifier> CachedSessionVerifier<V> {
    pub fn new(inner: V, ttl: Duration, max_capacity: u64) -> Self {
        Self {
            inner,
            cache: moka::future::Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }
}

impl<V: SessionVerifier> SessionVerifier for CachedSessionVerifier<V> {
    fn verify<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<Identity, AuthError>> {
        Box::pin(async move {
            if let Some(identity) = self.cache.get(token).await {
                if !identity.is_expired() {
                    return Ok(identity);
                }
                self.cache.invalidate(token).await;
            }
            let identity = self.inner.verify(token).await?;
            self.cache.insert(token.to_string(), identity).await;
            Ok(identity)
        })
    }
}

/// Resolve an explicit `auth {userId, token?}` claim.
///
/// A supplied token must verify to the claimed user. Without a token the
/// claim stands only when `trust_client_claims` is enabled.
pub async fn authenticate_claim(
    verifier: &dyn SessionVerifier,
    claimed: UserId,
    token: Option<&str>,
    trust_client_claims: bool,
) -> Result<Identity, AuthError> {
    match token {
        Some(token) => {
            let identity = verifier.verify(token).await?;
            if identity.user_id != claimed {
                return Err(AuthError::IdentityMismatch {
                    claimed,
                    verified: identity.user_id,
                });
            }
            Ok(identity)
        }
        None if trust_client_claims => Ok(Identity::new(claimed)),
        None => Err(AuthError::ClaimsDisabled),
    }
}
