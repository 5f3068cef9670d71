//! JWT session tokens
//!
//! Tokens are HS256-signed by the web site. Expiry is not treated as a decode
//! failure here: an expired but authentic token still resolves, flagged as
//! expired, so handlers can tell "expired" from "forged".

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::auth::{Principal, ResolvedSession, SessionValidator};
use crate::error::{AuthError, Result};

/// JWT claims carried by a session token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// Username
    pub username: String,
    /// Issued at timestamp (Unix)
    pub iat: i64,
    /// Expiration timestamp (Unix)
    pub exp: i64,
}

impl Claims {
    /// Get the user ID from the subject claim
    pub fn user_id(&self) -> std::result::Result<Uuid, AuthError> {
        Uuid::parse_str(&self.sub).map_err(|_| AuthError::InvalidToken("subject is not a user id".to_string()))
    }
}

/// Validates JWT session tokens
pub struct JwtSessionValidator {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    /// Clock-skew allowance in seconds
    leeway: u64,
}

impl JwtSessionValidator {
    pub fn new(secret: &str, leeway: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            leeway,
        }
    }

    /// Issue a token for a user
    pub fn issue(&self, user_id: Uuid, username: &str, expires_in_seconds: i64) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_string(),
            iat: now,
            exp: now + expires_in_seconds,
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AuthError::InvalidToken(format!("failed to sign token: {}", e)).into())
    }

    /// Verify the signature and return the claims, ignoring expiry
    pub fn claims(&self, token: &str) -> std::result::Result<Claims, AuthError> {
        let mut validation = Validation::default();
        validation.validate_exp = false;

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

impl SessionValidator for JwtSessionValidator {
    fn resolve(&self, token: &str) -> Option<ResolvedSession> {
        let claims = match self.claims(token) {
            Ok(claims) => claims,
            Err(e) => {
                debug!(error = %e, "Rejected session token");
                return None;
            }
        };
        let user_id = claims.user_id().ok()?;
        let expires_at: DateTime<Utc> = Utc.timestamp_opt(claims.exp, 0).single()?;
        let expired = claims.exp.saturating_add(self.leeway as i64) <= Utc::now().timestamp();

        Some(ResolvedSession {
            principal: Principal {
                user_id,
                username: claims.username,
            },
            expires_at,
            expired,
        })
    }
}

impl std::fmt::Debug for JwtSessionValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtSessionValidator")
            .field("leeway", &self.leeway)
            .finish_non_exhaustive()
    }
}
