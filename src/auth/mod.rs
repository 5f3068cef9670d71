//! Session validation module
//!
//! Maps a session token presented by a game client to the principal it was
//! issued for and whether it has expired. Handlers check the token on their
//! connection before touching game state.
//!
//! Three validators are provided:
//! - [`JwtSessionValidator`] for signed tokens issued by the web site
//! - [`DevSessionValidator`], which accepts any token (development mode)
//! - [`StaticSessionValidator`], a fixed in-memory token table

pub mod jwt;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::error::AuthError;

pub use jwt::{Claims, JwtSessionValidator};

/// The user a session token was issued for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    pub user_id: Uuid,
    pub username: String,
}

/// Result of resolving a token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSession {
    pub principal: Principal,
    pub expires_at: DateTime<Utc>,
    pub expired: bool,
}

/// Resolves session tokens to principals
pub trait SessionValidator: Send + Sync {
    /// Look a token up; `None` when the token is unknown or forged
    fn resolve(&self, token: &str) -> Option<ResolvedSession>;
}

/// Check the token presented on a connection
///
/// Does not log; the caller reports the rejection.
pub fn require_session(validator: &dyn SessionValidator, token: Option<&str>) -> Result<Principal, AuthError> {
    let token = token.ok_or(AuthError::SessionMissing)?;
    let session = validator
        .resolve(token)
        .ok_or_else(|| AuthError::InvalidToken("unknown session token".to_string()))?;
    if session.expired {
        return Err(AuthError::SessionExpired);
    }
    Ok(session.principal)
}

/// In-memory token table
#[derive(Debug, Default)]
pub struct StaticSessionValidator {
    sessions: DashMap<String, (Principal, DateTime<Utc>)>,
}

impl StaticSessionValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token valid until `expires_at`
    pub fn insert(&self, token: impl Into<String>, principal: Principal, expires_at: DateTime<Utc>) {
        self.sessions.insert(token.into(), (principal, expires_at));
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.sessions.remove(token).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionValidator for StaticSessionValidator {
    fn resolve(&self, token: &str) -> Option<ResolvedSession> {
        self.sessions.get(token).map(|entry| {
            let (principal, expires_at) = entry.value().clone();
            ResolvedSession {
                principal,
                expires_at,
                expired: expires_at <= Utc::now(),
            }
        })
    }
}

/// Session lifetime handed out in development mode
const DEV_SESSION_LIFETIME_HOURS: i64 = 24;

/// Accepts any non-empty token, creating its principal on first use
///
/// The same token always maps to the same user while the server runs.
#[derive(Debug, Default)]
pub struct DevSessionValidator {
    principals: DashMap<String, Principal>,
}

impl DevSessionValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokens seen so far
    pub fn len(&self) -> usize {
        self.principals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.principals.is_empty()
    }
}

impl SessionValidator for DevSessionValidator {
    fn resolve(&self, token: &str) -> Option<ResolvedSession> {
        let token = token.trim();
        if token.is_empty() {
            return None;
        }

        let principal = self
            .principals
            .entry(token.to_string())
            .or_insert_with(|| {
                let principal = Principal {
                    user_id: Uuid::new_v4(),
                    username: token.to_lowercase(),
                };
                debug!(
                    user_id = %principal.user_id,
                    username = %principal.username,
                    "Dev mode session - auto-accepting"
                );
                principal
            })
            .clone();

        Some(ResolvedSession {
            principal,
            expires_at: Utc::now() + Duration::hours(DEV_SESSION_LIFETIME_HOURS),
            expired: false,
        })
    }
}
