use std::fmt;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::profile::Environment;

/// Tokens go inactive after this long without renewal.
pub const IDLE_TIMEOUT: Duration = Duration::hours(2);

// Conservative (daylight-time) offset of US Eastern from UTC.
const EASTERN_OFFSET_HOURS: i64 = 4;

/// Whether a token pair came from the request-token leg or the access-token leg.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Request,
    Access,
}

/// OAuth token and its secret.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenPair {
    #[serde(rename = "oauth_token")]
    pub token: String,
    #[serde(rename = "oauth_token_secret")]
    pub secret: String,
    pub kind: TokenKind,
    pub issued_at: DateTime<Utc>,
}

impl TokenPair {
    pub fn request(token: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::new(token, secret, TokenKind::Request)
    }

    pub fn access(token: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::new(token, secret, TokenKind::Access)
    }

    fn new(token: impl Into<String>, secret: impl Into<String>, kind: TokenKind) -> Self {
        Self {
            token: token.into(),
            secret: secret.into(),
            kind,
            issued_at: Utc::now(),
        }
    }

    pub fn with_issued_at(mut self, issued_at: DateTime<Utc>) -> Self {
        self.issued_at = issued_at;
        self
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("token", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("kind", &self.kind)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Access token material as persisted for one `(profile, environment)` key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenRecord {
    pub environment: Environment,
    pub access: TokenPair,
    pub last_renewed_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn new(environment: Environment, access: TokenPair) -> Self {
        let last_renewed_at = access.issued_at;
        Self {
            environment,
            access,
            last_renewed_at,
        }
    }

    /// Midnight US Eastern following issuance; the token cannot be renewed past this.
    pub fn hard_expiry(&self) -> DateTime<Utc> {
        let offset = Duration::hours(EASTERN_OFFSET_HOURS);
        let eastern = self.access.issued_at.naive_utc() - offset;
        let next_midnight = eastern.date().and_time(NaiveTime::MIN) + Duration::days(1);
        Utc.from_utc_datetime(&(next_midnight + offset))
    }

    pub fn idle_expiry(&self) -> DateTime<Utc> {
        self.last_renewed_at + IDLE_TIMEOUT
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.hard_expiry()
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn needs_renewal_at(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now + window >= self.idle_expiry()
    }

    pub fn needs_renewal(&self, window: Duration) -> bool {
        self.needs_renewal_at(Utc::now(), window)
    }
}
