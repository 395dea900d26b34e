use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;
use crate::profile::Environment;

use super::signer::SigningError;

/// One network exchange of the OAuth 1.0a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    RequestToken,
    AccessToken,
    Renewal,
    Revocation,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Leg::RequestToken => "request-token",
            Leg::AccessToken => "access-token",
            Leg::Renewal => "renewal",
            Leg::Revocation => "revocation",
        };
        f.write_str(value)
    }
}

/// Errors surfaced by authentication and token management routines.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error("{leg} endpoint returned {status}: {body}")]
    TokenEndpoint {
        leg: Leg,
        status: StatusCode,
        body: String,
    },
    #[error("{leg} response is missing '{field}'")]
    MalformedTokenResponse { leg: Leg, field: &'static str },
    #[error("{leg} failed for profile {profile} ({environment}): {source}")]
    Handshake {
        profile: u32,
        environment: Environment,
        leg: Leg,
        #[source]
        source: Box<AuthError>,
    },
    #[error("no verification code received within {} seconds", .0.as_secs())]
    VerificationTimeout(Duration),
    #[error("no valid verification code after {attempts} attempt(s)")]
    InvalidVerificationCode { attempts: u32 },
    #[error("local verification page unavailable: {0}")]
    ChannelUnavailable(#[source] std::io::Error),
    #[error("verification channel closed before a code was submitted")]
    ListenerClosed,
    #[error("access token for profile {profile} ({environment}) was rejected; authorization required")]
    ReauthorizationRequired {
        profile: u32,
        environment: Environment,
    },
    #[error("profile {profile} ({environment}) is not authorized after token renewal")]
    NotAuthorized {
        profile: u32,
        environment: Environment,
    },
    #[error("authorization flow cancelled")]
    Cancelled,
    #[error("failed to launch system browser: {0}")]
    BrowserLaunch(String),
    #[error("invalid request on verification page: {0}")]
    InvalidCaptureRequest(String),
}

impl AuthError {
    /// Leg-level rejection by the provider, as opposed to a transport failure.
    pub fn is_rejection(&self) -> bool {
        match self {
            AuthError::TokenEndpoint { status, .. } => status.is_client_error(),
            AuthError::Handshake { source, .. } => source.is_rejection(),
            _ => false,
        }
    }
}
