mod capture;
mod error;
mod flow;
mod manual;
mod oauth;
mod orchestrator;
mod session;
pub mod signer;
mod token_store;
mod utils;

pub use capture::{
    ChannelOptions, VerificationChannel, DEFAULT_MAX_ATTEMPTS, DEFAULT_VERIFICATION_TIMEOUT,
};
pub use error::{AuthError, Leg};
pub use flow::{CaptureMode, FlowPreference, InvalidCaptureMode};
pub use manual::{
    parse_verifier_input, read_verification_code, AuthorizationPrompt, TerminalPrompt,
};
pub use oauth::{OAuthClient, OAuthEndpoints};
pub use orchestrator::{AuthorizationFlow, FlowOptions, FlowState, DEFAULT_RENEWAL_WINDOW};
pub use session::{TokenKind, TokenPair, TokenRecord, IDLE_TIMEOUT};
pub use signer::{SignedRequest, SigningContext, SigningError};
pub use token_store::{FileTokenStore, MemoryTokenStore, TokenKey, TokenStore};

#[cfg(test)]
pub(crate) use manual::testing;
