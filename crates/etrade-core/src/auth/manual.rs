use std::io::{self, Write};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use url::Url;

use crate::profile::Profile;

use super::AuthError;

const MAX_CODE_LEN: usize = 64;

/// User-facing side of the handshake.
///
/// `present` is called once per handshake with the provider's authorization page;
/// `capture_page` is set when a local verification page is waiting for the code.
/// `read_code` is only used when codes are typed directly into the host.
#[async_trait]
pub trait AuthorizationPrompt: Send + Sync {
    fn present(
        &self,
        profile: &Profile,
        authorization_url: &Url,
        capture_page: Option<&Url>,
    ) -> Result<(), AuthError>;

    async fn read_code(&self, profile: &Profile) -> Result<String, AuthError>;
}

/// Prompt on the controlling terminal. Instructions go to stderr so stdout stays
/// clean for command output.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

#[async_trait]
impl AuthorizationPrompt for TerminalPrompt {
    fn present(
        &self,
        profile: &Profile,
        authorization_url: &Url,
        capture_page: Option<&Url>,
    ) -> Result<(), AuthError> {
        let mut stderr = io::stderr().lock();
        writeln!(
            stderr,
            "\nAuthorize {} ({}) with E*TRADE:\n\n  {authorization_url}\n",
            profile.label(),
            profile.environment()
        )?;
        match capture_page {
            Some(page) => writeln!(
                stderr,
                "Then paste the verification code into the page at {page}\n"
            )?,
            None => writeln!(stderr, "Then enter the verification code below.\n")?,
        }
        Ok(())
    }

    async fn read_code(&self, profile: &Profile) -> Result<String, AuthError> {
        {
            let mut stderr = io::stderr().lock();
            write!(stderr, "Verification code for {}: ", profile.label())?;
            stderr.flush()?;
        }
        let mut input = String::new();
        let read = BufReader::new(tokio::io::stdin())
            .read_line(&mut input)
            .await?;
        if read == 0 {
            return Err(AuthError::Cancelled);
        }
        Ok(input)
    }
}

/// Read codes from the prompt until one is usable or attempts run out.
pub async fn read_verification_code(
    prompt: &dyn AuthorizationPrompt,
    profile: &Profile,
    max_attempts: u32,
) -> Result<String, AuthError> {
    let max_attempts = max_attempts.max(1);
    for attempt in 1..=max_attempts {
        let raw = prompt.read_code(profile).await?;
        match parse_verifier_input(&raw) {
            Some(code) => return Ok(code),
            None => tracing::debug!(
                profile = profile.index(),
                attempt,
                "rejected verification code input"
            ),
        }
    }
    Err(AuthError::InvalidVerificationCode {
        attempts: max_attempts,
    })
}

/// Accepts either the bare code or a pasted URL carrying `oauth_verifier`.
pub fn parse_verifier_input(input: &str) -> Option<String> {
    let input = input.trim();
    if let Ok(url) = Url::parse(input) {
        let verifier = url
            .query_pairs()
            .find(|(key, _)| key == "oauth_verifier")
            .map(|(_, value)| value.into_owned())?;
        return validate_code(&verifier);
    }
    validate_code(input)
}

fn validate_code(code: &str) -> Option<String> {
    let code = code.trim();
    let well_formed = !code.is_empty()
        && code.len() <= MAX_CODE_LEN
        && code.chars().all(|ch| ch.is_ascii_alphanumeric());
    well_formed.then(|| code.to_owned())
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedPrompt;
    use super::*;
    use crate::profile::{ConsumerCredentials, Environment};

    fn profile() -> Profile {
        Profile::new(
            0,
            None,
            Environment::Sandbox,
            ConsumerCredentials::new("ck", "cs"),
        )
    }

    #[tokio::test]
    async fn retries_until_a_usable_code() {
        let prompt = ScriptedPrompt::typing(&["", "  ", "12345"]);
        let code = read_verification_code(&prompt, &profile(), 5)
            .await
            .unwrap();
        assert_eq!(code, "12345");
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let prompt = ScriptedPrompt::typing(&["", "bad code", "?", "never read"]);
        let err = read_verification_code(&prompt, &profile(), 3)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::InvalidVerificationCode { attempts: 3 }
        ));
    }

    #[test]
    fn parse_input_handles_raw_code() {
        assert_eq!(parse_verifier_input(" 7QX2K \n").as_deref(), Some("7QX2K"));
    }

    #[test]
    fn parse_input_handles_url() {
        let parsed =
            parse_verifier_input("https://us.etrade.com/e/t/etws/authorize?oauth_verifier=ABC12");
        assert_eq!(parsed.as_deref(), Some("ABC12"));
        assert!(parse_verifier_input("https://us.etrade.com/e/t/etws/authorize?key=x").is_none());
    }

    #[test]
    fn parse_input_rejects_malformed() {
        assert!(parse_verifier_input("").is_none());
        assert!(parse_verifier_input("12 34").is_none());
        assert!(parse_verifier_input(&"9".repeat(MAX_CODE_LEN + 1)).is_none());
    }
}
