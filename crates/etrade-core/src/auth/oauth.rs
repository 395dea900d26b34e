use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use url::Url;

use crate::profile::ConsumerCredentials;

use super::signer;
use super::{AuthError, Leg, TokenPair};

pub const REQUEST_TOKEN_URL: &str = "https://api.etrade.com/oauth/request_token";
pub const AUTHORIZE_URL: &str = "https://us.etrade.com/e/t/etws/authorize";
pub const ACCESS_TOKEN_URL: &str = "https://api.etrade.com/oauth/access_token";
pub const RENEW_TOKEN_URL: &str = "https://api.etrade.com/oauth/renew_access_token";
pub const REVOKE_TOKEN_URL: &str = "https://api.etrade.com/oauth/revoke_access_token";

/// E*TRADE only supports out-of-band callbacks.
pub const OOB_CALLBACK: &str = "oob";

const DEFAULT_USER_AGENT: &str = "etrade-rs/0.1.0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// OAuth endpoints used by the handshake and renewal legs.
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub request_token_url: String,
    pub authorize_url: String,
    pub access_token_url: String,
    pub renew_token_url: String,
    pub revoke_token_url: String,
}

impl Default for OAuthEndpoints {
    fn default() -> Self {
        Self {
            request_token_url: REQUEST_TOKEN_URL.to_owned(),
            authorize_url: AUTHORIZE_URL.to_owned(),
            access_token_url: ACCESS_TOKEN_URL.to_owned(),
            renew_token_url: RENEW_TOKEN_URL.to_owned(),
            revoke_token_url: REVOKE_TOKEN_URL.to_owned(),
        }
    }
}

impl OAuthEndpoints {
    /// All endpoints under one base URL, keeping the provider's paths.
    pub fn rooted_at(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            request_token_url: format!("{base}/oauth/request_token"),
            authorize_url: format!("{base}/e/t/etws/authorize"),
            access_token_url: format!("{base}/oauth/access_token"),
            renew_token_url: format!("{base}/oauth/renew_access_token"),
            revoke_token_url: format!("{base}/oauth/revoke_access_token"),
        }
    }
}

/// Performs the signed OAuth 1.0a exchanges for one consumer key.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: Client,
    credentials: ConsumerCredentials,
    endpoints: OAuthEndpoints,
}

impl OAuthClient {
    pub fn new(credentials: ConsumerCredentials) -> Result<Self, AuthError> {
        Self::with_endpoints(credentials, OAuthEndpoints::default())
    }

    pub fn with_endpoints(
        credentials: ConsumerCredentials,
        endpoints: OAuthEndpoints,
    ) -> Result<Self, AuthError> {
        let http = Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            credentials,
            endpoints,
        })
    }

    pub fn credentials(&self) -> &ConsumerCredentials {
        &self.credentials
    }

    pub fn endpoints(&self) -> &OAuthEndpoints {
        &self.endpoints
    }

    /// Page where the user approves the request token and receives a verification code.
    pub fn authorization_url(&self, request_token: &TokenPair) -> Result<Url, AuthError> {
        let mut url = Url::parse(&self.endpoints.authorize_url)?;
        url.query_pairs_mut()
            .append_pair("key", self.credentials.key())
            .append_pair("token", &request_token.token);
        Ok(url)
    }

    /// First leg: obtain a temporary request token.
    pub async fn request_token(&self) -> Result<TokenPair, AuthError> {
        let params = [("oauth_callback".to_owned(), OOB_CALLBACK.to_owned())];
        let body = self
            .send(
                Leg::RequestToken,
                &self.endpoints.request_token_url,
                &params,
                None,
            )
            .await?;
        let (token, secret) = parse_token_response(Leg::RequestToken, &body)?;
        Ok(TokenPair::request(token, secret))
    }

    /// Final leg: trade the authorized request token and verification code for an access token.
    pub async fn access_token(
        &self,
        request_token: &TokenPair,
        verifier: &str,
    ) -> Result<TokenPair, AuthError> {
        let params = [("oauth_verifier".to_owned(), verifier.to_owned())];
        let body = self
            .send(
                Leg::AccessToken,
                &self.endpoints.access_token_url,
                &params,
                Some(request_token),
            )
            .await?;
        let (token, secret) = parse_token_response(Leg::AccessToken, &body)?;
        Ok(TokenPair::access(token, secret))
    }

    /// Extend the validity of an access token. The token values do not change.
    pub async fn renew_access_token(&self, access_token: &TokenPair) -> Result<(), AuthError> {
        self.send(
            Leg::Renewal,
            &self.endpoints.renew_token_url,
            &[],
            Some(access_token),
        )
        .await?;
        Ok(())
    }

    pub async fn revoke_access_token(&self, access_token: &TokenPair) -> Result<(), AuthError> {
        self.send(
            Leg::Revocation,
            &self.endpoints.revoke_token_url,
            &[],
            Some(access_token),
        )
        .await?;
        Ok(())
    }

    async fn send(
        &self,
        leg: Leg,
        url: &str,
        params: &[(String, String)],
        token: Option<&TokenPair>,
    ) -> Result<String, AuthError> {
        let signed = signer::sign("GET", url, params, &self.credentials, token)?;
        tracing::debug!(leg = %leg, url = %signed.url, "calling OAuth endpoint");

        let response = self
            .http
            .get(signed.url)
            .header(AUTHORIZATION, signed.authorization)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenEndpoint { leg, status, body });
        }
        Ok(response.text().await?)
    }
}

fn parse_token_response(leg: Leg, body: &str) -> Result<(String, String), AuthError> {
    let mut token = None;
    let mut secret = None;
    for (key, value) in url::form_urlencoded::parse(body.trim().as_bytes()) {
        match key.as_ref() {
            "oauth_token" => token = Some(value.into_owned()),
            "oauth_token_secret" => secret = Some(value.into_owned()),
            _ => {}
        }
    }
    let token = token
        .filter(|value| !value.is_empty())
        .ok_or(AuthError::MalformedTokenResponse {
            leg,
            field: "oauth_token",
        })?;
    let secret = secret
        .filter(|value| !value.is_empty())
        .ok_or(AuthError::MalformedTokenResponse {
            leg,
            field: "oauth_token_secret",
        })?;
    Ok((token, secret))
}
