use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

use crate::auth::{signer, AuthError, AuthorizationFlow, SigningError, TokenRecord, TokenStore};
use crate::profile::{Environment, Profile};

const USER_AGENT: &str = "etrade-rs/0.1.0";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors returned by the authenticated client and the services built on it.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {status} body: {body}")]
    HttpStatus { status: StatusCode, body: String },
    #[error("invalid API base URL: {0}")]
    InvalidBaseUrl(#[from] url::ParseError),
    #[error("failed to deserialize response: {0}")]
    Deserialize(#[from] serde_json::Error),
    #[error("stored token belongs to {found}, profile is configured for {expected}")]
    EnvironmentMismatch {
        expected: Environment,
        found: Environment,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("account not found: {0}")]
    AccountNotFound(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Signs every request for one profile, authorizing on first use and renewing once
/// when the provider rejects the current token.
pub struct EtradeClient<S> {
    http: Client,
    flow: Arc<AuthorizationFlow<S>>,
    base_url: String,
}

impl<S> Clone for EtradeClient<S> {
    fn clone(&self) -> Self {
        Self {
            http: self.http.clone(),
            flow: Arc::clone(&self.flow),
            base_url: self.base_url.clone(),
        }
    }
}

impl<S> EtradeClient<S>
where
    S: TokenStore,
{
    /// Target the data endpoints of the profile's environment.
    pub fn new(flow: Arc<AuthorizationFlow<S>>) -> ApiResult<Self> {
        let base_url = flow.profile().environment().api_base_url();
        Self::with_base_url(flow, base_url)
    }

    /// Build a client with a custom base URL (useful for testing).
    pub fn with_base_url(flow: Arc<AuthorizationFlow<S>>, base_url: &str) -> ApiResult<Self> {
        let base_url = Url::parse(base_url)?;
        let http = build_http(REQUEST_TIMEOUT)?;
        Ok(Self {
            http,
            flow,
            base_url: base_url.as_str().trim_end_matches('/').to_owned(),
        })
    }

    /// Replace the per-request timeout applied to data calls.
    pub fn with_timeout(mut self, timeout: Duration) -> ApiResult<Self> {
        self.http = build_http(timeout)?;
        Ok(self)
    }

    pub fn profile(&self) -> &Profile {
        self.flow.profile()
    }

    pub fn flow(&self) -> &Arc<AuthorizationFlow<S>> {
        &self.flow
    }

    /// Issue a signed request and return the successful response.
    ///
    /// A 401 triggers exactly one renewal (or a fresh handshake if the provider has
    /// revoked the token) followed by a single retry. A second 401 is `NotAuthorized`.
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
    ) -> ApiResult<Response> {
        let mut record = self.flow.ensure_authorized().await?;

        if record.needs_renewal(self.flow.options().renewal_window) {
            tracing::debug!(key = %self.flow.key(), "renewing access token before it goes idle");
            match self.flow.renew(&record).await {
                Ok(renewed) => record = renewed,
                Err(AuthError::ReauthorizationRequired { .. }) => {
                    record = self.flow.reauthorize(Some(&record)).await?;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "proactive renewal failed; using current token");
                }
            }
        }

        let response = self.send(&method, path, query, &record).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        tracing::info!(key = %self.flow.key(), path, "request unauthorized; renewing access token");
        let record = self.renew_or_reauthorize(&record).await?;
        let retry = self.send(&method, path, query, &record).await?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            let profile = self.profile();
            return Err(AuthError::NotAuthorized {
                profile: profile.index(),
                environment: profile.environment(),
            }
            .into());
        }
        check_status(retry).await
    }

    pub async fn get_json<T>(&self, path: &str, query: &[(String, String)]) -> ApiResult<T>
    where
        T: DeserializeOwned,
    {
        let response = self.call(Method::GET, path, query).await?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn renew_or_reauthorize(&self, record: &TokenRecord) -> ApiResult<TokenRecord> {
        match self.flow.renew(record).await {
            Ok(renewed) => Ok(renewed),
            Err(AuthError::ReauthorizationRequired { .. }) => {
                tracing::info!(key = %self.flow.key(), "access token revoked; starting a new handshake");
                Ok(self.flow.reauthorize(Some(record)).await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn send(
        &self,
        method: &Method,
        path: &str,
        query: &[(String, String)],
        record: &TokenRecord,
    ) -> ApiResult<Response> {
        let profile = self.profile();
        if record.environment != profile.environment() {
            return Err(ApiError::EnvironmentMismatch {
                expected: profile.environment(),
                found: record.environment,
            });
        }

        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let signed = signer::sign(
            method.as_str(),
            &url,
            query,
            profile.credentials(),
            Some(&record.access),
        )?;
        tracing::debug!(method = %method, url = %signed.url, "calling E*TRADE API");

        let response = self
            .http
            .request(method.clone(), signed.url)
            .header(AUTHORIZATION, signed.authorization)
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        Ok(response)
    }
}

fn build_http(timeout: Duration) -> ApiResult<Client> {
    Ok(Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()?)
}

async fn check_status(response: Response) -> ApiResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::HttpStatus { status, body })
}
