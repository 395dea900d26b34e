use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::profile::Profile;

use super::capture::{
    ChannelOptions, VerificationChannel, DEFAULT_MAX_ATTEMPTS, DEFAULT_VERIFICATION_TIMEOUT,
};
use super::manual::{read_verification_code, AuthorizationPrompt};
use super::{
    AuthError, CaptureMode, FlowPreference, Leg, OAuthClient, TokenKey, TokenRecord, TokenStore,
};

/// Renew proactively once a token is this close to going idle.
pub const DEFAULT_RENEWAL_WINDOW: Duration = Duration::minutes(30);

const HISTORY_LIMIT: usize = 64;

/// Where a profile's handshake currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Idle,
    RequestingToken,
    AwaitingUserAuthorization,
    AwaitingVerificationCode,
    ExchangingToken,
    Authorized,
    Renewing,
    Failed,
}

/// Tunables for handshakes and renewals.
#[derive(Debug, Clone)]
pub struct FlowOptions {
    pub preference: FlowPreference,
    /// Address the local verification page binds to.
    pub bind_addr: IpAddr,
    pub verification_timeout: StdDuration,
    pub max_attempts: u32,
    pub renewal_window: Duration,
}

impl FlowOptions {
    /// Defaults with capture preferences read from the environment.
    pub fn detect() -> Self {
        Self {
            preference: FlowPreference::detect(),
            ..Self::default()
        }
    }
}

impl Default for FlowOptions {
    fn default() -> Self {
        Self {
            preference: FlowPreference::new(CaptureMode::Page, false),
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            verification_timeout: DEFAULT_VERIFICATION_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            renewal_window: DEFAULT_RENEWAL_WINDOW,
        }
    }
}

/// Drives the three-legged handshake and the renewal leg for a single profile.
///
/// Token material is only written once the access-token leg succeeds, so an
/// interrupted or failed handshake leaves any previously stored record in place.
pub struct AuthorizationFlow<S> {
    profile: Profile,
    key: TokenKey,
    store: S,
    oauth: OAuthClient,
    prompt: Arc<dyn AuthorizationPrompt>,
    options: FlowOptions,
    state: StdMutex<FlowState>,
    history: StdMutex<Vec<FlowState>>,
    handshake: Mutex<()>,
    renewal: Mutex<()>,
    cancel: CancellationToken,
}

impl<S> AuthorizationFlow<S>
where
    S: TokenStore,
{
    pub fn new(
        profile: Profile,
        store: S,
        prompt: Arc<dyn AuthorizationPrompt>,
    ) -> Result<Self, AuthError> {
        let oauth = OAuthClient::new(profile.credentials().clone())?;
        Ok(Self::with_oauth_client(profile, store, prompt, oauth))
    }

    pub fn with_oauth_client(
        profile: Profile,
        store: S,
        prompt: Arc<dyn AuthorizationPrompt>,
        oauth: OAuthClient,
    ) -> Self {
        let key = TokenKey::for_profile(&profile);
        Self {
            profile,
            key,
            store,
            oauth,
            prompt,
            options: FlowOptions::default(),
            state: StdMutex::new(FlowState::Idle),
            history: StdMutex::new(vec![FlowState::Idle]),
            handshake: Mutex::new(()),
            renewal: Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: FlowOptions) -> Self {
        self.options = options;
        self
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn key(&self) -> TokenKey {
        self.key
    }

    pub fn options(&self) -> &FlowOptions {
        &self.options
    }

    pub fn state(&self) -> FlowState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// States visited so far, oldest first, without consecutive repeats.
    pub fn history(&self) -> Vec<FlowState> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Token shared with the host so shutdown can abandon an open verification session.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Close any open verification session. Later handshakes fail with `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn current_record(&self) -> Result<Option<TokenRecord>, AuthError> {
        self.store.get(self.key)
    }

    /// Return a usable access token, running a handshake if none is stored.
    pub async fn ensure_authorized(&self) -> Result<TokenRecord, AuthError> {
        if let Some(record) = self.usable_record()? {
            self.transition(FlowState::Authorized);
            return Ok(record);
        }
        self.reauthorize(None).await
    }

    /// Always run a fresh handshake, replacing whatever is stored on success.
    pub async fn authorize(&self) -> Result<TokenRecord, AuthError> {
        let _guard = self.handshake.lock().await;
        self.run_handshake().await
    }

    /// Run a handshake unless another caller already replaced `stale` while we waited.
    pub async fn reauthorize(&self, stale: Option<&TokenRecord>) -> Result<TokenRecord, AuthError> {
        let _guard = self.handshake.lock().await;
        if let Some(current) = self.usable_record()? {
            let superseded = stale.map_or(true, |stale| stale.access != current.access);
            if superseded {
                tracing::debug!(key = %self.key, "reusing token committed by a concurrent handshake");
                self.transition(FlowState::Authorized);
                return Ok(current);
            }
        }
        self.run_handshake().await
    }

    /// Renew `observed`. Concurrent renewals of the same token collapse into one call.
    ///
    /// A provider rejection removes the stored record and yields
    /// `ReauthorizationRequired`; transport failures leave the record untouched.
    pub async fn renew(&self, observed: &TokenRecord) -> Result<TokenRecord, AuthError> {
        let _guard = self.renewal.lock().await;
        let Some(current) = self.store.get(self.key)? else {
            self.transition(FlowState::Failed);
            return Err(self.reauthorization_required());
        };
        if current.access != observed.access || current.last_renewed_at > observed.last_renewed_at
        {
            tracing::debug!(key = %self.key, "token already renewed by a concurrent caller");
            self.transition(FlowState::Authorized);
            return Ok(current);
        }

        self.transition(FlowState::Renewing);
        match self.oauth.renew_access_token(&observed.access).await {
            Ok(()) => match self.store.mark_renewed(self.key, Utc::now())? {
                Some(record) => {
                    tracing::info!(key = %self.key, "access token renewed");
                    self.transition(FlowState::Authorized);
                    Ok(record)
                }
                None => {
                    self.transition(FlowState::Failed);
                    Err(self.reauthorization_required())
                }
            },
            Err(err) if err.is_rejection() => {
                tracing::warn!(key = %self.key, error = %err, "access token rejected; clearing stored record");
                if let Some(stored) = self.store.get(self.key)? {
                    if stored.access == observed.access {
                        self.store.delete(self.key)?;
                    }
                }
                self.transition(FlowState::Failed);
                Err(self.reauthorization_required())
            }
            Err(err) => {
                self.transition(FlowState::Failed);
                Err(self.handshake_error(Leg::Renewal, err))
            }
        }
    }

    /// Revoke the stored access token and forget it locally.
    pub async fn logout(&self) -> Result<(), AuthError> {
        let _guard = self.handshake.lock().await;
        if let Some(record) = self.store.get(self.key)? {
            if let Err(err) = self.oauth.revoke_access_token(&record.access).await {
                tracing::warn!(key = %self.key, error = %err, "token revocation failed; removing local record anyway");
            }
        }
        self.store.delete(self.key)?;
        self.transition(FlowState::Idle);
        Ok(())
    }

    fn usable_record(&self) -> Result<Option<TokenRecord>, AuthError> {
        let Some(record) = self.store.get(self.key)? else {
            return Ok(None);
        };
        if record.environment != self.profile.environment() {
            return Ok(None);
        }
        if record.is_expired() {
            tracing::info!(
                key = %self.key,
                expired_at = %record.hard_expiry(),
                "stored access token has expired"
            );
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn run_handshake(&self) -> Result<TokenRecord, AuthError> {
        tracing::info!(
            profile = self.profile.index(),
            environment = %self.profile.environment(),
            "starting authorization handshake"
        );
        match self.handshake_legs().await {
            Ok(record) => {
                self.transition(FlowState::Authorized);
                tracing::info!(key = %self.key, "authorization complete");
                Ok(record)
            }
            Err(err) => {
                self.transition(FlowState::Failed);
                tracing::warn!(key = %self.key, error = %err, "authorization handshake failed");
                Err(err)
            }
        }
    }

    async fn handshake_legs(&self) -> Result<TokenRecord, AuthError> {
        self.transition(FlowState::RequestingToken);
        let request_token = self
            .oauth
            .request_token()
            .await
            .map_err(|err| self.handshake_error(Leg::RequestToken, err))?;

        self.transition(FlowState::AwaitingUserAuthorization);
        let authorization_url = self.oauth.authorization_url(&request_token)?;
        let code = self.capture_code(&authorization_url).await?;

        self.transition(FlowState::ExchangingToken);
        let access = self
            .oauth
            .access_token(&request_token, &code)
            .await
            .map_err(|err| self.handshake_error(Leg::AccessToken, err))?;

        let record = TokenRecord::new(self.profile.environment(), access);
        self.store.put(self.key, &record)?;
        Ok(record)
    }

    async fn capture_code(&self, authorization_url: &Url) -> Result<String, AuthError> {
        if self.cancel.is_cancelled() {
            return Err(AuthError::Cancelled);
        }
        if self.options.preference.capture_mode() == CaptureMode::Prompt {
            return self.capture_by_prompt(authorization_url).await;
        }

        let channel_options = ChannelOptions {
            bind_addr: self.options.bind_addr,
            timeout: self.options.verification_timeout,
            max_attempts: self.options.max_attempts,
        };
        let mut channel = match VerificationChannel::open(authorization_url, channel_options).await
        {
            Ok(channel) => channel,
            Err(AuthError::ChannelUnavailable(err)) => {
                tracing::warn!(error = %err, "verification page unavailable; falling back to prompt");
                return self.capture_by_prompt(authorization_url).await;
            }
            Err(err) => return Err(err),
        };

        self.prompt
            .present(&self.profile, authorization_url, Some(channel.local_url()))?;
        self.launch_browser(channel.local_url());
        self.transition(FlowState::AwaitingVerificationCode);

        let outcome = tokio::select! {
            result = channel.wait_for_code() => result,
            _ = self.cancel.cancelled() => Err(AuthError::Cancelled),
        };
        channel.close().await;
        outcome
    }

    async fn capture_by_prompt(&self, authorization_url: &Url) -> Result<String, AuthError> {
        self.prompt.present(&self.profile, authorization_url, None)?;
        self.launch_browser(authorization_url);
        self.transition(FlowState::AwaitingVerificationCode);

        let timeout = self.options.verification_timeout;
        let read = read_verification_code(
            self.prompt.as_ref(),
            &self.profile,
            self.options.max_attempts,
        );
        tokio::select! {
            result = tokio::time::timeout(timeout, read) => match result {
                Ok(code) => code,
                Err(_) => Err(AuthError::VerificationTimeout(timeout)),
            },
            _ = self.cancel.cancelled() => Err(AuthError::Cancelled),
        }
    }

    fn launch_browser(&self, url: &Url) {
        if !self.options.preference.open_browser() {
            return;
        }
        if let Err(err) = open::that(url.as_str()) {
            let err = AuthError::BrowserLaunch(err.to_string());
            tracing::warn!(error = %err, "continuing without a browser");
        }
    }

    fn transition(&self, next: FlowState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == next {
            return;
        }
        tracing::debug!(key = %self.key, from = ?*state, to = ?next, "authorization state change");
        *state = next;

        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if history.len() == HISTORY_LIMIT {
            history.remove(0);
        }
        history.push(next);
    }

    fn handshake_error(&self, leg: Leg, source: AuthError) -> AuthError {
        AuthError::Handshake {
            profile: self.profile.index(),
            environment: self.profile.environment(),
            leg,
            source: Box::new(source),
        }
    }

    fn reauthorization_required(&self) -> AuthError {
        AuthError::ReauthorizationRequired {
            profile: self.profile.index(),
            environment: self.profile.environment(),
        }
    }
}
