//! Profile discovery from environment-style configuration.
//!
//! Each profile is one brokerage identity: a consumer key/secret pair bound to a single
//! environment. Profile 0 may use the unindexed legacy names (`ETRADE_CONSUMER_KEY`);
//! every other index uses `ETRADE_<N>_CONSUMER_KEY` and friends. Enumeration stops at the
//! first index without a consumer key.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

const VAR_PREFIX: &str = "ETRADE";
const CONSUMER_KEY: &str = "CONSUMER_KEY";
const CONSUMER_SECRET: &str = "CONSUMER_SECRET";
const ENVIRONMENT: &str = "ENVIRONMENT";
const LABEL: &str = "LABEL";

/// Brokerage environment a profile (and every token it owns) is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Sandbox,
    Production,
}

impl Environment {
    /// Base URL for data endpoints in this environment.
    pub fn api_base_url(&self) -> &'static str {
        match self {
            Environment::Sandbox => "https://apisb.etrade.com",
            Environment::Production => "https://api.etrade.com",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Sandbox => "sandbox",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = InvalidEnvironment;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sandbox" => Ok(Environment::Sandbox),
            "production" => Ok(Environment::Production),
            other => Err(InvalidEnvironment(other.to_owned())),
        }
    }
}

/// Error reported when parsing an unsupported environment name.
#[derive(Debug, thiserror::Error)]
#[error("invalid environment '{0}' (expected 'sandbox' or 'production')")]
pub struct InvalidEnvironment(pub String);

/// Consumer key and secret issued by the E*TRADE developer portal.
///
/// Held in memory only; never persisted and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ConsumerCredentials {
    key: String,
    secret: String,
}

impl ConsumerCredentials {
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            secret: secret.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for ConsumerCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerCredentials")
            .field("key", &"<redacted>")
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// One configured brokerage identity. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Profile {
    index: u32,
    label: String,
    environment: Environment,
    credentials: ConsumerCredentials,
}

impl Profile {
    pub fn new(
        index: u32,
        label: Option<String>,
        environment: Environment,
        credentials: ConsumerCredentials,
    ) -> Self {
        let label = label.unwrap_or_else(|| format!("Profile {index}"));
        Self {
            index,
            label,
            environment,
            credentials,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn credentials(&self) -> &ConsumerCredentials {
        &self.credentials
    }
}

/// Read-only view over key/value configuration.
pub trait ConfigSource {
    fn var(&self, name: &str) -> Option<String>;
}

/// The process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl ConfigSource for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        env::var(name).ok()
    }
}

impl ConfigSource for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Ordered set of profiles discovered at startup.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: Vec<Profile>,
}

impl ProfileRegistry {
    /// Load every profile from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_source(&ProcessEnv)
    }

    /// Load profiles from an arbitrary configuration source, failing fast on the first
    /// malformed entry.
    pub fn from_source<S>(source: &S) -> Result<Self, ConfigError>
    where
        S: ConfigSource + ?Sized,
    {
        let mut profiles = Vec::new();
        for index in 0u32.. {
            let Some(key) = lookup(source, index, CONSUMER_KEY) else {
                break;
            };
            let secret = lookup(source, index, CONSUMER_SECRET).ok_or_else(|| {
                ConfigError::InvalidProfileConfig {
                    index,
                    reason: format!("{} is not set", var_name(index, CONSUMER_SECRET)),
                }
            })?;
            let environment = match lookup(source, index, ENVIRONMENT) {
                Some(raw) => raw.parse::<Environment>().map_err(|err| {
                    ConfigError::InvalidProfileConfig {
                        index,
                        reason: err.to_string(),
                    }
                })?,
                None => Environment::Sandbox,
            };
            let label = lookup(source, index, LABEL);
            profiles.push(Profile::new(
                index,
                label,
                environment,
                ConsumerCredentials::new(key, secret),
            ));
        }

        if profiles.is_empty() {
            return Err(ConfigError::NoProfiles);
        }
        Ok(Self { profiles })
    }

    pub fn from_profiles(profiles: Vec<Profile>) -> Self {
        Self { profiles }
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    pub fn get(&self, index: u32) -> Result<&Profile, ConfigError> {
        self.profiles
            .iter()
            .find(|profile| profile.index() == index)
            .ok_or(ConfigError::UnknownProfile(index))
    }
}

fn var_name(index: u32, field: &str) -> String {
    format!("{VAR_PREFIX}_{index}_{field}")
}

fn lookup<S>(source: &S, index: u32, field: &str) -> Option<String>
where
    S: ConfigSource + ?Sized,
{
    let non_empty = |value: String| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_owned())
    };

    if let Some(value) = source.var(&var_name(index, field)).and_then(non_empty) {
        return Some(value);
    }
    if index == 0 {
        return source
            .var(&format!("{VAR_PREFIX}_{field}"))
            .and_then(non_empty);
    }
    None
}
