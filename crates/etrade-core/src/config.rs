use std::env;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;

use crate::profile::Environment;

/// Environment variable that overrides the token directory.
pub const TOKEN_DIR_ENV: &str = "ETRADE_TOKEN_DIR";

/// Locates the per-user directory holding persisted token records.
#[derive(Debug, Clone)]
pub struct ConfigLocator {
    root: PathBuf,
}

impl ConfigLocator {
    /// Attempt to discover the persistent configuration directory, creating it if needed.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs =
            ProjectDirs::from("", "", "etrade-mcp").ok_or(ConfigError::MissingProjectDirs)?;
        Self::at(dirs.config_dir())
    }

    /// Honour `ETRADE_TOKEN_DIR` when set, otherwise fall back to [`ConfigLocator::new`].
    pub fn from_env() -> Result<Self, ConfigError> {
        match env::var_os(TOKEN_DIR_ENV) {
            Some(dir) if !dir.is_empty() => Self::at(dir),
            _ => Self::new(),
        }
    }

    /// Use an explicit directory. A directory created here gets user-only permissions;
    /// an existing one is left as is, with a warning if others can read it.
    pub fn at(root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let root = root.as_ref();
        if root.is_dir() {
            warn_if_shared(root)?;
        } else {
            fs::create_dir_all(root).map_err(ConfigError::CreateDir)?;
            set_user_only_permissions(root)?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the token record for the given profile index and environment.
    pub fn token_file(&self, profile_index: u32, environment: Environment) -> PathBuf {
        self.root
            .join(format!("tokens-{profile_index}-{environment}.json"))
    }
}

fn warn_if_shared(path: &Path) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        let mode = fs::metadata(path)?.permissions().mode();
        if mode & 0o077 != 0 {
            tracing::warn!(
                path = %path.display(),
                mode = format_args!("{:o}", mode & 0o777),
                "token directory is accessible to other users"
            );
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

fn set_user_only_permissions(path: &Path) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        let metadata = fs::metadata(path)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(path, permissions)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Errors raised while reading configuration or preparing the token directory.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to determine configuration directory for etrade-mcp")]
    MissingProjectDirs,
    #[error("failed to create configuration directory: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("filesystem error: {0}")]
    Io(#[source] std::io::Error),
    #[error("invalid configuration for profile {index}: {reason}")]
    InvalidProfileConfig { index: u32, reason: String },
    #[error("no E*TRADE profiles configured; set ETRADE_0_CONSUMER_KEY and ETRADE_0_CONSUMER_SECRET")]
    NoProfiles,
    #[error("profile {0} is not configured")]
    UnknownProfile(u32),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}
