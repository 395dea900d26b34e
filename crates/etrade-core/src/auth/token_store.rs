use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConfigLocator;
use crate::profile::{Environment, Profile};

use super::{AuthError, TokenRecord};

const ENVELOPE_VERSION: u32 = 1;

/// Identifies one persisted record: a profile index within one environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenKey {
    pub profile_index: u32,
    pub environment: Environment,
}

impl TokenKey {
    pub fn new(profile_index: u32, environment: Environment) -> Self {
        Self {
            profile_index,
            environment,
        }
    }

    pub fn for_profile(profile: &Profile) -> Self {
        Self::new(profile.index(), profile.environment())
    }
}

impl fmt::Display for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.profile_index, self.environment)
    }
}

/// Persistence abstraction for access token records.
///
/// Every operation on a single key is serialized; operations on different keys never
/// wait on each other.
pub trait TokenStore: Send + Sync {
    fn get(&self, key: TokenKey) -> Result<Option<TokenRecord>, AuthError>;
    fn put(&self, key: TokenKey, record: &TokenRecord) -> Result<(), AuthError>;
    fn delete(&self, key: TokenKey) -> Result<(), AuthError>;
    /// Advance `last_renewed_at` in a single read-modify-write. Returns the stored record,
    /// or `None` when nothing is stored under `key`.
    fn mark_renewed(
        &self,
        key: TokenKey,
        renewed_at: DateTime<Utc>,
    ) -> Result<Option<TokenRecord>, AuthError>;
}

impl<T> TokenStore for Arc<T>
where
    T: TokenStore + ?Sized,
{
    fn get(&self, key: TokenKey) -> Result<Option<TokenRecord>, AuthError> {
        (**self).get(key)
    }

    fn put(&self, key: TokenKey, record: &TokenRecord) -> Result<(), AuthError> {
        (**self).put(key, record)
    }

    fn delete(&self, key: TokenKey) -> Result<(), AuthError> {
        (**self).delete(key)
    }

    fn mark_renewed(
        &self,
        key: TokenKey,
        renewed_at: DateTime<Utc>,
    ) -> Result<Option<TokenRecord>, AuthError> {
        (**self).mark_renewed(key, renewed_at)
    }
}

#[derive(Default)]
struct KeyLocks {
    locks: Mutex<HashMap<TokenKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    fn lock_for(&self, key: TokenKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key).or_default().clone()
    }
}

/// Filesystem-backed token storage, one file per key in the user configuration directory.
pub struct FileTokenStore {
    locator: ConfigLocator,
    locks: KeyLocks,
}

impl FileTokenStore {
    pub fn new(locator: ConfigLocator) -> Self {
        Self {
            locator,
            locks: KeyLocks::default(),
        }
    }

    pub fn with_default_locator() -> Result<Self, AuthError> {
        Ok(Self::new(ConfigLocator::from_env()?))
    }

    fn read(&self, key: TokenKey) -> Result<Option<TokenRecord>, AuthError> {
        let path = self.locator.token_file(key.profile_index, key.environment);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let envelope: TokenEnvelope = serde_json::from_str(&raw)?;
        if envelope.record.environment != key.environment {
            tracing::warn!(
                key = %key,
                stored = %envelope.record.environment,
                "ignoring token record stored for a different environment"
            );
            return Ok(None);
        }
        Ok(Some(envelope.record))
    }

    fn write(&self, key: TokenKey, record: &TokenRecord) -> Result<(), AuthError> {
        let path = self.locator.token_file(key.profile_index, key.environment);
        let envelope = TokenEnvelope {
            version: ENVELOPE_VERSION,
            profile_index: key.profile_index,
            record: record.clone(),
        };
        let payload = serde_json::to_string_pretty(&envelope)?;
        write_atomic(&path, &payload)?;
        Ok(())
    }
}

impl TokenStore for FileTokenStore {
    fn get(&self, key: TokenKey) -> Result<Option<TokenRecord>, AuthError> {
        let lock = self.locks.lock_for(key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read(key)
    }

    fn put(&self, key: TokenKey, record: &TokenRecord) -> Result<(), AuthError> {
        let lock = self.locks.lock_for(key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write(key, record)
    }

    fn delete(&self, key: TokenKey) -> Result<(), AuthError> {
        let lock = self.locks.lock_for(key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.locator.token_file(key.profile_index, key.environment);
        match fs::remove_file(path) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn mark_renewed(
        &self,
        key: TokenKey,
        renewed_at: DateTime<Utc>,
    ) -> Result<Option<TokenRecord>, AuthError> {
        let lock = self.locks.lock_for(key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(mut record) = self.read(key)? else {
            return Ok(None);
        };
        if renewed_at > record.last_renewed_at {
            record.last_renewed_at = renewed_at;
            self.write(key, &record)?;
        }
        Ok(Some(record))
    }
}

/// Write through a sibling temp file and rename so readers never see a partial record.
fn write_atomic(path: &Path, payload: &str) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "token path has no parent"))?;
    fs::create_dir_all(dir)?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid token file name"))?;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}.{nanos}", std::process::id()));

    let result = (|| -> io::Result<()> {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp_path)?;
        file.write_all(payload.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenEnvelope {
    version: u32,
    profile_index: u32,
    record: TokenRecord,
}

/// In-memory token storage for tests and short-lived embeddings.
#[derive(Default)]
pub struct MemoryTokenStore {
    records: Mutex<HashMap<TokenKey, TokenRecord>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: TokenKey) -> Result<Option<TokenRecord>, AuthError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(&key).cloned())
    }

    fn put(&self, key: TokenKey, record: &TokenRecord) -> Result<(), AuthError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.insert(key, record.clone());
        Ok(())
    }

    fn delete(&self, key: TokenKey) -> Result<(), AuthError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.remove(&key);
        Ok(())
    }

    fn mark_renewed(
        &self,
        key: TokenKey,
        renewed_at: DateTime<Utc>,
    ) -> Result<Option<TokenRecord>, AuthError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get_mut(&key).map(|record| {
            if renewed_at > record.last_renewed_at {
                record.last_renewed_at = renewed_at;
            }
            record.clone()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenPair;
    use chrono::Duration;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    fn store_in(temp_dir: &TempDir) -> FileTokenStore {
        FileTokenStore::new(ConfigLocator::at(temp_dir.path()).unwrap())
    }

    fn sample_record(environment: Environment) -> TokenRecord {
        TokenRecord::new(environment, TokenPair::access("token", "secret"))
    }

    #[test]
    fn round_trip_persistence() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        for key in [
            TokenKey::new(0, Environment::Sandbox),
            TokenKey::new(0, Environment::Production),
            TokenKey::new(7, Environment::Production),
        ] {
            let record = sample_record(key.environment);
            store.put(key, &record).unwrap();
            assert_eq!(store.get(key).unwrap(), Some(record));
        }
    }

    #[test]
    fn missing_record_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        assert!(store
            .get(TokenKey::new(3, Environment::Sandbox))
            .unwrap()
            .is_none());
    }

    #[test]
    fn delete_missing_is_ok() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        store.delete(TokenKey::new(0, Environment::Sandbox)).unwrap();
    }

    #[test]
    fn delete_removes_only_its_key() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let sandbox = TokenKey::new(0, Environment::Sandbox);
        let production = TokenKey::new(0, Environment::Production);
        store.put(sandbox, &sample_record(Environment::Sandbox)).unwrap();
        store
            .put(production, &sample_record(Environment::Production))
            .unwrap();
        store.delete(sandbox).unwrap();
        assert!(store.get(sandbox).unwrap().is_none());
        assert!(store.get(production).unwrap().is_some());
    }

    #[test]
    fn writes_leave_no_temp_files_behind() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let key = TokenKey::new(0, Environment::Sandbox);
        store.put(key, &sample_record(Environment::Sandbox)).unwrap();
        store.put(key, &sample_record(Environment::Sandbox)).unwrap();
        let names: Vec<String> = fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["tokens-0-sandbox.json".to_owned()]);
    }

    #[cfg(unix)]
    #[test]
    fn token_files_are_user_only() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let key = TokenKey::new(0, Environment::Sandbox);
        store.put(key, &sample_record(Environment::Sandbox)).unwrap();
        let path = temp_dir.path().join("tokens-0-sandbox.json");
        let mode = fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn record_for_other_environment_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let key = TokenKey::new(0, Environment::Sandbox);
        let envelope = TokenEnvelope {
            version: ENVELOPE_VERSION,
            profile_index: 0,
            record: sample_record(Environment::Production),
        };
        fs::write(
            temp_dir.path().join("tokens-0-sandbox.json"),
            serde_json::to_string(&envelope).unwrap(),
        )
        .unwrap();
        assert!(store.get(key).unwrap().is_none());
    }

    #[test]
    fn mark_renewed_only_moves_forward() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let key = TokenKey::new(0, Environment::Sandbox);
        let record = sample_record(Environment::Sandbox);
        store.put(key, &record).unwrap();

        let later = record.last_renewed_at + Duration::minutes(10);
        let updated = store.mark_renewed(key, later).unwrap().unwrap();
        assert_eq!(updated.last_renewed_at, later);
        assert_eq!(updated.access, record.access);

        let earlier = record.last_renewed_at + Duration::minutes(5);
        let unchanged = store.mark_renewed(key, earlier).unwrap().unwrap();
        assert_eq!(unchanged.last_renewed_at, later);
        assert_eq!(store.get(key).unwrap().unwrap().last_renewed_at, later);
    }

    #[test]
    fn mark_renewed_without_record_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_in(&temp_dir);
        let key = TokenKey::new(0, Environment::Sandbox);
        assert!(store.mark_renewed(key, Utc::now()).unwrap().is_none());
        assert!(store.get(key).unwrap().is_none());
    }

    #[test]
    fn concurrent_renewals_keep_latest_timestamp() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(store_in(&temp_dir));
        let key = TokenKey::new(0, Environment::Production);
        let record = sample_record(Environment::Production);
        store.put(key, &record).unwrap();

        let handles: Vec<_> = (1..=8)
            .map(|minutes| {
                let store = store.clone();
                let at = record.last_renewed_at + Duration::minutes(minutes);
                thread::spawn(move || store.mark_renewed(key, at).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stored = store.get(key).unwrap().unwrap();
        assert_eq!(
            stored.last_renewed_at,
            record.last_renewed_at + Duration::minutes(8)
        );
    }

    #[test]
    fn busy_key_does_not_block_other_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(store_in(&temp_dir));
        let busy = TokenKey::new(0, Environment::Production);
        let other = TokenKey::new(1, Environment::Sandbox);

        let lock = store.locks.lock_for(busy);
        let _held = lock.lock().unwrap();

        let (tx, rx) = mpsc::channel();
        let worker = {
            let store = store.clone();
            thread::spawn(move || {
                let record = sample_record(Environment::Sandbox);
                store.put(other, &record).unwrap();
                let loaded = store.get(other).unwrap();
                tx.send(loaded == Some(record)).unwrap();
            })
        };

        let completed = rx.recv_timeout(StdDuration::from_secs(5)).unwrap();
        assert!(completed);
        worker.join().unwrap();
        assert!(store.get(other).unwrap().is_some());
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryTokenStore::new();
        let key = TokenKey::new(2, Environment::Sandbox);
        let record = sample_record(Environment::Sandbox);
        store.put(key, &record).unwrap();
        assert_eq!(store.get(key).unwrap(), Some(record));
        store.delete(key).unwrap();
        assert!(store.get(key).unwrap().is_none());
    }
}
