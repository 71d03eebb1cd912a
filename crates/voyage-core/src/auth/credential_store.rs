use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::ConfigLocator;
use crate::logging::redact;

use super::clock::{Clock, SystemClock};
use super::credential::{Credential, UserProfile, DEFAULT_TOKEN_TYPE};
use super::AuthError;

pub const TOKEN_KEY: &str = "access_token";
pub const TOKEN_TYPE_KEY: &str = "token_type";
pub const EXPIRES_AT_KEY: &str = "expires_at";
pub const USER_KEY: &str = "user_data";

const AUTH_KEYS: [&str; 4] = [TOKEN_KEY, TOKEN_TYPE_KEY, EXPIRES_AT_KEY, USER_KEY];

/// Durable string key/value persistence underneath the credential store.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    /// Write every pair in one step.
    fn set_many(&self, entries: &[(&str, String)]) -> Result<(), AuthError>;
    /// Remove every key in one step.
    fn remove_many(&self, keys: &[&str]) -> Result<(), AuthError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Process-lifetime storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    fn set_many(&self, entries: &[(&str, String)]) -> Result<(), AuthError> {
        let mut map = lock(&self.entries);
        for (key, value) in entries {
            map.insert((*key).to_owned(), value.clone());
        }
        Ok(())
    }

    fn remove_many(&self, keys: &[&str]) -> Result<(), AuthError> {
        let mut map = lock(&self.entries);
        for key in keys {
            map.remove(*key);
        }
        Ok(())
    }
}

/// Filesystem-backed storage located in the user configuration directory.
///
/// The whole map is rewritten on every mutation, through a temporary file renamed into place.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StorageEnvelope {
    version: u32,
    entries: BTreeMap<String, String>,
}

impl FileStorage {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuthError> {
        let path = path.into();
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            match serde_json::from_str::<StorageEnvelope>(&raw) {
                Ok(envelope) => envelope.entries,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "ignoring unreadable credential file");
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Open the credential file for `profile` under the default configuration directory.
    pub fn for_profile(locator: &ConfigLocator, profile: &str) -> Result<Self, AuthError> {
        Self::open(locator.credentials_file(profile))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), AuthError> {
        let envelope = StorageEnvelope {
            version: 1,
            entries: entries.clone(),
        };
        let payload = serde_json::to_string_pretty(&envelope)?;
        write_file(&self.path, &payload)
    }
}

fn write_file(path: &Path, payload: &str) -> Result<(), AuthError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let staging = path.with_extension("json.tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&staging)?;
    file.write_all(payload.as_bytes())?;
    file.sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perm = file.metadata()?.permissions();
        perm.set_mode(0o600);
        fs::set_permissions(&staging, perm)?;
    }

    fs::rename(&staging, path)?;
    Ok(())
}

impl StorageBackend for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).get(key).cloned()
    }

    fn set_many(&self, entries: &[(&str, String)]) -> Result<(), AuthError> {
        let mut map = lock(&self.entries);
        let mut next = map.clone();
        for (key, value) in entries {
            next.insert((*key).to_owned(), value.clone());
        }
        self.persist(&next)?;
        *map = next;
        Ok(())
    }

    fn remove_many(&self, keys: &[&str]) -> Result<(), AuthError> {
        let mut map = lock(&self.entries);
        let mut next = map.clone();
        for key in keys {
            next.remove(*key);
        }
        self.persist(&next)?;
        *map = next;
        Ok(())
    }
}

/// Debug view of what the store currently holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthSnapshot {
    pub has_token: bool,
    pub token_type: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_expired: bool,
    pub has_user: bool,
    pub is_valid: bool,
}

/// Persistence of the access token, its type, its absolute expiry and the cached profile.
///
/// Pure storage: no network calls, no session notifications.
pub struct CredentialStore {
    backend: Box<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
}

impl CredentialStore {
    pub fn new(backend: impl StorageBackend + 'static) -> Self {
        Self::with_clock(backend, Arc::new(SystemClock))
    }

    pub fn with_clock(backend: impl StorageBackend + 'static, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend: Box::new(backend),
            clock,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryStorage::new())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Store a freshly issued credential, replacing whatever was there.
    pub fn set_credential(
        &self,
        token: &str,
        token_type: &str,
        expires_in_secs: i64,
    ) -> Result<Credential, AuthError> {
        let credential = Credential::issued(token, token_type, expires_in_secs, self.now())?;
        self.backend.set_many(&[
            (TOKEN_KEY, credential.access_token.clone()),
            (TOKEN_TYPE_KEY, credential.token_type.clone()),
            (
                EXPIRES_AT_KEY,
                credential.expires_at.timestamp_millis().to_string(),
            ),
        ])?;
        info!(
            token = %redact(token),
            expires_at = %credential.expires_at,
            "credential stored"
        );
        Ok(credential)
    }

    /// Overwrite token and expiry, keeping the stored token type.
    pub fn replace_token(&self, token: &str, expires_in_secs: i64) -> Result<Credential, AuthError> {
        let token_type = self
            .token_type()
            .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_owned());
        self.set_credential(token, &token_type, expires_in_secs)
    }

    pub fn token(&self) -> Option<String> {
        self.backend.get(TOKEN_KEY)
    }

    pub fn token_type(&self) -> Option<String> {
        self.backend.get(TOKEN_TYPE_KEY)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.backend.get(EXPIRES_AT_KEY)?;
        let millis = raw.trim().parse::<i64>().ok()?;
        Utc.timestamp_millis_opt(millis).single()
    }

    /// True when no expiry is recorded or it has passed.
    pub fn is_expired(&self) -> bool {
        match self.expires_at() {
            Some(expires_at) => {
                let expired = self.now() >= expires_at;
                if expired {
                    debug!(%expires_at, "stored credential expired");
                }
                expired
            }
            None => true,
        }
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.expires_at()
            .map(|expires_at| (expires_at - self.now()).max(Duration::zero()))
            .unwrap_or_else(Duration::zero)
    }

    pub fn has_valid_credential(&self) -> bool {
        self.token().is_some() && !self.is_expired()
    }

    /// The stored credential, only when it has not expired.
    pub fn valid_credential(&self) -> Option<Credential> {
        let credential = Credential {
            access_token: self.token()?,
            token_type: self
                .token_type()
                .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_owned()),
            expires_at: self.expires_at()?,
        };
        (!credential.is_expired_at(self.now())).then_some(credential)
    }

    /// `"<type> <token>"` when a valid credential exists.
    pub fn auth_header_value(&self) -> Option<String> {
        self.valid_credential()
            .map(|credential| credential.authorization_value())
    }

    pub fn set_user(&self, profile: &UserProfile) -> Result<(), AuthError> {
        let payload = serde_json::to_string(profile)?;
        self.backend.set_many(&[(USER_KEY, payload)])?;
        debug!(email = %profile.email, "user profile cached");
        Ok(())
    }

    /// Cached profile. Unparseable data wipes all credential state and reads as absent.
    pub fn user(&self) -> Option<UserProfile> {
        self.load_user().unwrap_or_else(|err| {
            warn!(error = %err, "discarding cached user profile");
            None
        })
    }

    /// Like [`CredentialStore::user`], but reports corrupt data as
    /// [`AuthError::CorruptStore`] after wiping it.
    pub fn load_user(&self) -> Result<Option<UserProfile>, AuthError> {
        let Some(raw) = self.backend.get(USER_KEY) else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(profile) => Ok(Some(profile)),
            Err(err) => {
                if let Err(clear_err) = self.clear() {
                    error!(error = %clear_err, "failed to clear corrupt credential state");
                }
                Err(AuthError::CorruptStore(format!("user profile: {err}")))
            }
        }
    }

    /// Remove token, type, expiry and cached profile together.
    pub fn clear(&self) -> Result<(), AuthError> {
        self.backend.remove_many(&AUTH_KEYS)?;
        info!("credential state cleared");
        Ok(())
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        AuthSnapshot {
            has_token: self.token().is_some(),
            token_type: self.token_type(),
            expires_at: self.expires_at(),
            is_expired: self.is_expired(),
            has_user: self.user().is_some(),
            is_valid: self.has_valid_credential(),
        }
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("has_token", &self.token().is_some())
            .field("expires_at", &self.expires_at())
            .finish()
    }
}
