//! Credential model and storage
//!
//! At most one credential is current at any time. Stores are single-writer:
//! every write goes through the refresh coordinator or an explicit
//! login/logout, never through the request path.
//!
//! `FileCredentialStore` persists to a JSON file with atomic temp-file + rename
//! writes (0600 on unix). A tokio Mutex serializes concurrent writes and reads
//! clone the in-memory copy.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::token::TokenResponse;

/// Access/refresh token pair.
///
/// `expires_at` is a unix timestamp in milliseconds and is advisory only: a 401
/// from the server always wins over a not-yet-expired local credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: Secret<String>,
    pub refresh_token: Secret<String>,
    pub expires_at: u64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Credential {
    pub fn new(access_token: &str, refresh_token: &str, expires_at: u64) -> Self {
        Self {
            access_token: Secret::from(access_token),
            refresh_token: Secret::from(refresh_token),
            expires_at,
            token_type: default_token_type(),
        }
    }

    /// Build the next credential from a token endpoint response.
    ///
    /// `expires_in` is a delta in seconds; it is converted to an absolute
    /// timestamp from `now_millis`. Servers that do not rotate refresh tokens
    /// omit `refresh_token`, in which case the previous one is kept.
    pub fn from_token_response(
        response: TokenResponse,
        previous_refresh: &Secret<String>,
        now_millis: u64,
    ) -> Self {
        Self {
            access_token: Secret::new(response.access_token),
            refresh_token: response
                .refresh_token
                .map(Secret::new)
                .unwrap_or_else(|| previous_refresh.clone()),
            expires_at: now_millis.saturating_add(response.expires_in.saturating_mul(1000)),
            token_type: response.token_type.unwrap_or_else(default_token_type),
        }
    }

    /// Value for the `Authorization` header.
    pub fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.access_token.expose())
    }

    /// Whether the advisory expiry falls within `window` of `now_millis`.
    pub fn expires_within(&self, window: Duration, now_millis: u64) -> bool {
        self.expires_at <= now_millis.saturating_add(window.as_millis() as u64)
    }
}

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Durable holder of the current credential.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn CredentialStore>`).
pub trait CredentialStore: Send + Sync {
    /// Clone of the current credential, if any.
    fn get(&self) -> Pin<Box<dyn Future<Output = Option<Credential>> + Send + '_>>;

    /// Replace the current credential.
    fn set(&self, credential: Credential) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Remove the current credential.
    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Volatile store for tests and embedders that persist elsewhere.
#[derive(Default)]
pub struct MemoryCredentialStore {
    state: Mutex<Option<Credential>>,
}

impl MemoryCredentialStore {
    pub fn new(initial: Option<Credential>) -> Self {
        Self {
            state: Mutex::new(initial),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Pin<Box<dyn Future<Output = Option<Credential>> + Send + '_>> {
        Box::pin(async move { self.state.lock().await.clone() })
    }

    fn set(&self, credential: Credential) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            *self.state.lock().await = Some(credential);
            Ok(())
        })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            *self.state.lock().await = None;
            Ok(())
        })
    }
}

/// JSON-file store with atomic writes.
pub struct FileCredentialStore {
    path: PathBuf,
    state: Mutex<Option<Credential>>,
}

impl FileCredentialStore {
    /// Load the credential from `path`.
    ///
    /// A missing file is a cold start with no session, not an error.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let credential: Credential = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), "loaded credential");
            Some(credential)
        } else {
            info!(path = %path.display(), "credential file not found, starting without a session");
            None
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Pin<Box<dyn Future<Output = Option<Credential>> + Send + '_>> {
        Box::pin(async move { self.state.lock().await.clone() })
    }

    fn set(&self, credential: Credential) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            write_atomic(&self.path, &credential).await?;
            *state = Some(credential);
            debug!("stored credential");
            Ok(())
        })
    }

    fn clear(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(format!("removing credential file: {e}"))),
            }
            *state = None;
            debug!("cleared credential");
            Ok(())
        })
    }
}

/// Write the credential atomically: temp file in the same directory, 0600,
/// then rename over the target.
async fn write_atomic(path: &Path, credential: &Credential) -> Result<()> {
    let json = serde_json::to_string_pretty(credential)
        .map_err(|e| Error::CredentialParse(format!("serializing credential: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".credential.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credential");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_credential(suffix: &str) -> Credential {
        Credential::new(&format!("at_{suffix}"), &format!("rt_{suffix}"), 1735500000000)
    }

    #[tokio::test]
    async fn roundtrip_set_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credential.json");

        let store = FileCredentialStore::load(path.clone()).await.unwrap();
        store.set(test_credential("1")).await.unwrap();

        let store2 = FileCredentialStore::load(path).await.unwrap();
        let cred = store2.get().await.unwrap();
        assert_eq!(cred.access_token.expose(), "at_1");
        assert_eq!(cred.refresh_token.expose(), "rt_1");
        assert_eq!(cred.token_type, "Bearer");
    }

    #[tokio::test]
    async fn cold_start_has_no_credential() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credential.json");

        let store = FileCredentialStore::load(path.clone()).await.unwrap();
        assert!(store.get().await.is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn clear_removes_file_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credential.json");

        let store = FileCredentialStore::load(path.clone()).await.unwrap();
        store.set(test_credential("1")).await.unwrap();
        assert!(path.exists());

        store.clear().await.unwrap();
        assert!(store.get().await.is_none());
        assert!(!path.exists());

        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credential.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let result = FileCredentialStore::load(path).await;
        assert!(matches!(result, Err(Error::CredentialParse(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credential.json");

        let store = FileCredentialStore::load(path.clone()).await.unwrap();
        store.set(test_credential("1")).await.unwrap();

        let metadata = tokio::fs::metadata(&path).await.unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "credential file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn memory_store_set_get_clear() {
        let store = MemoryCredentialStore::new(None);
        assert!(store.get().await.is_none());

        store.set(test_credential("m")).await.unwrap();
        assert_eq!(store.get().await.unwrap().access_token.expose(), "at_m");

        store.clear().await.unwrap();
        assert!(store.get().await.is_none());
    }

    #[test]
    fn debug_output_redacts_tokens() {
        let debug = format!("{:?}", test_credential("secret"));
        assert!(!debug.contains("at_secret"));
        assert!(!debug.contains("rt_secret"));
    }

    #[test]
    fn authorization_uses_token_type() {
        let mut cred = test_credential("1");
        assert_eq!(cred.authorization(), "Bearer at_1");
        cred.token_type = "MAC".into();
        assert_eq!(cred.authorization(), "MAC at_1");
    }

    #[test]
    fn from_token_response_computes_absolute_expiry() {
        let previous = Secret::from("rt_old");
        let response = TokenResponse {
            access_token: "at_new".into(),
            refresh_token: Some("rt_new".into()),
            expires_in: 3600,
            token_type: None,
        };
        let cred = Credential::from_token_response(response, &previous, 1_000);
        assert_eq!(cred.access_token.expose(), "at_new");
        assert_eq!(cred.refresh_token.expose(), "rt_new");
        assert_eq!(cred.expires_at, 1_000 + 3_600_000);
        assert_eq!(cred.token_type, "Bearer");
    }

    #[test]
    fn from_token_response_keeps_unrotated_refresh_token() {
        let previous = Secret::from("rt_keep");
        let response = TokenResponse {
            access_token: "at_new".into(),
            refresh_token: None,
            expires_in: 60,
            token_type: Some("Bearer".into()),
        };
        let cred = Credential::from_token_response(response, &previous, 0);
        assert_eq!(cred.refresh_token.expose(), "rt_keep");
    }

    #[test]
    fn expires_within_window() {
        let cred = Credential::new("at", "rt", 10_000);
        assert!(cred.expires_within(Duration::from_secs(5), 6_000));
        assert!(!cred.expires_within(Duration::from_secs(1), 6_000));
    }
}
