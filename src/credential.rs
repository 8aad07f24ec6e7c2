/// Credential state and its persistence
use crate::error::StoreError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Seconds subtracted from the provider's stated token lifetime so the
/// refresh always happens before the real expiry.
pub const EXPIRY_MARGIN_SECS: u64 = 600;

/// Current wall-clock time as epoch seconds.
pub fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Absolute expiry for a token issued at `now` with a lifetime of `expires_in`
/// seconds, minus [`EXPIRY_MARGIN_SECS`].
pub fn expiry_from(now: u64, expires_in: u64) -> u64 {
    now.saturating_add(expires_in)
        .saturating_sub(EXPIRY_MARGIN_SECS)
}

/// The single persisted credential record.
///
/// Tokens are only ever assigned together, so whenever `access_token` is set
/// `refresh_token` and `expires_at` are set as well.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    authorization_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    access_token: Option<String>,
    /// Epoch seconds, margin already applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
}

impl CredentialState {
    /// An empty state, as on first run
    pub fn new() -> Self {
        Self::default()
    }

    /// A state holding only a not-yet-exchanged authorization code
    pub fn with_code(code: impl Into<String>) -> Self {
        Self {
            authorization_code: Some(code.into()),
            ..Self::default()
        }
    }

    /// A state holding a complete token set
    pub fn with_tokens(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: u64,
    ) -> Self {
        Self {
            authorization_code: None,
            access_token: Some(access_token.into()),
            expires_at: Some(expires_at),
            refresh_token: Some(refresh_token.into()),
        }
    }

    pub fn authorization_code(&self) -> Option<&str> {
        self.authorization_code.as_deref()
    }

    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.expires_at
    }

    pub fn has_tokens(&self) -> bool {
        self.access_token.is_some()
    }

    /// True once `now` is past the stored (margin-adjusted) expiry.
    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    pub(crate) fn set_code(&mut self, code: String) {
        self.authorization_code = Some(code);
    }

    pub(crate) fn take_code(&mut self) -> Option<String> {
        self.authorization_code.take()
    }

    pub(crate) fn apply_tokens(
        &mut self,
        access_token: String,
        refresh_token: String,
        expires_in: u64,
        now: u64,
    ) {
        self.access_token = Some(access_token);
        self.refresh_token = Some(refresh_token);
        self.expires_at = Some(expiry_from(now, expires_in));
    }

    pub(crate) fn clear_tokens(&mut self) {
        self.access_token = None;
        self.refresh_token = None;
        self.expires_at = None;
    }

    /// Drop a token set that is missing any of its parts.
    fn normalized(mut self) -> Self {
        let complete = self.access_token.is_some()
            && self.refresh_token.is_some()
            && self.expires_at.is_some();
        let partial = self.access_token.is_some()
            || self.refresh_token.is_some()
            || self.expires_at.is_some();
        if partial && !complete {
            warn!("persisted token set is incomplete, discarding it");
            self.clear_tokens();
        }
        self
    }
}

/// Persistence medium for [`CredentialState`]
pub trait CredentialStore: Send + Sync {
    /// Read the persisted state. Missing or unreadable storage is a cold
    /// start and yields the empty state.
    fn load(&self) -> CredentialState;

    /// Overwrite the persisted state.
    fn save(&self, state: &CredentialState) -> Result<(), StoreError>;
}

/// In-memory store
///
/// Suitable for tests and for runs that should not touch the filesystem.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<CredentialState>>,
    fail_saves: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing state
    pub fn with_state(state: CredentialState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
            fail_saves: false,
        }
    }

    /// A store whose saves always fail
    pub fn failing() -> Self {
        Self {
            fail_saves: true,
            ..Self::default()
        }
    }

    /// What was last saved
    pub fn snapshot(&self) -> CredentialState {
        self.state.read().clone()
    }
}

impl CredentialStore for MemoryStore {
    fn load(&self) -> CredentialState {
        self.state.read().clone()
    }

    fn save(&self, state: &CredentialState) -> Result<(), StoreError> {
        if self.fail_saves {
            return Err(StoreError::Io(std::io::Error::new(
                ErrorKind::PermissionDenied,
                "memory store configured to fail",
            )));
        }
        *self.state.write() = state.clone();
        Ok(())
    }
}

/// JSON file store
///
/// The whole record is rewritten on every save through a temp file and a
/// rename, so a crash mid-write never leaves a truncated file behind.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Store `state.json` under the application's data directory
    ///
    /// Checks `$XDG_DATA_HOME` first and falls back to the platform data
    /// directory (`~/.local/share` on Linux).
    pub fn new(app_name: &str) -> Result<Self, StoreError> {
        let base_dir = if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
            PathBuf::from(xdg_data)
        } else {
            dirs::data_dir().ok_or_else(|| {
                StoreError::Io(std::io::Error::new(
                    ErrorKind::NotFound,
                    "could not determine data directory",
                ))
            })?
        };

        Ok(Self::with_path(base_dir.join(app_name).join("state.json")))
    }

    /// Store state at an explicit file path
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        static COUNTER: AtomicU32 = AtomicU32::new(0);

        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state.json".to_string());
        self.path
            .with_file_name(format!("{}.{}.{}.tmp", name, std::process::id(), seq))
    }
}

impl CredentialStore for FileStore {
    fn load(&self) -> CredentialState {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no persisted state, starting empty");
                return CredentialState::new();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read state file, starting empty");
                return CredentialState::new();
            }
        };

        match serde_json::from_str::<CredentialState>(&content) {
            Ok(state) => {
                info!(path = %self.path.display(), "loaded auth state from file");
                state.normalized()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "state file is corrupt, starting empty");
                CredentialState::new()
            }
        }
    }

    fn save(&self, state: &CredentialState) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string_pretty(state)?;
        let tmp_path = self.temp_path();
        fs::write(&tmp_path, content)?;
        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        debug!(path = %self.path.display(), "saved auth state to file");
        Ok(())
    }
}
