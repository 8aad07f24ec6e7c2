/// Credential lifecycle: authorization code, code exchange, proactive refresh
use crate::credential::{now_epoch_secs, CredentialState, CredentialStore};
use crate::error::{AuthError, Result};
use crate::oauth::{TokenEndpoint, TokenResponse};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where the credential stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Nothing known; the user has to authorize
    NoCode,
    /// Authorization code received, not yet exchanged
    HaveCode,
    /// Access token present and inside its (margin-adjusted) lifetime
    Authenticated,
    /// Access token present but past `expires_at`; a refresh is due
    Expired,
}

impl AuthState {
    fn of(state: &CredentialState, now: u64) -> Self {
        if state.has_tokens() {
            if state.is_expired_at(now) {
                AuthState::Expired
            } else {
                AuthState::Authenticated
            }
        } else if state.authorization_code().is_some() {
            AuthState::HaveCode
        } else {
            AuthState::NoCode
        }
    }
}

/// Result of the proactive refresh check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Token still valid, nothing was sent
    Valid,
    /// Token was expired and has been refreshed
    Refreshed,
}

/// Read-only, always-current view of the credential
///
/// Handed to consumers that need the access token but must never mutate
/// the state owned by [`TokenManager`].
#[derive(Debug, Clone)]
pub struct CredentialView {
    inner: Arc<RwLock<CredentialState>>,
}

impl CredentialView {
    pub fn access_token(&self) -> Option<String> {
        self.inner.read().access_token().map(str::to_string)
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.inner.read().expires_at()
    }

    pub fn state_at(&self, now: u64) -> AuthState {
        AuthState::of(&self.inner.read(), now)
    }

    /// Copy of the current record
    pub fn snapshot(&self) -> CredentialState {
        self.inner.read().clone()
    }
}

/// Owner and sole writer of the credential state
///
/// Every transition is persisted through the [`CredentialStore`]. Persistence
/// failures are logged and otherwise ignored: the in-memory state stays
/// authoritative for the lifetime of the process.
pub struct TokenManager<S: CredentialStore, E: TokenEndpoint> {
    store: Arc<S>,
    endpoint: E,
    state: Arc<RwLock<CredentialState>>,
}

impl<S: CredentialStore, E: TokenEndpoint> TokenManager<S, E> {
    /// Restore the credential from `store`
    pub fn new(store: Arc<S>, endpoint: E) -> Self {
        let state = store.load();
        debug!(state = ?AuthState::of(&state, now_epoch_secs()), "credential restored");

        Self {
            store,
            endpoint,
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub fn view(&self) -> CredentialView {
        CredentialView {
            inner: self.state.clone(),
        }
    }

    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    pub fn state(&self) -> AuthState {
        self.state_at(now_epoch_secs())
    }

    pub fn state_at(&self, now: u64) -> AuthState {
        AuthState::of(&self.state.read(), now)
    }

    /// Record a freshly received authorization code (`NoCode -> HaveCode`)
    pub fn accept_code(&mut self, code: String) {
        self.state.write().set_code(code);
        self.persist();
    }

    /// Exchange the authorization code for tokens (`HaveCode -> Authenticated`)
    ///
    /// The code is single-use: it is consumed whether or not the exchange
    /// succeeds.
    pub fn exchange_code(&mut self) -> Result<()> {
        self.exchange_code_at(now_epoch_secs())
    }

    pub fn exchange_code_at(&mut self, now: u64) -> Result<()> {
        let code = self.state.write().take_code().ok_or(AuthError::NoCode)?;

        info!("fetching token");
        let result = self.endpoint.exchange_code(&code);
        if let Ok(token) = &result {
            self.apply(token, now);
        }
        self.persist();

        match result {
            Ok(_) => {
                info!(expires_at = ?self.state.read().expires_at(), "login success");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "code exchange failed");
                Err(e)
            }
        }
    }

    /// Rotate the token pair with the current refresh token
    ///
    /// A provider rejection drops the tokens, which puts the manager back in
    /// [`AuthState::NoCode`]. Transport and server failures keep them so the
    /// next cycle can retry.
    pub fn refresh(&mut self) -> Result<()> {
        self.refresh_at(now_epoch_secs())
    }

    pub fn refresh_at(&mut self, now: u64) -> Result<()> {
        let refresh_token = self
            .state
            .read()
            .refresh_token()
            .map(str::to_string)
            .ok_or(AuthError::NoRefreshToken)?;

        info!("refreshing token");
        match self.endpoint.refresh(&refresh_token) {
            Ok(token) => {
                self.apply(&token, now);
                self.persist();
                info!(expires_at = ?self.state.read().expires_at(), "refresh success");
                Ok(())
            }
            Err(e) if e.is_rejection() => {
                warn!(error = %e, "refresh token rejected, authorization required");
                self.state.write().clear_tokens();
                self.persist();
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, "refresh failed, will retry next cycle");
                Err(e)
            }
        }
    }

    /// Refresh only when the token is past `expires_at`
    pub fn ensure_fresh(&mut self) -> Result<Freshness> {
        self.ensure_fresh_at(now_epoch_secs())
    }

    pub fn ensure_fresh_at(&mut self, now: u64) -> Result<Freshness> {
        match self.state_at(now) {
            AuthState::Authenticated => Ok(Freshness::Valid),
            AuthState::Expired => self.refresh_at(now).map(|()| Freshness::Refreshed),
            AuthState::NoCode | AuthState::HaveCode => Err(AuthError::NotAuthenticated),
        }
    }

    fn apply(&self, token: &TokenResponse, now: u64) {
        self.state.write().apply_tokens(
            token.access_token.clone(),
            token.refresh_token.clone(),
            token.expires_in,
            now,
        );
    }

    fn persist(&self) {
        let snapshot = self.state.read().clone();
        if let Err(e) = self.store.save(&snapshot) {
            warn!(error = %e, "failed to persist auth state, a restart will require re-authorization");
        }
    }
}
