/// OAuth 2.0 provider calls: authorization URL and token endpoint grants
use crate::error::{AuthError, Result};
use rand::Rng;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// OAuth 2.0 provider configuration
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub redirect_uri: String,
    /// Space-separated scopes
    pub scope: String,
}

impl OAuthConfig {
    /// Preset for the Netatmo cloud with the Home Coach and weather station
    /// read scopes
    pub fn netatmo(client_id: &str, client_secret: &str, redirect_uri: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            authorization_endpoint: "https://api.netatmo.com/oauth2/authorize".to_string(),
            token_endpoint: "https://api.netatmo.com/oauth2/token".to_string(),
            redirect_uri: redirect_uri.to_string(),
            scope: "read_station read_homecoach".to_string(),
        }
    }

    /// Authorization URL the user opens to grant access
    pub fn authorization_url(&self, state: &str) -> std::result::Result<String, url::ParseError> {
        let url = Url::parse_with_params(
            &self.authorization_endpoint,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("scope", self.scope.as_str()),
                ("state", state),
            ],
        )?;
        Ok(url.into())
    }
}

/// Random anti-forgery value for the `state` parameter
pub fn generate_state() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Token endpoint response
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Lifetime in seconds
    pub expires_in: u64,
}

/// The provider's token endpoint
pub trait TokenEndpoint {
    /// Trade an authorization code for tokens (`grant_type=authorization_code`)
    fn exchange_code(&self, code: &str) -> Result<TokenResponse>;

    /// Trade a refresh token for new tokens (`grant_type=refresh_token`)
    fn refresh(&self, refresh_token: &str) -> Result<TokenResponse>;
}

/// Token endpoint over blocking HTTP
pub struct HttpTokenEndpoint {
    config: OAuthConfig,
    client: Client,
}

impl HttpTokenEndpoint {
    /// Every request carries `timeout`, so a dead endpoint cannot stall the caller
    pub fn new(config: OAuthConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    fn post(&self, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .client
            .post(&self.config.token_endpoint)
            .header("accept", "application/json")
            .form(form)
            .send()?;

        let status = response.status();
        let body = response.text()?;
        debug!(status = status.as_u16(), "token endpoint responded");

        if is_credential_rejection(status, &body) {
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            return Err(AuthError::ServerError {
                status: status.as_u16(),
                body,
            });
        }

        parse_token_response(&body)
    }
}

impl TokenEndpoint for HttpTokenEndpoint {
    fn exchange_code(&self, code: &str) -> Result<TokenResponse> {
        self.post(&[
            ("grant_type", "authorization_code"),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
            ("code", code),
            ("redirect_uri", &self.config.redirect_uri),
            ("scope", &self.config.scope),
        ])
    }

    fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        self.post(&[
            ("grant_type", "refresh_token"),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
            ("refresh_token", refresh_token),
        ])
    }
}

/// OAuth error codes that mean the grant or the client itself is no good
const REJECTED_GRANT_ERRORS: [&str; 3] = ["invalid_grant", "invalid_client", "unauthorized_client"];

/// Whether the provider refused the credential, as opposed to a throttled,
/// timed out or otherwise retryable request
///
/// 401 and 403 always count. A 400 only counts when its `error` is one of
/// [`REJECTED_GRANT_ERRORS`]; everything else (429, 408, 5xx) is retryable.
fn is_credential_rejection(status: StatusCode, body: &str) -> bool {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => true,
        StatusCode::BAD_REQUEST => serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .is_some_and(|error| REJECTED_GRANT_ERRORS.contains(&error.as_str())),
        _ => false,
    }
}

/// Parse a token response body, keeping the body for diagnosis on failure
pub fn parse_token_response(body: &str) -> Result<TokenResponse> {
    serde_json::from_str(body).map_err(|error| AuthError::InvalidResponse {
        error,
        body: body.to_string(),
    })
}
