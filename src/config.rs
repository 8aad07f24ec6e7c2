/// Agent configuration from command-line arguments and environment
use crate::credential::FileStore;
use crate::device::HOMECOACH_URL;
use crate::error::StoreError;
use crate::ingest::Cadence;
use crate::oauth::OAuthConfig;
use crate::sink::InfluxConfig;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Application directory under the platform data dir
pub const APP_NAME: &str = "netatmo-influx";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Netatmo to InfluxDB agent configuration
#[derive(Debug, Clone, Parser)]
#[command(name = "netatmo-influx", about = "Ship Netatmo Home Coach readings to InfluxDB", long_about = None)]
pub struct AgentConfig {
    /// Netatmo application client id
    #[arg(long, env = "NETATMO_CLIENT_ID")]
    pub client_id: String,

    /// Netatmo application client secret
    #[arg(long, env = "NETATMO_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: String,

    #[arg(
        long,
        env = "NETATMO_AUTHORIZE_URL",
        default_value = "https://api.netatmo.com/oauth2/authorize"
    )]
    pub authorize_url: String,

    #[arg(
        long,
        env = "NETATMO_TOKEN_URL",
        default_value = "https://api.netatmo.com/oauth2/token"
    )]
    pub token_url: String,

    #[arg(long, env = "NETATMO_DEVICE_URL", default_value = HOMECOACH_URL)]
    pub device_url: String,

    /// Space-separated OAuth scopes
    #[arg(long, env = "NETATMO_SCOPE", default_value = "read_station read_homecoach")]
    pub scope: String,

    /// Address the authorization callback listener binds to
    #[arg(long, env = "CALLBACK_HOST", default_value = "127.0.0.1")]
    pub callback_host: String,

    #[arg(long, env = "CALLBACK_PORT", default_value = "5567")]
    pub callback_port: u16,

    /// Redirect URI registered with Netatmo (defaults to the callback address)
    #[arg(long, env = "REDIRECT_URI")]
    pub redirect_uri: Option<String>,

    /// Seconds to wait for the user to authorize
    #[arg(long, env = "AUTH_TIMEOUT_SECS", default_value = "300")]
    pub auth_timeout_secs: u64,

    /// Credential state file (defaults to the platform data directory)
    #[arg(long, env = "STATE_FILE")]
    pub state_file: Option<PathBuf>,

    /// InfluxDB base URL, e.g. http://localhost:8086
    #[arg(long, env = "INFLUXDB_ENDPOINT")]
    pub influx_endpoint: String,

    #[arg(long, env = "INFLUXDB_TOKEN", hide_env_values = true)]
    pub influx_token: String,

    #[arg(long, env = "INFLUXDB_ORG")]
    pub influx_org: String,

    #[arg(long, env = "INFLUXDB_BUCKET")]
    pub influx_bucket: String,

    /// Seconds between polls while authenticated
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value = "60")]
    pub poll_interval_secs: u64,

    /// Seconds between polls while waiting for authorization
    #[arg(long, env = "IDLE_INTERVAL_SECS", default_value = "5")]
    pub idle_interval_secs: u64,

    /// Timeout for every outbound HTTP request
    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value = "30")]
    pub http_timeout_secs: u64,

    /// Open the authorization URL in the default browser
    #[arg(long, env = "OPEN_BROWSER")]
    pub open_browser: bool,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

impl AgentConfig {
    /// Load configuration from environment and CLI arguments
    ///
    /// # Errors
    ///
    /// Returns an error if a required value is missing or malformed
    pub fn load() -> Result<Self, clap::Error> {
        // Load .env file if present (ignore if missing)
        _ = dotenvy::dotenv();

        Self::try_parse()
    }

    #[must_use]
    pub fn callback_addr(&self) -> String {
        format!("{}:{}", self.callback_host, self.callback_port)
    }

    #[must_use]
    pub fn redirect_uri(&self) -> String {
        self.redirect_uri
            .clone()
            .unwrap_or_else(|| format!("http://{}/", self.callback_addr()))
    }

    #[must_use]
    pub fn oauth_config(&self) -> OAuthConfig {
        OAuthConfig {
            authorization_endpoint: self.authorize_url.clone(),
            token_endpoint: self.token_url.clone(),
            scope: self.scope.clone(),
            ..OAuthConfig::netatmo(&self.client_id, &self.client_secret, &self.redirect_uri())
        }
    }

    #[must_use]
    pub fn influx_config(&self) -> InfluxConfig {
        InfluxConfig {
            endpoint: self.influx_endpoint.clone(),
            token: self.influx_token.clone(),
            org: self.influx_org.clone(),
            bucket: self.influx_bucket.clone(),
        }
    }

    #[must_use]
    pub fn cadence(&self) -> Cadence {
        Cadence {
            authenticated: Duration::from_secs(self.poll_interval_secs),
            unauthenticated: Duration::from_secs(self.idle_interval_secs),
        }
    }

    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    #[must_use]
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    /// Credential store for the configured (or default) state file
    pub fn store(&self) -> Result<FileStore, StoreError> {
        match &self.state_file {
            Some(path) => Ok(FileStore::with_path(path.clone())),
            None => FileStore::new(APP_NAME),
        }
    }
}
