/// Device cloud API client
use crate::error::FetchError;
use reqwest::blocking::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Home Coach endpoint on the Netatmo cloud
pub const HOMECOACH_URL: &str = "https://api.netatmo.com/api/gethomecoachsdata";

/// `gethomecoachsdata` response
///
/// Devices stay untyped here so one malformed entry cannot fail the whole
/// payload; they are validated one by one during mapping.
#[derive(Debug, Clone, Deserialize)]
pub struct DevicePayload {
    pub body: PayloadBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayloadBody {
    pub devices: Vec<serde_json::Value>,
}

impl DevicePayload {
    /// Parse a response body, keeping it for diagnosis on failure
    pub fn parse(body: &str) -> Result<Self, FetchError> {
        serde_json::from_str(body).map_err(|source| FetchError::Parse {
            source,
            body: body.to_string(),
        })
    }
}

/// Authenticated access to the device readings
pub trait DeviceApi {
    fn fetch(&self, access_token: &str) -> Result<DevicePayload, FetchError>;
}

/// Device API over blocking HTTP
pub struct HttpDeviceApi {
    url: String,
    client: Client,
}

impl HttpDeviceApi {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

impl DeviceApi for HttpDeviceApi {
    fn fetch(&self, access_token: &str) -> Result<DevicePayload, FetchError> {
        let response = self
            .client
            .get(&self.url)
            .header("accept", "application/json")
            .bearer_auth(access_token)
            .send()?;

        let status = response.status();
        let body = response.text()?;
        debug!(status = status.as_u16(), bytes = body.len(), "device API responded");

        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        DevicePayload::parse(&body)
    }
}
