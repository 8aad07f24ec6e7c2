/// Time-series sink for metric points
use crate::error::SinkError;
use crate::metrics::MetricPoint;
use parking_lot::Mutex;
use reqwest::blocking::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Accepts metric points one at a time
pub trait MetricSink {
    fn write(&self, point: &MetricPoint) -> Result<(), SinkError>;
}

/// InfluxDB v2 connection settings
#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub endpoint: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
}

/// InfluxDB v2 writer using the HTTP line-protocol API
pub struct InfluxSink {
    write_url: Url,
    token: String,
    client: Client,
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig, timeout: Duration) -> Result<Self, SinkError> {
        let write_url = Url::parse_with_params(
            &format!("{}/api/v2/write", config.endpoint.trim_end_matches('/')),
            &[
                ("org", config.org.as_str()),
                ("bucket", config.bucket.as_str()),
                ("precision", "ns"),
            ],
        )?;
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            write_url,
            token: config.token.clone(),
            client,
        })
    }

    pub fn write_url(&self) -> &Url {
        &self.write_url
    }
}

impl MetricSink for InfluxSink {
    fn write(&self, point: &MetricPoint) -> Result<(), SinkError> {
        let line = point.to_line_protocol();
        let response = self
            .client
            .post(self.write_url.clone())
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(line)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(measurement = %point.measurement, "point written");
        Ok(())
    }
}

/// Sink that keeps every point in memory
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    points: Arc<Mutex<Vec<MetricPoint>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> Vec<MetricPoint> {
        self.points.lock().clone()
    }
}

impl MetricSink for MemorySink {
    fn write(&self, point: &MetricPoint) -> Result<(), SinkError> {
        self.points.lock().push(point.clone());
        Ok(())
    }
}
