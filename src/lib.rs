//! netatmo-influx - Netatmo Home Coach readings into InfluxDB
//!
//! Keeps an OAuth 2.0 authorization-code credential alive across restarts
//! and polls the Netatmo cloud on a fixed cadence, turning every Home Coach
//! device into tagged metric points.
//!
//! # Features
//!
//! - Interactive first authorization through a local callback listener
//! - Proactive token refresh with a safety margin before expiry
//! - Human-readable credential state file, rewritten atomically
//! - Per-cycle failure isolation: a bad device or a failed write never
//!   stops the loop
//!
//! # Example
//!
//! ```
//! use netatmo_influx::prelude::*;
//! use chrono::Utc;
//! use serde_json::json;
//!
//! let device = json!({
//!     "station_name": "Office",
//!     "dashboard_data": {
//!         "Temperature": 21.5, "CO2": 420, "Humidity": 45,
//!         "Noise": 38, "Pressure": 1013.2
//!     }
//! });
//!
//! let points = map_device(&device, Utc::now()).unwrap();
//! assert_eq!(points.len(), 5);
//! ```

pub mod authorize;
pub mod callback;
pub mod config;
pub mod credential;
pub mod device;
pub mod error;
pub mod ingest;
pub mod lock;
pub mod metrics;
pub mod oauth;
pub mod shutdown;
pub mod sink;
pub mod token;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::authorize::{Authorizer, CallbackAuthorizer};
    pub use crate::credential::{CredentialState, CredentialStore, FileStore, MemoryStore};
    pub use crate::device::{DeviceApi, DevicePayload, HttpDeviceApi};
    pub use crate::error::{AuthError, FetchError, SinkError};
    pub use crate::ingest::{Cadence, CycleOutcome, CycleReport, IngestionLoop};
    pub use crate::metrics::{map_device, FieldValue, MetricPoint};
    pub use crate::oauth::{HttpTokenEndpoint, OAuthConfig, TokenEndpoint, TokenResponse};
    pub use crate::shutdown::Shutdown;
    pub use crate::sink::{InfluxConfig, InfluxSink, MemorySink, MetricSink};
    pub use crate::token::{AuthState, CredentialView, TokenManager};
}
