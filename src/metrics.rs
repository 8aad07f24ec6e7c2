/// Metric points and the mapping from device payloads to points
///
/// Every Home Coach device becomes one point per reading in
/// [`HOMECOACH_READINGS`], tagged with the reading's unit and the device's
/// `station_name`. Continuous readings are carried as [`Decimal`] parsed from
/// the JSON number's own text, so values are never rounded through a binary float.
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Numeric field value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    Integer(i64),
    Decimal(Decimal),
}

impl fmt::Display for FieldValue {
    /// Line-protocol rendering: integers carry the `i` suffix
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(v) => write!(f, "{}i", v),
            FieldValue::Decimal(v) => write!(f, "{}", v.normalize()),
        }
    }
}

/// One timestamped, tagged measurement
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: DateTime<Utc>,
}

impl MetricPoint {
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Nanoseconds since the epoch, saturating past the year 2262
    pub fn timestamp_nanos(&self) -> i64 {
        self.timestamp.timestamp_nanos_opt().unwrap_or(i64::MAX)
    }

    /// InfluxDB line protocol, e.g.
    /// `CO2,location=Office,unit=ppm value=420i 1700000000000000000`
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);
        for (key, value) in &self.tags {
            line.push(',');
            line.push_str(&escape(key, &[',', '=', ' ']));
            line.push('=');
            line.push_str(&escape(value, &[',', '=', ' ']));
        }

        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| format!("{}={}", escape(key, &[',', '=', ' ']), value))
            .collect();
        line.push(' ');
        line.push_str(&fields.join(","));

        line.push(' ');
        line.push_str(&self.timestamp_nanos().to_string());
        line
    }
}

/// Backslash-escape `special`; line breaks become escaped spaces so a point
/// always stays on one line
fn escape(text: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\n' | '\r' => out.push_str("\\ "),
            _ => {
                if c == '\\' || special.contains(&c) {
                    out.push('\\');
                }
                out.push(c);
            }
        }
    }
    out
}

/// How a JSON number is coerced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    /// Truncated to a whole number
    Integer,
    /// Kept exactly as written
    Decimal,
}

/// One row of the mapping table
#[derive(Debug, Clone, Copy)]
pub struct Reading {
    pub measurement: &'static str,
    /// Key inside `dashboard_data`
    pub key: &'static str,
    pub unit: &'static str,
    pub coercion: Coercion,
}

pub const HOMECOACH_READINGS: [Reading; 5] = [
    Reading {
        measurement: "Temperature",
        key: "Temperature",
        unit: "C",
        coercion: Coercion::Decimal,
    },
    Reading {
        measurement: "CO2",
        key: "CO2",
        unit: "ppm",
        coercion: Coercion::Integer,
    },
    Reading {
        measurement: "Humidity",
        key: "Humidity",
        unit: "%",
        coercion: Coercion::Integer,
    },
    Reading {
        measurement: "Noise",
        key: "Noise",
        unit: "dB",
        coercion: Coercion::Integer,
    },
    Reading {
        measurement: "Pressure",
        key: "Pressure",
        unit: "mbar",
        coercion: Coercion::Decimal,
    },
];

/// Why a device entry produced no points
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MappingError {
    #[error("device has no usable station_name")]
    MissingName,

    #[error("device {device} has no dashboard_data")]
    MissingDashboard { device: String },

    #[error("device {device} is missing {field}")]
    MissingField { device: String, field: String },

    #[error("device {device} has non-numeric {field}: {value}")]
    NotNumeric {
        device: String,
        field: String,
        value: String,
    },
}

/// Coerce a JSON value per `coercion`; `None` if it is not a usable number
pub fn coerce(value: &Value, coercion: Coercion) -> Option<FieldValue> {
    let decimal = match value {
        Value::Number(n) => number_to_decimal(n)?,
        _ => return None,
    };

    match coercion {
        Coercion::Integer => decimal.trunc().to_i64().map(FieldValue::Integer),
        Coercion::Decimal => Some(FieldValue::Decimal(decimal)),
    }
}

fn number_to_decimal(n: &Number) -> Option<Decimal> {
    if let Some(i) = n.as_i64() {
        return Some(Decimal::from(i));
    }
    let text = n.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

/// Map one device entry to its points, all stamped with `timestamp`
///
/// A device yields either every reading in the table or nothing, so a
/// reading is never recorded half.
pub fn map_device(
    device: &Value,
    timestamp: DateTime<Utc>,
) -> Result<Vec<MetricPoint>, MappingError> {
    let name = device
        .get("station_name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or(MappingError::MissingName)?;
    let dashboard = device
        .get("dashboard_data")
        .filter(|d| d.is_object())
        .ok_or_else(|| MappingError::MissingDashboard {
            device: name.to_string(),
        })?;

    HOMECOACH_READINGS
        .iter()
        .map(|reading| {
            let raw = dashboard
                .get(reading.key)
                .ok_or_else(|| MappingError::MissingField {
                    device: name.to_string(),
                    field: reading.key.to_string(),
                })?;
            let value = coerce(raw, reading.coercion).ok_or_else(|| MappingError::NotNumeric {
                device: name.to_string(),
                field: reading.key.to_string(),
                value: raw.to_string(),
            })?;

            Ok(MetricPoint::new(reading.measurement, timestamp)
                .tag("unit", reading.unit)
                .tag("location", name)
                .field("value", value))
        })
        .collect()
}
