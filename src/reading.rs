use crate::clock::SharedClock;
use crate::config::DeviceConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Metric name to value, in insertion order.
///
/// The order defines the column order of the local log and the field order
/// of uploads, and survives a round trip through the upload queue.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Reading(Map<String, Value>);

impl Reading {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Non-finite values are stored as `null`.
    pub fn push(&mut self, name: &str, value: f64) {
        let value = Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null);
        self.0.insert(name.to_string(), value);
    }

    pub fn push_int(&mut self, name: &str, value: i64) {
        self.0.insert(name.to_string(), Value::from(value));
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).and_then(Value::as_f64)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Values rendered for text output; `null` renders empty.
    pub fn rendered_values(&self) -> impl Iterator<Item = String> + '_ {
        self.0.values().map(|v| match v {
            Value::Null => String::new(),
            other => other.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One upload attempt's worth of data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub nickname: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "firmware")]
    pub firmware_version: String,
    pub model: String,
    #[serde(rename = "uid")]
    pub device_uid: String,
    pub readings: Reading,
    #[serde(rename = "wifi", default, skip_serializing_if = "Option::is_none")]
    pub wifi_signal: Option<i32>,
    /// Queue entry this payload was loaded from. Never serialized.
    #[serde(skip)]
    pub source_file: Option<String>,
}

impl Payload {
    pub fn is_queued(&self) -> bool {
        self.source_file.is_some()
    }

    /// Log label: the queue entry name, or "on-demand reading".
    pub fn label(&self) -> &str {
        self.source_file.as_deref().unwrap_or("on-demand reading")
    }
}

/// Wraps readings with the device identity and capture time.
#[derive(Clone)]
pub struct PayloadBuilder {
    nickname: String,
    model: String,
    uid: String,
    firmware_version: String,
    clock: SharedClock,
}

impl PayloadBuilder {
    pub fn new(device: &DeviceConfig, clock: SharedClock) -> Self {
        Self {
            nickname: device.nickname.clone(),
            model: device.model.clone(),
            uid: device.uid.clone(),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
            clock,
        }
    }

    pub fn build(&self, readings: Reading) -> Payload {
        Payload {
            nickname: self.nickname.clone(),
            timestamp: self.clock.now(),
            firmware_version: self.firmware_version.clone(),
            model: self.model.clone(),
            device_uid: self.uid.clone(),
            readings,
            wifi_signal: None,
            source_file: None,
        }
    }
}
