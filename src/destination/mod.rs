//! Delivery targets for readings.
//!
//! Each target implements [`Destination`]; the configured ones are built
//! once at startup into a [`DestinationKind`]. HTTP collectors and Weather
//! Underground are reached over HTTPS, brokers over MQTT.

pub mod http;
pub mod mqtt;
pub mod retry;
pub mod wunderground;

pub use http::HttpCollector;
pub use mqtt::MqttBroker;
pub use retry::RetryPolicy;
pub use wunderground::Wunderground;

use crate::config::{DestinationConfig, DeviceConfig, UploadConfig};
use crate::error::Result;
use crate::reading::Payload;
use reqwest::Client;
use std::time::Duration;

/// Result of delivering one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Success,
    /// Destination asked us to back off; retry on a later wake.
    RateLimited,
    /// Destination rejected the timestamp; the clock needs a resync.
    LostSync,
    /// This payload can never be accepted as-is.
    SkipFile,
    /// Destination unreachable or broken; stop the batch.
    Failed,
}

/// Capability interface every delivery target provides.
#[allow(async_fn_in_trait)]
pub trait Destination {
    /// Short identifier, e.g. "http". Two destinations of the same kind are
    /// treated as the same target.
    fn kind(&self) -> &'static str;

    fn log_destination(&self) {}

    async fn upload(&self, payload: &Payload) -> UploadOutcome;

    /// True when [`Destination::announce`] has something to send.
    fn announces(&self) -> bool {
        false
    }

    /// One-off startup message describing the node, such as service discovery.
    async fn announce(&self, _device: &DeviceConfig) -> Result<()> {
        Ok(())
    }
}

pub enum DestinationKind {
    Http(HttpCollector),
    Wunderground(Wunderground),
    Mqtt(MqttBroker),
}

impl DestinationKind {
    pub fn from_config(config: &DestinationConfig, upload: &UploadConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("weather-node/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(upload.request_timeout_seconds))
            .build()?;
        let retry = RetryPolicy::from_config(upload);

        Ok(match config {
            DestinationConfig::Http { url, auth_token } => {
                DestinationKind::Http(HttpCollector::new(client, url, auth_token.clone(), retry))
            }
            DestinationConfig::Wunderground {
                url,
                station_id,
                station_key,
            } => DestinationKind::Wunderground(Wunderground::new(
                client,
                url,
                station_id,
                station_key,
                retry,
            )),
            DestinationConfig::Mqtt {
                broker,
                port,
                username,
                password,
                topic_prefix,
                home_assistant_discovery,
            } => {
                let mut mqtt = MqttBroker::new(
                    broker,
                    *port,
                    topic_prefix,
                    Duration::from_secs(upload.request_timeout_seconds),
                    retry,
                )
                .with_discovery(*home_assistant_discovery);
                if let Some(username) = username {
                    mqtt = mqtt.with_credentials(
                        username.clone(),
                        password.clone().unwrap_or_default(),
                    );
                }
                DestinationKind::Mqtt(mqtt)
            }
        })
    }
}

impl Destination for DestinationKind {
    fn kind(&self) -> &'static str {
        match self {
            DestinationKind::Http(d) => d.kind(),
            DestinationKind::Wunderground(d) => d.kind(),
            DestinationKind::Mqtt(d) => d.kind(),
        }
    }

    fn log_destination(&self) {
        match self {
            DestinationKind::Http(d) => d.log_destination(),
            DestinationKind::Wunderground(d) => d.log_destination(),
            DestinationKind::Mqtt(d) => d.log_destination(),
        }
    }

    async fn upload(&self, payload: &Payload) -> UploadOutcome {
        match self {
            DestinationKind::Http(d) => d.upload(payload).await,
            DestinationKind::Wunderground(d) => d.upload(payload).await,
            DestinationKind::Mqtt(d) => d.upload(payload).await,
        }
    }

    fn announces(&self) -> bool {
        match self {
            DestinationKind::Http(d) => d.announces(),
            DestinationKind::Wunderground(d) => d.announces(),
            DestinationKind::Mqtt(d) => d.announces(),
        }
    }

    async fn announce(&self, device: &DeviceConfig) -> Result<()> {
        match self {
            DestinationKind::Http(d) => d.announce(device).await,
            DestinationKind::Wunderground(d) => d.announce(device).await,
            DestinationKind::Mqtt(d) => d.announce(device).await,
        }
    }
}
