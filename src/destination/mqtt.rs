use crate::config::DeviceConfig;
use crate::destination::retry::{retry_with_backoff, RetryPolicy};
use crate::destination::{Destination, UploadOutcome};
use crate::error::{AppError, Result};
use crate::reading::Payload;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Home Assistant sensors announced for a weather node:
/// (name, device class, unit, value path in the payload, icon).
const DISCOVERY_SENSORS: &[(&str, Option<&str>, Option<&str>, &str, &str)] = &[
    ("Temperature", Some("temperature"), Some("°C"), "readings.temperature", "mdi:thermometer"),
    ("Pressure", Some("pressure"), Some("hPa"), "readings.pressure", "mdi:gauge"),
    ("Humidity", Some("humidity"), Some("%"), "readings.humidity", "mdi:water-percent"),
    ("Wifi Signal", Some("signal_strength"), Some("dBm"), "wifi", "mdi:wifi"),
    ("Luminance", Some("illuminance"), Some("lx"), "readings.luminance", "mdi:brightness-5"),
    ("Wind Speed", Some("wind_speed"), Some("m/s"), "readings.wind_speed", "mdi:weather-windy"),
    ("Wind Gust", Some("wind_speed"), Some("m/s"), "readings.wind_gust", "mdi:weather-windy-variant"),
    ("Wind Direction", None, Some("°"), "readings.wind_direction", "mdi:compass"),
    ("Wind Direction Confidence", None, None, "readings.wind_direction_confidence", "mdi:target-variant"),
    ("Rain", Some("precipitation"), Some("mm"), "readings.rain", "mdi:weather-rainy"),
    ("Rain Per Second", None, Some("mm/s"), "readings.rain_per_second", "mdi:weather-pouring"),
    ("Rain Per Hour", Some("precipitation_intensity"), Some("mm/h"), "readings.rain_per_hour", "mdi:weather-pouring"),
    ("Rain Today", Some("precipitation"), Some("mm"), "readings.rain_today", "mdi:weather-rainy"),
    ("Dew Point", Some("temperature"), Some("°C"), "readings.dewpoint", "mdi:water"),
    ("Temperature Min", Some("temperature"), Some("°C"), "readings.temperature_min", "mdi:thermometer-low"),
    ("Temperature Max", Some("temperature"), Some("°C"), "readings.temperature_max", "mdi:thermometer-high"),
    ("Humidity Min", Some("humidity"), Some("%"), "readings.humidity_min", "mdi:water-percent"),
    ("Humidity Max", Some("humidity"), Some("%"), "readings.humidity_max", "mdi:water-percent"),
    ("Pollen Index", Some("aqi"), None, "readings.pollen_index", "mdi:flower-pollen"),
];

/// One retained message to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttMessage {
    pub topic: String,
    pub body: Vec<u8>,
}

/// Publishes each payload as retained JSON on `<prefix>/<nickname>`.
pub struct MqttBroker {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    topic_prefix: String,
    discovery: bool,
    timeout: Duration,
    retry: RetryPolicy,
}

impl MqttBroker {
    pub fn new(host: &str, port: u16, topic_prefix: &str, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            host: host.to_string(),
            port,
            credentials: None,
            topic_prefix: topic_prefix.trim_end_matches('/').to_string(),
            discovery: false,
            timeout,
            retry,
        }
    }

    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.credentials = Some((username, password));
        self
    }

    /// Announce the node's sensors to Home Assistant on startup.
    pub fn with_discovery(mut self, enabled: bool) -> Self {
        self.discovery = enabled;
        self
    }

    pub fn state_topic(&self, nickname: &str) -> String {
        format!("{}/{}", self.topic_prefix, nickname)
    }

    pub fn reading_message(&self, payload: &Payload) -> Result<MqttMessage> {
        Ok(MqttMessage {
            topic: self.state_topic(&payload.nickname),
            body: serde_json::to_vec(payload)?,
        })
    }

    /// Home Assistant discovery configs, one per sensor.
    pub fn discovery_messages(&self, device: &DeviceConfig) -> Result<Vec<MqttMessage>> {
        let nickname = &device.nickname;
        DISCOVERY_SENSORS
            .iter()
            .map(|&(name, device_class, unit, value_path, icon)| -> Result<MqttMessage> {
                let sensor = value_path.rsplit('.').next().unwrap_or(value_path);
                let mut config = json!({
                    "device": {
                        "identifiers": [nickname],
                        "name": nickname,
                        "model": device.model,
                        "manufacturer": "weather-node",
                    },
                    "name": name,
                    "unique_id": format!("sensor.{}.{}", nickname, sensor),
                    "state_topic": self.state_topic(nickname),
                    "value_template": format!("{{{{ value_json.{} }}}}", value_path),
                    "state_class": "measurement",
                    "icon": icon,
                });
                if let Value::Object(fields) = &mut config {
                    if let Some(class) = device_class {
                        fields.insert("device_class".to_string(), json!(class));
                    }
                    if let Some(unit) = unit {
                        fields.insert("unit_of_measurement".to_string(), json!(unit));
                    }
                }

                Ok(MqttMessage {
                    topic: format!("homeassistant/sensor/{}/{}/config", nickname, sensor),
                    body: serde_json::to_vec(&config)?,
                })
            })
            .collect()
    }

    /// Connects, publishes every message at QoS 1, waits for all acks and
    /// disconnects, all inside the request timeout.
    async fn publish(&self, client_id: &str, messages: &[MqttMessage]) -> Result<()> {
        // The client rejects empty ids and ids starting with a space
        let client_id = match client_id.trim() {
            "" => "weather-node",
            id => id,
        };
        let mut options = MqttOptions::new(client_id, self.host.as_str(), self.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let Some((username, password)) = &self.credentials {
            options.set_credentials(username.as_str(), password.as_str());
        }

        let (client, mut eventloop) = AsyncClient::new(options, messages.len() + 1);
        for message in messages {
            client
                .publish(message.topic.as_str(), QoS::AtLeastOnce, true, message.body.clone())
                .await
                .map_err(|e| AppError::Mqtt(e.to_string()))?;
        }

        let session = async {
            let mut acked = 0;
            while acked < messages.len() {
                let event = eventloop
                    .poll()
                    .await
                    .map_err(|e| AppError::Mqtt(e.to_string()))?;
                if let Event::Incoming(Packet::PubAck(_)) = event {
                    acked += 1;
                }
            }

            client
                .disconnect()
                .await
                .map_err(|e| AppError::Mqtt(e.to_string()))?;
            // Everything is acked; a failure while closing doesn't matter
            while let Ok(event) = eventloop.poll().await {
                if let Event::Outgoing(Outgoing::Disconnect) = event {
                    break;
                }
            }
            Ok::<(), AppError>(())
        };

        tokio::time::timeout(self.timeout, session)
            .await
            .map_err(|_| AppError::Mqtt(format!("no answer from {}:{}", self.host, self.port)))?
    }
}

impl Destination for MqttBroker {
    fn kind(&self) -> &'static str {
        "mqtt"
    }

    fn log_destination(&self) {
        info!("Uploading readings to MQTT broker: {}:{}", self.host, self.port);
    }

    async fn upload(&self, payload: &Payload) -> UploadOutcome {
        let message = match self.reading_message(payload) {
            Ok(message) => message,
            Err(e) => {
                debug!("Cannot encode {}: {}", payload.label(), e);
                return UploadOutcome::Failed;
            }
        };

        let messages = [message];
        match retry_with_backoff(&self.retry, || self.publish(&payload.device_uid, &messages)).await {
            Ok(()) => UploadOutcome::Success,
            Err(e) => {
                debug!("MQTT publish of {} failed: {}", payload.label(), e);
                UploadOutcome::Failed
            }
        }
    }

    fn announces(&self) -> bool {
        self.discovery
    }

    async fn announce(&self, device: &DeviceConfig) -> Result<()> {
        if !self.discovery {
            return Ok(());
        }

        let messages = self.discovery_messages(device)?;
        retry_with_backoff(&self.retry, || self.publish(&device.nickname, &messages)).await?;
        info!("Sent Home Assistant discovery for {} sensors", messages.len());
        Ok(())
    }
}
