use crate::error::{AppError, Result};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub device: DeviceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub smoothing: SmoothingConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeviceConfig {
    pub nickname: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_uid")]
    pub uid: String,
}

fn default_model() -> String {
    "weather".to_string()
}

fn default_uid() -> String {
    "0000000000000000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    pub fn daily_stats_file(&self) -> PathBuf {
        self.data_dir.join("daily_stats.json")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn readings_dir(&self) -> PathBuf {
        self.data_dir.join("readings")
    }

    pub fn reattempt_flag_file(&self) -> PathBuf {
        self.data_dir.join("reattempt_upload.flag")
    }

    pub fn sync_time_file(&self) -> PathBuf {
        self.data_dir.join("sync_time.txt")
    }

    pub fn last_time_file(&self) -> PathBuf {
        self.data_dir.join("last_time.txt")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default = "default_reading_frequency", deserialize_with = "deserialize_u64")]
    pub reading_frequency_minutes: u64,
    #[serde(default = "default_sleep_tick_ms", deserialize_with = "deserialize_u64")]
    pub sleep_tick_ms: u64,
    #[serde(default = "default_resync_frequency", deserialize_with = "deserialize_u64")]
    pub resync_frequency_hours: u64,
}

fn default_reading_frequency() -> u64 {
    15
}

fn default_sleep_tick_ms() -> u64 {
    250
}

fn default_resync_frequency() -> u64 {
    168 // once a week
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            reading_frequency_minutes: default_reading_frequency(),
            sleep_tick_ms: default_sleep_tick_ms(),
            resync_frequency_hours: default_resync_frequency(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    /// Number of cached readings that triggers an upload. 1 uploads on demand.
    #[serde(default = "default_batch_size", deserialize_with = "deserialize_u64")]
    pub batch_size: u64,
    #[serde(default)]
    pub destination: Option<DestinationConfig>,
    #[serde(default)]
    pub secondary_destination: Option<DestinationConfig>,
    #[serde(default = "default_rate_limit_backoff_ms")]
    pub rate_limit_backoff_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_batch_size() -> u64 {
    5
}

fn default_rate_limit_backoff_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            destination: None,
            secondary_destination: None,
            rate_limit_backoff_ms: default_rate_limit_backoff_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DestinationConfig {
    Http {
        url: String,
        #[serde(default)]
        auth_token: Option<String>,
    },
    Wunderground {
        #[serde(default = "default_wunderground_url")]
        url: String,
        station_id: String,
        station_key: String,
    },
    Mqtt {
        /// Broker host name or address.
        broker: String,
        #[serde(default = "default_mqtt_port")]
        port: u16,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default = "default_topic_prefix")]
        topic_prefix: String,
        #[serde(default)]
        home_assistant_discovery: bool,
    },
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic_prefix() -> String {
    "enviro".to_string()
}

fn default_wunderground_url() -> String {
    "https://weatherstation.wunderground.com/weatherstation/updateweatherstation.php".to_string()
}

impl DestinationConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            DestinationConfig::Http { .. } => "http",
            DestinationConfig::Wunderground { .. } => "wunderground",
            DestinationConfig::Mqtt { .. } => "mqtt",
        }
    }

    fn url(&self) -> Option<&str> {
        match self {
            DestinationConfig::Http { url, .. } => Some(url.as_str()),
            DestinationConfig::Wunderground { url, .. } => Some(url.as_str()),
            DestinationConfig::Mqtt { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CalibrationConfig {
    /// Rain required for the bucket to tip, in mm.
    #[serde(default = "default_rain_mm_per_tick")]
    pub rain_mm_per_tick: f64,
    /// Distance from the anemometer axis to the centre of a cup, in cm.
    #[serde(default = "default_wind_radius_cm")]
    pub wind_radius_cm: f64,
    #[serde(default = "default_wind_factor")]
    pub wind_factor: f64,
    #[serde(default)]
    pub wind_direction_offset: f64,
}

fn default_rain_mm_per_tick() -> f64 {
    0.2794
}

fn default_wind_radius_cm() -> f64 {
    7.0
}

fn default_wind_factor() -> f64 {
    0.0218
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            rain_mm_per_tick: default_rain_mm_per_tick(),
            wind_radius_cm: default_wind_radius_cm(),
            wind_factor: default_wind_factor(),
            wind_direction_offset: 0.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SmoothingConfig {
    #[serde(default = "default_alpha_base")]
    pub alpha_base: f64,
    #[serde(default = "default_calm_threshold")]
    pub calm_threshold_mps: f64,
    #[serde(default = "default_hysteresis_deg")]
    pub hysteresis_deg: f64,
}

fn default_alpha_base() -> f64 {
    0.25
}

fn default_calm_threshold() -> f64 {
    0.8
}

fn default_hysteresis_deg() -> f64 {
    8.0
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            alpha_base: default_alpha_base(),
            calm_threshold_mps: default_calm_threshold(),
            hysteresis_deg: default_hysteresis_deg(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    #[serde(default = "default_rain_event_cap")]
    pub rain_event_cap: usize,
    #[serde(default = "default_wind_sample_cap")]
    pub wind_sample_cap: usize,
}

fn default_rain_event_cap() -> usize {
    190 // fits comfortably in one flash block
}

fn default_wind_sample_cap() -> usize {
    50
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            rain_event_cap: default_rain_event_cap(),
            wind_sample_cap: default_wind_sample_cap(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ReplayConfig {
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Custom deserializer that handles integers as both number and string
///
/// Accepts:
/// - `batch_size: 5` (number)
/// - `batch_size: "5"` (string that parses to number)
/// - `batch_size: ${UPLOAD_BATCH}` (env var substituted to either)
fn deserialize_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntValue {
        Number(u64),
        String(String),
    }

    match IntValue::deserialize(deserializer)? {
        IntValue::Number(n) => Ok(n),
        IntValue::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom(format!("Invalid integer: '{}'", s))),
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // Substitute environment variables
        let expanded = expand_env_vars(content)?;

        let config: Config = serde_yaml::from_str(&expanded)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    ///
    /// Checks for:
    /// - Unexpanded environment variables
    /// - Non-empty device identity
    /// - Positive thresholds, caps and intervals
    /// - Valid destination URL formats and MQTT broker hosts
    fn validate(&self) -> Result<()> {
        let fields_to_check = [
            ("device.nickname", &self.device.nickname),
            ("device.uid", &self.device.uid),
        ];

        for (field_name, value) in &fields_to_check {
            if value.contains("${") {
                return Err(AppError::Config(format!(
                    "{} references an environment variable that is not set",
                    field_name
                )));
            }
        }

        if self.device.nickname.trim().is_empty() {
            return Err(AppError::Config(
                "Device nickname cannot be empty".to_string(),
            ));
        }

        if self.upload.batch_size == 0 {
            return Err(AppError::Config(
                "Upload batch_size must be at least 1".to_string(),
            ));
        }

        if self.schedule.reading_frequency_minutes == 0 {
            return Err(AppError::Config(
                "Schedule reading_frequency_minutes must be greater than 0".to_string(),
            ));
        }

        if self.schedule.sleep_tick_ms == 0 {
            return Err(AppError::Config(
                "Schedule sleep_tick_ms must be greater than 0".to_string(),
            ));
        }

        if self.calibration.rain_mm_per_tick <= 0.0 {
            return Err(AppError::Config(format!(
                "Calibration rain_mm_per_tick must be positive, got {}",
                self.calibration.rain_mm_per_tick
            )));
        }

        if !(self.smoothing.alpha_base > 0.0 && self.smoothing.alpha_base <= 1.0) {
            return Err(AppError::Config(format!(
                "Smoothing alpha_base must be in (0, 1], got {}",
                self.smoothing.alpha_base
            )));
        }

        if self.smoothing.calm_threshold_mps < 0.0 || self.smoothing.hysteresis_deg < 0.0 {
            return Err(AppError::Config(
                "Smoothing calm_threshold_mps and hysteresis_deg cannot be negative".to_string(),
            ));
        }

        if self.retention.rain_event_cap == 0 || self.retention.wind_sample_cap == 0 {
            return Err(AppError::Config(
                "Retention caps must be at least 1".to_string(),
            ));
        }

        if self.schedule.reading_frequency_minutes < 5 {
            tracing::warn!(
                "Reading frequency of {} minutes is very short, flash wear will increase",
                self.schedule.reading_frequency_minutes
            );
        }

        let destinations = [
            ("destination", self.upload.destination.as_ref()),
            ("secondary_destination", self.upload.secondary_destination.as_ref()),
        ];

        for (label, destination) in destinations {
            let Some(destination) = destination else {
                continue;
            };

            if let DestinationConfig::Mqtt { broker, .. } = destination {
                if broker.trim().is_empty() || broker.contains("://") {
                    return Err(AppError::Config(format!(
                        "{} broker must be a host name, got '{}'",
                        label, broker
                    )));
                }
                continue;
            }

            let Some(raw_url) = destination.url() else {
                continue;
            };
            let parsed = url::Url::parse(raw_url).map_err(|e| {
                AppError::Config(format!("Invalid {} url '{}': {}", label, raw_url, e))
            })?;

            if parsed.scheme() != "https" && parsed.scheme() != "http" {
                return Err(AppError::Config(format!(
                    "{} url must use http or https, got: {}",
                    label,
                    parsed.scheme()
                )));
            }
        }

        if self.upload.secondary_destination.is_some() && self.upload.destination.is_none() {
            tracing::warn!("secondary_destination is set without a primary destination, it will be ignored");
        }

        Ok(())
    }
}

fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = content.to_string();
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| AppError::Config(format!("Invalid placeholder pattern: {}", e)))?;

    let mut missing_vars = Vec::new();

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                missing_vars.push(var_name.to_string());
            }
        }
    }

    if !missing_vars.is_empty() {
        return Err(AppError::Config(format!(
            "Missing required environment variable{}: {}\n\n\
             To fix this:\n\
             1. Create a .env file next to the config\n\
             2. Set the missing variable{}: export {}=<value>\n\
             3. Or set {} in your environment before running",
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars.join(", "),
            if missing_vars.len() > 1 { "s" } else { "" },
            missing_vars[0],
            missing_vars.join(", ")
        )));
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
device:
  nickname: garden
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.device.model, "weather");
        assert_eq!(config.upload.batch_size, 5);
        assert!(config.upload.destination.is_none());
        assert_eq!(config.retention.rain_event_cap, 190);
        assert_eq!(config.retention.wind_sample_cap, 50);
        assert!((config.calibration.rain_mm_per_tick - 0.2794).abs() < 1e-12);
        assert!((config.smoothing.calm_threshold_mps - 0.8).abs() < 1e-12);
        assert_eq!(config.schedule.sleep_tick_ms, 250);
    }

    #[test]
    fn test_destination_kinds_deserialize() {
        let yaml = r#"
device:
  nickname: garden
upload:
  batch_size: 1
  destination:
    kind: http
    url: https://collector.example.com/ingest
  secondary_destination:
    kind: wunderground
    station_id: IABC123
    station_key: secret
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.upload.batch_size, 1);
        assert_eq!(config.upload.destination.as_ref().unwrap().kind(), "http");
        match config.upload.secondary_destination.unwrap() {
            DestinationConfig::Wunderground { url, station_id, .. } => {
                assert_eq!(station_id, "IABC123");
                assert!(url.starts_with("https://weatherstation.wunderground.com"));
            }
            other => panic!("Expected wunderground destination, got {:?}", other),
        }
    }

    #[test]
    fn test_batch_size_deserialize_from_string() {
        let yaml = r#"
device:
  nickname: garden
upload:
  batch_size: "3"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.upload.batch_size, 3);
    }

    #[test]
    fn test_batch_size_zero_rejected() {
        let yaml = r#"
device:
  nickname: garden
upload:
  batch_size: 0
"#;
        let err = Config::from_yaml(yaml).unwrap_err().to_string();
        assert!(err.contains("batch_size"));
    }

    #[test]
    fn test_bad_destination_scheme_rejected() {
        let yaml = r#"
device:
  nickname: garden
upload:
  destination:
    kind: http
    url: ftp://collector.example.com/
"#;
        let err = Config::from_yaml(yaml).unwrap_err().to_string();
        assert!(err.contains("http or https"));
    }

    #[test]
    fn test_mqtt_destination_defaults() {
        let yaml = r#"
device:
  nickname: garden
upload:
  destination:
    kind: mqtt
    broker: broker.local
    home_assistant_discovery: true
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(
            config.upload.destination,
            Some(DestinationConfig::Mqtt {
                broker: "broker.local".to_string(),
                port: 1883,
                username: None,
                password: None,
                topic_prefix: "enviro".to_string(),
                home_assistant_discovery: true,
            })
        );
    }

    #[test]
    fn test_mqtt_broker_must_be_a_host() {
        let yaml = r#"
device:
  nickname: garden
upload:
  destination:
    kind: mqtt
    broker: mqtt://broker.local
"#;
        let err = Config::from_yaml(yaml).unwrap_err().to_string();
        assert!(err.contains("host name"));
    }

    #[test]
    fn test_missing_env_var_reported() {
        let yaml = r#"
device:
  nickname: ${WEATHER_NODE_TEST_SURELY_UNSET_VAR}
"#;
        let err = Config::from_yaml(yaml).unwrap_err().to_string();
        assert!(err.contains("WEATHER_NODE_TEST_SURELY_UNSET_VAR"));
    }

    #[test]
    fn test_storage_paths_live_under_data_dir() {
        let storage = StorageConfig {
            data_dir: PathBuf::from("/var/lib/node"),
        };
        assert_eq!(
            storage.daily_stats_file(),
            PathBuf::from("/var/lib/node/daily_stats.json")
        );
        assert_eq!(storage.uploads_dir(), PathBuf::from("/var/lib/node/uploads"));
    }
}
