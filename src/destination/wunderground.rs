use crate::conversions::{
    celsius_to_fahrenheit, hpa_to_inches, lux_to_solar_radiation, mm_to_inches, mps_to_mph,
};
use crate::destination::retry::{retry_with_backoff, RetryPolicy};
use crate::destination::{Destination, UploadOutcome};
use crate::error::Result;
use crate::reading::Payload;
use reqwest::{Client, StatusCode};
use tracing::{debug, info};

/// Weather Underground personal weather station upload.
///
/// Protocol: https://support.weather.com/s/article/PWS-Upload-Protocol
pub struct Wunderground {
    client: Client,
    url: String,
    station_id: String,
    station_key: String,
    retry: RetryPolicy,
}

impl Wunderground {
    pub fn new(
        client: Client,
        url: &str,
        station_id: &str,
        station_key: &str,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            url: url.to_string(),
            station_id: station_id.to_string(),
            station_key: station_key.to_string(),
            retry,
        }
    }

    /// Query parameters for one payload, converted to imperial units.
    pub fn query_params(&self, payload: &Payload) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("ID", self.station_id.clone()),
            ("PASSWORD", self.station_key.clone()),
            (
                "dateutc",
                payload.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            ),
            ("softwaretype", "WeatherNode".to_string()),
            ("action", "updateraw".to_string()),
        ];

        let readings = &payload.readings;
        let mut add = |name: &'static str, value: Option<f64>| {
            if let Some(value) = value {
                params.push((name, format!("{:.2}", value)));
            }
        };

        add("tempf", readings.get("temperature").map(celsius_to_fahrenheit));
        add("tempfmax", readings.get("temperature_max").map(celsius_to_fahrenheit));
        add("tempfmin", readings.get("temperature_min").map(celsius_to_fahrenheit));
        add("tempavgf", readings.get("temperature_avg").map(celsius_to_fahrenheit));
        add("humidity", readings.get("humidity").map(|h| h.min(100.0)));
        add("dewptf", readings.get("dewpoint").map(celsius_to_fahrenheit));
        add(
            "baromin",
            readings
                .get("sea_level_pressure")
                .or_else(|| readings.get("pressure"))
                .map(hpa_to_inches),
        );
        add("windspeedmph", readings.get("wind_speed").map(mps_to_mph));
        add("windgustmph", readings.get("wind_gust").map(mps_to_mph));
        add("winddir", readings.get("wind_direction"));
        add("rainin", readings.get("rain_per_hour").map(mm_to_inches));
        add("dailyrainin", readings.get("rain_today").map(mm_to_inches));
        add(
            "solarradiation",
            readings.get("luminance").map(lux_to_solar_radiation),
        );
        add("UV", readings.get("uv_index"));

        params
    }

    async fn get(&self, params: &[(&'static str, String)]) -> Result<StatusCode> {
        let response = self.client.get(&self.url).query(params).send().await?;
        let status = response.status();
        if status.is_server_error() {
            response.error_for_status()?;
        }
        Ok(status)
    }
}

impl Destination for Wunderground {
    fn kind(&self) -> &'static str {
        "wunderground"
    }

    fn log_destination(&self) {
        info!(
            "Uploading readings to Weather Underground station: {}",
            self.station_id
        );
    }

    async fn upload(&self, payload: &Payload) -> UploadOutcome {
        let params = self.query_params(payload);
        match retry_with_backoff(&self.retry, || self.get(&params)).await {
            Ok(StatusCode::OK) => UploadOutcome::Success,
            Ok(status) => {
                debug!("Weather Underground upload issue ({})", status);
                UploadOutcome::Failed
            }
            Err(e) => {
                debug!("Weather Underground upload failed: {}", e);
                UploadOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Reading;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn station() -> Wunderground {
        Wunderground::new(
            Client::new(),
            "https://weatherstation.wunderground.com/weatherstation/updateweatherstation.php",
            "IABC123",
            "key",
            RetryPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
            },
        )
    }

    #[test]
    fn test_query_params_convert_units() {
        let mut readings = Reading::new();
        readings.push("temperature", 20.0);
        readings.push("humidity", 101.3);
        readings.push("pressure", 1000.0);
        readings.push("wind_speed", 10.0);
        readings.push("rain_today", 25.4);
        readings.push("luminance", 1200.0);
        let payload = Payload {
            nickname: "garden".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 2, 3, 4, 5, 6).unwrap(),
            firmware_version: "0.1.0".to_string(),
            model: "weather".to_string(),
            device_uid: "abc".to_string(),
            readings,
            wifi_signal: None,
            source_file: None,
        };

        let params = station().query_params(&payload);
        let get = |name: &str| {
            params
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.clone())
        };

        assert_eq!(get("dateutc").as_deref(), Some("2024-02-03 04:05:06"));
        assert_eq!(get("tempf").as_deref(), Some("68.00"));
        assert_eq!(get("humidity").as_deref(), Some("100.00"));
        assert_eq!(get("baromin").as_deref(), Some("29.53"));
        assert_eq!(get("windspeedmph").as_deref(), Some("22.37"));
        assert_eq!(get("dailyrainin").as_deref(), Some("1.00"));
        assert_eq!(get("solarradiation").as_deref(), Some("10.00"));
        assert_eq!(get("windgustmph"), None);
    }
}
