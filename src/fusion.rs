//! Combines one instantaneous sample with the day's running statistics.

use crate::config::CalibrationConfig;
use crate::conversions::{direction_from_voltage, dewpoint, round_to, wind_speed_from_transitions};
use crate::reading::Reading;
use crate::stats::StatsStore;
use chrono::Duration;
use serde::Deserialize;
use tracing::{debug, warn};

/// One set of instantaneous sensor values.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RawSample {
    pub temperature_c: f64,
    /// Relative humidity, percent.
    pub humidity: f64,
    pub pressure_hpa: f64,
    pub luminance_lux: f64,
    pub wind_speed_mps: f64,
    /// Vane heading before the mounting offset is applied.
    pub wind_direction_deg: f64,
    /// Raw anemometer capture. Takes precedence over `wind_speed_mps`.
    #[serde(default)]
    pub anemometer: Option<AnemometerCapture>,
    /// Raw vane output in volts. Takes precedence over `wind_direction_deg`.
    #[serde(default)]
    pub vane_voltage: Option<f64>,
}

/// Reed switch transitions seen during one anemometer sample window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct AnemometerCapture {
    pub first_ms: u64,
    pub last_ms: u64,
    pub transitions: u32,
}

pub struct SensorFusion {
    rain_mm_per_tick: f64,
    wind_radius_cm: f64,
    wind_factor: f64,
    wind_direction_offset: f64,
}

impl SensorFusion {
    pub fn new(calibration: &CalibrationConfig) -> Self {
        Self {
            rain_mm_per_tick: calibration.rain_mm_per_tick,
            wind_radius_cm: calibration.wind_radius_cm,
            wind_factor: calibration.wind_factor,
            wind_direction_offset: calibration.wind_direction_offset,
        }
    }

    /// Instantaneous wind speed in m/s, decoded from the raw capture if
    /// the board supplied one.
    pub fn wind_speed(&self, sample: &RawSample) -> f64 {
        match sample.anemometer {
            Some(capture) => wind_speed_from_transitions(
                capture.first_ms,
                capture.last_ms,
                capture.transitions,
                self.wind_radius_cm,
                self.wind_factor,
            ),
            None => sample.wind_speed_mps,
        }
    }

    /// Compass heading with the mounting offset applied, in [0, 360).
    pub fn wind_direction(&self, sample: &RawSample) -> f64 {
        match sample.vane_voltage {
            Some(voltage) => direction_from_voltage(voltage, self.wind_direction_offset),
            None => (sample.wind_direction_deg + self.wind_direction_offset).rem_euclid(360.0),
        }
    }

    /// Folds `sample` into `stats` and returns the derived reading.
    ///
    /// `seconds_since_last` is the gap since the previous reading and only
    /// feeds the per-second rain rate; zero or negative yields a rate of 0.
    pub fn fuse(
        &self,
        stats: &mut StatsStore,
        sample: &RawSample,
        seconds_since_last: i64,
    ) -> Reading {
        let tip = self.rain_mm_per_tick;

        let rain = stats.rainfall(Duration::seconds(3600));
        let rain_amount = round_to(rain.delta_ticks as f64 * tip, 4);
        let rain_per_second = if seconds_since_last > 0 {
            round_to(rain_amount / seconds_since_last as f64, 6)
        } else {
            0.0
        };
        let rain_per_hour = round_to(rain.window_ticks as f64 * tip, 4);
        let rain_today = round_to(rain.total_mm, 3);

        let (temperature_avg, humidity_avg) =
            stats.record_temp_humidity(sample.temperature_c, sample.humidity);

        let (wind_avg, wind_gust) = stats.record_wind_sample(self.wind_speed(sample));
        let (wind_direction, direction_confidence) =
            stats.smooth_wind_direction(self.wind_direction(sample), wind_avg);

        let daily = stats.load();
        let temperature = daily.temperature;
        let humidity = daily.humidity;

        let pollen = pollen_index(
            sample.temperature_c,
            sample.humidity,
            wind_avg,
            rain_today,
            sample.luminance_lux,
        );

        let mut reading = Reading::new();
        reading.push("temperature", round_to(sample.temperature_c, 2));
        reading.push("humidity", round_to(sample.humidity, 2));
        reading.push("pressure", round_to(sample.pressure_hpa, 2));
        reading.push("luminance", round_to(sample.luminance_lux, 2));
        reading.push("wind_speed", wind_avg);
        reading.push("wind_gust", wind_gust);
        reading.push("wind_direction", round_to(wind_direction, 1));
        reading.push("wind_direction_confidence", round_to(direction_confidence, 3));
        reading.push("rain", rain_amount);
        reading.push("rain_per_second", rain_per_second);
        reading.push("rain_per_hour", rain_per_hour);
        reading.push("rain_today", rain_today);
        reading.push(
            "dewpoint",
            round_to(dewpoint(sample.temperature_c, sample.humidity), 2),
        );
        reading.push("temperature_avg", temperature_avg);
        reading.push("temperature_min", round_to(temperature.min, 2));
        reading.push("temperature_max", round_to(temperature.max, 2));
        reading.push("humidity_avg", humidity_avg);
        reading.push("humidity_min", round_to(humidity.min, 2));
        reading.push("humidity_max", round_to(humidity.max, 2));
        reading.push_int("pollen_index", i64::from(pollen));

        debug!(
            "Fused reading: {} rain tips since last, {:.1} deg at {:.2} m/s",
            rain.delta_ticks, wind_direction, wind_avg
        );

        if let Err(e) = stats.flush(false) {
            warn!("Failed to persist daily stats after reading: {}", e);
        }

        reading
    }
}

/// Qualitative 0-5 pollen estimate from weather conditions.
///
/// This is a heuristic, not a measurement.
pub fn pollen_index(
    temperature_c: f64,
    humidity: f64,
    wind_speed_mps: f64,
    rain_today_mm: f64,
    luminance_lux: f64,
) -> u8 {
    let mut score: i32 = 0;

    score += [15.0, 20.0, 25.0]
        .iter()
        .filter(|&&t| temperature_c > t)
        .count() as i32;
    score += [70.0, 50.0].iter().filter(|&&h| humidity < h).count() as i32;
    score += [2.0, 4.0]
        .iter()
        .filter(|&&w| wind_speed_mps > w)
        .count() as i32;

    if rain_today_mm > 0.0 {
        score -= 2;
    }
    if luminance_lux > 10000.0 {
        score += 1;
    }

    score.clamp(0, 5) as u8
}
