//! Recorded sensor samples played back as a [`Board`].
//!
//! One sample per line, whitespace separated:
//!
//! ```text
//! temperature humidity pressure_hpa luminance wind_mps wind_deg rain_tips
//! ```
//!
//! A line may carry four more fields with the raw wind signals, which then
//! replace `wind_mps` and `wind_deg`:
//!
//! ```text
//! ... rain_tips first_transition_ms last_transition_ms transitions vane_volts
//! ```

use crate::board::Board;
use crate::error::{AppError, Result};
use crate::fusion::{AnemometerCapture, RawSample};
use std::collections::VecDeque;
use std::path::Path;
use tracing::{info, warn};

const MISSING_VALUE: f64 = -9999.0;

const FIELD_COUNT: usize = 7;
const RAW_WIND_FIELD_COUNT: usize = 11;

/// Default failure threshold - fail if more than 10% of lines fail to parse
const DEFAULT_FAILURE_THRESHOLD: f64 = 0.10;

#[derive(Debug, Clone, Default)]
pub struct ParseStats {
    pub total_lines: usize,
    pub parsed_successfully: usize,
    pub parse_failures: usize,
    pub empty_lines: usize,
    pub failure_rate: f64,
}

impl ParseStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finalize(&mut self) {
        let non_empty = self.total_lines - self.empty_lines;
        self.failure_rate = if non_empty > 0 {
            self.parse_failures as f64 / non_empty as f64
        } else {
            0.0
        };
    }

    pub fn exceeds_threshold(&self, threshold: f64) -> bool {
        self.failure_rate > threshold
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplaySample {
    pub sample: RawSample,
    /// Rain gauge tips that happened before this sample was taken.
    pub rain_tips: u32,
}

/// Parse replay content and return samples with parse statistics
pub fn parse_samples(content: &str) -> Result<(Vec<ReplaySample>, ParseStats)> {
    parse_samples_with_threshold(content, DEFAULT_FAILURE_THRESHOLD)
}

pub fn parse_samples_with_threshold(
    content: &str,
    failure_threshold: f64,
) -> Result<(Vec<ReplaySample>, ParseStats)> {
    let mut samples = Vec::new();
    let mut stats = ParseStats::new();

    for (line_num, line) in content.lines().enumerate() {
        stats.total_lines += 1;

        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            stats.empty_lines += 1;
            continue;
        }

        match parse_line(line) {
            Ok(sample) => {
                samples.push(sample);
                stats.parsed_successfully += 1;
            }
            Err(e) => {
                stats.parse_failures += 1;
                warn!(
                    "Skipping replay line {} (failure {}/{}): {} - {}",
                    line_num + 1,
                    stats.parse_failures,
                    stats.total_lines - stats.empty_lines,
                    e,
                    line
                );
            }
        }
    }

    stats.finalize();

    if stats.exceeds_threshold(failure_threshold) {
        return Err(AppError::Parse(format!(
            "Replay failure rate {:.1}% exceeds threshold {:.1}%: {} failures out of {} samples",
            stats.failure_rate * 100.0,
            failure_threshold * 100.0,
            stats.parse_failures,
            stats.total_lines - stats.empty_lines
        )));
    }

    Ok((samples, stats))
}

fn parse_line(line: &str) -> Result<ReplaySample> {
    let fields: Vec<&str> = line.split_whitespace().collect();

    if fields.len() != FIELD_COUNT && fields.len() != RAW_WIND_FIELD_COUNT {
        return Err(AppError::Parse(format!(
            "Expected {} or {} fields, got {}",
            FIELD_COUNT,
            RAW_WIND_FIELD_COUNT,
            fields.len()
        )));
    }

    let (anemometer, vane_voltage) = match fields.get(FIELD_COUNT..) {
        Some(raw) if !raw.is_empty() => {
            let capture = AnemometerCapture {
                first_ms: parse_count("first transition", raw[0])?,
                last_ms: parse_count("last transition", raw[1])?,
                transitions: parse_count("transitions", raw[2])?,
            };
            (Some(capture), Some(parse_value("vane voltage", raw[3])?))
        }
        _ => (None, None),
    };

    let sample = RawSample {
        temperature_c: parse_value("temperature", fields[0])?,
        humidity: parse_value("humidity", fields[1])?,
        pressure_hpa: parse_value("pressure", fields[2])?,
        luminance_lux: parse_value("luminance", fields[3])?,
        wind_speed_mps: parse_value("wind speed", fields[4])?,
        wind_direction_deg: parse_value("wind direction", fields[5])?,
        anemometer,
        vane_voltage,
    };

    let rain_tips = parse_count("rain tips", fields[6])?;

    Ok(ReplaySample { sample, rain_tips })
}

fn parse_count<T: std::str::FromStr>(name: &str, s: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    s.parse::<T>()
        .map_err(|e| AppError::Parse(format!("Failed to parse {} '{}': {}", name, s, e)))
}

fn parse_value(name: &str, s: &str) -> Result<f64> {
    let value = s
        .parse::<f64>()
        .map_err(|e| AppError::Parse(format!("Failed to parse {} '{}': {}", name, s, e)))?;

    if (value - MISSING_VALUE).abs() < 0.1 {
        return Err(AppError::InvalidData(format!("{} is missing", name)));
    }
    if !value.is_finite() {
        return Err(AppError::InvalidData(format!("{} is not finite", name)));
    }
    Ok(value)
}

/// Board backed by a list of recorded samples. Has no button and reports
/// rain only through [`Board::take_pending_rain_tips`].
#[derive(Debug, Default)]
pub struct ReplayBoard {
    samples: VecDeque<ReplaySample>,
    pending_tips: u32,
}

impl ReplayBoard {
    pub fn new(samples: Vec<ReplaySample>) -> Self {
        Self {
            samples: samples.into(),
            pending_tips: 0,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let (samples, stats) = parse_samples(&content)?;

        info!(
            "Loaded {} replay samples from {} ({} skipped)",
            stats.parsed_successfully,
            path.display(),
            stats.parse_failures
        );
        Ok(Self::new(samples))
    }
}

impl Board for ReplayBoard {
    async fn sample(&mut self) -> Result<Option<RawSample>> {
        let Some(next) = self.samples.pop_front() else {
            return Ok(None);
        };
        self.pending_tips += next.rain_tips;
        Ok(Some(next.sample))
    }

    fn rain_triggered(&mut self) -> bool {
        false
    }

    fn button_pressed(&mut self) -> bool {
        false
    }

    fn take_pending_rain_tips(&mut self) -> u32 {
        std::mem::take(&mut self.pending_tips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        let sample = parse_line("21.4  48.2 1012.6 5400 3.1 247.5 2").unwrap();
        assert_eq!(sample.sample.temperature_c, 21.4);
        assert_eq!(sample.sample.humidity, 48.2);
        assert_eq!(sample.sample.wind_direction_deg, 247.5);
        assert_eq!(sample.rain_tips, 2);
        assert!(sample.sample.anemometer.is_none());
    }

    #[test]
    fn test_parse_line_with_raw_wind() {
        let sample = parse_line("21.4 48.2 1012.6 5400 0 0 1 120 1620 7 0.27").unwrap();
        let capture = sample.sample.anemometer.unwrap();
        assert_eq!((capture.first_ms, capture.last_ms, capture.transitions), (120, 1620, 7));
        assert_eq!(sample.sample.vane_voltage, Some(0.27));
        assert_eq!(sample.rain_tips, 1);
        assert!(parse_line("21.4 48.2 1012.6 5400 0 0 1 120 1620").is_err());
    }

    #[test]
    fn test_missing_value_rejects_line() {
        assert!(parse_line("21.4 -9999 1012.6 5400 3.1 247.5 0").is_err());
        assert!(parse_line("21.4 48.2 1012.6 5400 3.1 247.5").is_err());
    }

    #[test]
    fn test_parse_samples_with_stats() {
        let content = "# temperature humidity pressure luminance wind dir tips\n\
                       21.4 48.2 1012.6 5400 3.1 247.5 0\n\
                       \n\
                       21.9 47.0 1012.4 5600 2.7 250.0 1\n";

        let (samples, stats) = parse_samples(content).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(stats.parsed_successfully, 2);
        assert_eq!(stats.empty_lines, 2);
        assert_eq!(stats.parse_failures, 0);
    }

    #[test]
    fn test_parse_samples_failure_threshold() {
        let content = "21.4 48.2 1012.6 5400 3.1 247.5 0\n\
                       bad line\n\
                       21.4 -9999 1012.6 5400 3.1 247.5 0\n";

        let result = parse_samples(content);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("exceeds threshold"));
    }

    #[tokio::test]
    async fn test_board_hands_out_samples_and_tips() {
        let (samples, _) = parse_samples(
            "20.0 50.0 1010.0 100 1.0 90.0 3\n\
             20.5 50.0 1010.0 100 1.0 90.0 1\n",
        )
        .unwrap();
        let mut board = ReplayBoard::new(samples);

        assert_eq!(board.take_pending_rain_tips(), 0);
        let first = board.sample().await.unwrap().unwrap();
        assert_eq!(first.temperature_c, 20.0);
        assert_eq!(board.take_pending_rain_tips(), 3);
        assert_eq!(board.take_pending_rain_tips(), 0);

        board.sample().await.unwrap();
        assert!(board.sample().await.unwrap().is_none());
        assert_eq!(board.take_pending_rain_tips(), 1);
    }
}
