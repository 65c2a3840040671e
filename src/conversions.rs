//! Pure meteorological helpers: dewpoint, unit conversions, and decoding of
//! the anemometer and wind vane signals.

use std::f64::consts::PI;

/// Vane output voltage for each of the 16 compass points, starting at north
/// and stepping clockwise by 22.5 degrees.
const VANE_VOLTAGES: [f64; 16] = [
    2.533, 1.308, 1.487, 0.270, 0.300, 0.212, 0.595, 0.408, 0.926, 0.789, 2.031, 1.932, 3.046,
    2.667, 2.859, 2.265,
];

/// Dewpoint in °C using the Magnus approximation.
///
/// Returns a non-finite value when `relative_humidity` is zero or negative.
pub fn dewpoint(temperature_c: f64, relative_humidity: f64) -> f64 {
    let alpha = (relative_humidity / 100.0).ln() + (17.625 * temperature_c) / (243.04 + temperature_c);
    (243.04 * alpha) / (17.625 - alpha)
}

pub fn celsius_to_fahrenheit(temperature_c: f64) -> f64 {
    temperature_c * 1.8 + 32.0
}

pub fn hpa_to_inches(pressure_hpa: f64) -> f64 {
    pressure_hpa * 0.02953
}

pub fn mps_to_mph(speed_mps: f64) -> f64 {
    speed_mps * 2.2369362912
}

pub fn mm_to_inches(distance_mm: f64) -> f64 {
    distance_mm * 0.0393700787
}

/// Rough solar radiation estimate in W/m² from illuminance in lux.
pub fn lux_to_solar_radiation(lux: f64) -> f64 {
    round_to(lux / 120.0, 2)
}

/// Wind speed in m/s from reed switch transitions captured over a sample window.
///
/// `first_ms` and `last_ms` are the times of the first and last transitions.
/// The switch closes twice per rotation.
pub fn wind_speed_from_transitions(
    first_ms: u64,
    last_ms: u64,
    transitions: u32,
    radius_cm: f64,
    factor: f64,
) -> f64 {
    if transitions < 2 || last_ms <= first_ms {
        return 0.0;
    }

    let avg_tick_ms = (last_ms - first_ms) as f64 / (transitions - 1) as f64;
    let rotation_hz = (1000.0 / avg_tick_ms) / 2.0;
    let circumference = radius_cm * 2.0 * PI;
    rotation_hz * circumference * factor
}

/// Compass direction in degrees for the closest matching vane voltage.
pub fn direction_from_voltage(voltage: f64, offset_deg: f64) -> f64 {
    let closest = VANE_VOLTAGES
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            (*a - voltage)
                .abs()
                .partial_cmp(&(*b - voltage).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
        .unwrap_or(0);

    (closest as f64 * 22.5 + 360.0 + offset_deg).rem_euclid(360.0)
}

pub fn deg_to_vec(deg: f64) -> (f64, f64) {
    let rad = deg.rem_euclid(360.0).to_radians();
    (rad.cos(), rad.sin())
}

/// Heading of a vector in [0, 360). The zero vector maps to 0.
pub fn vec_to_deg(x: f64, y: f64) -> f64 {
    if x == 0.0 && y == 0.0 {
        return 0.0;
    }
    y.atan2(x).to_degrees().rem_euclid(360.0)
}

/// Smallest signed difference `a - b` in degrees, in [-180, 180).
pub fn angular_diff(a: f64, b: f64) -> f64 {
    (a - b + 180.0).rem_euclid(360.0) - 180.0
}

pub fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}
