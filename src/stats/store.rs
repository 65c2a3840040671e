use crate::clock::SharedClock;
use crate::config::{RetentionConfig, SmoothingConfig};
use crate::conversions::{angular_diff, deg_to_vec, round_to, vec_to_deg};
use crate::error::Result;
use crate::stats::models::{DailyStats, WindDirState};
use chrono::{Duration as ChronoDuration, NaiveDate};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Minimum spacing between throttled writes.
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Rain counters as seen by a single fusion call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RainTally {
    /// Bucket tips since the previous call.
    pub delta_ticks: u64,
    /// Bucket tips inside the trailing window.
    pub window_ticks: usize,
    pub total_mm: f64,
}

/// Owner of the single live [`DailyStats`] record and its file.
///
/// Every mutation goes through the cached record and marks it dirty;
/// [`StatsStore::flush`] is the only path that writes it back.
pub struct StatsStore {
    path: PathBuf,
    clock: SharedClock,
    rain_mm_per_tick: f64,
    smoothing: SmoothingConfig,
    retention: RetentionConfig,
    cache: Option<DailyStats>,
    dirty: bool,
    last_flush: Option<Instant>,
}

impl StatsStore {
    pub fn new(
        path: impl Into<PathBuf>,
        clock: SharedClock,
        rain_mm_per_tick: f64,
        smoothing: SmoothingConfig,
        retention: RetentionConfig,
    ) -> Self {
        Self {
            path: path.into(),
            clock,
            rain_mm_per_tick,
            smoothing,
            retention,
            cache: None,
            dirty: false,
            last_flush: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Today's record, starting a fresh one if the date has moved on.
    pub fn load(&mut self) -> &DailyStats {
        self.current()
    }

    /// Records one bucket tip at the current time.
    pub fn record_rain_tick(&mut self) {
        let now = self.clock.now();
        let tip = self.rain_mm_per_tick;

        let stats = self.current();
        stats.rain_ticks += 1;
        stats.rain_total_mm = stats.rain_ticks as f64 * tip;
        stats.rain_events.push(now);
        let total = stats.rain_total_mm;
        self.dirty = true;

        if self.flush_due() {
            if let Err(e) = self.flush(true) {
                warn!("Failed to persist rain tick: {}", e);
            }
        }

        info!("Rain tick recorded ({:.4} mm total)", total);
    }

    /// Adds a wind speed sample and returns the moving average and today's gust.
    pub fn record_wind_sample(&mut self, speed_mps: f64) -> (f64, f64) {
        let stats = self.current();
        stats.wind_samples.push(speed_mps);
        if speed_mps > stats.wind_gust {
            stats.wind_gust = round_to(speed_mps, 2);
        }
        let result = (round_to(stats.wind_average(), 2), stats.wind_gust);
        self.dirty = true;
        result
    }

    /// Folds one temperature/humidity pair in and returns the running averages.
    pub fn record_temp_humidity(&mut self, temperature: f64, humidity: f64) -> (f64, f64) {
        let stats = self.current();
        stats.temperature.update(temperature);
        stats.humidity.update(humidity);
        let result = (
            round_to(stats.temperature.average(), 2),
            round_to(stats.humidity.average(), 2),
        );
        self.dirty = true;
        result
    }

    /// Speed-weighted EMA of the wind direction.
    ///
    /// Returns `(smoothed_deg, confidence)`. Calm wind and small changes under
    /// light wind leave the stored vector untouched.
    pub fn smooth_wind_direction(&mut self, raw_deg: f64, speed_mps: f64) -> (f64, f64) {
        let calm = self.smoothing.calm_threshold_mps;
        let hysteresis = self.smoothing.hysteresis_deg;
        let alpha_base = self.smoothing.alpha_base;

        let state = self.current().wind_dir_state;

        if speed_mps < calm && state.has_estimate() {
            return (vec_to_deg(state.ema_x, state.ema_y), state.confidence());
        }

        if state.has_estimate() {
            let current_dir = vec_to_deg(state.ema_x, state.ema_y);
            if angular_diff(raw_deg, current_dir).abs() < hysteresis && speed_mps < calm * 1.5 {
                debug!(
                    "Direction change {:.1} -> {:.1} below hysteresis, keeping estimate",
                    current_dir, raw_deg
                );
                return (current_dir, state.confidence());
            }
        }

        let speed_weight = (speed_mps / 3.0).clamp(0.5, 2.0);
        let alpha = (alpha_base * speed_weight).clamp(0.05, 0.8);

        let (vx, vy) = deg_to_vec(raw_deg);
        let next = WindDirState {
            ema_x: (1.0 - alpha) * state.ema_x + alpha * vx,
            ema_y: (1.0 - alpha) * state.ema_y + alpha * vy,
        };

        self.current().wind_dir_state = next;
        self.dirty = true;

        (vec_to_deg(next.ema_x, next.ema_y), next.confidence())
    }

    /// Rain since the previous call plus the tips inside the trailing `window`.
    ///
    /// Advances `rain_last_count` so the next call only sees new tips.
    pub fn rainfall(&mut self, window: ChronoDuration) -> RainTally {
        let since = self.clock.now() - window;

        let stats = self.current();
        let ticks_now = stats.rain_ticks;
        let tally = RainTally {
            delta_ticks: ticks_now.saturating_sub(stats.rain_last_count),
            window_ticks: stats.rain_events_since(since),
            total_mm: stats.rain_total_mm,
        };
        stats.rain_last_count = ticks_now;
        self.dirty = true;

        tally
    }

    /// Writes the record if it changed since the last write, or unconditionally when forced.
    pub fn flush(&mut self, force: bool) -> Result<()> {
        let Some(stats) = self.cache.as_ref() else {
            return Ok(());
        };
        if !self.dirty && !force {
            return Ok(());
        }

        self.persist(stats)?;
        self.dirty = false;
        self.last_flush = Some(Instant::now());
        Ok(())
    }

    /// Writes pending changes once the throttle interval has passed since
    /// the last write.
    pub fn flush_if_due(&mut self) -> Result<()> {
        if !self.dirty || !self.flush_due() {
            return Ok(());
        }
        self.flush(false)
    }

    fn flush_due(&self) -> bool {
        self.last_flush
            .map_or(true, |last| last.elapsed() >= FLUSH_INTERVAL)
    }

    fn current(&mut self) -> &mut DailyStats {
        let today = self.clock.today();
        let cached = self.cache.take().filter(|stats| stats.date == today);
        let stats = match cached {
            Some(stats) => stats,
            None => {
                self.dirty = false;
                self.read_or_reset(today)
            }
        };
        self.cache.insert(stats)
    }

    fn read_or_reset(&self, today: NaiveDate) -> DailyStats {
        if self.path.exists() {
            match self.read() {
                Ok(mut stats) if stats.date == today => {
                    stats.rain_events.set_capacity(self.retention.rain_event_cap);
                    stats.wind_samples.set_capacity(self.retention.wind_sample_cap);
                    debug!("Loaded daily stats for {}", today);
                    return stats;
                }
                Ok(stats) => {
                    info!(
                        "New day detected ({} -> {}), resetting daily stats",
                        stats.date, today
                    );
                }
                Err(e) => {
                    error!(
                        "Failed to read {}: {}. Resetting daily stats",
                        self.path.display(),
                        e
                    );
                }
            }
        }

        let fresh = DailyStats::new(
            today,
            self.retention.rain_event_cap,
            self.retention.wind_sample_cap,
        );
        if let Err(e) = self.persist(&fresh) {
            error!("Failed to write fresh daily stats: {}", e);
        }
        fresh
    }

    fn read(&self) -> Result<DailyStats> {
        let content = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write-to-temp then rename so a power cut never leaves a torn record.
    fn persist(&self, stats: &DailyStats) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        serde_json::to_writer(&mut tmp, stats)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;

        debug!("Persisted daily stats to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use approx::assert_relative_eq;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn store_at(dir: &Path, clock: Arc<ManualClock>) -> StatsStore {
        StatsStore::new(
            dir.join("daily_stats.json"),
            clock,
            0.2794,
            SmoothingConfig::default(),
            RetentionConfig::default(),
        )
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn test_wind_sample_average_and_gust() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(dir.path(), clock());

        assert_eq!(store.record_wind_sample(2.0), (2.0, 2.0));
        assert_eq!(store.record_wind_sample(4.567), (3.28, 4.57));
        assert_eq!(store.record_wind_sample(1.0), (2.52, 4.57));
        assert!(store.is_dirty());
    }

    #[test]
    fn test_wind_samples_are_capped() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(dir.path(), clock());

        for _ in 0..60 {
            store.record_wind_sample(1.0);
        }
        store.record_wind_sample(51.0);
        assert_eq!(store.load().wind_samples.len(), 50);
        // 49 ones and one 51
        assert_eq!(store.record_wind_sample(1.0).0, 2.0);
    }

    #[test]
    fn test_temp_humidity_averages() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(dir.path(), clock());

        store.record_temp_humidity(10.0, 80.0);
        let (t, h) = store.record_temp_humidity(15.0, 60.0);
        assert_eq!((t, h), (12.5, 70.0));

        let stats = store.load();
        assert_eq!(stats.temperature.min, 10.0);
        assert_eq!(stats.temperature.max, 15.0);
        assert_eq!(stats.humidity.min, 60.0);
        assert_eq!(stats.humidity.max, 80.0);
    }

    #[test]
    fn test_rain_tick_flush_is_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let clock = clock();
        let mut store = store_at(dir.path(), clock.clone());

        store.record_rain_tick();
        let on_disk: DailyStats =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(on_disk.rain_ticks, 1);

        store.record_rain_tick();
        let on_disk: DailyStats =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(on_disk.rain_ticks, 1, "second tick inside 5s must not hit flash");
        assert!(store.is_dirty());

        store.flush(false).unwrap();
        let on_disk: DailyStats =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(on_disk.rain_ticks, 2);
        assert_relative_eq!(on_disk.rain_total_mm, 0.5588, epsilon = 1e-9);
        assert!(!store.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_if_due_waits_for_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(dir.path(), clock());
        let ticks_on_disk = |store: &StatsStore| {
            let on_disk: DailyStats =
                serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
            on_disk.rain_ticks
        };

        store.record_rain_tick();
        store.record_rain_tick();
        store.flush_if_due().unwrap();
        assert_eq!(ticks_on_disk(&store), 1);

        tokio::time::advance(Duration::from_secs(4)).await;
        store.flush_if_due().unwrap();
        assert!(store.is_dirty());

        tokio::time::advance(Duration::from_secs(1)).await;
        store.flush_if_due().unwrap();
        assert!(!store.is_dirty());
        assert_eq!(ticks_on_disk(&store), 2);
    }

    #[test]
    fn test_rain_events_capped_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let clock = clock();
        let mut store = store_at(dir.path(), clock.clone());

        for _ in 0..200 {
            store.record_rain_tick();
            clock.advance_secs(1);
        }
        let stats = store.load();
        assert_eq!(stats.rain_ticks, 200);
        assert_eq!(stats.rain_events.len(), 190);
        assert_eq!(
            *stats.rain_events.iter().next().unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 10).unwrap()
        );
    }

    #[test]
    fn test_flush_without_changes_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(dir.path(), clock());
        store.flush(false).unwrap();
        assert!(!store.path().exists(), "nothing loaded, nothing written");

        store.load();
        let before = std::fs::metadata(store.path()).unwrap().modified().unwrap();
        store.flush(false).unwrap();
        let after = std::fs::metadata(store.path()).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_first_estimate_takes_raw_direction() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(dir.path(), clock());

        let (deg, confidence) = store.smooth_wind_direction(90.0, 3.0);
        assert_relative_eq!(deg, 90.0, epsilon = 1e-9);
        // alpha = 0.25 at 3 m/s
        assert_relative_eq!(confidence, 0.25, epsilon = 1e-9);
    }

    #[test]
    fn test_calm_wind_returns_prior_estimate() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(dir.path(), clock());

        store.smooth_wind_direction(180.0, 5.0);
        let before = store.load().wind_dir_state;

        let (deg, _) = store.smooth_wind_direction(0.0, 0.5);
        assert_relative_eq!(deg, 180.0, epsilon = 1e-9);
        assert_eq!(store.load().wind_dir_state, before);
    }

    #[test]
    fn test_alpha_is_clamped_at_high_speed() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_at(dir.path(), clock());

        // weight clamps at 2.0, alpha = 0.5
        let (_, confidence) = store.smooth_wind_direction(45.0, 30.0);
        assert_relative_eq!(confidence, 0.5, epsilon = 1e-9);
    }
}
