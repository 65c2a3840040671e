use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::VecDeque;

/// Fixed-capacity sequence that drops its oldest entry when full.
///
/// The capacity is a runtime setting and is not persisted; it is applied
/// with [`RingBuffer::set_capacity`] after loading. Equality compares the
/// contents only.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        while self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    /// Changes the capacity, dropping the oldest entries if over it.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.items.len() > capacity {
            self.items.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl<T: PartialEq> PartialEq for RingBuffer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl<T> Default for RingBuffer<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
            capacity: usize::MAX,
        }
    }
}

impl<T: Serialize> Serialize for RingBuffer<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.items.iter())
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for RingBuffer<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let items = VecDeque::<T>::deserialize(deserializer)?;
        Ok(Self {
            items,
            capacity: usize::MAX,
        })
    }
}

/// Running min/max/sum/count for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extrema {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: u64,
}

impl Default for Extrema {
    fn default() -> Self {
        // Sentinels: any real reading replaces both on first update.
        Self {
            min: 999.0,
            max: -999.0,
            sum: 0.0,
            count: 0,
        }
    }
}

impl Extrema {
    pub fn update(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.count += 1;
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }
}

/// Exponential moving average of the wind direction unit vector.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WindDirState {
    pub ema_x: f64,
    pub ema_y: f64,
}

impl WindDirState {
    pub fn has_estimate(&self) -> bool {
        self.ema_x != 0.0 || self.ema_y != 0.0
    }

    pub fn magnitude(&self) -> f64 {
        (self.ema_x * self.ema_x + self.ema_y * self.ema_y).sqrt()
    }

    pub fn confidence(&self) -> f64 {
        self.magnitude().clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    #[serde(default)]
    pub rain_ticks: u64,
    #[serde(default)]
    pub rain_total_mm: f64,
    #[serde(default)]
    pub rain_events: RingBuffer<DateTime<Utc>>,
    #[serde(default)]
    pub rain_last_count: u64,
    #[serde(default)]
    pub wind_gust: f64,
    #[serde(default)]
    pub wind_samples: RingBuffer<f64>,
    #[serde(default)]
    pub wind_dir_state: WindDirState,
    #[serde(default)]
    pub temperature: Extrema,
    #[serde(default)]
    pub humidity: Extrema,
}

impl DailyStats {
    pub fn new(date: NaiveDate, rain_event_cap: usize, wind_sample_cap: usize) -> Self {
        Self {
            date,
            rain_ticks: 0,
            rain_total_mm: 0.0,
            rain_events: RingBuffer::new(rain_event_cap),
            rain_last_count: 0,
            wind_gust: 0.0,
            wind_samples: RingBuffer::new(wind_sample_cap),
            wind_dir_state: WindDirState::default(),
            temperature: Extrema::default(),
            humidity: Extrema::default(),
        }
    }

    pub fn wind_average(&self) -> f64 {
        if self.wind_samples.is_empty() {
            return 0.0;
        }
        self.wind_samples.iter().sum::<f64>() / self.wind_samples.len() as f64
    }

    /// Number of rain events at or after `since`.
    pub fn rain_events_since(&self, since: DateTime<Utc>) -> usize {
        self.rain_events.iter().filter(|t| **t >= since).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_drops_oldest() {
        let mut buf = RingBuffer::new(3);
        for i in 1..=5 {
            buf.push(i);
        }
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[test]
    fn test_ring_buffer_capacity_applied_after_load() {
        let mut buf: RingBuffer<u32> = serde_json::from_str("[1,2,3,4,5,6]").unwrap();
        assert_eq!(buf.len(), 6);
        buf.set_capacity(4);
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![3, 4, 5, 6]);
        buf.push(7);
        assert_eq!(buf.len(), 4);
        assert_eq!(serde_json::to_string(&buf).unwrap(), "[4,5,6,7]");
    }

    #[test]
    fn test_extrema_first_update_replaces_sentinels() {
        let mut t = Extrema::default();
        t.update(12.5);
        assert_eq!(t.min, 12.5);
        assert_eq!(t.max, 12.5);
        t.update(8.0);
        t.update(15.5);
        assert_eq!(t.min, 8.0);
        assert_eq!(t.max, 15.5);
        assert_eq!(t.count, 3);
        assert_eq!(t.average(), 12.0);
    }

    #[test]
    fn test_daily_stats_schema_field_names() {
        let stats = DailyStats::new(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(), 190, 50);
        let json = serde_json::to_value(&stats).unwrap();
        for key in [
            "date",
            "rain_ticks",
            "rain_total_mm",
            "rain_events",
            "rain_last_count",
            "wind_gust",
            "wind_samples",
            "wind_dir_state",
            "temperature",
            "humidity",
        ] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(json["date"], "2024-06-01");
        assert_eq!(json["wind_dir_state"]["ema_x"], 0.0);
        assert_eq!(json["temperature"]["min"], 999.0);
    }

    #[test]
    fn test_daily_stats_without_dir_state_loads() {
        let json = r#"{"date":"2024-06-01","rain_ticks":2,"rain_total_mm":0.5588,
            "rain_events":["2024-06-01T10:00:00Z"],"rain_last_count":1}"#;
        let stats: DailyStats = serde_json::from_str(json).unwrap();
        assert_eq!(stats.rain_ticks, 2);
        assert!(!stats.wind_dir_state.has_estimate());
        assert_eq!(stats.humidity, Extrema::default());
    }
}
