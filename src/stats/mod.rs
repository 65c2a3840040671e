pub mod models;
pub mod store;

pub use models::{DailyStats, Extrema, RingBuffer, WindDirState};
pub use store::{RainTally, StatsStore};
