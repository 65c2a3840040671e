//! Wall-clock access and the timestamp formats used on disk.
//!
//! All persisted timestamps use `YYYY-MM-DDTHH:MM:SSZ`. Queue and log file
//! names swap the colons for underscores so they are valid on FAT volumes
//! and still sort chronologically.

use crate::error::{AppError, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound, Utc};
use std::sync::{Arc, Mutex};

const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
const FILE_DATETIME_FORMAT: &str = "%Y-%m-%dT%H_%M_%SZ";

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

/// Whole seconds only, so serialized timestamps carry no fraction.
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now().trunc_subsecs(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        if let Ok(mut now) = self.now.lock() {
            *now += chrono::Duration::seconds(secs);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

pub fn datetime_string(dt: &DateTime<Utc>) -> String {
    dt.format(DATETIME_FORMAT).to_string()
}

pub fn datetime_file_string(dt: &DateTime<Utc>) -> String {
    dt.format(FILE_DATETIME_FORMAT).to_string()
}

pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s.trim(), DATETIME_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| AppError::Parse(format!("Invalid timestamp '{}': {}", s, e)))
}
