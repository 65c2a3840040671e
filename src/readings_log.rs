use crate::clock::datetime_string;
use crate::error::Result;
use crate::reading::Reading;
use chrono::{DateTime, NaiveDate, Utc};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Daily CSV files of readings, kept when no upload destination is configured.
#[derive(Debug, Clone)]
pub struct ReadingsLog {
    dir: PathBuf,
}

impl ReadingsLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.csv", date.format("%Y-%m-%d")))
    }

    /// Appends one row to the file for `at`'s date.
    ///
    /// The header is written only when the file is new, so its columns
    /// follow the first reading of the day.
    pub fn append(&self, at: DateTime<Utc>, reading: &Reading) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(at.date_naive());
        let is_new = std::fs::metadata(&path).map_or(true, |m| m.len() == 0);

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::CRLF)
            .from_writer(file);

        if is_new {
            info!("Starting readings log {}", path.display());
            let mut header = vec!["timestamp"];
            header.extend(reading.keys());
            writer.write_record(&header)?;
        }

        let mut row = vec![datetime_string(&at)];
        row.extend(reading.rendered_values());
        writer.write_record(&row)?;
        writer.flush()?;

        debug!("Appended reading to {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reading(temperature: f64) -> Reading {
        let mut reading = Reading::new();
        reading.push("temperature", temperature);
        reading.push("humidity", 55.0);
        reading.push("dewpoint", f64::NAN);
        reading
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let log = ReadingsLog::new(dir.path().join("readings"));
        let first = Utc.with_ymd_and_hms(2024, 5, 4, 6, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 5, 4, 6, 15, 0).unwrap();

        let path = log.append(first, &reading(12.5)).unwrap();
        log.append(second, &reading(13.0)).unwrap();

        assert!(path.ends_with("readings/2024-05-04.csv"));
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "timestamp,temperature,humidity,dewpoint\r\n\
             2024-05-04T06:00:00Z,12.5,55.0,\r\n\
             2024-05-04T06:15:00Z,13.0,55.0,\r\n"
        );
    }

    #[test]
    fn test_new_day_starts_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = ReadingsLog::new(dir.path());

        let a = log
            .append(Utc.with_ymd_and_hms(2024, 5, 4, 23, 59, 0).unwrap(), &reading(1.0))
            .unwrap();
        let b = log
            .append(Utc.with_ymd_and_hms(2024, 5, 5, 0, 14, 0).unwrap(), &reading(2.0))
            .unwrap();

        assert_ne!(a, b);
        let content = std::fs::read_to_string(b).unwrap();
        assert!(content.starts_with("timestamp,"));
    }
}
