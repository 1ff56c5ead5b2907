//! # Readlog Module - Durable Reading Log
//!
//! When enabled, every decoded reading is also appended to a daily CSV file
//! under the data directory, so telemetry survives uplink outages. Rows are
//! timestamped in the device's configured local time (GMT offset plus DST
//! offset, both remotely settable).
//!
//! The log is deliberately append-only and line-oriented; rotation or pruning
//! is left to the operator.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{FixedOffset, Utc};
use log::warn;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::bus::DecodedReading;

/// Append-only CSV sink for decoded readings.
pub struct ReadingLog {
    dir: PathBuf,
    enabled: bool,
    offset: FixedOffset,
}

impl ReadingLog {
    pub fn new<P: AsRef<Path>>(dir: P, enabled: bool, gmt_secs: i32, dst_secs: u32) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            enabled,
            offset: make_offset(gmt_secs, dst_secs),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Toggle the sink live; takes effect from the next reading.
    pub fn set_enabled(&mut self, on: bool) {
        self.enabled = on;
    }

    /// Apply new offsets live; takes effect from the next reading.
    pub fn set_timezone(&mut self, gmt_secs: i32, dst_secs: u32) {
        self.offset = make_offset(gmt_secs, dst_secs);
    }

    /// Append one reading. A disabled sink accepts and drops silently.
    pub async fn append(&self, reading: &DecodedReading) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let now = Utc::now().with_timezone(&self.offset);
        let path = self.dir.join(format!("readings-{}.csv", now.format("%Y%m%d")));
        let values: Vec<String> = reading.values.iter().map(|v| v.to_string()).collect();
        let line = format!(
            "{},{},{}\n",
            now.to_rfc3339(),
            reading.addr,
            values.join(",")
        );

        fs::create_dir_all(&self.dir).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

fn make_offset(gmt_secs: i32, dst_secs: u32) -> FixedOffset {
    let total = gmt_secs.saturating_add(dst_secs as i32);
    FixedOffset::east_opt(total).unwrap_or_else(|| {
        warn!("timezone offset {}s out of range, using UTC", total);
        FixedOffset::east_opt(0).unwrap()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ReadingValue;

    fn reading() -> DecodedReading {
        DecodedReading {
            addr: 1,
            values: vec![ReadingValue::Scaled(1.0), ReadingValue::Scaled(2.0)],
        }
    }

    #[tokio::test]
    async fn disabled_sink_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let log = ReadingLog::new(dir.path(), false, 0, 0);
        log.append(&reading()).await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn appends_timestamped_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = ReadingLog::new(dir.path(), false, 3600, 0);
        log.set_enabled(true);
        log.append(&reading()).await.unwrap();
        log.append(&reading()).await.unwrap();

        let entry = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap();
        let contents = std::fs::read_to_string(entry.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(",1,1.0,2.0"));
        // Offset rendered in the timestamp, not baked into the clock.
        assert!(lines[0].contains("+01:00"));
    }

    #[test]
    fn out_of_range_offset_falls_back_to_utc() {
        let log = ReadingLog::new("/tmp", true, i32::MAX, 0);
        assert_eq!(log.offset.local_minus_utc(), 0);
    }
}
