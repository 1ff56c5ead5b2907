//! # Persist Module - Runtime Settings Store
//!
//! Settings changed over the control topic must survive restarts, so they live
//! in a small sled database under the data directory. The layout is flat
//! key/value with fixed-width big-endian encodings:
//!
//! ```text
//! csv    -> bool   telemetry as CSV (true) or per-value segments
//! period -> u64    poll period in microseconds
//! sd     -> bool   durable reading log enabled
//! gmt    -> i32    timezone offset, seconds
//! dst    -> u32    daylight-saving offset, seconds
//! baud   -> u32    serial bus baud rate
//! rnum   -> u8     number of repeated requests
//! msg{N} -> [u8;8] repeated request frames, keyed by 1-based ordinal
//! ```
//!
//! Invariant: `rnum` always equals the number of stored `msg{N}` entries, and
//! the ordinals are contiguous from 1. Removal compacts the ordinals so a
//! reload after a restart reproduces the surviving frames in their original
//! order.

use std::path::Path;

use log::debug;
use thiserror::Error;

use crate::bus::Frame;

const KEY_CSV: &str = "csv";
const KEY_PERIOD: &str = "period";
const KEY_SD: &str = "sd";
const KEY_GMT: &str = "gmt";
const KEY_DST: &str = "dst";
const KEY_BAUD: &str = "baud";
const KEY_COUNT: &str = "rnum";

/// Defaults applied when a key has never been written.
pub const DEFAULT_PERIOD_US: u64 = 5_000_000;
pub const DEFAULT_BAUD: u32 = 4800;

/// Errors from the settings store.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Wrapper around sled's error type.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Wrapper around IO errors (directory creation, flush).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored value has the wrong width for its type.
    #[error("corrupt value for {key}: expected {expected} bytes, got {found}")]
    Corrupt {
        key: String,
        expected: usize,
        found: usize,
    },
}

/// Sled-backed runtime settings.
pub struct Settings {
    db: sled::Db,
}

impl Settings {
    /// Open (or create) the settings store rooted at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistError> {
        std::fs::create_dir_all(path.as_ref())?;
        let db = sled::open(path.as_ref())?;
        Ok(Self { db })
    }

    pub fn csv_output(&self) -> Result<bool, PersistError> {
        self.get_bool(KEY_CSV, true)
    }

    pub fn set_csv_output(&self, on: bool) -> Result<(), PersistError> {
        self.put(KEY_CSV, &[on as u8])
    }

    pub fn poll_period_us(&self) -> Result<u64, PersistError> {
        match self.get_fixed::<8>(KEY_PERIOD)? {
            Some(raw) => Ok(u64::from_be_bytes(raw)),
            None => Ok(DEFAULT_PERIOD_US),
        }
    }

    pub fn set_poll_period_us(&self, micros: u64) -> Result<(), PersistError> {
        self.put(KEY_PERIOD, &micros.to_be_bytes())
    }

    pub fn storage_enabled(&self) -> Result<bool, PersistError> {
        self.get_bool(KEY_SD, false)
    }

    pub fn set_storage_enabled(&self, on: bool) -> Result<(), PersistError> {
        self.put(KEY_SD, &[on as u8])
    }

    pub fn gmt_offset_secs(&self) -> Result<i32, PersistError> {
        match self.get_fixed::<4>(KEY_GMT)? {
            Some(raw) => Ok(i32::from_be_bytes(raw)),
            None => Ok(0),
        }
    }

    pub fn dst_offset_secs(&self) -> Result<u32, PersistError> {
        match self.get_fixed::<4>(KEY_DST)? {
            Some(raw) => Ok(u32::from_be_bytes(raw)),
            None => Ok(0),
        }
    }

    /// Both offsets are written together; a timezone change is one command.
    pub fn set_timezone(&self, gmt_secs: i32, dst_secs: u32) -> Result<(), PersistError> {
        self.db.insert(KEY_GMT, &gmt_secs.to_be_bytes()[..])?;
        self.put(KEY_DST, &dst_secs.to_be_bytes())
    }

    pub fn baud_rate(&self) -> Result<u32, PersistError> {
        match self.get_fixed::<4>(KEY_BAUD)? {
            Some(raw) => Ok(u32::from_be_bytes(raw)),
            None => Ok(DEFAULT_BAUD),
        }
    }

    pub fn set_baud_rate(&self, baud: u32) -> Result<(), PersistError> {
        self.put(KEY_BAUD, &baud.to_be_bytes())
    }

    /// Number of stored repeated requests.
    pub fn request_count(&self) -> Result<u8, PersistError> {
        match self.get_fixed::<1>(KEY_COUNT)? {
            Some(raw) => Ok(raw[0]),
            None => Ok(0),
        }
    }

    /// Append a repeated request. Returns its new 1-based ordinal.
    pub fn append_request(&self, frame: &Frame) -> Result<u8, PersistError> {
        let next = self.request_count()?.saturating_add(1);
        self.db
            .insert(msg_key(next).as_str(), &frame.as_bytes()[..])?;
        self.put(KEY_COUNT, &[next])?;
        debug!("stored repeated request msg{}", next);
        Ok(next)
    }

    /// Remove the first stored request equal to `frame`, compacting the
    /// ordinals above it. Returns whether a match was found.
    pub fn remove_request(&self, frame: &Frame) -> Result<bool, PersistError> {
        let stored = self.load_requests()?;
        let pos = match stored.iter().position(|f| f == frame) {
            Some(pos) => pos,
            None => return Ok(false),
        };

        // Shift everything above the hole down one ordinal, drop the last key.
        let count = stored.len();
        for i in pos + 1..count {
            self.db
                .insert(msg_key(i as u8).as_str(), &stored[i].as_bytes()[..])?;
        }
        self.db.remove(msg_key(count as u8).as_str())?;
        self.put(KEY_COUNT, &[(count - 1) as u8])?;
        debug!("removed repeated request msg{}", pos + 1);
        Ok(true)
    }

    /// Load the stored requests in ordinal order.
    pub fn load_requests(&self) -> Result<Vec<Frame>, PersistError> {
        let count = self.request_count()?;
        let mut frames = Vec::with_capacity(count as usize);
        for n in 1..=count {
            let key = msg_key(n);
            match self.get_fixed::<8>(&key)? {
                Some(raw) => frames.push(Frame::new(raw)),
                // A missing ordinal means the count key drifted; stop at the gap.
                None => break,
            }
        }
        Ok(frames)
    }

    fn get_bool(&self, key: &str, default: bool) -> Result<bool, PersistError> {
        match self.get_fixed::<1>(key)? {
            Some(raw) => Ok(raw[0] != 0),
            None => Ok(default),
        }
    }

    fn get_fixed<const N: usize>(&self, key: &str) -> Result<Option<[u8; N]>, PersistError> {
        match self.db.get(key)? {
            Some(ivec) => {
                let raw: [u8; N] = ivec.as_ref().try_into().map_err(|_| PersistError::Corrupt {
                    key: key.to_string(),
                    expected: N,
                    found: ivec.len(),
                })?;
                Ok(Some(raw))
            }
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), PersistError> {
        self.db.insert(key, value)?;
        self.db.flush()?;
        Ok(())
    }
}

fn msg_key(ordinal: u8) -> String {
    format!("msg{}", ordinal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(first: u8) -> Frame {
        Frame::new([first, 0x03, 0x00, 0x00, 0x00, 0x03, 0x05, 0xCB])
    }

    #[test]
    fn scalar_defaults_and_updates() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::open(dir.path()).unwrap();

        assert!(s.csv_output().unwrap());
        assert_eq!(s.poll_period_us().unwrap(), DEFAULT_PERIOD_US);
        assert!(!s.storage_enabled().unwrap());
        assert_eq!(s.baud_rate().unwrap(), DEFAULT_BAUD);
        assert_eq!(s.gmt_offset_secs().unwrap(), 0);

        s.set_csv_output(false).unwrap();
        s.set_poll_period_us(60_000_000).unwrap();
        s.set_timezone(-28800, 3600).unwrap();
        s.set_baud_rate(9600).unwrap();

        assert!(!s.csv_output().unwrap());
        assert_eq!(s.poll_period_us().unwrap(), 60_000_000);
        assert_eq!(s.gmt_offset_secs().unwrap(), -28800);
        assert_eq!(s.dst_offset_secs().unwrap(), 3600);
        assert_eq!(s.baud_rate().unwrap(), 9600);
    }

    #[test]
    fn append_then_remove_keeps_count_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::open(dir.path()).unwrap();

        assert_eq!(s.append_request(&frame(1)).unwrap(), 1);
        assert_eq!(s.append_request(&frame(2)).unwrap(), 2);
        assert_eq!(s.append_request(&frame(3)).unwrap(), 3);
        assert_eq!(s.request_count().unwrap(), 3);

        // Remove the middle entry; ordinals compact around the hole.
        assert!(s.remove_request(&frame(2)).unwrap());
        assert_eq!(s.request_count().unwrap(), 2);
        assert_eq!(s.load_requests().unwrap(), vec![frame(1), frame(3)]);

        // Removing again reports a miss and mutates nothing.
        assert!(!s.remove_request(&frame(2)).unwrap());
        assert_eq!(s.request_count().unwrap(), 2);
    }

    #[test]
    fn corrupt_scalar_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::open(dir.path()).unwrap();
        s.db.insert(KEY_PERIOD, &[0x01u8, 0x02][..]).unwrap();
        assert!(matches!(
            s.poll_period_us(),
            Err(PersistError::Corrupt { .. })
        ));
    }
}
