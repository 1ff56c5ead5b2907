//! Reply decoding for the fixed RS-485 reply layout.
//!
//! Replies are variable length: byte 0 is the source address, byte 2 the
//! declared payload byte count, and the payload starts at byte 3. Payload
//! values are big-endian 16-bit registers scaled by 1/10, except for the
//! single-byte layout which carries one raw unscaled value. Trailing bytes
//! past the declared payload (checksums included) are ignored.

use std::fmt;

/// One decoded value from a reply payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadingValue {
    /// Single-byte payload, passed through unscaled.
    Raw(u8),
    /// Big-endian 16-bit register divided by 10.
    Scaled(f64),
}

impl fmt::Display for ReadingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadingValue::Raw(b) => write!(f, "{}", b),
            ReadingValue::Scaled(v) => write!(f, "{:.1}", v),
        }
    }
}

/// A decoded sensor reply: the peer address and its values in payload order.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedReading {
    pub addr: u8,
    pub values: Vec<ReadingValue>,
}

impl DecodedReading {
    /// Render the values as a comma/space-joined list, e.g. `"1.0, 2.0"`.
    pub fn render(&self) -> String {
        let parts: Vec<String> = self.values.iter().map(|v| v.to_string()).collect();
        parts.join(", ")
    }
}

/// Decode an accumulated reply buffer into a reading.
///
/// Returns `None` when the buffer is too short for the header or for the
/// declared payload; the caller clears the buffer either way. An odd declared
/// byte count decodes `count / 2` register pairs and drops the trailing byte.
pub fn decode_reply(buf: &[u8]) -> Option<DecodedReading> {
    if buf.len() < 3 {
        return None;
    }
    let addr = buf[0];
    let declared = buf[2] as usize;

    let values = if declared < 2 {
        vec![ReadingValue::Raw(*buf.get(3)?)]
    } else {
        let pairs = declared / 2;
        if buf.len() < 3 + pairs * 2 {
            return None;
        }
        let mut values = Vec::with_capacity(pairs);
        for i in 0..pairs {
            let high = buf[3 + i * 2];
            let low = buf[4 + i * 2];
            let raw = u16::from_be_bytes([high, low]);
            values.push(ReadingValue::Scaled(raw as f64 / 10.0));
        }
        values
    };

    Some(DecodedReading { addr, values })
}
