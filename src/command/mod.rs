//! # Command Module - Remote Configuration Protocol
//!
//! Configuration messages arrive on the MQTT control topic as `+`-delimited
//! text. Field 0 is a numeric command code; the remaining fields are
//! command-specific. The full table:
//!
//! | Code | Effect | Fields |
//! |------|--------|--------|
//! | 0 | CSV vs segmented telemetry output | `true`/other |
//! | 1 | poll period in seconds | seconds |
//! | 2 | append a repeated bus request | 8 hex bytes |
//! | 3 | send a one-time bus request | 8 hex bytes |
//! | 4 | enable/disable the reading log | `true`/other |
//! | 5 | GMT and DST offsets in seconds | gmt, dst |
//! | 6 | bus baud rate | baud |
//! | 7 | remove a repeated bus request | 8 hex bytes |
//!
//! Parsing is all-or-nothing per message: a message that fails to parse
//! applies no effect at all. Boolean fields follow the device convention that
//! the literal `true` enables and anything else disables.

use thiserror::Error;

use crate::bus::Frame;

/// Field delimiter in control messages.
pub const FIELD_SEPARATOR: char = '+';

/// A fully parsed control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Code 0: telemetry as one CSV message (true) or per-value segments.
    SetCsvOutput(bool),
    /// Code 1: polling period, carried in microseconds.
    SetPollPeriod { micros: u64 },
    /// Code 2: append to the repeated polling queue and persist.
    AddRepeated(Frame),
    /// Code 3: one-shot transmission, no persistence, no telemetry.
    SendOnetime(Frame),
    /// Code 4: toggle the durable reading log.
    SetStorageEnabled(bool),
    /// Code 5: timezone offsets applied to reading-log timestamps.
    SetTimezone { gmt_secs: i32, dst_secs: u32 },
    /// Code 6: rebind the serial bus at a new baud rate.
    SetBaudRate(u32),
    /// Code 7: remove the first matching repeated request.
    RemoveRepeated(Frame),
}

/// Why a control message failed to parse. Malformed messages are dropped
/// whole; no partial effects are applied.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command message")]
    Empty,

    #[error("command code is not a number: {0:?}")]
    BadCode(String),

    #[error("unknown command code {0}")]
    UnknownCode(u8),

    #[error("command {code}: missing field {index}")]
    MissingField { code: u8, index: usize },

    #[error("command {code}: field {index} is not a number: {value:?}")]
    BadNumber {
        code: u8,
        index: usize,
        value: String,
    },

    #[error("command {code}: field {index} is not a hex byte: {value:?}")]
    BadHexByte {
        code: u8,
        index: usize,
        value: String,
    },
}

/// Parse one control message.
pub fn parse(msg: &str) -> Result<Command, CommandError> {
    let fields: Vec<&str> = msg.trim().split(FIELD_SEPARATOR).collect();
    let head = fields[0].trim();
    if head.is_empty() {
        return Err(CommandError::Empty);
    }
    let code: u8 = head
        .parse()
        .map_err(|_| CommandError::BadCode(head.to_string()))?;

    match code {
        0 => Ok(Command::SetCsvOutput(bool_field(code, &fields, 1)?)),
        1 => {
            let secs: u64 = num_field(code, &fields, 1)?;
            Ok(Command::SetPollPeriod {
                micros: secs.saturating_mul(1_000_000),
            })
        }
        2 => Ok(Command::AddRepeated(frame_fields(code, &fields)?)),
        3 => Ok(Command::SendOnetime(frame_fields(code, &fields)?)),
        4 => Ok(Command::SetStorageEnabled(bool_field(code, &fields, 1)?)),
        5 => Ok(Command::SetTimezone {
            gmt_secs: num_field(code, &fields, 1)?,
            dst_secs: num_field(code, &fields, 2)?,
        }),
        6 => Ok(Command::SetBaudRate(num_field(code, &fields, 1)?)),
        7 => Ok(Command::RemoveRepeated(frame_fields(code, &fields)?)),
        other => Err(CommandError::UnknownCode(other)),
    }
}

fn field<'a>(code: u8, fields: &[&'a str], index: usize) -> Result<&'a str, CommandError> {
    fields
        .get(index)
        .map(|f| f.trim())
        .ok_or(CommandError::MissingField { code, index })
}

fn bool_field(code: u8, fields: &[&str], index: usize) -> Result<bool, CommandError> {
    Ok(field(code, fields, index)? == "true")
}

fn num_field<T: std::str::FromStr>(
    code: u8,
    fields: &[&str],
    index: usize,
) -> Result<T, CommandError> {
    let raw = field(code, fields, index)?;
    raw.parse().map_err(|_| CommandError::BadNumber {
        code,
        index,
        value: raw.to_string(),
    })
}

/// Parse fields 1..=8 as the hex bytes of a request frame.
fn frame_fields(code: u8, fields: &[&str]) -> Result<Frame, CommandError> {
    let mut bytes = [0u8; Frame::LEN];
    for (i, b) in bytes.iter_mut().enumerate() {
        let index = i + 1;
        let raw = field(code, fields, index)?;
        *b = u8::from_str_radix(raw, 16).map_err(|_| CommandError::BadHexByte {
            code,
            index,
            value: raw.to_string(),
        })?;
    }
    Ok(Frame::new(bytes))
}
