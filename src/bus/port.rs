//! Serial access to the RS-485 transceiver.
//!
//! The scheduler talks to the bus through the [`BusPort`] trait so tests can
//! substitute a scripted port. The real implementation wraps a `serialport`
//! handle opened 8N1 with a short read timeout.

use std::io::{self, Read, Write};
use std::time::Duration;

use log::{debug, info};

use super::Frame;

/// Read timeout on the serial handle. Short: replies are collected after the
/// turnaround wait, never awaited byte-by-byte.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Half-duplex bus access used by the scheduler.
pub trait BusPort: Send {
    /// Write one 8-byte request frame onto the bus.
    fn transmit(&mut self, frame: &Frame) -> io::Result<()>;

    /// Drain every byte currently buffered on the receive side into `buf`.
    fn drain(&mut self, buf: &mut Vec<u8>) -> io::Result<()>;

    /// Rebind the port at a new baud rate.
    fn rebind(&mut self, baud: u32) -> io::Result<()>;
}

/// RS-485 transceiver behind a standard serial device node.
pub struct SerialBus {
    path: String,
    port: Box<dyn serialport::SerialPort>,
}

impl SerialBus {
    /// Open `path` at `baud`, 8N1.
    pub fn open(path: &str, baud: u32) -> io::Result<Self> {
        let port = serialport::new(path, baud)
            .timeout(READ_TIMEOUT)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .open()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        info!("[BUS] opened {} @ {} baud", path, baud);
        Ok(Self {
            path: path.to_string(),
            port,
        })
    }
}

impl BusPort for SerialBus {
    fn transmit(&mut self, frame: &Frame) -> io::Result<()> {
        self.port.write_all(frame.as_bytes())?;
        self.port.flush()
    }

    fn drain(&mut self, buf: &mut Vec<u8>) -> io::Result<()> {
        loop {
            let pending = self
                .port
                .bytes_to_read()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            if pending == 0 {
                return Ok(());
            }
            let mut chunk = vec![0u8; pending as usize];
            let n = self.port.read(&mut chunk)?;
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn rebind(&mut self, baud: u32) -> io::Result<()> {
        self.port
            .set_baud_rate(baud)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        debug!("[BUS] {} rebound @ {} baud", self.path, baud);
        Ok(())
    }
}
