//! # Bus Module - Half-Duplex Polling Scheduler
//!
//! This module owns everything that touches the RS-485 bus: the repeated
//! request queue, the one-time override slot, the transmit/turnaround/decode
//! cycle, and the serial port itself.
//!
//! ## Polling Model
//!
//! The bus is half duplex with a single transceiver, so transmissions never
//! overlap. A periodic tick sends the request at the queue cursor, waits a
//! fixed turnaround interval for the peer to answer, drains whatever arrived,
//! and decodes it into a [`DecodedReading`] that is forwarded to the telemetry
//! fan-out. The cursor advances round-robin: increment after each transmit,
//! wrap modulo the queue length. Any removal resets the cursor to the front so
//! it can never point past the end.
//!
//! One-time requests (typically configuration writes to a peer) are sent after
//! the repeated cycle, or immediately when the bus is idle. Their replies are
//! decoded for the debug log but never forwarded downstream.
//!
//! ## Ownership
//!
//! [`BusScheduler`] is owned by a single task started with [`start_poller`];
//! everything else talks to it through a cloneable [`SchedulerHandle`]. Queue
//! state is never shared directly.

use std::fmt;
use std::io;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

pub mod decode;
pub mod port;

pub use decode::{decode_reply, DecodedReading, ReadingValue};
pub use port::{BusPort, SerialBus};

/// Floor for the poll period; a zero interval would spin the bus task.
const MIN_POLL_PERIOD: Duration = Duration::from_millis(1);

/// A fixed 8-byte request frame addressed to a bus peer.
///
/// The payload layout (function code, register, count, checksum) is the peers'
/// convention; the logger treats the frame as opaque apart from the
/// destination address in byte 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame([u8; 8]);

impl Frame {
    pub const LEN: usize = 8;

    pub fn new(bytes: [u8; 8]) -> Self {
        Frame(bytes)
    }

    /// Destination peer address (byte 0).
    pub fn addr(&self) -> u8 {
        self.0[0]
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Parse a frame from 16 contiguous hex digits, e.g. `"01030000000305CB"`.
    pub fn from_hex(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() != Self::LEN * 2 || !s.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 8];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Frame(bytes))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

/// Round-robin bus poller. One transmit/receive cycle per tick.
pub struct BusScheduler {
    queue: Vec<Frame>,
    cursor: usize,
    onetime: Option<Frame>,
    busy: bool,
    port: Box<dyn BusPort>,
    turnaround: Duration,
    readings: mpsc::UnboundedSender<DecodedReading>,
}

impl BusScheduler {
    pub fn new(
        port: Box<dyn BusPort>,
        turnaround: Duration,
        readings: mpsc::UnboundedSender<DecodedReading>,
    ) -> Self {
        Self {
            queue: Vec::new(),
            cursor: 0,
            onetime: None,
            busy: false,
            port,
            turnaround,
            readings,
        }
    }

    /// Append a frame to the repeated polling queue. Returns its 1-based
    /// position, which matches the ordinal used by the settings store.
    pub fn enqueue_repeated(&mut self, frame: Frame) -> usize {
        self.queue.push(frame);
        debug!("[BUS] repeated request {} queued at {}", frame, self.queue.len());
        self.queue.len()
    }

    /// Remove the first exact match from the repeated queue. The cursor is
    /// reset to the front on removal so it stays inside the shrunk queue.
    pub fn remove_repeated(&mut self, frame: &Frame) -> bool {
        match self.queue.iter().position(|f| f == frame) {
            Some(pos) => {
                self.queue.remove(pos);
                self.cursor = 0;
                true
            }
            None => false,
        }
    }

    /// Send a non-repeated frame. When the bus is idle it goes out right away;
    /// mid-cycle it is armed and sent at the end of the next tick. Either way
    /// its reply is never forwarded downstream.
    pub async fn submit_onetime(&mut self, frame: Frame) {
        if self.busy {
            if self.onetime.is_some() {
                warn!("[BUS] replacing an armed one-time request");
            }
            self.onetime = Some(frame);
            return;
        }
        self.busy = true;
        self.cycle(frame, false).await;
        self.busy = false;
    }

    /// Run at most one full transmit/receive cycle plus a pending one-time.
    /// No-op while a cycle is already in flight or when there is nothing to do.
    pub async fn tick(&mut self) {
        if self.busy {
            return;
        }
        self.busy = true;

        if !self.queue.is_empty() {
            let frame = self.queue[self.cursor];
            self.cursor = (self.cursor + 1) % self.queue.len();
            self.cycle(frame, true).await;
        }

        if let Some(frame) = self.onetime.take() {
            self.cycle(frame, false).await;
        }

        self.busy = false;
    }

    /// Transmit one frame, wait the bus turnaround, then decode whatever the
    /// peer sent back. Replies shorter than a decodable header are dropped;
    /// the receive side is drained regardless.
    async fn cycle(&mut self, frame: Frame, forward: bool) {
        if let Err(e) = self.port.transmit(&frame) {
            warn!("[BUS] transmit {} failed: {}", frame, e);
            return;
        }
        sleep(self.turnaround).await;

        let mut reply = Vec::new();
        if let Err(e) = self.port.drain(&mut reply) {
            warn!("[BUS] reply drain failed: {}", e);
            return;
        }

        match decode_reply(&reply) {
            Some(reading) => {
                debug!("[BUS] {} -> {}", reading.addr, reading.render());
                if forward {
                    let _ = self.readings.send(reading);
                }
            }
            None if reply.is_empty() => debug!("[BUS] no reply from {}", frame.addr()),
            None => debug!("[BUS] undecodable reply ({} bytes) from {}", reply.len(), frame.addr()),
        }
    }

    #[cfg(test)]
    fn force_busy(&mut self, busy: bool) {
        self.busy = busy;
    }

    #[cfg(test)]
    fn queue_len(&self) -> usize {
        self.queue.len()
    }
}

/// Commands accepted by the poller task.
pub enum BusCommand {
    EnqueueRepeated(Frame),
    RemoveRepeated(Frame, oneshot::Sender<bool>),
    SubmitOnetime(Frame),
    SetPeriod(Duration),
    Rebind(u32),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to the poller task.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<BusCommand>,
}

impl SchedulerHandle {
    pub fn enqueue_repeated(&self, frame: Frame) {
        let _ = self.tx.send(BusCommand::EnqueueRepeated(frame));
    }

    /// Remove the first exact match; resolves to whether one was found.
    pub async fn remove_repeated(&self, frame: Frame) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(BusCommand::RemoveRepeated(frame, tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn submit_onetime(&self, frame: Frame) {
        let _ = self.tx.send(BusCommand::SubmitOnetime(frame));
    }

    pub fn set_period(&self, period: Duration) {
        let _ = self.tx.send(BusCommand::SetPeriod(period));
    }

    pub fn rebind(&self, baud: u32) {
        let _ = self.tx.send(BusCommand::Rebind(baud));
    }

    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.tx.send(BusCommand::Shutdown(tx));
        let _ = rx.await;
    }
}

/// Spawn the poller task. Commands interleave with poll ticks only at tick
/// boundaries; a cycle in flight is never interrupted.
pub fn start_poller(mut sched: BusScheduler, period: Duration) -> SchedulerHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<BusCommand>();
    let handle = SchedulerHandle { tx };

    tokio::spawn(async move {
        let mut period = period.max(MIN_POLL_PERIOD);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(BusCommand::EnqueueRepeated(frame)) => {
                            sched.enqueue_repeated(frame);
                        }
                        Some(BusCommand::RemoveRepeated(frame, resp)) => {
                            let _ = resp.send(sched.remove_repeated(&frame));
                        }
                        Some(BusCommand::SubmitOnetime(frame)) => {
                            sched.submit_onetime(frame).await;
                        }
                        Some(BusCommand::SetPeriod(new_period)) => {
                            period = new_period.max(MIN_POLL_PERIOD);
                            if new_period < MIN_POLL_PERIOD {
                                warn!("[BUS] poll period clamped to {:?}", period);
                            }
                            ticker = tokio::time::interval(period);
                            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                            info!("[BUS] poll period set to {:?}", period);
                        }
                        Some(BusCommand::Rebind(baud)) => {
                            match sched.port.rebind(baud) {
                                Ok(()) => info!("[BUS] serial rebound @ {} baud", baud),
                                Err(e) => warn!("[BUS] serial rebind failed: {}", e),
                            }
                        }
                        Some(BusCommand::Shutdown(done)) => {
                            let _ = done.send(());
                            break;
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    sched.tick().await;
                }
            }
        }
        debug!("[BUS] poller task stopped");
    });

    handle
}
