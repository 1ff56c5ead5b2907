//! Daemon assembly and the control path.
//!
//! `LoggerServer` owns the channels between the three tasks and runs the
//! fan-out loop: readings from the bus go to both the uplink and the reading
//! log, and control payloads from the uplink are parsed and applied here.
//! Command effects always persist before they touch live state, so a failed
//! write never leaves the queue and the settings store disagreeing.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::sync::mpsc;

use crate::bus::{self, BusScheduler, DecodedReading, SchedulerHandle, SerialBus};
use crate::command::{self, Command};
use crate::config::Config;
use crate::logutil::escape_log;
use crate::persist::{PersistError, Settings};
use crate::readlog::ReadingLog;
use crate::uplink::{self, UplinkHandle};

/// Everything a control command may touch.
pub struct ControlContext<'a> {
    pub settings: &'a Settings,
    pub scheduler: &'a SchedulerHandle,
    pub uplink: &'a UplinkHandle,
    pub readlog: &'a mut ReadingLog,
}

/// The assembled daemon.
pub struct LoggerServer {
    settings: Settings,
    scheduler: SchedulerHandle,
    uplink: UplinkHandle,
    readlog: ReadingLog,
    readings_rx: mpsc::UnboundedReceiver<DecodedReading>,
    control_rx: mpsc::UnboundedReceiver<String>,
}

impl LoggerServer {
    /// Open persistence and the serial port, restore the polling queue, and
    /// start the bus and uplink tasks.
    pub async fn new(config: Config) -> Result<Self> {
        let data_dir = Path::new(&config.storage.data_dir);
        let settings = Settings::open(data_dir.join("settings"))
            .context("cannot open settings store")?;

        let baud = settings.baud_rate()?;
        let port = SerialBus::open(&config.bus.port, baud)
            .with_context(|| format!("cannot open bus port {}", config.bus.port))?;

        let (readings_tx, readings_rx) = mpsc::unbounded_channel();
        let mut sched = BusScheduler::new(
            Box::new(port),
            Duration::from_millis(config.bus.turnaround_ms),
            readings_tx,
        );
        let restored = settings.load_requests()?;
        info!("restoring {} repeated bus request(s)", restored.len());
        for frame in restored {
            sched.enqueue_repeated(frame);
        }
        let period = Duration::from_micros(settings.poll_period_us()?);
        let scheduler = bus::start_poller(sched, period);

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let uplink = uplink::start_uplink(config.mqtt.clone(), settings.csv_output()?, control_tx);

        let readlog = ReadingLog::new(
            data_dir.join("readings"),
            settings.storage_enabled()?,
            settings.gmt_offset_secs()?,
            settings.dst_offset_secs()?,
        );

        Ok(Self {
            settings,
            scheduler,
            uplink,
            readlog,
            readings_rx,
            control_rx,
        })
    }

    /// Run until interrupted. Readings fan out to telemetry and the reading
    /// log; control payloads are parsed and applied between readings.
    pub async fn run(mut self) -> Result<()> {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                Some(reading) = self.readings_rx.recv() => {
                    self.uplink.publish(reading.clone());
                    if let Err(e) = self.readlog.append(&reading).await {
                        warn!("reading log write failed: {}", e);
                    }
                }
                Some(payload) = self.control_rx.recv() => {
                    self.handle_control(&payload).await;
                }
                _ = &mut ctrl_c => {
                    info!("interrupt received, shutting down");
                    break;
                }
            }
        }

        self.scheduler.shutdown().await;
        self.uplink.shutdown();
        Ok(())
    }

    async fn handle_control(&mut self, payload: &str) {
        match command::parse(payload) {
            Ok(cmd) => {
                let mut ctx = ControlContext {
                    settings: &self.settings,
                    scheduler: &self.scheduler,
                    uplink: &self.uplink,
                    readlog: &mut self.readlog,
                };
                if let Err(e) = apply_command(cmd, &mut ctx).await {
                    warn!("[CTRL] command not applied: {}", e);
                }
            }
            Err(e) => {
                warn!("[CTRL] dropping malformed command {:?}: {}", escape_log(payload), e);
            }
        }
    }
}

/// Apply one parsed control command. Persists first, then updates live state,
/// so a persistence failure applies nothing.
pub async fn apply_command(cmd: Command, ctx: &mut ControlContext<'_>) -> Result<(), PersistError> {
    match cmd {
        Command::SetCsvOutput(on) => {
            ctx.settings.set_csv_output(on)?;
            ctx.uplink.set_csv_output(on);
            info!("[CTRL] csv output set to {}", on);
        }
        Command::SetPollPeriod { micros } => {
            ctx.settings.set_poll_period_us(micros)?;
            ctx.scheduler.set_period(Duration::from_micros(micros));
            info!("[CTRL] poll period set to {} us", micros);
        }
        Command::AddRepeated(frame) => {
            let ordinal = ctx.settings.append_request(&frame)?;
            ctx.scheduler.enqueue_repeated(frame);
            info!("[CTRL] added repeated request msg{}: {}", ordinal, frame);
        }
        Command::SendOnetime(frame) => {
            ctx.scheduler.submit_onetime(frame);
            info!("[CTRL] one-time request {} submitted", frame);
        }
        Command::SetStorageEnabled(on) => {
            ctx.settings.set_storage_enabled(on)?;
            ctx.readlog.set_enabled(on);
            info!(
                "[CTRL] reading log {}",
                if on { "enabled" } else { "disabled" }
            );
        }
        Command::SetTimezone { gmt_secs, dst_secs } => {
            ctx.settings.set_timezone(gmt_secs, dst_secs)?;
            ctx.readlog.set_timezone(gmt_secs, dst_secs);
            info!("[CTRL] timezone set to gmt {}s dst {}s", gmt_secs, dst_secs);
        }
        Command::SetBaudRate(baud) => {
            ctx.settings.set_baud_rate(baud)?;
            ctx.scheduler.rebind(baud);
            info!("[CTRL] bus baud rate set to {}", baud);
        }
        Command::RemoveRepeated(frame) => {
            if ctx.scheduler.remove_repeated(frame).await {
                ctx.settings.remove_request(&frame)?;
                info!("[CTRL] match found, removed {}", frame);
            } else {
                info!("[CTRL] no matching repeated request for {}", frame);
            }
        }
    }
    Ok(())
}
