//! # Buslogger - Remote RS-485 Environmental Data Logger
//!
//! Buslogger polls sensor peers on a shared half-duplex RS-485 bus, decodes their
//! replies, and forwards readings to an MQTT telemetry backend. The polling
//! schedule and device settings are reconfigurable at runtime over a dedicated
//! MQTT control topic and survive restarts in an embedded key-value store.
//!
//! ## Features
//!
//! - **Round-Robin Bus Polling**: One fixed 8-byte request frame per poll tick,
//!   with a fixed turnaround wait before the reply is decoded.
//! - **Resilient Uplink**: Two cascaded connection tiers (broker reachability,
//!   then the MQTT session) with bounded retries and a long-cooldown circuit
//!   breaker, so a dead broker never causes a reconnect storm.
//! - **Remote Reconfiguration**: A compact `+`-delimited command protocol on the
//!   control topic mutates the polling queue and persisted settings live.
//! - **Durable Settings**: Output format, poll period, baud rate, timezone
//!   offsets, and the repeated request list persist across restarts in sled.
//! - **Async Design**: Built with Tokio; the bus, the uplink, and the control
//!   path each run as a single-owner task talking over channels.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use buslogger::config::Config;
//! use buslogger::logger::LoggerServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let server = LoggerServer::new(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`bus`] - Bus scheduler, reply decoder, and serial port access
//! - [`uplink`] - Connection state machines and the MQTT uplink task
//! - [`command`] - Remote configuration command protocol
//! - [`persist`] - Runtime settings persistence (sled)
//! - [`readlog`] - Durable reading log written alongside telemetry
//! - [`config`] - Static configuration management and validation
//! - [`logger`] - Composition root wiring the tasks together

pub mod bus;
pub mod command;
pub mod config;
pub mod logger;
pub mod logutil;
pub mod persist;
pub mod readlog;
pub mod uplink;
