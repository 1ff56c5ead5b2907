//! # Logger Module - Composition Root
//!
//! Wires the pieces into a running daemon: the bus poller task, the uplink
//! task, the reading fan-out (telemetry plus the durable reading log), and the
//! control path that applies remote commands to all of them.

pub mod server;

pub use server::LoggerServer;
