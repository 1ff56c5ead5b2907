//! # Uplink Module - Broker Connectivity and Telemetry
//!
//! The uplink runs as one task owning two cascaded connection tiers:
//!
//! 1. **Link** - is the broker host reachable at all (TCP probe)? On wireless
//!    deployments this is what catches a dropped association; the session tier
//!    is never attempted while the link is down.
//! 2. **Session** - the authenticated MQTT connection. Established sessions
//!    subscribe to the control topic; keep-alive pings are the transport's
//!    job and happen as a side effect of polling the event loop.
//!
//! Each tier retries on a fixed backoff up to a budget of
//! [`RetryPolicy::DEFAULT_BUDGET`] consecutive failures, then trips a circuit
//! breaker for a one-hour cooldown. After the cooldown the whole chain
//! re-establishes from the link tier up, so a broker outage self-heals without
//! hammering it in the meantime.
//!
//! Decoded readings arrive over the handle and publish to
//! `{username}/{zone}/{peer address}`: one CSV message in structured mode, or
//! one message per value with a letter suffix (`/a`, `/b`, ...) in segmented
//! mode. Readings that arrive while disconnected are dropped; the reading log
//! is the durable path.

use std::io;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration, Transport,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep_until;

use crate::bus::DecodedReading;
use crate::config::MqttConfig;
use crate::logutil::escape_log;

pub mod state;

pub use state::{ConnMachine, ConnState, FailureOutcome, RetryPolicy};

/// Backoff between link probes.
const LINK_BACKOFF: Duration = Duration::from_millis(500);
/// Backoff between MQTT session attempts.
const SESSION_BACKOFF: Duration = Duration::from_secs(5);
/// Circuit-breaker cooldown once a tier's retry budget is spent.
const GIVEUP_COOLDOWN: Duration = Duration::from_secs(3600);
/// Cadence of the deadline check while the circuit is open.
const COOLDOWN_CHECK: Duration = Duration::from_secs(60);
/// Per-attempt budget for the TCP reachability probe.
const LINK_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands accepted by the uplink task.
pub enum UplinkCommand {
    /// Publish a decoded reading (dropped when disconnected).
    Publish(DecodedReading),
    /// Switch between CSV and segmented telemetry, effective immediately.
    SetCsvOutput(bool),
    Shutdown,
}

/// Cloneable handle to the uplink task.
#[derive(Clone)]
pub struct UplinkHandle {
    tx: mpsc::UnboundedSender<UplinkCommand>,
}

impl UplinkHandle {
    pub fn publish(&self, reading: DecodedReading) {
        let _ = self.tx.send(UplinkCommand::Publish(reading));
    }

    pub fn set_csv_output(&self, on: bool) {
        let _ = self.tx.send(UplinkCommand::SetCsvOutput(on));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(UplinkCommand::Shutdown);
    }

    /// A handle wired to a bare channel instead of a running task. Lets tests
    /// and one-shot tools observe what would have been sent.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<UplinkCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

/// Spawn the uplink task. Inbound control payloads are forwarded on
/// `control_tx` verbatim; parsing happens in the control path, not here.
pub fn start_uplink(
    cfg: MqttConfig,
    csv_output: bool,
    control_tx: mpsc::UnboundedSender<String>,
) -> UplinkHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(cfg, csv_output, rx, control_tx));
    UplinkHandle { tx }
}

async fn run(
    cfg: MqttConfig,
    mut csv: bool,
    mut rx: mpsc::UnboundedReceiver<UplinkCommand>,
    control_tx: mpsc::UnboundedSender<String>,
) {
    let mut link = ConnMachine::new("link", RetryPolicy::new(LINK_BACKOFF, GIVEUP_COOLDOWN));
    let mut session = ConnMachine::new(
        "session",
        RetryPolicy::new(SESSION_BACKOFF, GIVEUP_COOLDOWN),
    );
    let mut conn: Option<(AsyncClient, EventLoop)> = None;

    loop {
        if link.is_given_up() || session.is_given_up() {
            if !idle_wait(&mut rx, &mut csv, COOLDOWN_CHECK).await {
                return;
            }
            let now = Instant::now();
            if link.cooldown_over(now) {
                info!("[LINK] cooldown elapsed, probing again");
            }
            if session.cooldown_over(now) {
                info!("[MQTT] cooldown elapsed, reconnecting");
                // Re-establish from the link tier up, as after a fresh boot.
                link.connection_lost();
                conn = None;
            }
            continue;
        }

        if !link.is_connected() {
            match probe_link(&cfg).await {
                Ok(()) => {
                    info!("[LINK] broker {}:{} reachable", cfg.host, cfg.port);
                    link.connected();
                }
                Err(e) => {
                    warn!("[LINK] probe of {}:{} failed: {}", cfg.host, cfg.port, e);
                    match link.attempt_failed(Instant::now()) {
                        FailureOutcome::Retry(backoff) => {
                            if !idle_wait(&mut rx, &mut csv, backoff).await {
                                return;
                            }
                        }
                        FailureOutcome::GaveUp => {
                            error!(
                                "[LINK] unreachable after {} attempts, backing off",
                                RetryPolicy::DEFAULT_BUDGET
                            );
                        }
                    }
                }
            }
            continue;
        }

        if !session.is_connected() {
            if conn.is_none() {
                debug!("[MQTT] connecting to broker");
                conn = Some(make_client(&cfg));
            }
            let mut drop_conn = false;
            if let Some((client, eventloop)) = conn.as_mut() {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("[MQTT] connected to broker");
                        session.connected();
                        match client
                            .subscribe(cfg.control_topic.as_str(), QoS::AtMostOnce)
                            .await
                        {
                            Ok(()) => info!("[MQTT] subscribed to {}", cfg.control_topic),
                            Err(e) => {
                                warn!("[MQTT] control subscribe failed: {}", e);
                                session.connection_lost();
                            }
                        }
                    }
                    // Handshake traffic before the ConnAck; keep polling.
                    Ok(_) => {}
                    Err(e) => {
                        warn!("[MQTT] connect failed: {}", e);
                        match session.attempt_failed(Instant::now()) {
                            FailureOutcome::Retry(backoff) => {
                                if !idle_wait(&mut rx, &mut csv, backoff).await {
                                    return;
                                }
                            }
                            FailureOutcome::GaveUp => {
                                error!(
                                    "[MQTT] broker refused {} attempts, backing off",
                                    RetryPolicy::DEFAULT_BUDGET
                                );
                                drop_conn = true;
                            }
                        }
                    }
                }
            }
            if drop_conn {
                conn = None;
            }
            continue;
        }

        // Both tiers up: serve the event loop and the command channel. Polling
        // the loop is also what keeps the keep-alive pings flowing.
        let (client, eventloop) = match conn.as_mut() {
            Some(pair) => pair,
            None => {
                session.connection_lost();
                continue;
            }
        };
        tokio::select! {
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let payload = String::from_utf8_lossy(&publish.payload).to_string();
                    if publish.topic == cfg.control_topic {
                        debug!("[MQTT] control message: {}", escape_log(&payload));
                        let _ = control_tx.send(payload);
                    } else {
                        debug!(
                            "[MQTT] downlink on unexpected topic {}: {}",
                            publish.topic,
                            escape_log(&payload)
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("[MQTT] connection lost: {}", e);
                    session.connection_lost();
                    // Re-verify reachability before redialing the broker.
                    link.connection_lost();
                }
            },
            cmd = rx.recv() => match cmd {
                Some(UplinkCommand::Publish(reading)) => {
                    publish_reading(client, &cfg, csv, &reading).await;
                }
                Some(UplinkCommand::SetCsvOutput(on)) => {
                    csv = on;
                    info!("[MQTT] csv output set to {}", on);
                }
                Some(UplinkCommand::Shutdown) | None => {
                    let _ = client.disconnect().await;
                    return;
                }
            },
        }
    }
}

/// Wait out a backoff or cooldown slice while still serving the command
/// channel. Readings are dropped while disconnected. Returns false on
/// shutdown.
async fn idle_wait(
    rx: &mut mpsc::UnboundedReceiver<UplinkCommand>,
    csv: &mut bool,
    wait: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => return true,
            cmd = rx.recv() => match cmd {
                Some(UplinkCommand::Publish(reading)) => {
                    debug!("[MQTT] not connected, dropping reading from {}", reading.addr);
                }
                Some(UplinkCommand::SetCsvOutput(on)) => *csv = on,
                Some(UplinkCommand::Shutdown) | None => return false,
            },
        }
    }
}

fn make_client(cfg: &MqttConfig) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
    opts.set_credentials(cfg.username.clone(), cfg.password.clone());
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(5)));
    if let Some(path) = &cfg.ca_cert {
        match std::fs::read(path) {
            Ok(ca) => {
                opts.set_transport(Transport::Tls(TlsConfiguration::Simple {
                    ca,
                    alpn: None,
                    client_auth: None,
                }));
            }
            Err(e) => warn!("[MQTT] cannot read CA certificate {}: {}", path, e),
        }
    }
    AsyncClient::new(opts, 16)
}

async fn probe_link(cfg: &MqttConfig) -> io::Result<()> {
    match tokio::time::timeout(
        LINK_PROBE_TIMEOUT,
        TcpStream::connect((cfg.host.as_str(), cfg.port)),
    )
    .await
    {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "probe timed out")),
    }
}

/// Base telemetry topic for one peer.
fn telemetry_topic(cfg: &MqttConfig, addr: u8) -> String {
    format!("{}/{}/{}", cfg.username, cfg.zone, addr)
}

/// Letter suffix for segmented publishes: `a`, `b`, `c`, ...
fn segment_suffix(index: usize) -> char {
    (b'a' + (index % 26) as u8) as char
}

async fn publish_reading(
    client: &AsyncClient,
    cfg: &MqttConfig,
    csv: bool,
    reading: &DecodedReading,
) {
    let base = telemetry_topic(cfg, reading.addr);
    if csv {
        let body = reading.render();
        match client
            .publish(base.as_str(), QoS::AtMostOnce, false, body.as_str())
            .await
        {
            Ok(()) => debug!("[MQTT] publish {} <- {}", base, body),
            Err(e) => warn!("[MQTT] publish to {} failed: {}", base, e),
        }
    } else {
        for (i, value) in reading.values.iter().enumerate() {
            let topic = format!("{}/{}", base, segment_suffix(i));
            let body = value.to_string();
            match client
                .publish(topic.as_str(), QoS::AtMostOnce, false, body.as_str())
                .await
            {
                Ok(()) => debug!("[MQTT] publish {} <- {}", topic, body),
                Err(e) => warn!("[MQTT] publish to {} failed: {}", topic, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> MqttConfig {
        MqttConfig {
            host: "broker.example.net".to_string(),
            port: 8883,
            username: "logger".to_string(),
            password: "secret".to_string(),
            client_id: "buslogger".to_string(),
            zone: "greenhouse".to_string(),
            control_topic: "logger/greenhouse/config".to_string(),
            keep_alive_secs: 30,
            ca_cert: None,
        }
    }

    #[test]
    fn telemetry_topic_is_user_zone_addr() {
        assert_eq!(telemetry_topic(&cfg(), 7), "logger/greenhouse/7");
    }

    #[test]
    fn segment_suffixes_are_letters() {
        assert_eq!(segment_suffix(0), 'a');
        assert_eq!(segment_suffix(2), 'c');
        assert_eq!(segment_suffix(25), 'z');
        assert_eq!(segment_suffix(26), 'a');
    }

    #[tokio::test]
    async fn detached_handle_carries_commands() {
        let (handle, mut rx) = UplinkHandle::detached();
        handle.set_csv_output(false);
        handle.publish(DecodedReading {
            addr: 1,
            values: vec![],
        });
        assert!(matches!(
            rx.recv().await,
            Some(UplinkCommand::SetCsvOutput(false))
        ));
        assert!(matches!(rx.recv().await, Some(UplinkCommand::Publish(_))));
    }

    #[tokio::test]
    async fn idle_wait_serves_commands_and_shutdown() {
        let (handle, mut rx) = UplinkHandle::detached();
        let mut csv = true;
        handle.set_csv_output(false);
        handle.shutdown();
        let alive = idle_wait(&mut rx, &mut csv, Duration::from_secs(30)).await;
        assert!(!alive);
        assert!(!csv);
    }
}
