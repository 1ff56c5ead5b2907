//! Control messages end to end: parse, apply, persist, and reach the
//! scheduler and uplink.

mod common;

use std::time::Duration;

use buslogger::bus::{start_poller, BusScheduler, Frame, SchedulerHandle};
use buslogger::command;
use buslogger::logger::server::{apply_command, ControlContext};
use buslogger::persist::Settings;
use buslogger::readlog::ReadingLog;
use buslogger::uplink::{UplinkCommand, UplinkHandle};
use common::MockPort;
use tokio::sync::mpsc;
use tokio::time::sleep;

const THCS_FRAME: [u8; 8] = [0x01, 0x03, 0x00, 0x00, 0x00, 0x03, 0x05, 0xCB];

struct Fixture {
    settings: Settings,
    scheduler: SchedulerHandle,
    uplink: UplinkHandle,
    uplink_rx: mpsc::UnboundedReceiver<UplinkCommand>,
    readlog: ReadingLog,
    sent: std::sync::Arc<std::sync::Mutex<Vec<Frame>>>,
    _dir: tempfile::TempDir,
}

fn fixture(period: Duration) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let settings = Settings::open(dir.path().join("settings")).unwrap();
    let (port, sent, _replies) = MockPort::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let sched = BusScheduler::new(Box::new(port), Duration::from_millis(1), tx);
    let scheduler = start_poller(sched, period);
    let (uplink, uplink_rx) = UplinkHandle::detached();
    let readlog = ReadingLog::new(dir.path().join("readings"), false, 0, 0);
    Fixture {
        settings,
        scheduler,
        uplink,
        uplink_rx,
        readlog,
        sent,
        _dir: dir,
    }
}

async fn apply(fx: &mut Fixture, msg: &str) {
    let cmd = command::parse(msg).expect("well-formed command");
    let mut ctx = ControlContext {
        settings: &fx.settings,
        scheduler: &fx.scheduler,
        uplink: &fx.uplink,
        readlog: &mut fx.readlog,
    };
    apply_command(cmd, &mut ctx).await.expect("command applies");
}

#[tokio::test]
async fn append_persists_and_next_tick_transmits() {
    let mut fx = fixture(Duration::from_millis(10));

    apply(&mut fx, "2+01+03+00+00+00+03+05+CB").await;
    assert_eq!(fx.settings.request_count().unwrap(), 1);
    assert_eq!(
        fx.settings.load_requests().unwrap(),
        vec![Frame::new(THCS_FRAME)]
    );

    sleep(Duration::from_millis(50)).await;
    let sent = fx.sent.lock().unwrap().clone();
    assert!(!sent.is_empty(), "appended request should be polled");
    assert!(sent.iter().all(|f| f.as_bytes() == &THCS_FRAME));
    fx.scheduler.shutdown().await;
}

#[tokio::test]
async fn remove_deletes_queue_entry_and_persisted_count() {
    let mut fx = fixture(Duration::from_secs(60));

    apply(&mut fx, "2+01+03+00+00+00+03+05+CB").await;
    apply(&mut fx, "2+02+03+00+00+00+03+05+CB").await;
    assert_eq!(fx.settings.request_count().unwrap(), 2);

    apply(&mut fx, "7+01+03+00+00+00+03+05+CB").await;
    assert_eq!(fx.settings.request_count().unwrap(), 1);
    assert_eq!(fx.settings.load_requests().unwrap()[0].addr(), 0x02);

    // Removing the same frame again is a miss and mutates nothing.
    apply(&mut fx, "7+01+03+00+00+00+03+05+CB").await;
    assert_eq!(fx.settings.request_count().unwrap(), 1);
    fx.scheduler.shutdown().await;
}

#[tokio::test]
async fn output_format_reaches_uplink_and_persists() {
    let mut fx = fixture(Duration::from_secs(60));

    apply(&mut fx, "0+false").await;
    assert!(!fx.settings.csv_output().unwrap());
    assert!(matches!(
        fx.uplink_rx.recv().await,
        Some(UplinkCommand::SetCsvOutput(false))
    ));
    fx.scheduler.shutdown().await;
}

#[tokio::test]
async fn settings_commands_persist_and_reinit_live_state() {
    let mut fx = fixture(Duration::from_secs(60));

    apply(&mut fx, "1+60").await;
    assert_eq!(fx.settings.poll_period_us().unwrap(), 60_000_000);

    apply(&mut fx, "4+true").await;
    assert!(fx.settings.storage_enabled().unwrap());
    assert!(fx.readlog.enabled());

    apply(&mut fx, "5+-28800+3600").await;
    assert_eq!(fx.settings.gmt_offset_secs().unwrap(), -28800);
    assert_eq!(fx.settings.dst_offset_secs().unwrap(), 3600);

    apply(&mut fx, "6+9600").await;
    assert_eq!(fx.settings.baud_rate().unwrap(), 9600);
    fx.scheduler.shutdown().await;
}

#[tokio::test]
async fn malformed_messages_apply_nothing() {
    let fx = fixture(Duration::from_secs(60));

    for msg in ["", "nope", "9+true", "2+01+03", "2+01+03+00+00+00+03+05+ZZ"] {
        assert!(command::parse(msg).is_err(), "{:?} should not parse", msg);
    }
    assert_eq!(fx.settings.request_count().unwrap(), 0);
    assert!(fx.settings.csv_output().unwrap());
    fx.scheduler.shutdown().await;
}
