//! Persistence across a simulated restart: close the store, reopen it at the
//! same path, and check everything comes back.

use buslogger::bus::Frame;
use buslogger::persist::{Settings, DEFAULT_BAUD, DEFAULT_PERIOD_US};

fn frame(first: u8) -> Frame {
    Frame::new([first, 0x03, 0x00, 0x00, 0x00, 0x03, 0x05, 0xCB])
}

#[test]
fn request_list_survives_restart_in_order() {
    let dir = tempfile::tempdir().unwrap();

    {
        let s = Settings::open(dir.path()).unwrap();
        s.append_request(&frame(0x01)).unwrap();
        s.append_request(&frame(0x05)).unwrap();
        s.append_request(&frame(0x02)).unwrap();
    }

    let s = Settings::open(dir.path()).unwrap();
    assert_eq!(s.request_count().unwrap(), 3);
    assert_eq!(
        s.load_requests().unwrap(),
        vec![frame(0x01), frame(0x05), frame(0x02)]
    );
}

#[test]
fn removal_before_restart_reloads_the_compacted_list() {
    let dir = tempfile::tempdir().unwrap();

    {
        let s = Settings::open(dir.path()).unwrap();
        s.append_request(&frame(0x01)).unwrap();
        s.append_request(&frame(0x05)).unwrap();
        s.append_request(&frame(0x02)).unwrap();
        assert!(s.remove_request(&frame(0x05)).unwrap());
    }

    let s = Settings::open(dir.path()).unwrap();
    assert_eq!(s.request_count().unwrap(), 2);
    assert_eq!(s.load_requests().unwrap(), vec![frame(0x01), frame(0x02)]);
}

#[test]
fn scalar_settings_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let s = Settings::open(dir.path()).unwrap();
        assert_eq!(s.poll_period_us().unwrap(), DEFAULT_PERIOD_US);
        assert_eq!(s.baud_rate().unwrap(), DEFAULT_BAUD);
        s.set_csv_output(false).unwrap();
        s.set_poll_period_us(30_000_000).unwrap();
        s.set_storage_enabled(true).unwrap();
        s.set_timezone(7200, 3600).unwrap();
        s.set_baud_rate(19200).unwrap();
    }

    let s = Settings::open(dir.path()).unwrap();
    assert!(!s.csv_output().unwrap());
    assert_eq!(s.poll_period_us().unwrap(), 30_000_000);
    assert!(s.storage_enabled().unwrap());
    assert_eq!(s.gmt_offset_secs().unwrap(), 7200);
    assert_eq!(s.dst_offset_secs().unwrap(), 3600);
    assert_eq!(s.baud_rate().unwrap(), 19200);
}
