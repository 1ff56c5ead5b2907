//! Test utilities & fixtures.
//! Provides a scripted bus port so scheduler flows run without hardware.

use std::io;
use std::sync::{Arc, Mutex};

use buslogger::bus::{BusPort, Frame};

/// Scripted port: records transmitted frames and replays canned replies in
/// submission order.
pub struct MockPort {
    sent: Arc<Mutex<Vec<Frame>>>,
    replies: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockPort {
    #[allow(dead_code)] // Not every test binary uses the full fixture.
    pub fn new() -> (Self, Arc<Mutex<Vec<Frame>>>, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let replies = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                sent: sent.clone(),
                replies: replies.clone(),
            },
            sent,
            replies,
        )
    }
}

impl BusPort for MockPort {
    fn transmit(&mut self, frame: &Frame) -> io::Result<()> {
        self.sent.lock().unwrap().push(*frame);
        Ok(())
    }

    fn drain(&mut self, buf: &mut Vec<u8>) -> io::Result<()> {
        let mut replies = self.replies.lock().unwrap();
        if !replies.is_empty() {
            buf.extend(replies.remove(0));
        }
        Ok(())
    }

    fn rebind(&mut self, _baud: u32) -> io::Result<()> {
        Ok(())
    }
}
