#![allow(dead_code)]

use dirwatch::ChangeNotification;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Collects delivered batches until `pred` holds over everything received, or the timeout
/// expires. Native backends batch and coalesce, so assertions should scan the collected
/// notifications rather than expect exact sequences.
pub fn recv_until(
    rx: &Receiver<Vec<ChangeNotification>>,
    timeout: Duration,
    pred: impl Fn(&[ChangeNotification]) -> bool,
) -> Vec<ChangeNotification> {
    let deadline = Instant::now() + timeout;
    let mut notes = Vec::new();
    while !pred(&notes) && Instant::now() < deadline {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(batch) => notes.extend(batch),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    notes
}

/// Drains anything still arriving within `window`; used to assert silence after a cancel.
pub fn drain_for(
    rx: &Receiver<Vec<ChangeNotification>>,
    window: Duration,
) -> Vec<ChangeNotification> {
    let deadline = Instant::now() + window;
    let mut notes = Vec::new();
    while Instant::now() < deadline {
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(batch) => notes.extend(batch),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    notes
}

/// Polls `cond` until it holds or the timeout expires.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}
