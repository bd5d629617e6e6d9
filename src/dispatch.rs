//! Per-registration serial delivery of notifications.
//!
//! Every registration owns one [`DispatchQueue`]: an unbounded channel drained
//! by a dedicated worker thread. Callbacks for one registration never overlap;
//! callbacks for distinct registrations run concurrently. A panic inside a
//! client callback is caught and logged, it must never take the worker down.

use crate::event::ChangeNotification;
use crate::normalize;
use crate::registry;
use crate::state::ChangeState;
use crate::{unbounded, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

type Job = Box<dyn FnOnce() + Send>;

pub(crate) struct DispatchQueue {
    tx: Sender<Job>,
}

impl DispatchQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded::<Job>();
        // The worker is detached on purpose: it exits when the owning state drops the sender,
        // and joining from a callback context would deadlock.
        let _ = thread::Builder::new()
            .name("dirwatch dispatch".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        log::error!("panic in change callback (ignored)");
                    }
                }
            });
        Self { tx }
    }

    pub(crate) fn submit(&self, job: Job) {
        let _ = self.tx.send(job);
    }
}

/// Queues one normalized batch for client delivery.
///
/// The job resolves the registration id through the table (a stopped monitor delivers
/// nothing), stores the batch's last event id *before* calling out so the client can archive a
/// token mid-callback, runs the rename pairing pass, and on a canceling batch removes the
/// registration once the client has seen its final notification.
pub(crate) fn dispatch_batch(
    state: &Arc<ChangeState>,
    mut notes: Vec<ChangeNotification>,
    last_id: u64,
    cancel: bool,
) {
    if notes.is_empty() {
        return;
    }
    let regid = state.regid();
    state.queue().submit(Box::new(move || {
        if let Some(ss) = registry::find(regid) {
            if last_id > 0 {
                // 0 is reserved for root-changed events and must not escape into tokens.
                ss.store_last_event_id(last_id);
            }
            if cancel {
                ss.set_canceled();
            }
            normalize::process_renames(&mut notes);
            ss.invoke_callback(notes);
            if cancel {
                registry::remove(regid);
            }
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn jobs_run_in_submission_order() {
        let queue = DispatchQueue::new();
        let seen = Arc::new(AtomicUsize::new(0));
        for i in 0..16 {
            let seen = seen.clone();
            queue.submit(Box::new(move || {
                // Only advances when jobs arrive strictly in order.
                let _ = seen.compare_exchange(i, i + 1, Ordering::SeqCst, Ordering::SeqCst);
            }));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while seen.load(Ordering::SeqCst) != 16 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn a_panicking_job_does_not_kill_the_worker() {
        let queue = DispatchQueue::new();
        queue.submit(Box::new(|| panic!("client bug")));
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        queue.submit(Box::new(move || {
            s.store(1, Ordering::SeqCst);
        }));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while seen.load(Ordering::SeqCst) != 1 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
