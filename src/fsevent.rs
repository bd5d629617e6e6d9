//! Monitor backend for Darwin's FSEvents API.
//!
//! FSEvents demands a run loop, so a single lazily-started worker thread owns
//! one for the whole process. Every platform call that needs run-loop
//! affinity is shipped to that thread as a closure through a run-loop source
//! and awaited with a one-shot channel; stream callbacks fire on the same
//! thread and hand their batches to the per-registration dispatch queues.
//!
//! FSEvents natively provides everything the uniform model wants: per-device
//! UUIDs, persistent monotonic event ids (which make resume and replay real
//! here, not emulated), kernel-side latency coalescing and root watching.

#![allow(non_upper_case_globals, non_snake_case)]

use crate::config::ChangeConfig;
use crate::dispatch;
use crate::error::{Error, ErrorKind, Result};
use crate::normalize::{self, RawEvent, RawFlags};
use crate::registry;
use crate::state::ChangeState;
use crate::{bounded, unbounded, Receiver, Sender};
use fsevent_sys::core_foundation as cf;
use fsevent_sys::fsevent as fs;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_uchar, c_void};
use std::os::unix::ffi::OsStrExt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

const kCFStringEncodingUTF8: u32 = 0x0800_0100;

type CFRunLoopSourceRef = cf::CFRef;

#[repr(C)]
struct CFRunLoopSourceContext {
    version: cf::CFIndex,
    info: *mut c_void,
    retain: cf::CFRef,
    release: cf::CFRef,
    copyDescription: cf::CFRef,
    equal: cf::CFRef,
    hash: cf::CFRef,
    schedule: cf::CFRef,
    cancel: cf::CFRef,
    perform: extern "C" fn(*mut c_void),
}

// Declared locally where fsevent-sys does not bind them.
#[link(name = "CoreServices", kind = "framework")]
extern "C" {
    fn CFRunLoopSourceCreate(
        allocator: cf::CFRef,
        order: cf::CFIndex,
        context: *const CFRunLoopSourceContext,
    ) -> CFRunLoopSourceRef;
    fn CFRunLoopAddSource(rl: cf::CFRunLoopRef, source: CFRunLoopSourceRef, mode: cf::CFStringRef);
    fn CFRunLoopSourceSignal(source: CFRunLoopSourceRef);
    fn CFRunLoopWakeUp(rl: cf::CFRunLoopRef);
    fn CFStringCreateWithCString(
        allocator: cf::CFRef,
        c_str: *const c_char,
        encoding: u32,
    ) -> cf::CFStringRef;
    fn CFStringGetCString(
        the_string: cf::CFStringRef,
        buffer: *mut c_char,
        buffer_size: cf::CFIndex,
        encoding: u32,
    ) -> c_uchar;
    fn FSEventsCopyUUIDForDevice(dev: libc::dev_t) -> cf::CFRef;
    fn CFUUIDCreateString(allocator: cf::CFRef, uuid: cf::CFRef) -> cf::CFStringRef;
    fn FSEventsGetCurrentEventId() -> fs::FSEventStreamEventId;
}

type Job = Box<dyn FnOnce() + Send>;

struct Reactor {
    runloop: usize,
    source: usize,
    jobs: Sender<Job>,
}

// The refs are only ever used from the worker thread or through thread-safe CF entry points
// (signal and wake-up).
unsafe impl Send for Reactor {}
unsafe impl Sync for Reactor {}

extern "C" fn drain_jobs(info: *mut c_void) {
    let rx = unsafe { &*(info as *const Receiver<Job>) };
    while let Ok(job) = rx.try_recv() {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            log::error!("panic on fsevents worker (ignored)");
        }
    }
}

/// The process-wide run-loop worker. Started on first use, never stopped.
fn reactor() -> &'static Reactor {
    static REACTOR: OnceLock<Reactor> = OnceLock::new();
    REACTOR.get_or_init(|| {
        let (jobs_tx, jobs_rx) = unbounded::<Job>();
        let (ready_tx, ready_rx) = bounded::<(usize, usize)>(1);
        let _ = thread::Builder::new()
            .name("dirwatch fsevents loop".to_string())
            .spawn(move || unsafe {
                // The receiver must outlive the run loop; it is owned by the source context.
                let rx = Box::into_raw(Box::new(jobs_rx));
                let context = CFRunLoopSourceContext {
                    version: 0,
                    info: rx as *mut c_void,
                    retain: cf::NULL,
                    release: cf::NULL,
                    copyDescription: cf::NULL,
                    equal: cf::NULL,
                    hash: cf::NULL,
                    schedule: cf::NULL,
                    cancel: cf::NULL,
                    perform: drain_jobs,
                };
                let source = CFRunLoopSourceCreate(cf::kCFAllocatorDefault, 0, &context);
                let runloop = cf::CFRunLoopGetCurrent();
                CFRunLoopAddSource(runloop, source, cf::kCFRunLoopDefaultMode);
                let _ = ready_tx.send((runloop as usize, source as usize));
                // The jobs source keeps the loop alive for the process lifetime.
                cf::CFRunLoopRun();
            });
        let (runloop, source) = ready_rx
            .recv()
            .expect("fsevents worker failed to start");
        Reactor {
            runloop,
            source,
            jobs: jobs_tx,
        }
    })
}

/// Runs `f` on the run-loop worker and waits for its result.
fn submit<R: Send + 'static>(f: impl FnOnce() -> R + Send + 'static) -> Result<R> {
    let r = reactor();
    let (tx, rx) = bounded(1);
    r.jobs.send(Box::new(move || {
        let _ = tx.send(f());
    }))?;
    unsafe {
        CFRunLoopSourceSignal(r.source as CFRunLoopSourceRef);
        CFRunLoopWakeUp(r.runloop as cf::CFRunLoopRef);
    }
    Ok(rx.recv()?)
}

fn device_of(path: &Path) -> Result<libc::dev_t> {
    let cpath = CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::invalid_argument())?;
    let mut sb: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::lstat(cpath.as_ptr(), &mut sb) } != 0 {
        let err = std::io::Error::last_os_error();
        return Err(if err.kind() == std::io::ErrorKind::NotFound {
            Error::path_not_found().add_path(path.into())
        } else {
            Error::io(err).add_path(path.into())
        });
    }
    Ok(sb.st_dev)
}

pub(crate) fn device_uuid(path: &Path) -> Result<String> {
    let dev = device_of(path)?;
    unsafe {
        let uuid = FSEventsCopyUUIDForDevice(dev);
        if uuid.is_null() {
            // Most likely a read-only volume; it has no event stream to resume.
            return Err(Error::not_supported().add_path(path.into()));
        }
        let uuid_str = CFUUIDCreateString(cf::kCFAllocatorDefault, uuid);
        cf::CFRelease(uuid);
        if uuid_str.is_null() {
            return Err(Error::new(ErrorKind::MonitorCreate));
        }
        let mut buf = [0 as c_char; 64];
        let ok = CFStringGetCString(
            uuid_str,
            buf.as_mut_ptr(),
            buf.len() as cf::CFIndex,
            kCFStringEncodingUTF8,
        );
        cf::CFRelease(uuid_str);
        if ok == 0 {
            return Err(Error::new(ErrorKind::MonitorCreate));
        }
        Ok(CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned())
    }
}

pub(crate) fn current_event_id(_path: &Path, _seed: u64) -> u64 {
    unsafe { FSEventsGetCurrentEventId() }
}

/// Owner of one FSEvents stream. The stream pointer is only dereferenced on the run-loop
/// worker.
pub(crate) struct WatchHandle {
    stream: AtomicUsize,
}

unsafe impl Send for WatchHandle {}
unsafe impl Sync for WatchHandle {}

impl WatchHandle {
    pub(crate) fn stop(&self) {
        let stream = self.stream.swap(0, Ordering::AcqRel);
        if stream == 0 {
            return;
        }
        let _ = submit(move || unsafe {
            let stream = stream as fs::FSEventStreamRef;
            fs::FSEventStreamStop(stream);
            fs::FSEventStreamInvalidate(stream);
            fs::FSEventStreamRelease(stream);
        });
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) fn start(
    state: &Arc<ChangeState>,
    cfg: &ChangeConfig,
    recursive: bool,
) -> Result<WatchHandle> {
    // FSEvents only watches trees; the non-recursive entry point rejects macOS before
    // reaching the backend.
    debug_assert!(recursive);

    let since_when = if state.last_event_id() > 0 {
        state.last_event_id()
    } else {
        fs::kFSEventStreamEventIdSinceNow
    };
    let latency = cfg.notification_latency().as_secs_f64();
    let flags = fs::kFSEventStreamCreateFlagWatchRoot
        | fs::kFSEventStreamCreateFlagFileEvents
        | fs::kFSEventStreamCreateFlagNoDefer
        | cfg.reserved_flags();
    let root = state.root().to_path_buf();
    let regid = state.regid();

    let stream = submit(move || unsafe { create_and_start(&root, regid, since_when, latency, flags) })??;
    Ok(WatchHandle {
        stream: AtomicUsize::new(stream),
    })
}

unsafe fn create_and_start(
    root: &Path,
    regid: usize,
    since_when: fs::FSEventStreamEventId,
    latency: cf::CFTimeInterval,
    flags: fs::FSEventStreamCreateFlags,
) -> Result<usize> {
    let cpath = CString::new(root.as_os_str().as_bytes()).map_err(|_| Error::invalid_argument())?;
    let cf_path = CFStringCreateWithCString(
        cf::kCFAllocatorDefault,
        cpath.as_ptr(),
        kCFStringEncodingUTF8,
    );
    if cf_path.is_null() {
        return Err(Error::new(ErrorKind::MonitorCreate).add_path(root.into()));
    }

    let paths = cf::CFArrayCreateMutable(cf::kCFAllocatorDefault, 0, &cf::kCFTypeArrayCallBacks);
    cf::CFArrayAppendValue(paths, cf_path);
    cf::CFRelease(cf_path);

    let context = fs::FSEventStreamContext {
        version: 0,
        info: regid as *mut c_void,
        retain: None,
        release: None,
        copy_description: None,
    };

    let stream = fs::FSEventStreamCreate(
        cf::kCFAllocatorDefault,
        callback,
        &context,
        paths,
        since_when,
        latency,
        flags,
    );
    cf::CFRelease(paths);
    if stream.is_null() {
        return Err(Error::new(ErrorKind::MonitorCreate).add_path(root.into()));
    }

    fs::FSEventStreamScheduleWithRunLoop(stream, cf::CFRunLoopGetCurrent(), cf::kCFRunLoopDefaultMode);
    if !fs::FSEventStreamStart(stream) {
        fs::FSEventStreamInvalidate(stream);
        fs::FSEventStreamRelease(stream);
        return Err(Error::new(ErrorKind::MonitorStart).add_path(root.into()));
    }

    Ok(stream as usize)
}

extern "C" fn callback(
    stream_ref: fs::FSEventStreamRef,
    info: *mut c_void,
    num_events: libc::size_t,
    event_paths: *mut c_void,
    event_flags: *const fs::FSEventStreamEventFlags,
    event_ids: *const fs::FSEventStreamEventId,
) {
    // Nothing may unwind across the platform boundary.
    let result = catch_unwind(AssertUnwindSafe(|| unsafe {
        callback_impl(stream_ref, info, num_events, event_paths, event_flags, event_ids)
    }));
    if result.is_err() {
        log::error!("panic in fsevents callback (ignored)");
    }
}

unsafe fn callback_impl(
    stream_ref: fs::FSEventStreamRef,
    info: *mut c_void,
    num_events: libc::size_t,
    event_paths: *mut c_void,
    event_flags: *const fs::FSEventStreamEventFlags,
    event_ids: *const fs::FSEventStreamEventId,
) {
    let regid = info as usize;
    let state = match registry::find(regid) {
        Some(state) => state,
        None => return,
    };

    let paths = std::slice::from_raw_parts(event_paths as *const *const c_char, num_events);
    let flags = std::slice::from_raw_parts(event_flags, num_events);
    let ids = std::slice::from_raw_parts(event_ids, num_events);

    let mut batch = Vec::with_capacity(num_events);
    for i in 0..num_events {
        let path = PathBuf::from(CStr::from_ptr(paths[i]).to_string_lossy().into_owned());
        let raw = RawFlags::from_bits_truncate(flags[i]);
        log::trace!("fsevent: path = `{}`, flags = {raw:?}", path.display());
        batch.push(RawEvent {
            path,
            flags: raw,
            id: ids[i],
        });
    }

    let normalized = normalize::normalize_batch(&state, &batch);
    if normalized.cancel {
        // The stream is stopped in place; invalidation happens when the handle drops.
        fs::FSEventStreamStop(stream_ref);
    }
    dispatch::dispatch_batch(&state, normalized.notes, normalized.last_id, normalized.cancel);
}
