//! Per-registration monitor state, the weak client handle, and the resume token.
//!
//! A live monitor is an `Arc<ChangeState>` owned by the process-wide
//! [registry](crate::registry); clients only ever hold a [`ChangeRegistration`]
//! (a `Weak` reference). The platform event worker hands out raw registration
//! ids that are upgraded back to strong references through the registry, so a
//! callback can never race monitor teardown.

use crate::config::{ChangeConfig, ThawOptions};
use crate::error::{Error, ErrorKind, Result};
use crate::event::ChangeNotification;
use crate::dispatch::DispatchQueue;
use crate::registry;
use crate::ChangeCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

#[cfg(any(target_os = "linux", target_os = "android"))]
use crate::inotify as backend;
#[cfg(target_os = "macos")]
use crate::fsevent as backend;
#[cfg(windows)]
use crate::windows as backend;

pub(crate) use backend::WatchHandle;

/// Serialized identity of an event stream, used to resume monitoring without losing events.
///
/// The wire form is a small JSON object with two recognized keys, `uuid` (the volume or stream
/// identifier) and `evid` (the last delivered event id). Unknown keys are ignored; the empty
/// string deserializes to a default state that resumes nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeState {
    uuid: String,
    last_event_id: u64,
    replay_to_current: bool,
}

#[derive(Deserialize)]
struct TokenIn {
    uuid: Option<String>,
    evid: Option<u64>,
}

#[derive(Serialize)]
struct TokenOut<'a> {
    uuid: &'a str,
    evid: u64,
}

impl ResumeState {
    /// Parses a resume token previously produced by [`serialize`](Self::serialize) or
    /// [`ChangeRegistration::serialize`].
    ///
    /// An empty string yields the default (non-resuming) state. Malformed JSON is an error.
    /// [`ThawOptions::REPLAY_TO_CURRENT_EVENT`] arms the replay boundary, but only when the
    /// token carries an event id.
    pub fn deserialize(token: &str, opts: ThawOptions) -> Result<Self> {
        if token.is_empty() {
            return Ok(Self::default());
        }
        let parsed: TokenIn = serde_json::from_str(token).map_err(|_| Error::invalid_argument())?;
        let last_event_id = parsed.evid.unwrap_or(0);
        Ok(Self {
            uuid: parsed.uuid.unwrap_or_default(),
            last_event_id,
            replay_to_current: parsed.evid.is_some()
                && opts.contains(ThawOptions::REPLAY_TO_CURRENT_EVENT),
        })
    }

    /// Serializes the state back to its token form.
    ///
    /// A state that has not observed any event (empty uuid or an event id of zero) serializes
    /// to the empty string. Tokens round-trip byte-exactly.
    pub fn serialize(&self) -> String {
        serialize_token(&self.uuid, self.last_event_id)
    }

    /// The volume or stream identifier.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// The last delivered event id.
    pub fn last_event_id(&self) -> u64 {
        self.last_event_id
    }

    /// Whether the replay boundary is armed.
    pub fn replay_to_current_event(&self) -> bool {
        self.replay_to_current
    }
}

fn serialize_token(uuid: &str, evid: u64) -> String {
    if uuid.is_empty() || evid == 0 {
        return String::new();
    }
    serde_json::to_string(&TokenOut { uuid, evid }).unwrap_or_default()
}

/// A durable reference to the watched root directory.
///
/// The descriptor survives renames of the root, which is what lets the normalizer recover the
/// canonical path after a root-changed event.
#[cfg(unix)]
pub(crate) struct RootHandle {
    fd: libc::c_int,
}

#[cfg(unix)]
impl RootHandle {
    pub(crate) fn open(path: &Path) -> Option<Self> {
        use std::os::unix::ffi::OsStrExt;
        let cpath = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
        #[cfg(target_os = "macos")]
        let flags = libc::O_EVTONLY;
        #[cfg(not(target_os = "macos"))]
        let flags = libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC;
        let fd = unsafe { libc::open(cpath.as_ptr(), flags) };
        if fd < 0 {
            return None;
        }
        Some(Self { fd })
    }

    #[cfg(target_os = "macos")]
    pub(crate) fn current_path(&self) -> Option<PathBuf> {
        use std::os::unix::ffi::OsStrExt;
        let mut buf = [0u8; libc::PATH_MAX as usize];
        if unsafe { libc::fcntl(self.fd, libc::F_GETPATH, buf.as_mut_ptr()) } != 0 {
            return None;
        }
        let len = buf.iter().position(|b| *b == 0)?;
        Some(PathBuf::from(std::ffi::OsStr::from_bytes(&buf[..len])))
    }

    #[cfg(not(target_os = "macos"))]
    pub(crate) fn current_path(&self) -> Option<PathBuf> {
        std::fs::read_link(format!("/proc/self/fd/{}", self.fd)).ok()
    }
}

#[cfg(unix)]
impl Drop for RootHandle {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(windows)]
pub(crate) struct RootHandle {
    file: std::fs::File,
}

#[cfg(windows)]
impl RootHandle {
    pub(crate) fn open(path: &Path) -> Option<Self> {
        use std::os::windows::fs::OpenOptionsExt;
        // FILE_FLAG_BACKUP_SEMANTICS is required to open a directory handle.
        let file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(0x0200_0000)
            .open(path)
            .ok()?;
        Some(Self { file })
    }

    pub(crate) fn current_path(&self) -> Option<PathBuf> {
        crate::windows::final_path(&self.file)
    }
}

/// The library-owned state behind one monitor registration.
pub(crate) struct ChangeState {
    root: PathBuf,
    uuid: String,
    last_event_id: AtomicU64,
    stop_id: u64,
    regid: AtomicUsize,
    canceled: AtomicBool,
    root_handle: Option<RootHandle>,
    queue: DispatchQueue,
    callback: Mutex<Option<Box<dyn ChangeCallback>>>,
    backend: Mutex<Option<WatchHandle>>,
}

impl ChangeState {
    pub(crate) fn new(
        root: &Path,
        cfg: &ChangeConfig,
        callback: Box<dyn ChangeCallback>,
    ) -> Result<Arc<Self>> {
        let uuid = backend::device_uuid(root)?;

        let mut last_event_id = 0u64;
        let mut stop_id = 0u64;
        if let Some(resume) = cfg.state() {
            if !resume.uuid().is_empty() {
                if resume.uuid() == uuid && resume.last_event_id() > 0 {
                    last_event_id = resume.last_event_id();
                } else {
                    return Err(Error::new(ErrorKind::MonitorThaw));
                }
            }
            if resume.replay_to_current_event() && resume.last_event_id() > 0 {
                stop_id = backend::current_event_id(root, last_event_id);
                if stop_id < last_event_id {
                    // Possible with clock drift or an explicit clock change on the host.
                    return Err(Error::new(ErrorKind::MonitorReplayPast));
                }
            }
        }

        Ok(Arc::new(Self {
            root: root.to_path_buf(),
            uuid,
            last_event_id: AtomicU64::new(last_event_id),
            stop_id,
            regid: AtomicUsize::new(0),
            canceled: AtomicBool::new(false),
            root_handle: RootHandle::open(root),
            queue: DispatchQueue::new(),
            callback: Mutex::new(Some(callback)),
            backend: Mutex::new(None),
        }))
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn uuid(&self) -> &str {
        &self.uuid
    }

    pub(crate) fn regid(&self) -> usize {
        self.regid.load(Ordering::Acquire)
    }

    pub(crate) fn set_regid(&self, id: usize) {
        self.regid.store(id, Ordering::Release);
    }

    pub(crate) fn last_event_id(&self) -> u64 {
        self.last_event_id.load(Ordering::Acquire)
    }

    pub(crate) fn store_last_event_id(&self, id: u64) {
        self.last_event_id.store(id, Ordering::Release);
    }

    pub(crate) fn stop_id(&self) -> u64 {
        self.stop_id
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub(crate) fn set_canceled(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    /// The root path as the filesystem currently knows it, recovered through the kept-open
    /// descriptor. `None` when the root is gone or the descriptor could not be opened.
    pub(crate) fn canonical_root_path(&self) -> Option<PathBuf> {
        self.root_handle.as_ref().and_then(|h| h.current_path())
    }

    pub(crate) fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    pub(crate) fn invoke_callback(&self, notes: Vec<ChangeNotification>) {
        let mut guard = self.callback.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cb) = guard.as_mut() {
            cb.on_changes(notes);
        }
    }

    pub(crate) fn set_backend(&self, handle: WatchHandle) {
        *self.backend.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub(crate) fn take_backend(&self) -> Option<WatchHandle> {
        self.backend.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub(crate) fn serialize_token(&self) -> String {
        serialize_token(&self.uuid, self.last_event_id())
    }

    #[cfg(test)]
    pub(crate) fn for_tests(root: &Path, stop_id: u64) -> Arc<Self> {
        Arc::new(Self {
            root: root.to_path_buf(),
            uuid: "test".into(),
            last_event_id: AtomicU64::new(0),
            stop_id,
            regid: AtomicUsize::new(0),
            canceled: AtomicBool::new(false),
            root_handle: RootHandle::open(root),
            queue: DispatchQueue::new(),
            callback: Mutex::new(None),
            backend: Mutex::new(None),
        })
    }
}

impl fmt::Debug for ChangeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeState")
            .field("root", &self.root)
            .field("uuid", &self.uuid)
            .field("last_event_id", &self.last_event_id)
            .field("stop_id", &self.stop_id)
            .field("regid", &self.regid)
            .field("canceled", &self.canceled)
            .finish()
    }
}

/// A weak handle to a live monitor.
///
/// Registrations do not own the monitor: the registration table holds the strong reference
/// until [`stop`](crate::stop) is called or the monitor cancels itself. All clones refer to
/// the same underlying state.
#[derive(Clone, Default)]
pub struct ChangeRegistration {
    pub(crate) state: Weak<ChangeState>,
}

impl ChangeRegistration {
    pub(crate) fn new(state: &Arc<ChangeState>) -> Self {
        Self {
            state: Arc::downgrade(state),
        }
    }

    /// Whether the monitor behind this registration is still registered and has not canceled.
    pub fn is_live(&self) -> bool {
        match self.state.upgrade() {
            Some(state) => registry::contains(state.regid()) && !state.is_canceled(),
            None => false,
        }
    }

    /// The last event id delivered to the client callback, if the monitor is still alive.
    ///
    /// Updated before each callback runs, so a token serialized from inside a callback
    /// reflects pre-callback progress.
    pub fn last_event_id(&self) -> Option<u64> {
        self.state.upgrade().map(|s| s.last_event_id())
    }

    /// Produces a resume token for this registration's event stream.
    ///
    /// Returns the empty string when the registration is dead or no event has been delivered
    /// yet.
    pub fn serialize(&self) -> String {
        match self.state.upgrade() {
            Some(state) => state.serialize_token(),
            None => String::new(),
        }
    }
}

impl fmt::Debug for ChangeRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeRegistration")
            .field("live", &self.is_live())
            .finish()
    }
}

impl PartialEq for ChangeRegistration {
    fn eq(&self, other: &Self) -> bool {
        // All clones of a registration point at the same shared state.
        self.state.upgrade().is_some() && Weak::ptr_eq(&self.state, &other.state)
    }
}

impl PartialEq<ChangeNotification> for ChangeRegistration {
    fn eq(&self, note: &ChangeNotification) -> bool {
        match self.state.upgrade() {
            Some(state) => state.regid() == note.registration_id(),
            None => false,
        }
    }
}

impl PartialEq<ChangeRegistration> for ChangeNotification {
    fn eq(&self, reg: &ChangeRegistration) -> bool {
        reg == self
    }
}
