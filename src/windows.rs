//! Monitor backend for Windows' directory management APIs.
//!
//! Each registration owns a worker thread issuing overlapped
//! `ReadDirectoryChangesW` reads against the root handle. The native records
//! carry no event ids and no rename cookies; ids come from a per-stream
//! counter, and the OLD_NAME/NEW_NAME adjacency guarantee stands in for the
//! cookie so both rename halves share one id. Latency is a batching window,
//! as on Linux.

use crate::config::ChangeConfig;
use crate::dispatch;
use crate::error::{Error, ErrorKind, Result};
use crate::normalize::{self, RawEvent, RawFlags};
use crate::state::ChangeState;
use crate::{bounded, unbounded, Receiver, Sender};
use std::ffi::OsString;
use std::fs;
use std::mem;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::os::windows::io::AsRawHandle;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_NOTIFY_ENUM_DIR, HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, GetFileInformationByHandle, GetFinalPathNameByHandleW, ReadDirectoryChangesW,
    BY_HANDLE_FILE_INFORMATION, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED, FILE_ACTION_REMOVED,
    FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME, FILE_FLAG_BACKUP_SEMANTICS,
    FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY, FILE_NOTIFY_CHANGE_ATTRIBUTES,
    FILE_NOTIFY_CHANGE_CREATION, FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME,
    FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SECURITY, FILE_NOTIFY_CHANGE_SIZE,
    FILE_NOTIFY_INFORMATION, FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::{CreateEventW, SetEvent, WaitForMultipleObjects};
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};

const BUF_SIZE: usize = 16384;

pub(crate) fn device_uuid(path: &Path) -> Result<String> {
    let file = open_dir_handle(path, false)?;
    let mut info: BY_HANDLE_FILE_INFORMATION = unsafe { mem::zeroed() };
    let ok = unsafe { GetFileInformationByHandle(file.as_raw_handle() as HANDLE, &mut info) };
    if ok == 0 {
        return Err(Error::io(std::io::Error::last_os_error()).add_path(path.into()));
    }
    Ok(format!("vsn:{:08x}", info.dwVolumeSerialNumber))
}

/// No journal clock is consumed here; the stream position is the per-registration counter.
pub(crate) fn current_event_id(_path: &Path, seed: u64) -> u64 {
    seed
}

pub(crate) fn final_path(file: &fs::File) -> Option<PathBuf> {
    let mut buf = [0u16; 1024];
    let len = unsafe {
        GetFinalPathNameByHandleW(
            file.as_raw_handle() as HANDLE,
            buf.as_mut_ptr(),
            buf.len() as u32,
            0,
        )
    };
    if len == 0 || len as usize > buf.len() {
        return None;
    }
    let s = OsString::from_wide(&buf[..len as usize]);
    let p = PathBuf::from(s);
    // Strip the \\?\ verbatim prefix for comparability with client paths.
    match p.to_str().and_then(|s| s.strip_prefix("\\\\?\\")) {
        Some(stripped) => Some(PathBuf::from(stripped)),
        None => Some(p),
    }
}

fn open_dir_handle(path: &Path, overlapped: bool) -> Result<fs::File> {
    use std::os::windows::io::FromRawHandle;
    let encoded: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
    let mut flags = FILE_FLAG_BACKUP_SEMANTICS;
    if overlapped {
        flags |= FILE_FLAG_OVERLAPPED;
    }
    let handle = unsafe {
        CreateFileW(
            encoded.as_ptr(),
            FILE_LIST_DIRECTORY,
            FILE_SHARE_READ | FILE_SHARE_DELETE | FILE_SHARE_WRITE,
            ptr::null(),
            OPEN_EXISTING,
            flags,
            ptr::null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        let err = std::io::Error::last_os_error();
        return Err(if err.kind() == std::io::ErrorKind::NotFound {
            Error::path_not_found().add_path(path.into())
        } else {
            Error::io(err).add_path(path.into())
        });
    }
    Ok(unsafe { fs::File::from_raw_handle(handle as _) })
}

enum Control {
    Stop(Sender<()>),
}

/// Control handle for one registration's reader thread.
pub(crate) struct WatchHandle {
    tx: Sender<Control>,
    wake_event: HANDLE,
}

unsafe impl Send for WatchHandle {}
unsafe impl Sync for WatchHandle {}

impl WatchHandle {
    pub(crate) fn stop(&self) {
        let (ack_tx, ack_rx) = bounded(1);
        if self.tx.send(Control::Stop(ack_tx)).is_ok() {
            unsafe { SetEvent(self.wake_event) };
            let _ = ack_rx.recv();
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.wake_event) };
    }
}

pub(crate) fn start(
    state: &Arc<ChangeState>,
    cfg: &ChangeConfig,
    recursive: bool,
) -> Result<WatchHandle> {
    let dir = open_dir_handle(state.root(), true)?;
    let wake_event = unsafe { CreateEventW(ptr::null(), 0, 0, ptr::null()) };
    let io_event = unsafe { CreateEventW(ptr::null(), 0, 0, ptr::null()) };
    if wake_event == 0 || io_event == 0 {
        return Err(Error::new(ErrorKind::MonitorCreate));
    }

    let (tx, rx) = unbounded();
    let reader = Reader {
        state: state.clone(),
        dir,
        io_event,
        wake_event,
        rx,
        recursive,
        latency: cfg.notification_latency(),
        next_id: state.last_event_id() + 1,
        pending: Vec::new(),
        pending_rename_id: None,
        deadline: None,
        running: true,
    };

    let handle = WatchHandle { tx, wake_event };
    let _ = thread::Builder::new()
        .name("dirwatch windows loop".to_string())
        .spawn(move || reader.run());
    Ok(handle)
}

struct Reader {
    state: Arc<ChangeState>,
    dir: fs::File,
    io_event: HANDLE,
    wake_event: HANDLE,
    rx: Receiver<Control>,
    recursive: bool,
    latency: Duration,
    next_id: u64,
    pending: Vec<RawEvent>,
    pending_rename_id: Option<u64>,
    deadline: Option<Instant>,
    running: bool,
}

// The handles are only used from the reader thread once it starts.
unsafe impl Send for Reader {}

impl Drop for Reader {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.io_event) };
    }
}

impl Reader {
    fn run(mut self) {
        // A resumed stream has no history to replay; the boundary is reached at once.
        if self.state.stop_id() > 0 {
            self.pending.push(RawEvent {
                path: self.state.root().to_path_buf(),
                flags: RawFlags::HISTORY_DONE,
                id: 0,
            });
            self.flush();
        }

        // DWORD-aligned buffer, as FILE_NOTIFY_INFORMATION requires.
        let mut buffer = vec![0u32; BUF_SIZE / 4];
        let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
        overlapped.hEvent = self.io_event;

        while self.running {
            if !self.issue_read(&mut buffer, &mut overlapped) {
                break;
            }

            loop {
                let timeout = match self.deadline {
                    Some(d) => d.saturating_duration_since(Instant::now()).as_millis() as u32,
                    None => u32::MAX, // INFINITE
                };
                let handles = [self.wake_event, self.io_event];
                let waited =
                    unsafe { WaitForMultipleObjects(2, handles.as_ptr(), 0, timeout) };
                if waited == WAIT_OBJECT_0 {
                    self.handle_messages(&mut overlapped);
                    if !self.running {
                        return;
                    }
                } else if waited == WAIT_OBJECT_0 + 1 {
                    self.handle_read_completion(&buffer, &mut overlapped);
                    break; // reissue the read
                } else if waited == u32::MAX {
                    // WAIT_FAILED: a handle went bad underneath us, likely the root.
                    self.push_root_changed();
                    self.flush();
                    return;
                } else {
                    // Timeout: the latency window closed.
                    self.flush();
                }
                if !self.running {
                    return;
                }
            }
        }
    }

    fn handle_messages(&mut self, overlapped: &mut OVERLAPPED) {
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                Control::Stop(ack) => {
                    unsafe {
                        CancelIoEx(self.dir.as_raw_handle() as HANDLE, overlapped);
                    }
                    self.flush();
                    self.running = false;
                    let _ = ack.send(());
                }
            }
        }
    }

    fn issue_read(&mut self, buffer: &mut [u32], overlapped: &mut OVERLAPPED) -> bool {
        let filter = FILE_NOTIFY_CHANGE_FILE_NAME
            | FILE_NOTIFY_CHANGE_DIR_NAME
            | FILE_NOTIFY_CHANGE_ATTRIBUTES
            | FILE_NOTIFY_CHANGE_SIZE
            | FILE_NOTIFY_CHANGE_LAST_WRITE
            | FILE_NOTIFY_CHANGE_CREATION
            | FILE_NOTIFY_CHANGE_SECURITY;
        let ok = unsafe {
            ReadDirectoryChangesW(
                self.dir.as_raw_handle() as HANDLE,
                buffer.as_mut_ptr() as *mut _,
                (buffer.len() * 4) as u32,
                self.recursive as i32,
                filter,
                ptr::null_mut(),
                overlapped,
                None,
            )
        };
        if ok == 0 {
            // The root is gone or inaccessible; treat it like a root change.
            self.push_root_changed();
            self.flush();
            false
        } else {
            true
        }
    }

    fn handle_read_completion(&mut self, buffer: &[u32], overlapped: &mut OVERLAPPED) {
        let mut bytes = 0u32;
        let ok = unsafe {
            GetOverlappedResult(
                self.dir.as_raw_handle() as HANDLE,
                overlapped,
                &mut bytes,
                0,
            )
        };
        if ok == 0 {
            let err = unsafe { GetLastError() };
            if err == ERROR_NOTIFY_ENUM_DIR {
                self.push_rescan();
            } else {
                self.push_root_changed();
            }
            self.flush();
            return;
        }
        if bytes == 0 {
            // Too many changes for the buffer; the tree must be rescanned.
            self.push_rescan();
            self.flush();
            return;
        }

        self.parse_events(buffer.as_ptr() as *const u8, bytes as usize);

        if !self.pending.is_empty() {
            if self.latency.is_zero() {
                self.flush();
            } else if self.deadline.is_none() {
                self.deadline = Some(Instant::now() + self.latency);
            }
        }
    }

    fn parse_events(&mut self, base: *const u8, len: usize) {
        let root = self.state.root().to_path_buf();
        let mut offset = 0usize;
        loop {
            if offset + mem::size_of::<FILE_NOTIFY_INFORMATION>() > len {
                break;
            }
            let info = unsafe { &*(base.add(offset) as *const FILE_NOTIFY_INFORMATION) };
            let name_len = info.FileNameLength as usize / 2;
            let name = unsafe { std::slice::from_raw_parts(info.FileName.as_ptr(), name_len) };
            let rel = OsString::from_wide(name);
            let path = root.join(rel);

            let mut flags = match info.Action {
                FILE_ACTION_ADDED => RawFlags::ITEM_CREATED,
                FILE_ACTION_REMOVED => RawFlags::ITEM_REMOVED,
                FILE_ACTION_MODIFIED => RawFlags::ITEM_MODIFIED,
                FILE_ACTION_RENAMED_OLD_NAME | FILE_ACTION_RENAMED_NEW_NAME => {
                    RawFlags::ITEM_RENAMED
                }
                _ => RawFlags::empty(),
            };

            if !flags.is_empty() {
                let id = match info.Action {
                    FILE_ACTION_RENAMED_OLD_NAME => {
                        let id = self.alloc_id();
                        self.pending_rename_id = Some(id);
                        id
                    }
                    // OLD_NAME and NEW_NAME are documented to be adjacent.
                    FILE_ACTION_RENAMED_NEW_NAME => self
                        .pending_rename_id
                        .take()
                        .unwrap_or_else(|| self.alloc_id()),
                    _ => self.alloc_id(),
                };
                flags |= type_hint(&path);
                self.pending.push(RawEvent { path, flags, id });
            }

            if info.NextEntryOffset == 0 {
                break;
            }
            offset += info.NextEntryOffset as usize;
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn push_root_changed(&mut self) {
        self.pending.push(RawEvent {
            path: self.state.root().to_path_buf(),
            flags: RawFlags::ROOT_CHANGED,
            id: 0,
        });
    }

    fn push_rescan(&mut self) {
        self.pending.push(RawEvent {
            path: self.state.root().to_path_buf(),
            flags: RawFlags::MUST_SCAN_SUBDIRS,
            id: 0,
        });
    }

    fn flush(&mut self) {
        self.deadline = None;
        self.pending_rename_id = None;
        if self.pending.is_empty() {
            return;
        }
        let batch = mem::take(&mut self.pending);
        let normalized = normalize::normalize_batch(&self.state, &batch);
        if normalized.cancel {
            self.running = false;
        }
        dispatch::dispatch_batch(
            &self.state,
            normalized.notes,
            normalized.last_id,
            normalized.cancel,
        );
    }
}

// ReadDirectoryChangesW reports no type; a best-effort stat fills the gap. The race with the
// filesystem is accepted.
fn type_hint(path: &Path) -> RawFlags {
    match fs::symlink_metadata(path) {
        Ok(md) if md.is_dir() => RawFlags::IS_DIR,
        Ok(md) if md.is_file() => RawFlags::IS_FILE,
        Ok(_) => RawFlags::IS_SYMLINK,
        Err(_) => RawFlags::empty(),
    }
}
