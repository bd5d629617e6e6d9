//! Monitor backend for the inotify Linux API.
//!
//! inotify watches are per-directory and carry no event ids, so this backend
//! bridges both gaps: a recursive registration seeds one watch per directory
//! (using the crate's own traversal engine) and maintains the set as
//! directories appear and disappear, and every native record is stamped with
//! a monotonic per-stream id. The two halves of a rename share one id (the
//! kernel cookie pairs them), which is what lets the platform-independent
//! pairing pass merge them.
//!
//! There is no kernel coalescing window; the configured latency is honored by
//! batching reads until the window closes. Latency zero flushes every read.

use crate::config::ChangeConfig;
use crate::dispatch;
use crate::error::{Error, ErrorKind, Result};
use crate::event::ChangeEvent;
use crate::normalize::{self, RawEvent, RawFlags};
use crate::state::ChangeState;
use crate::walk::DirIterator;
use crate::{bounded, unbounded, DirOptions, FileType, Receiver, Sender};
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use std::collections::HashMap;
use std::fs;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const INOTIFY: mio::Token = mio::Token(0);
const MESSAGE: mio::Token = mio::Token(1);

/// The stream identity for resume tokens: inotify has no volume UUIDs, the device id is the
/// closest durable equivalent.
pub(crate) fn device_uuid(path: &Path) -> Result<String> {
    use std::os::unix::fs::MetadataExt;
    match fs::symlink_metadata(path) {
        Ok(md) => Ok(format!("dev:{:x}", md.dev())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::path_not_found().add_path(path.into()))
        }
        Err(e) => Err(Error::io(e).add_path(path.into())),
    }
}

/// inotify has no global event clock; the per-stream counter seeded from the resume token is
/// the stream position, so "current" is wherever the token left off.
pub(crate) fn current_event_id(_path: &Path, seed: u64) -> u64 {
    seed
}

enum EventLoopMsg {
    Shutdown(Sender<()>),
}

/// Control handle for one registration's event loop.
pub(crate) struct WatchHandle {
    tx: Sender<EventLoopMsg>,
    waker: Arc<mio::Waker>,
}

impl WatchHandle {
    /// Synchronous stop: returns once the loop has acknowledged teardown (or has already
    /// exited on its own after a cancel).
    pub(crate) fn stop(&self) {
        let (ack_tx, ack_rx) = bounded(1);
        if self.tx.send(EventLoopMsg::Shutdown(ack_tx)).is_ok() && self.waker.wake().is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

fn event_mask_to_watch_mask(events: ChangeEvent, recursive: bool) -> WatchMask {
    let mut mask = WatchMask::empty();

    if recursive {
        // Subdirectory tracking needs these regardless of the subscription.
        mask |= WatchMask::CREATE | WatchMask::MOVED_TO | WatchMask::DELETE | WatchMask::MOVED_FROM;
    }
    if events.intersects(ChangeEvent::CREATED) {
        mask |= WatchMask::CREATE | WatchMask::MOVED_TO;
    }
    if events.intersects(ChangeEvent::REMOVED) {
        mask |= WatchMask::DELETE | WatchMask::MOVED_FROM;
    }
    if events.intersects(ChangeEvent::RENAMED) {
        mask |= WatchMask::MOVED_FROM | WatchMask::MOVED_TO;
    }
    if events.intersects(ChangeEvent::CONTENT_MODIFIED) {
        mask |= WatchMask::MODIFY;
    }
    if events.intersects(ChangeEvent::METADATA_MODIFIED) {
        mask |= WatchMask::ATTRIB;
    }

    mask
}

fn map_watch_error(e: std::io::Error, path: &Path) -> Error {
    if e.raw_os_error() == Some(libc::ENOSPC) {
        // Not "no more disk space"; the inotify watch limit was hit.
        Error::new(ErrorKind::MaxFilesWatch).add_path(path.into())
    } else if e.kind() == std::io::ErrorKind::NotFound {
        Error::path_not_found().add_path(path.into())
    } else if e.kind() == std::io::ErrorKind::PermissionDenied {
        Error::new(ErrorKind::PermissionDenied).add_path(path.into())
    } else {
        Error::io(e).add_path(path.into())
    }
}

pub(crate) fn start(
    state: &Arc<ChangeState>,
    cfg: &ChangeConfig,
    recursive: bool,
) -> Result<WatchHandle> {
    let inotify = Inotify::init().map_err(|e| {
        log::debug!("inotify init failed: {e}");
        Error::new(ErrorKind::MonitorCreate)
    })?;

    let mut event_loop = EventLoop::new(inotify, state.clone(), cfg, recursive)?;
    // Start is synchronous from the caller's perspective: every watch is registered before
    // this returns, and a failure to watch the root fails the whole subscription.
    event_loop.add_root()?;

    let handle = WatchHandle {
        tx: event_loop.tx.clone(),
        waker: event_loop.waker.clone(),
    };
    event_loop.run();
    Ok(handle)
}

struct EventLoop {
    running: bool,
    poll: mio::Poll,
    waker: Arc<mio::Waker>,
    tx: Sender<EventLoopMsg>,
    rx: Receiver<EventLoopMsg>,
    inotify: Option<Inotify>,
    state: Arc<ChangeState>,
    root: PathBuf,
    root_wd: Option<WatchDescriptor>,
    recursive: bool,
    events: ChangeEvent,
    latency: Duration,
    watches: HashMap<PathBuf, WatchDescriptor>,
    paths: HashMap<WatchDescriptor, PathBuf>,
    next_id: u64,
    pending: Vec<RawEvent>,
    pending_cookies: HashMap<u32, u64>,
    deadline: Option<Instant>,
}

impl EventLoop {
    fn new(
        inotify: Inotify,
        state: Arc<ChangeState>,
        cfg: &ChangeConfig,
        recursive: bool,
    ) -> Result<Self> {
        let (tx, rx) = unbounded();
        let poll = mio::Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), MESSAGE)?);

        let inotify_fd = inotify.as_raw_fd();
        let mut evented_inotify = mio::unix::SourceFd(&inotify_fd);
        poll.registry()
            .register(&mut evented_inotify, INOTIFY, mio::Interest::READABLE)?;

        let next_id = state.last_event_id() + 1;
        let root = state.root().to_path_buf();
        Ok(EventLoop {
            running: true,
            poll,
            waker,
            tx,
            rx,
            inotify: Some(inotify),
            state,
            root,
            root_wd: None,
            recursive,
            events: cfg.events(),
            latency: cfg.notification_latency(),
            watches: HashMap::new(),
            paths: HashMap::new(),
            next_id,
            pending: Vec::new(),
            pending_cookies: HashMap::new(),
            deadline: None,
        })
    }

    fn run(self) {
        let _ = thread::Builder::new()
            .name("dirwatch inotify loop".to_string())
            .spawn(|| self.event_loop_thread());
    }

    fn event_loop_thread(mut self) {
        // A resumed stream has no history to replay here; the boundary is reached at once.
        if self.state.stop_id() > 0 {
            self.pending.push(RawEvent {
                path: self.root.clone(),
                flags: RawFlags::HISTORY_DONE,
                id: 0,
            });
            self.flush();
        }

        let mut events = mio::Events::with_capacity(16);
        while self.running {
            let timeout = self
                .deadline
                .map(|d| d.saturating_duration_since(Instant::now()));
            match self.poll.poll(&mut events, timeout) {
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("inotify poll failed: {e}");
                    break;
                }
                Ok(()) => {}
            }

            for event in &events {
                match event.token() {
                    MESSAGE => self.handle_messages(),
                    INOTIFY => self.handle_inotify(),
                    _ => unreachable!(),
                }
            }

            if self
                .deadline
                .map(|d| Instant::now() >= d)
                .unwrap_or(false)
            {
                self.flush();
            }
        }
    }

    fn handle_messages(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                EventLoopMsg::Shutdown(ack) => {
                    self.flush();
                    if let Some(inotify) = self.inotify.take() {
                        let _ = inotify.close();
                    }
                    self.running = false;
                    let _ = ack.send(());
                }
            }
        }
    }

    fn alloc_ids(next_id: &mut u64) -> u64 {
        let id = *next_id;
        *next_id += 1;
        id
    }

    fn handle_inotify(&mut self) {
        let mut add_watches = Vec::new();
        let mut remove_watches = Vec::new();
        let mut cancel_pending = false;

        if let Some(ref mut inotify) = self.inotify {
            let mut buffer = [0u8; 4096];
            loop {
                match inotify.read_events(&mut buffer) {
                    Ok(events) => {
                        let mut num_events = 0;
                        for event in events {
                            num_events += 1;
                            log::trace!("inotify event: {event:?}");

                            if event.mask.contains(EventMask::Q_OVERFLOW) {
                                self.pending.push(RawEvent {
                                    path: self.root.clone(),
                                    flags: RawFlags::MUST_SCAN_SUBDIRS,
                                    id: 0,
                                });
                                cancel_pending = true;
                            }

                            let path = match event.name {
                                Some(name) => {
                                    self.paths.get(&event.wd).map(|root| root.join(name))
                                }
                                None => self.paths.get(&event.wd).cloned(),
                            };
                            let path = match path {
                                Some(path) => path,
                                None => {
                                    log::debug!("inotify event with unknown descriptor: {event:?}");
                                    continue;
                                }
                            };

                            if event
                                .mask
                                .intersects(EventMask::DELETE_SELF | EventMask::MOVE_SELF)
                            {
                                if Some(&event.wd) == self.root_wd.as_ref() {
                                    self.pending.push(RawEvent {
                                        path: self.root.clone(),
                                        flags: RawFlags::ROOT_CHANGED,
                                        id: 0,
                                    });
                                    cancel_pending = true;
                                }
                                continue;
                            }

                            let mut flags = RawFlags::empty();
                            let mut id = None;

                            if event.mask.contains(EventMask::MOVED_FROM) {
                                flags |= RawFlags::ITEM_RENAMED;
                                let assigned = Self::alloc_ids(&mut self.next_id);
                                self.pending_cookies.insert(event.cookie, assigned);
                                id = Some(assigned);
                                if self.watches.contains_key(&path) {
                                    remove_watches.push(path.clone());
                                }
                            }
                            if event.mask.contains(EventMask::MOVED_TO) {
                                flags |= RawFlags::ITEM_RENAMED;
                                // The rename source assigned an id for this cookie; sharing it
                                // is what lets the pairing pass merge the two halves.
                                id = Some(
                                    self.pending_cookies
                                        .remove(&event.cookie)
                                        .unwrap_or_else(|| Self::alloc_ids(&mut self.next_id)),
                                );
                                if event.mask.contains(EventMask::ISDIR) && self.recursive {
                                    add_watches.push(path.clone());
                                }
                            }
                            if event.mask.contains(EventMask::CREATE) {
                                flags |= RawFlags::ITEM_CREATED;
                                if event.mask.contains(EventMask::ISDIR) && self.recursive {
                                    add_watches.push(path.clone());
                                }
                            }
                            if event.mask.contains(EventMask::DELETE) {
                                flags |= RawFlags::ITEM_REMOVED;
                                if self.watches.contains_key(&path) {
                                    remove_watches.push(path.clone());
                                }
                            }
                            if event.mask.contains(EventMask::MODIFY) {
                                flags |= RawFlags::ITEM_MODIFIED;
                            }
                            if event.mask.contains(EventMask::ATTRIB) {
                                flags |= RawFlags::INODE_META_MOD;
                            }
                            if event.mask.contains(EventMask::UNMOUNT) {
                                flags |= RawFlags::UNMOUNT;
                            }

                            if flags.is_empty() {
                                continue;
                            }

                            if flags.intersects(RawFlags::ITEM_CHANGE_FLAGS) {
                                flags |= if event.mask.contains(EventMask::ISDIR) {
                                    RawFlags::IS_DIR
                                } else {
                                    RawFlags::IS_FILE
                                };
                            }

                            let id = id.unwrap_or_else(|| Self::alloc_ids(&mut self.next_id));
                            self.pending.push(RawEvent { path, flags, id });
                        }

                        if num_events == 0 {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::warn!("inotify read failed: {e}");
                        break;
                    }
                }
            }
        }

        for path in remove_watches {
            self.remove_watch(&path);
        }
        for path in add_watches {
            if let Err(err) = self.add_watch_recursive(&path) {
                if matches!(err.kind, ErrorKind::MaxFilesWatch) {
                    // Coverage of the tree can no longer be guaranteed.
                    log::warn!("inotify watch limit reached below {}", self.root.display());
                    self.pending.push(RawEvent {
                        path: self.root.clone(),
                        flags: RawFlags::MUST_SCAN_SUBDIRS,
                        id: 0,
                    });
                    cancel_pending = true;
                    break;
                }
            }
        }

        if !self.pending.is_empty() {
            if self.latency.is_zero() || cancel_pending {
                self.flush();
            } else if self.deadline.is_none() {
                self.deadline = Some(Instant::now() + self.latency);
            }
        }
    }

    fn flush(&mut self) {
        self.deadline = None;
        // A cookie whose partner did not arrive within the window cannot be paired anymore.
        self.pending_cookies.clear();
        if self.pending.is_empty() {
            return;
        }
        let batch = mem::take(&mut self.pending);
        let normalized = normalize::normalize_batch(&self.state, &batch);
        if normalized.cancel {
            // Equivalent of stopping the platform stream: stop reading and wind down.
            self.running = false;
            if let Some(inotify) = self.inotify.take() {
                let _ = inotify.close();
            }
        }
        dispatch::dispatch_batch(
            &self.state,
            normalized.notes,
            normalized.last_id,
            normalized.cancel,
        );
    }

    fn add_root(&mut self) -> Result<()> {
        let mask = event_mask_to_watch_mask(self.events, self.recursive)
            | WatchMask::DELETE_SELF
            | WatchMask::MOVE_SELF;
        let root = self.root.clone();
        let wd = self.add_single_watch(&root, mask)?;
        self.root_wd = Some(wd);

        if self.recursive {
            self.seed_descendants(&root)?;
        }
        Ok(())
    }

    /// Adds watches for a directory that appeared mid-stream and everything below it (the
    /// directory may already contain a subtree by the time the event is handled).
    fn add_watch_recursive(&mut self, path: &Path) -> Result<()> {
        let mask = event_mask_to_watch_mask(self.events, self.recursive);
        match self.add_single_watch(path, mask) {
            Ok(_) => {}
            // TOCTOU: the directory can be gone again before the watch lands. This must not
            // fail the stream.
            Err(err) if matches!(err.kind, ErrorKind::PathNotFound) => return Ok(()),
            Err(err) => return Err(err),
        }
        self.seed_descendants(path)
    }

    fn seed_descendants(&mut self, root: &Path) -> Result<()> {
        let mask = event_mask_to_watch_mask(self.events, self.recursive);
        let walker = DirIterator::new(root, DirOptions::SKIP_PERMISSION_DENIED)?;
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::debug!("skipping unreadable entry while seeding watches: {err}");
                    continue;
                }
            };
            if entry.file_type() != FileType::Directory {
                continue;
            }
            match self.add_single_watch(entry.path(), mask) {
                Ok(_) => {}
                Err(err) if matches!(err.kind, ErrorKind::PathNotFound) => {}
                Err(err) if matches!(err.kind, ErrorKind::PermissionDenied) => {
                    log::debug!("cannot watch {}: permission denied", entry.path().display());
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn add_single_watch(&mut self, path: &Path, mask: WatchMask) -> Result<WatchDescriptor> {
        let inotify = match self.inotify.as_mut() {
            Some(inotify) => inotify,
            None => return Err(Error::watch_not_found()),
        };
        log::trace!("adding inotify watch: {}", path.display());
        match inotify.watches().add(path, mask) {
            Ok(wd) => {
                self.watches.insert(path.to_path_buf(), wd.clone());
                self.paths.insert(wd.clone(), path.to_path_buf());
                Ok(wd)
            }
            Err(e) => Err(map_watch_error(e, path)),
        }
    }

    fn remove_watch(&mut self, path: &Path) {
        let Some(wd) = self.watches.remove(path) else {
            return;
        };
        self.paths.remove(&wd);
        if let Some(ref mut inotify) = self.inotify {
            // The kernel may already have dropped the descriptor for a deleted directory;
            // that race is expected and carries no information.
            if let Err(err) = inotify.watches().remove(wd) {
                log::trace!("unable to remove watch descriptor: {err:?}");
            }
        }

        // Bookkeeping for anything below a removed directory.
        let stale: Vec<PathBuf> = self
            .watches
            .keys()
            .filter(|p| p.starts_with(path))
            .cloned()
            .collect();
        for p in stale {
            if let Some(wd) = self.watches.remove(&p) {
                self.paths.remove(&wd);
                if let Some(ref mut inotify) = self.inotify {
                    let _ = inotify.watches().remove(wd);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_mask_tracks_subscription() {
        let mask = event_mask_to_watch_mask(ChangeEvent::CONTENT_MODIFIED, false);
        assert!(mask.contains(WatchMask::MODIFY));
        assert!(!mask.contains(WatchMask::CREATE));

        let mask = event_mask_to_watch_mask(ChangeEvent::METADATA_MODIFIED, false);
        assert!(mask.contains(WatchMask::ATTRIB));

        // Recursive mode needs structural events even if the client did not subscribe.
        let mask = event_mask_to_watch_mask(ChangeEvent::CONTENT_MODIFIED, true);
        assert!(mask.contains(WatchMask::CREATE | WatchMask::MOVED_TO));
        assert!(mask.contains(WatchMask::DELETE | WatchMask::MOVED_FROM));
    }

    #[test]
    fn device_uuid_is_stable_per_volume() {
        let dir = tempfile::tempdir().unwrap();
        let a = device_uuid(dir.path()).unwrap();
        let b = device_uuid(dir.path()).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("dev:"));

        let missing = dir.path().join("nope");
        assert!(matches!(
            device_uuid(&missing).unwrap_err().kind,
            ErrorKind::PathNotFound
        ));
    }
}
