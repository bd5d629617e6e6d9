//! An iterator-style consumer over a recursive change monitor.
//!
//! The iterator owns a registration and buffers the *paths* extracted from
//! surviving notifications in an insertion-ordered, deduplicating set. It is
//! a pull API over a push source: [`next`](ChangeIterator::next) returning
//! `None` means "nothing queued right now", not end of iteration — see
//! [`at_end`](ChangeIterator::at_end).

use crate::config::{ChangeConfig, DirOptions};
use crate::error::{Error, Result};
use crate::event::{ChangeEvent, ChangeNotification, FileType};
use crate::state::{ChangeRegistration, ResumeState};
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A notification predicate. Filters are plain function pointers applied in order; a
/// notification is queued only if every filter accepts it.
pub type ChangeFilter = fn(&ChangeNotification) -> bool;

type OnChange = Box<dyn Fn(&ChangeRegistration) + Send + Sync>;

/// Configuration for [`changed_directory_iterator`].
#[derive(Default)]
pub struct ChangeIterConfig {
    on_change: Option<OnChange>,
    filters: Vec<ChangeFilter>,
    latency: Option<Duration>,
    state: Option<ResumeState>,
}

impl ChangeIterConfig {
    /// Invoke `callback` with the iterator's registration after every enqueue and after the
    /// done transition.
    ///
    /// The callback runs on a background delivery thread and must be reentrant-safe with the
    /// iterator's public methods.
    pub fn with_on_change(
        mut self,
        callback: impl Fn(&ChangeRegistration) + Send + Sync + 'static,
    ) -> Self {
        self.on_change = Some(Box::new(callback));
        self
    }

    /// Appends a notification filter. Notifications that require a rescan bypass all filters.
    pub fn with_filter(mut self, filter: ChangeFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// The coalescing latency handed to the underlying monitor. Defaults to one second.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Resume the underlying monitor from a previously serialized state.
    pub fn with_state(mut self, state: ResumeState) -> Self {
        self.state = Some(state);
        self
    }

    /// Accepts only regular files. Rescan and cancel notifications always pass.
    pub fn is_regular_filter(note: &ChangeNotification) -> bool {
        note.file_type() == FileType::Regular
    }

    /// Accepts only notifications whose target path currently exists on disk.
    pub fn exists_filter(note: &ChangeNotification) -> bool {
        let target = note.renamed_to_path().unwrap_or_else(|| note.path());
        fs::metadata(target).is_ok()
    }
}

fn to_events(opts: DirOptions) -> ChangeEvent {
    let mut events = ChangeEvent::RESCAN_REQUIRED;
    if opts.contains(DirOptions::INCLUDE_CREATED_EVENTS) {
        events |= ChangeEvent::CREATED | ChangeEvent::RENAMED;
    }
    if opts.contains(DirOptions::INCLUDE_MODIFIED_EVENTS) {
        events |= ChangeEvent::CONTENT_MODIFIED;
    }
    events
}

fn apply_filters(filters: &[ChangeFilter], note: &ChangeNotification) -> bool {
    if note.rescan_required() {
        // Never drop a notification the consumer must act on.
        return true;
    }
    filters.iter().all(|f| f(note))
}

// Insertion-ordered set of pending paths. The queue drives ordering, the set deduplication;
// both are drained together.
#[derive(Default)]
struct PathSet {
    set: HashSet<PathBuf>,
    order: VecDeque<PathBuf>,
}

impl PathSet {
    fn insert(&mut self, path: PathBuf) -> bool {
        if self.set.insert(path.clone()) {
            self.order.push_back(path);
            true
        } else {
            false
        }
    }

    fn pop_front(&mut self) -> Option<PathBuf> {
        let path = self.order.pop_front()?;
        self.set.remove(&path);
        Some(path)
    }

    fn drain(&mut self) -> Vec<PathBuf> {
        self.set.clear();
        self.order.drain(..).collect()
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

struct IterShared {
    entries: Mutex<PathSet>,
    done: AtomicBool,
    on_change: Option<OnChange>,
    filters: Vec<ChangeFilter>,
    registration: Mutex<ChangeRegistration>,
}

impl IterShared {
    fn entries(&self) -> MutexGuard<'_, PathSet> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn registration(&self) -> ChangeRegistration {
        self.registration
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn add(&self, mut note: ChangeNotification) {
        if note.rescan() || note.canceled() {
            self.done.store(true, Ordering::SeqCst);
            self.abort();
            self.notify();
            return;
        }
        let inserted = self.entries().insert(note.extract_path());
        if inserted {
            self.notify();
        }
    }

    fn abort(&self) {
        let _ = crate::stop(&self.registration());
    }

    fn notify(&self) {
        if let Some(cb) = &self.on_change {
            let reg = self.registration();
            if catch_unwind(AssertUnwindSafe(|| cb(&reg))).is_err() {
                log::error!("panic in change iterator callback (ignored)");
            }
        }
    }
}

/// An iterator over the paths changing beneath a directory.
///
/// Created by [`changed_directory_iterator`]. Dropping the iterator stops the underlying
/// monitor.
pub struct ChangeIterator {
    inner: Arc<IterShared>,
}

impl std::fmt::Debug for ChangeIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeIterator").finish_non_exhaustive()
    }
}

impl ChangeIterator {
    /// Removes and returns the oldest queued path.
    ///
    /// `None` means the queue is momentarily empty, which is **not** end of iteration; poll
    /// [`at_end`](Self::at_end) to detect termination.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&self) -> Option<PathBuf> {
        self.inner.entries().pop_front()
    }

    /// Atomically drains and returns every queued path, oldest first.
    pub fn extract(&self) -> Vec<PathBuf> {
        self.inner.entries().drain()
    }

    /// True once the monitor has terminated (cancel or rescan observed) and the queue has been
    /// fully drained.
    pub fn at_end(&self) -> bool {
        self.inner.done.load(Ordering::SeqCst) && self.inner.entries().is_empty()
    }

    /// The registration driving this iterator.
    pub fn registration(&self) -> ChangeRegistration {
        self.inner.registration()
    }

    /// Produces a resume token for the underlying event stream.
    pub fn serialize(&self) -> String {
        self.registration().serialize()
    }
}

impl PartialEq<ChangeRegistration> for ChangeIterator {
    fn eq(&self, other: &ChangeRegistration) -> bool {
        self.inner.registration() == *other
    }
}

impl PartialEq<ChangeIterator> for ChangeRegistration {
    fn eq(&self, other: &ChangeIterator) -> bool {
        other == self
    }
}

impl Drop for ChangeIterator {
    fn drop(&mut self) {
        self.inner.abort();
    }
}

/// Starts a recursive monitor on `path` and returns an iterator over the changing paths
/// beneath it.
///
/// At least one of [`DirOptions::INCLUDE_CREATED_EVENTS`] or
/// [`DirOptions::INCLUDE_MODIFIED_EVENTS`] must be set. Queued paths are deduplicated: a file
/// modified several times between two drains appears once.
pub fn changed_directory_iterator(
    path: impl AsRef<std::path::Path>,
    opts: DirOptions,
    config: ChangeIterConfig,
) -> Result<ChangeIterator> {
    if !opts.intersects(DirOptions::INCLUDE_CREATED_EVENTS | DirOptions::INCLUDE_MODIFIED_EVENTS) {
        return Err(Error::invalid_argument());
    }

    let events = to_events(opts);
    let shared = Arc::new(IterShared {
        entries: Mutex::new(PathSet::default()),
        done: AtomicBool::new(false),
        on_change: config.on_change,
        filters: config.filters,
        registration: Mutex::new(ChangeRegistration::default()),
    });

    let mut monitor_config = ChangeConfig::default()
        .with_notification_latency(config.latency.unwrap_or(Duration::from_millis(1000)));
    if let Some(state) = config.state {
        monitor_config = monitor_config.with_state(state);
    }

    let cb_shared = shared.clone();
    let registration = crate::recursive_monitor(
        path,
        monitor_config,
        move |notes: Vec<ChangeNotification>| {
            for note in notes {
                if note.event().intersects(events) && apply_filters(&cb_shared.filters, &note) {
                    cb_shared.add(note);
                }
            }
        },
    )?;

    *shared
        .registration
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = registration;

    Ok(ChangeIterator { inner: shared })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(path: &str, event: ChangeEvent, file_type: FileType) -> ChangeNotification {
        ChangeNotification::new(PathBuf::from(path), None, event, file_type, 1, 0)
    }

    fn shared(filters: Vec<ChangeFilter>) -> Arc<IterShared> {
        Arc::new(IterShared {
            entries: Mutex::new(PathSet::default()),
            done: AtomicBool::new(false),
            on_change: None,
            filters,
            registration: Mutex::new(ChangeRegistration::default()),
        })
    }

    fn iterator(inner: Arc<IterShared>) -> ChangeIterator {
        ChangeIterator { inner }
    }

    #[test]
    fn option_to_event_mapping() {
        assert_eq!(to_events(DirOptions::empty()), ChangeEvent::RESCAN_REQUIRED);
        assert_eq!(
            to_events(DirOptions::INCLUDE_CREATED_EVENTS),
            ChangeEvent::RESCAN_REQUIRED | ChangeEvent::CREATED | ChangeEvent::RENAMED
        );
        assert_eq!(
            to_events(DirOptions::INCLUDE_MODIFIED_EVENTS),
            ChangeEvent::RESCAN_REQUIRED | ChangeEvent::CONTENT_MODIFIED
        );
        assert_eq!(
            to_events(DirOptions::INCLUDE_CREATED_EVENTS | DirOptions::INCLUDE_MODIFIED_EVENTS),
            ChangeEvent::RESCAN_REQUIRED
                | ChangeEvent::CREATED
                | ChangeEvent::RENAMED
                | ChangeEvent::CONTENT_MODIFIED
        );
    }

    #[test]
    fn filters_run_in_order_and_all_must_accept() {
        fn yes(_: &ChangeNotification) -> bool {
            true
        }
        fn no(_: &ChangeNotification) -> bool {
            false
        }
        let n = note("/t/a", ChangeEvent::CREATED, FileType::Regular);
        assert!(apply_filters(&[], &n));
        assert!(apply_filters(&[yes], &n));
        assert!(!apply_filters(&[no], &n));
        assert!(!apply_filters(&[yes, no], &n));
        assert!(!apply_filters(&[no, yes], &n));
    }

    #[test]
    fn rescan_required_bypasses_all_filters() {
        fn no(_: &ChangeNotification) -> bool {
            false
        }
        let rescan = note("/t/a", ChangeEvent::RESCAN, FileType::Directory);
        let canceled = note("/t/a", ChangeEvent::CANCELED, FileType::Directory);
        assert!(apply_filters(&[no], &rescan));
        assert!(apply_filters(&[no], &canceled));
    }

    #[test]
    fn regular_filter_checks_the_type() {
        let regular = note("/t/a", ChangeEvent::CREATED, FileType::Regular);
        let dir = note("/t/a", ChangeEvent::CREATED, FileType::Directory);
        let unknown = note("/t/a", ChangeEvent::CREATED, FileType::Unknown);
        assert!(ChangeIterConfig::is_regular_filter(&regular));
        assert!(!ChangeIterConfig::is_regular_filter(&dir));
        assert!(!ChangeIterConfig::is_regular_filter(&unknown));
    }

    #[test]
    fn exists_filter_checks_the_target_path() {
        let dir = tempfile::tempdir().unwrap();
        let there = ChangeNotification::new(
            dir.path().to_path_buf(),
            None,
            ChangeEvent::CREATED,
            FileType::Directory,
            1,
            0,
        );
        assert!(ChangeIterConfig::exists_filter(&there));

        // The rename destination is the target when present, even with no type information.
        let renamed = ChangeNotification::new(
            dir.path().join("gone"),
            Some(dir.path().to_path_buf()),
            ChangeEvent::RENAMED,
            FileType::None,
            1,
            0,
        );
        assert!(ChangeIterConfig::exists_filter(&renamed));

        let missing = ChangeNotification::new(
            dir.path().join("gone"),
            None,
            ChangeEvent::CREATED,
            FileType::Regular,
            1,
            0,
        );
        assert!(!ChangeIterConfig::exists_filter(&missing));
    }

    #[test]
    fn queued_paths_deduplicate_and_keep_insertion_order() {
        let it = iterator(shared(Vec::new()));
        for p in ["/t/a", "/t/b", "/t/a", "/t/c", "/t/b"] {
            it.inner
                .add(note(p, ChangeEvent::CONTENT_MODIFIED, FileType::Regular));
        }
        assert_eq!(
            it.extract(),
            vec![
                PathBuf::from("/t/a"),
                PathBuf::from("/t/b"),
                PathBuf::from("/t/c")
            ]
        );
        assert!(it.extract().is_empty());
    }

    #[test]
    fn next_returns_oldest_then_none() {
        let it = iterator(shared(Vec::new()));
        it.inner
            .add(note("/t/a", ChangeEvent::CREATED, FileType::Regular));
        it.inner
            .add(note("/t/b", ChangeEvent::CREATED, FileType::Regular));
        assert_eq!(it.next(), Some(PathBuf::from("/t/a")));
        assert_eq!(it.next(), Some(PathBuf::from("/t/b")));
        assert_eq!(it.next(), None);
        // A drained path may be queued again later.
        it.inner
            .add(note("/t/a", ChangeEvent::CREATED, FileType::Regular));
        assert_eq!(it.next(), Some(PathBuf::from("/t/a")));
    }

    #[test]
    fn rename_destination_is_the_dedup_key() {
        let it = iterator(shared(Vec::new()));
        let n = ChangeNotification::new(
            PathBuf::from("/t/old"),
            Some(PathBuf::from("/t/new")),
            ChangeEvent::RENAMED,
            FileType::Regular,
            1,
            0,
        );
        it.inner.add(n);
        assert_eq!(it.next(), Some(PathBuf::from("/t/new")));
    }

    #[test]
    fn cancel_marks_the_iterator_done() {
        let it = iterator(shared(Vec::new()));
        it.inner
            .add(note("/t/a", ChangeEvent::CREATED, FileType::Regular));
        assert!(!it.at_end());
        it.inner
            .add(note("/t/x", ChangeEvent::CANCELED, FileType::Directory));
        // Done, but the queue must drain before at_end.
        assert!(!it.at_end());
        assert_eq!(it.next(), Some(PathBuf::from("/t/a")));
        assert!(it.at_end());
        // The canceling notification's path is not queued.
        assert_eq!(it.next(), None);
    }

    #[test]
    fn on_change_fires_on_enqueue_and_done() {
        use std::sync::atomic::AtomicUsize;
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let inner = Arc::new(IterShared {
            entries: Mutex::new(PathSet::default()),
            done: AtomicBool::new(false),
            on_change: Some(Box::new(|_| {
                CALLS.fetch_add(1, Ordering::SeqCst);
            })),
            filters: Vec::new(),
            registration: Mutex::new(ChangeRegistration::default()),
        });
        let it = iterator(inner);
        it.inner
            .add(note("/t/a", ChangeEvent::CREATED, FileType::Regular));
        // Duplicate: not an enqueue, no callback.
        it.inner
            .add(note("/t/a", ChangeEvent::CREATED, FileType::Regular));
        it.inner
            .add(note("/t/x", ChangeEvent::RESCAN, FileType::None));
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    }
}
