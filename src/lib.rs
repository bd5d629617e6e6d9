//! Cross-platform directory traversal and change monitoring
//!
//! # Installation
//!
//! ```toml
//! [dependencies]
//! dirwatch = "0.3"
//! ```
//!
//! The crate has two halves that compose:
//!
//! - a recursive **traversal engine** ([`DirIterator`]) walking a tree with an explicit stack,
//!   with options for symlink following, mount points, hidden files, packages and postorder
//!   visits;
//! - a recursive **change monitor** ([`recursive_monitor`]) bridging the native change
//!   notification facility (FSEvents on macOS, inotify on Linux, ReadDirectoryChangesW on
//!   Windows) into one uniform event model, with rename pairing, cancellation, resume tokens
//!   and a [`changed_directory_iterator`] built on top.
//!
//! # Monitoring
//!
//! ```no_run
//! use dirwatch::{recursive_monitor, stop, ChangeConfig, ChangeNotification, Result};
//!
//! fn main() -> Result<()> {
//!     let registration = recursive_monitor(
//!         "/some/dir",
//!         ChangeConfig::default(),
//!         |notes: Vec<ChangeNotification>| {
//!             for n in &notes {
//!                 println!("{:?}: {}", n.event(), n.path().display());
//!             }
//!         },
//!     )?;
//!
//!     // ... later
//!     stop(&registration)?;
//!     Ok(())
//! }
//! ```
//!
//! Callbacks run on a background delivery thread owned by the registration; callbacks for one
//! registration never overlap. A notification carrying
//! [`ChangeEvent::CANCELED`] is the last one a registration delivers — typically the watched
//! root itself was renamed or removed, and the client should start a new monitor.
//!
//! # Resume tokens
//!
//! [`ChangeRegistration::serialize`] produces an opaque JSON token recording the event-stream
//! identity and the last delivered event id. Passing it back through
//! [`ResumeState::deserialize`] into [`ChangeConfig::with_state`] reopens the stream without
//! losing events, where the platform keeps an event journal (FSEvents); elsewhere the token
//! preserves id continuity.
//!
//! # Traversal
//!
//! ```no_run
//! use dirwatch::{DirIterator, DirOptions};
//!
//! # fn main() -> dirwatch::Result<()> {
//! let mut walk = DirIterator::new("/some/dir", DirOptions::SKIP_HIDDEN_DESCENDANTS)?;
//! while let Some(entry) = walk.next_entry()? {
//!     println!("{} (depth {})", entry.path().display(), walk.depth());
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub use crate::change_iter::{
    changed_directory_iterator, ChangeFilter, ChangeIterConfig, ChangeIterator,
};
pub use crate::config::{
    ChangeConfig, DirOptions, ThawOptions, RESERVED_FLAG_IGNORE_SELF, RESERVED_FLAG_MARK_SELF,
};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::event::{ChangeEvent, ChangeNotification, FileType};
pub use crate::state::{ChangeRegistration, ResumeState};
pub use crate::walk::{DirEntry, DirIterator};

use std::path::Path;

mod change_iter;
mod config;
mod dispatch;
mod error;
mod event;
mod normalize;
mod registry;
mod state;
mod walk;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod inotify;

#[cfg(target_os = "macos")]
mod fsevent;

#[cfg(windows)]
mod windows;

#[cfg(any(target_os = "linux", target_os = "android"))]
use crate::inotify as backend;
#[cfg(target_os = "macos")]
use crate::fsevent as backend;
#[cfg(windows)]
use crate::windows as backend;

pub(crate) type Receiver<T> = crossbeam_channel::Receiver<T>;
pub(crate) type Sender<T> = crossbeam_channel::Sender<T>;

#[inline]
pub(crate) fn unbounded<T>() -> (Sender<T>, Receiver<T>) {
    crossbeam_channel::unbounded()
}

#[inline]
pub(crate) fn bounded<T>(cap: usize) -> (Sender<T>, Receiver<T>) {
    crossbeam_channel::bounded(cap)
}

/// The requirements for monitor callback functions.
///
/// Callbacks fire on a background delivery thread and must be thread safe. A panic inside a
/// callback is caught and logged; it never crosses into the event worker.
///
/// # Example implementation
///
/// ```no_run
/// use dirwatch::{ChangeCallback, ChangeNotification};
///
/// /// Prints received notifications
/// struct NotificationPrinter;
///
/// impl ChangeCallback for NotificationPrinter {
///     fn on_changes(&mut self, notes: Vec<ChangeNotification>) {
///         for n in &notes {
///             println!("{:?}: {}", n.event(), n.path().display());
///         }
///     }
/// }
/// ```
pub trait ChangeCallback: Send + 'static {
    /// Handles one delivered batch of notifications.
    fn on_changes(&mut self, notifications: Vec<ChangeNotification>);
}

impl<F> ChangeCallback for F
where
    F: FnMut(Vec<ChangeNotification>) + Send + 'static,
{
    fn on_changes(&mut self, notifications: Vec<ChangeNotification>) {
        (self)(notifications);
    }
}

impl ChangeCallback for crossbeam_channel::Sender<Vec<ChangeNotification>> {
    fn on_changes(&mut self, notifications: Vec<ChangeNotification>) {
        let _ = self.send(notifications);
    }
}

impl ChangeCallback for std::sync::mpsc::Sender<Vec<ChangeNotification>> {
    fn on_changes(&mut self, notifications: Vec<ChangeNotification>) {
        let _ = self.send(notifications);
    }
}

fn start_monitor(
    path: &Path,
    config: ChangeConfig,
    callback: Box<dyn ChangeCallback>,
    recursive: bool,
) -> Result<ChangeRegistration> {
    if path.as_os_str().is_empty() {
        return Err(Error::invalid_argument());
    }
    config.validate()?;

    let state = state::ChangeState::new(path, &config, callback)?;
    let registration = ChangeRegistration::new(&state);
    let id = registry::insert(state.clone());

    match backend::start(&state, &config, recursive) {
        Ok(handle) => {
            state.set_backend(handle);
            Ok(registration)
        }
        Err(err) => {
            registry::remove(id);
            Err(match err.kind {
                // Domain-specific kinds pass through; anything opaque becomes a start failure.
                ErrorKind::Io(_) | ErrorKind::Generic(_) => {
                    Error::new(ErrorKind::MonitorStart).set_paths(err.paths)
                }
                _ => err,
            })
        }
    }
}

/// Monitors a single directory (not its subdirectories) for changes.
///
/// Returns [`ErrorKind::NotSupported`] on macOS, where the native facility only watches whole
/// trees.
pub fn monitor<P, C>(path: P, config: ChangeConfig, callback: C) -> Result<ChangeRegistration>
where
    P: AsRef<Path>,
    C: ChangeCallback,
{
    #[cfg(target_os = "macos")]
    {
        // Watching file or single-directory changes needs a different primitive than
        // FSEvents (dispatch sources or kqueue); keep the honest error until one exists.
        let _ = (path, config, callback);
        Err(Error::not_supported())
    }
    #[cfg(not(target_os = "macos"))]
    {
        start_monitor(path.as_ref(), config, Box::new(callback), false)
    }
}

/// Monitors a directory tree for changes.
///
/// Start is synchronous: when this returns `Ok`, the platform has accepted the subscription.
/// The returned registration is a weak handle; the monitor runs until [`stop`] or until it
/// cancels itself (delivering a final [`ChangeEvent::CANCELED`] notification).
pub fn recursive_monitor<P, C>(
    path: P,
    config: ChangeConfig,
    callback: C,
) -> Result<ChangeRegistration>
where
    P: AsRef<Path>,
    C: ChangeCallback,
{
    start_monitor(path.as_ref(), config, Box::new(callback), true)
}

/// Stops a monitor.
///
/// Synchronous: once this returns, no further notifications for the registration are
/// delivered. Returns [`ErrorKind::WatchNotFound`] if the registration was never started, was
/// already stopped, or canceled itself.
pub fn stop(registration: &ChangeRegistration) -> Result<()> {
    let state = registration
        .state
        .upgrade()
        .ok_or_else(Error::watch_not_found)?;
    let state = registry::remove(state.regid()).ok_or_else(Error::watch_not_found)?;
    if let Some(handle) = state.take_backend() {
        handle.stop();
    }
    Ok(())
}
