//! Error types

use crate::event::ChangeEvent;
use std::path::PathBuf;
use std::{error, fmt, io, result};

/// Type alias to use this library's `Error` type in a `Result`
pub type Result<T> = result::Result<T, Error>;

/// Error kinds
#[derive(Debug)]
pub enum ErrorKind {
    /// Generic error
    ///
    /// May be used in cases where a platform specific error is mapped to this type, or for opaque
    /// internal errors.
    Generic(String),

    /// I/O errors.
    Io(io::Error),

    /// A path does not exist.
    PathNotFound,

    /// Attempted to stop a monitor that is not registered (or has already canceled itself).
    WatchNotFound,

    /// Invalid argument: empty path, empty event mask, undocumented reserved flags or a bad
    /// option combination.
    InvalidArgument(Option<ChangeEvent>),

    /// The requested capability is not available on this platform.
    NotSupported,

    /// The platform change subscription could not be constructed.
    MonitorCreate,

    /// The platform change subscription could not be started.
    MonitorStart,

    /// A resume state was given whose stream identity or event id is incompatible with the
    /// volume being watched.
    MonitorThaw,

    /// A resume state requested a replay into the past.
    MonitorReplayPast,

    /// A directory entry name could not be decoded as UTF-8. The entry has been skipped.
    NonUtf8Name,

    /// A directory could not be read due to missing permissions.
    PermissionDenied,

    /// An OS limit on the number of watches was reached.
    MaxFilesWatch,
}

/// The error type for monitors and iterators.
///
/// Errors are emitted either at creation time of a monitor or iterator, or during the event
/// stream.
#[derive(Debug)]
pub struct Error {
    /// Kind of the error.
    pub kind: ErrorKind,
    /// Relevant paths to the error, if any.
    pub paths: Vec<PathBuf>,
}

impl Error {
    /// Adds a path to the error.
    pub fn add_path(mut self, path: PathBuf) -> Self {
        self.paths.push(path);
        self
    }

    /// Replaces the paths for the error.
    pub fn set_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.paths = paths;
        self
    }

    /// Creates a new Error with new `ErrorKind`
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            paths: Vec::new(),
        }
    }

    /// Creates a new generic Error from a message
    pub fn generic(msg: &str) -> Self {
        Self::new(ErrorKind::Generic(msg.into()))
    }

    /// Creates a new i/o Error from a stdlib `io::Error`
    pub fn io(err: io::Error) -> Self {
        Self::new(ErrorKind::Io(err))
    }

    /// Creates a new "path not found" error
    pub fn path_not_found() -> Self {
        Self::new(ErrorKind::PathNotFound)
    }

    /// Creates a new "watch not found" error
    pub fn watch_not_found() -> Self {
        Self::new(ErrorKind::WatchNotFound)
    }

    /// Creates a new "invalid argument" error
    pub fn invalid_argument() -> Self {
        Self::new(ErrorKind::InvalidArgument(None))
    }

    /// Creates a new "not supported" error
    pub fn not_supported() -> Self {
        Self::new(ErrorKind::NotSupported)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let error = match &self.kind {
            ErrorKind::PathNotFound => "No path was found.".into(),
            ErrorKind::WatchNotFound => "No watch was found.".into(),
            ErrorKind::InvalidArgument(None) => "Invalid argument.".into(),
            ErrorKind::InvalidArgument(Some(events)) => {
                format!("Invalid event mask: {events:?}.")
            }
            ErrorKind::NotSupported => "Not supported on this platform.".into(),
            ErrorKind::MonitorCreate => "The change monitor could not be created.".into(),
            ErrorKind::MonitorStart => "The change monitor could not be started.".into(),
            ErrorKind::MonitorThaw => {
                "The resume state does not match the current event stream.".into()
            }
            ErrorKind::MonitorReplayPast => {
                "The resume state would replay events from the past.".into()
            }
            ErrorKind::NonUtf8Name => {
                "A non-UTF8 path name was encountered. It has been skipped.".into()
            }
            ErrorKind::PermissionDenied => "Permission denied.".into(),
            ErrorKind::MaxFilesWatch => "OS file watch limit reached.".into(),
            ErrorKind::Generic(err) => err.clone(),
            ErrorKind::Io(err) => err.to_string(),
        };

        if self.paths.is_empty() {
            write!(f, "{error}")
        } else {
            write!(f, "{error} about {:?}", self.paths)
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self.kind {
            ErrorKind::Io(ref cause) => Some(cause),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::io(err)
    }
}

impl From<crossbeam_channel::RecvError> for Error {
    fn from(err: crossbeam_channel::RecvError) -> Self {
        Error::generic(&format!("internal channel disconnect: {err:?}"))
    }
}

impl<T> From<crossbeam_channel::SendError<T>> for Error {
    fn from(err: crossbeam_channel::SendError<T>) -> Self {
        Error::generic(&format!("internal channel disconnect: {err:?}"))
    }
}
