//! The directory traversal engine.
//!
//! [`DirIterator`] walks a tree with an explicit stack of open directory
//! handles rather than language-level recursion. Each frame owns one handle,
//! released when the frame pops. A directory that cannot be opened still
//! pushes a *placeholder* frame so that depth reporting and
//! [`skip_descendants`](DirIterator::skip_descendants) behave the same way
//! whether or not the open succeeded.

use crate::config::DirOptions;
use crate::error::{Error, ErrorKind, Result};
use crate::event::FileType;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A traversed directory entry with optionally cached metadata.
#[derive(Debug, Clone)]
pub struct DirEntry {
    path: PathBuf,
    file_type: FileType,
    size: Option<u64>,
    modified: Option<SystemTime>,
}

impl DirEntry {
    fn new(path: PathBuf, file_type: FileType) -> Self {
        Self {
            path,
            file_type,
            size: None,
            modified: None,
        }
    }

    /// The full path of the entry.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consumes the entry, returning its path.
    pub fn into_path(self) -> PathBuf {
        self.path
    }

    /// The file type as cached during traversal. May be [`FileType::Unknown`] on filesystems
    /// that do not report types from directory reads.
    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    /// The cached size, where the platform provides one during traversal or after
    /// [`refresh`](Self::refresh).
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// The cached last-write time, where available.
    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    /// Re-reads the entry's metadata from the filesystem (without following symlinks).
    ///
    /// On failure the cache is cleared and the error returned.
    pub fn refresh(&mut self) -> Result<()> {
        match fs::symlink_metadata(&self.path) {
            Ok(md) => {
                self.file_type = file_type_of(&md.file_type());
                self.size = Some(md.len());
                self.modified = md.modified().ok();
                Ok(())
            }
            Err(e) => {
                self.file_type = if e.kind() == io::ErrorKind::NotFound {
                    FileType::NotFound
                } else {
                    FileType::None
                };
                self.size = None;
                self.modified = None;
                Err(Error::io(e).add_path(self.path.clone()))
            }
        }
    }
}

fn file_type_of(ft: &fs::FileType) -> FileType {
    if ft.is_dir() {
        return FileType::Directory;
    }
    if ft.is_symlink() {
        return FileType::Symlink;
    }
    if ft.is_file() {
        return FileType::Regular;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if ft.is_block_device() {
            return FileType::Block;
        }
        if ft.is_char_device() {
            return FileType::Character;
        }
        if ft.is_fifo() {
            return FileType::Fifo;
        }
        if ft.is_socket() {
            return FileType::Socket;
        }
    }
    FileType::Unknown
}

fn is_permission_denied(err: &io::Error) -> bool {
    // Covers EACCES, and EPERM for the macOS user-data-protection directories.
    err.kind() == io::ErrorKind::PermissionDenied
}

#[cfg(unix)]
fn is_hidden(_path: &Path, name: &OsStr) -> bool {
    use std::os::unix::ffi::OsStrExt;
    name.as_bytes().first() == Some(&b'.')
}

#[cfg(windows)]
fn is_hidden(path: &Path, _name: &OsStr) -> bool {
    use std::os::windows::fs::MetadataExt;
    use windows_sys::Win32::Storage::FileSystem::FILE_ATTRIBUTE_HIDDEN;
    fs::symlink_metadata(path)
        .map(|md| md.file_attributes() & FILE_ATTRIBUTE_HIDDEN != 0)
        .unwrap_or(false)
}

#[cfg(unix)]
fn is_mountpoint(path: &Path, parent_dev: Option<u64>) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (parent_dev, fs::metadata(path)) {
        (Some(dev), Ok(md)) => md.dev() != dev,
        _ => false,
    }
}

#[cfg(windows)]
fn is_mountpoint(path: &Path, _parent_dev: Option<u64>) -> bool {
    use std::os::windows::fs::MetadataExt;
    use windows_sys::Win32::Storage::FileSystem::FILE_ATTRIBUTE_REPARSE_POINT;
    fs::symlink_metadata(path)
        .map(|md| md.file_attributes() & FILE_ATTRIBUTE_REPARSE_POINT != 0)
        .unwrap_or(false)
}

#[cfg(target_os = "macos")]
fn is_package(path: &Path) -> bool {
    // LaunchServices-style bundle extensions.
    const PACKAGE_EXTENSIONS: &[&str] = &[
        "app",
        "bundle",
        "framework",
        "kext",
        "plugin",
        "prefPane",
        "qlgenerator",
        "xpc",
    ];
    path.extension()
        .and_then(OsStr::to_str)
        .map(|ext| PACKAGE_EXTENSIONS.iter().any(|p| p.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

#[cfg(not(target_os = "macos"))]
fn is_package(_path: &Path) -> bool {
    false
}

#[cfg(target_os = "macos")]
fn is_apple_double(dir: &Path, leaf: &OsStr) -> bool {
    use std::os::unix::ffi::OsStrExt;
    let bytes = leaf.as_bytes();
    if bytes.len() <= 2 || !bytes.starts_with(b"._") {
        return false;
    }
    let sidecar = dir.join(leaf);
    match fs::symlink_metadata(&sidecar) {
        Ok(md) if !md.is_dir() => {
            let sibling = dir.join(OsStr::from_bytes(&bytes[2..]));
            fs::symlink_metadata(sibling).is_ok()
        }
        _ => false,
    }
}

#[cfg(not(target_os = "macos"))]
fn is_apple_double(_dir: &Path, _leaf: &OsStr) -> bool {
    false
}

#[cfg(unix)]
fn device_of(path: &Path) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    fs::metadata(path).map(|md| md.dev()).ok()
}

#[cfg(not(unix))]
fn device_of(_path: &Path) -> Option<u64> {
    None
}

// A placeholder frame carries no handle but still participates in pop/depth accounting.
#[derive(Debug)]
struct Frame {
    dir: Option<fs::ReadDir>,
    path: PathBuf,
    dev: Option<u64>,
}

/// A stack-based recursive directory iterator.
///
/// Yields each entry beneath the root exactly once, in native directory order; with
/// [`DirOptions::INCLUDE_POSTORDER_DIRECTORIES`] each directory is additionally yielded after
/// its descendants. Dot entries are never yielded. Errors are yielded in-line
/// (`Some(Err(..))`) and iteration continues past them.
///
/// ```no_run
/// # use dirwatch::{DirIterator, DirOptions};
/// for entry in DirIterator::new("/tmp", DirOptions::default())? {
///     println!("{}", entry?.path().display());
/// }
/// # Ok::<(), dirwatch::Error>(())
/// ```
#[derive(Debug)]
pub struct DirIterator {
    stack: Vec<Frame>,
    opts: DirOptions,
    will_recurse: bool,
    postorder_pending: bool,
}

impl DirIterator {
    /// Opens an iterator rooted at `root`.
    ///
    /// Fails when the root cannot be opened, unless the error is a permission failure and
    /// [`DirOptions::SKIP_PERMISSION_DENIED`] is set (the iterator is then immediately
    /// exhausted).
    pub fn new(root: impl AsRef<Path>, opts: DirOptions) -> Result<Self> {
        let root = root.as_ref();
        if root.as_os_str().is_empty() {
            return Err(Error::invalid_argument());
        }
        let mut iter = Self {
            stack: Vec::new(),
            opts,
            will_recurse: false,
            postorder_pending: false,
        };
        iter.push(root.to_path_buf())?;
        Ok(iter)
    }

    fn recurse(&self) -> bool {
        !self
            .opts
            .contains(DirOptions::SKIP_SUBDIRECTORY_DESCENDANTS)
    }

    fn is_child(&self) -> bool {
        self.stack.len() > 1
    }

    fn top_is_placeholder(&self) -> bool {
        matches!(self.stack.last(), Some(frame) if frame.dir.is_none())
    }

    fn push_placeholder(&mut self, path: PathBuf) {
        self.stack.push(Frame {
            dir: None,
            path,
            dev: None,
        });
    }

    fn push(&mut self, path: PathBuf) -> Result<()> {
        match fs::read_dir(&path) {
            Ok(dir) => {
                self.will_recurse = true;
                let dev = device_of(&path);
                self.stack.push(Frame {
                    dir: Some(dir),
                    path,
                    dev,
                });
                Ok(())
            }
            Err(e) => {
                self.will_recurse = false;
                let denied = is_permission_denied(&e);
                // Push a bad entry so clients still get a listing of a dir that can't be
                // opened and may call skip_descendants() without unexpected results.
                let err = Error::io(e).add_path(path.clone());
                self.push_placeholder(path);
                if denied && self.opts.contains(DirOptions::SKIP_PERMISSION_DENIED) {
                    Ok(())
                } else if denied {
                    Err(Error::new(ErrorKind::PermissionDenied).set_paths(err.paths))
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Advances the walk. `Ok(None)` is the end of iteration; errors do not end it.
    pub fn next_entry(&mut self) -> Result<Option<DirEntry>> {
        let postorder = self
            .opts
            .contains(DirOptions::INCLUDE_POSTORDER_DIRECTORIES);

        self.will_recurse = false;
        self.postorder_pending = false;

        // A placeholder below the root is a directory we could not (or chose not to) open;
        // with postorder enabled it still owes its own post-visit.
        if postorder && self.is_child() && self.top_is_placeholder() {
            self.postorder_pending = true;
            let frame = self.stack.pop().expect("checked non-empty");
            return Ok(Some(DirEntry::new(frame.path, FileType::Directory)));
        }

        loop {
            // Drop any placeholder frames; there is nothing to read from them.
            while self.top_is_placeholder() {
                self.stack.pop();
            }
            if self.stack.is_empty() {
                return Ok(None);
            }

            let frame_path = self
                .stack
                .last()
                .map(|f| f.path.clone())
                .expect("checked non-empty");
            let frame_dev = self.stack.last().and_then(|f| f.dev);

            let read = self
                .stack
                .last_mut()
                .and_then(|f| f.dir.as_mut())
                .expect("top frame is open")
                .next();

            match read {
                Some(Ok(ent)) => {
                    let name = ent.file_name();
                    // `.` and `..` are never surfaced by ReadDir; only decoding remains.
                    if name.to_str().is_none() {
                        return Err(
                            Error::new(ErrorKind::NonUtf8Name).add_path(frame_path.clone())
                        );
                    }

                    if !self.opts.contains(DirOptions::INCLUDE_APPLE_DOUBLE_FILES)
                        && is_apple_double(&frame_path, &name)
                    {
                        continue;
                    }

                    let cpath = frame_path.join(&name);

                    if self.opts.contains(DirOptions::SKIP_HIDDEN_DESCENDANTS)
                        && is_hidden(&cpath, &name)
                    {
                        continue;
                    }

                    let ftype = ent
                        .file_type()
                        .map(|t| file_type_of(&t))
                        .unwrap_or(FileType::Unknown);

                    let mut open_err = None;
                    if self.recurse() && self.should_descend(&cpath, ftype) {
                        if (!self.opts.contains(DirOptions::FOLLOW_MOUNTPOINTS)
                            && is_mountpoint(&cpath, frame_dev))
                            || (self
                                .opts
                                .contains(DirOptions::SKIP_PACKAGE_CONTENT_DESCENDANTS)
                                && is_package(&cpath))
                        {
                            // Placeholder so clients can call skip_descendants() without
                            // unexpected results.
                            self.push_placeholder(cpath.clone());
                        } else {
                            let push_path = if ftype == FileType::Symlink {
                                fs::canonicalize(&cpath).unwrap_or_else(|_| cpath.clone())
                            } else {
                                cpath.clone()
                            };
                            if let Err(e) = self.push(push_path) {
                                open_err = Some(e);
                            }
                        }
                    }

                    let entry = DirEntry::new(cpath, ftype);
                    return match open_err {
                        // The entry is lost to the caller here, but its subtree is not: the
                        // placeholder keeps depth and skip_descendants consistent.
                        Some(e) => Err(e),
                        None => Ok(Some(entry)),
                    };
                }
                Some(Err(e)) => {
                    return Err(Error::io(e).add_path(frame_path));
                }
                None => {
                    // Read all entries in the current dir.
                    if postorder && self.is_child() {
                        self.postorder_pending = true;
                        let frame = self.stack.pop().expect("checked non-empty");
                        return Ok(Some(DirEntry::new(frame.path, FileType::Directory)));
                    }
                    self.stack.pop();
                }
            }
        }
    }

    fn should_descend(&self, cpath: &Path, ftype: FileType) -> bool {
        match ftype {
            FileType::Directory => true,
            FileType::Symlink => {
                self.opts.contains(DirOptions::FOLLOW_DIRECTORY_SYMLINK)
                    && fs::metadata(cpath).map(|md| md.is_dir()).unwrap_or(false)
            }
            _ => false,
        }
    }

    /// The depth of the entry just yielded: the number of ancestor directories within the
    /// walk (0 for immediate children of the root).
    pub fn depth(&self) -> usize {
        let mut sz = self.stack.len();
        if sz == 0 {
            return 0;
        }
        sz -= 1;
        if sz > 0 && (self.will_recurse || self.top_is_placeholder()) {
            sz -= 1;
        }
        sz
    }

    /// Do not descend into the directory entry that was just yielded.
    pub fn skip_descendants(&mut self) {
        if self.is_child() && (self.will_recurse || self.top_is_placeholder()) {
            self.stack.pop();
            self.will_recurse = false;
        }
    }

    /// Whether the walk is exhausted.
    pub fn at_end(&self) -> bool {
        self.stack.is_empty()
    }

    /// Whether the entry just yielded was a postorder directory visit.
    pub fn postorder_pending(&self) -> bool {
        self.postorder_pending
    }

    /// The options this iterator was created with.
    pub fn options(&self) -> DirOptions {
        self.opts
    }
}

impl Iterator for DirIterator {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
