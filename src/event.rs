//! The uniform change event model.
//!
//! All platform backends funnel their native flag words through
//! [`ChangeEvent`] and deliver [`ChangeNotification`] values to the client
//! callback. The model intentionally stays a flat bitmask: native APIs
//! coalesce events aggressively and a single notification frequently carries
//! several bits at once (e.g. `CREATED | CONTENT_MODIFIED`).

use bitflags::bitflags;
use std::mem;
use std::path::{Path, PathBuf};

bitflags! {
    /// A bitmask describing what happened to a path.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ChangeEvent: u32 {
        /// The item was created.
        const CREATED = 1 << 1;
        /// The item's data was modified.
        ///
        /// Some systems do not distinguish content from metadata modifications, in which case
        /// both bits are always set together.
        const CONTENT_MODIFIED = 1 << 2;
        /// The item's metadata (mode, ownership, extended attributes) was modified.
        const METADATA_MODIFIED = 1 << 3;
        /// The item was removed.
        const REMOVED = 1 << 4;
        /// The item was renamed.
        ///
        /// Renames may come in pairs or as a single event, depending on system specifics. A
        /// fully resolved rename carries the destination in
        /// [`ChangeNotification::renamed_to_path`]; an unresolved half carries this bit alone.
        const RENAMED = 1 << 5;
        /// Marks the boundary between replayed historical events and live events.
        ///
        /// Only emitted for monitors resumed with
        /// [`ThawOptions::REPLAY_TO_CURRENT_EVENT`](crate::ThawOptions::REPLAY_TO_CURRENT_EVENT).
        /// The notification carries an empty path and no further events follow.
        const REPLAY_END = 1 << 6;

        /// A full rescan of the tree is suggested.
        ///
        /// May be combined with [`CANCELED`](Self::CANCELED) (the rescan is then required), or
        /// stand alone for a path that was hidden or exposed by a volume mount or unmount.
        const RESCAN = 1 << 29;
        /// The event was a side effect of a change made across the watch boundary, e.g. a file
        /// moved out of (or into) the watched tree.
        ///
        /// Not all platforms can detect this; the bit is best-effort.
        const OUTSIDE_TREE = 1 << 30;
        /// The monitor was canceled, usually because the watched root itself was renamed or
        /// removed (the corresponding bit is also set when known).
        ///
        /// No more events are delivered after a canceled notification.
        const CANCELED = 1 << 31;

        /// Both modification kinds.
        const MODIFIED = Self::CONTENT_MODIFIED.bits() | Self::METADATA_MODIFIED.bits();
        /// Every item-level event.
        const ALL = Self::CREATED.bits()
            | Self::REMOVED.bits()
            | Self::RENAMED.bits()
            | Self::CONTENT_MODIFIED.bits()
            | Self::METADATA_MODIFIED.bits();
        /// The consumer must treat its cached view of the tree as invalid and rewalk it.
        const RESCAN_REQUIRED = Self::RESCAN.bits() | Self::CANCELED.bits();
    }
}

/// Best-effort file type reported with notifications and directory entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FileType {
    /// No type information is available.
    #[default]
    None,
    /// The path does not exist.
    NotFound,
    /// A regular file.
    Regular,
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
    /// A block device.
    Block,
    /// A character device.
    Character,
    /// A FIFO.
    Fifo,
    /// A socket.
    Socket,
    /// The type exists but could not be mapped.
    Unknown,
}

/// A single change delivered to a monitor callback.
#[derive(Debug, Clone)]
pub struct ChangeNotification {
    pub(crate) path: PathBuf,
    pub(crate) renamed_to_path: Option<PathBuf>,
    pub(crate) event: ChangeEvent,
    pub(crate) file_type: FileType,
    pub(crate) event_id: u64,
    pub(crate) registration_id: usize,
}

impl ChangeNotification {
    pub(crate) fn new(
        path: PathBuf,
        renamed_to_path: Option<PathBuf>,
        event: ChangeEvent,
        file_type: FileType,
        event_id: u64,
        registration_id: usize,
    ) -> Self {
        Self {
            path,
            renamed_to_path,
            event,
            file_type,
            event_id,
            registration_id,
        }
    }

    /// The path the event applies to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The destination path of a fully resolved rename.
    pub fn renamed_to_path(&self) -> Option<&Path> {
        self.renamed_to_path.as_deref()
    }

    /// The event bits.
    pub fn event(&self) -> ChangeEvent {
        self.event
    }

    /// The best-effort file type of the path.
    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    /// Monotonic per-stream event id. 0 is reserved for root-changed and synthetic events.
    pub fn event_id(&self) -> u64 {
        self.event_id
    }

    /// Opaque id of the owning registration.
    ///
    /// Compare with a [`ChangeRegistration`](crate::ChangeRegistration) via `==`.
    pub fn registration_id(&self) -> usize {
        self.registration_id
    }

    /// Whether a file type is known.
    pub fn type_known(&self) -> bool {
        self.file_type != FileType::None
    }

    /// The item was created.
    pub fn created(&self) -> bool {
        self.event.contains(ChangeEvent::CREATED)
    }

    /// The item was removed.
    pub fn removed(&self) -> bool {
        self.event.contains(ChangeEvent::REMOVED)
    }

    /// The item was renamed.
    pub fn renamed(&self) -> bool {
        self.event.contains(ChangeEvent::RENAMED)
    }

    /// The item's data was modified.
    pub fn content_modified(&self) -> bool {
        self.event.contains(ChangeEvent::CONTENT_MODIFIED)
    }

    /// The item's metadata was modified.
    pub fn metadata_modified(&self) -> bool {
        self.event.contains(ChangeEvent::METADATA_MODIFIED)
    }

    /// Either modification kind.
    pub fn modified(&self) -> bool {
        self.event.intersects(ChangeEvent::MODIFIED)
    }

    /// A rescan of the tree is suggested.
    pub fn rescan(&self) -> bool {
        self.event.contains(ChangeEvent::RESCAN)
    }

    /// The monitor was canceled; this is its final notification.
    pub fn canceled(&self) -> bool {
        self.event.contains(ChangeEvent::CANCELED)
    }

    /// The consumer must fully rescan its view of the tree.
    pub fn rescan_required(&self) -> bool {
        self.event.intersects(ChangeEvent::RESCAN_REQUIRED)
    }

    /// Moves the target path out of the notification without a copy: the rename destination if
    /// one is present, the event path otherwise.
    ///
    /// Change events are frequent and ephemeral; this avoids a clone per consumed path. The
    /// notification is invalidated.
    pub fn extract_path(&mut self) -> PathBuf {
        self.event = ChangeEvent::empty();
        self.registration_id = 0;
        match self.renamed_to_path.take() {
            Some(p) => p,
            None => mem::take(&mut self.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(event: ChangeEvent) -> ChangeNotification {
        ChangeNotification::new(PathBuf::from("/t/a"), None, event, FileType::Regular, 1, 7)
    }

    #[test]
    fn composite_masks() {
        assert!(ChangeEvent::ALL.contains(ChangeEvent::CREATED));
        assert!(ChangeEvent::ALL.contains(ChangeEvent::REMOVED));
        assert!(ChangeEvent::ALL.contains(ChangeEvent::RENAMED));
        assert!(ChangeEvent::ALL.contains(ChangeEvent::MODIFIED));
        assert!(!ChangeEvent::ALL.contains(ChangeEvent::RESCAN));
        assert_eq!(
            ChangeEvent::RESCAN_REQUIRED,
            ChangeEvent::RESCAN | ChangeEvent::CANCELED
        );
    }

    #[test]
    fn predicates_follow_bits() {
        let n = note(ChangeEvent::CREATED | ChangeEvent::CONTENT_MODIFIED);
        assert!(n.created());
        assert!(n.content_modified());
        assert!(n.modified());
        assert!(!n.metadata_modified());
        assert!(!n.removed());
        assert!(!n.rescan_required());

        assert!(note(ChangeEvent::RESCAN).rescan_required());
        assert!(note(ChangeEvent::CANCELED).rescan_required());
    }

    #[test]
    fn extract_path_prefers_rename_destination() {
        let mut n = ChangeNotification::new(
            PathBuf::from("/t/a"),
            Some(PathBuf::from("/t/b")),
            ChangeEvent::RENAMED,
            FileType::Regular,
            3,
            7,
        );
        assert_eq!(n.extract_path(), PathBuf::from("/t/b"));
        assert_eq!(n.event(), ChangeEvent::empty());
        assert_eq!(n.registration_id(), 0);

        let mut n = note(ChangeEvent::CREATED);
        assert_eq!(n.extract_path(), PathBuf::from("/t/a"));
    }

    #[test]
    fn type_known_excludes_none() {
        assert!(note(ChangeEvent::CREATED).type_known());
        let mut n = note(ChangeEvent::CREATED);
        n.file_type = FileType::None;
        assert!(!n.type_known());
    }
}
