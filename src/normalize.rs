//! Raw platform events and their normalization into the uniform model.
//!
//! Backends translate native change records into [`RawEvent`] batches using
//! the flag vocabulary below (bit-compatible with the richest native source,
//! FSEvents, so that backend can pass its flag words through unchanged).
//! [`normalize_batch`] then applies the platform-independent rules: the
//! removed-wins ordering, the coalesced-remove heuristic, root-change
//! recovery, mount handling and the replay boundary.

use crate::event::{ChangeEvent, ChangeNotification, FileType};
use crate::state::ChangeState;
use bitflags::bitflags;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

bitflags! {
    /// Platform-level change flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct RawFlags: u32 {
        const MUST_SCAN_SUBDIRS = 1 << 0;
        const USER_DROPPED = 1 << 1;
        const KERNEL_DROPPED = 1 << 2;
        const IDS_WRAPPED = 1 << 3;
        const HISTORY_DONE = 1 << 4;
        const ROOT_CHANGED = 1 << 5;
        const MOUNT = 1 << 6;
        const UNMOUNT = 1 << 7;
        const ITEM_CREATED = 1 << 8;
        const ITEM_REMOVED = 1 << 9;
        const INODE_META_MOD = 1 << 10;
        const ITEM_RENAMED = 1 << 11;
        const ITEM_MODIFIED = 1 << 12;
        const FINDER_INFO_MOD = 1 << 13;
        const CHANGE_OWNER = 1 << 14;
        const XATTR_MOD = 1 << 15;
        const IS_FILE = 1 << 16;
        const IS_DIR = 1 << 17;
        const IS_SYMLINK = 1 << 18;

        const ITEM_CHANGE_FLAGS = Self::ITEM_CREATED.bits()
            | Self::ITEM_REMOVED.bits()
            | Self::INODE_META_MOD.bits()
            | Self::ITEM_RENAMED.bits()
            | Self::ITEM_MODIFIED.bits()
            | Self::FINDER_INFO_MOD.bits()
            | Self::CHANGE_OWNER.bits()
            | Self::XATTR_MOD.bits();
    }
}

/// One native change record.
#[derive(Debug, Clone)]
pub(crate) struct RawEvent {
    pub path: PathBuf,
    pub flags: RawFlags,
    pub id: u64,
}

/// The result of normalizing one batch.
pub(crate) struct NormalizedBatch {
    pub notes: Vec<ChangeNotification>,
    pub last_id: u64,
    /// The platform subscription must be stopped; the batch's final notification is terminal.
    pub cancel: bool,
}

pub(crate) fn to_event(flags: RawFlags) -> ChangeEvent {
    let mut evts = ChangeEvent::empty();

    if flags.intersects(RawFlags::MOUNT | RawFlags::UNMOUNT) {
        return ChangeEvent::RESCAN;
    }

    // Renames require extra processing (the pairing pass), so the flag must travel with other
    // events when present.
    if flags.contains(RawFlags::ITEM_RENAMED) {
        evts |= ChangeEvent::RENAMED;
    }

    // Order matters due to event coalescing.
    // XXX: removed events can be coalesced with create events that occur AFTER the remove.
    // This seems wrong and is handled specially in `normalize_batch`.
    if flags.contains(RawFlags::ITEM_REMOVED) {
        evts |= ChangeEvent::REMOVED;
    } else {
        // XXX: create does not override modified as this may screw up clients looking for a
        // modify after a known create where the platform has coalesced the two.
        if flags.contains(RawFlags::ITEM_CREATED) {
            evts |= ChangeEvent::CREATED;
        }
        if flags.contains(RawFlags::ITEM_MODIFIED) {
            evts |= ChangeEvent::CONTENT_MODIFIED;
        }
        if flags.intersects(
            RawFlags::INODE_META_MOD
                | RawFlags::FINDER_INFO_MOD
                | RawFlags::CHANGE_OWNER
                | RawFlags::XATTR_MOD,
        ) {
            evts |= ChangeEvent::METADATA_MODIFIED;
        }
    }

    evts
}

pub(crate) fn to_type(flags: RawFlags) -> FileType {
    match flags & (RawFlags::IS_FILE | RawFlags::IS_DIR | RawFlags::IS_SYMLINK) {
        RawFlags::IS_FILE => FileType::Regular,
        RawFlags::IS_DIR => FileType::Directory,
        RawFlags::IS_SYMLINK => FileType::Symlink,
        _ => FileType::None,
    }
}

fn rescan_required(flags: RawFlags) -> bool {
    flags.intersects(RawFlags::ROOT_CHANGED | RawFlags::MUST_SCAN_SUBDIRS)
}

// Cheaper than a full status query, and deliberately counts "exists but unreadable" as
// existing.
fn exists(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(_) => true,
        Err(e) => e.kind() != io::ErrorKind::NotFound,
    }
}

/// Converts one batch of raw platform events into notifications.
///
/// A root-changed or must-rescan condition, and the replay boundary, each terminate the batch:
/// the remaining raw events are invalid once the subscription is canceled.
pub(crate) fn normalize_batch(state: &ChangeState, events: &[RawEvent]) -> NormalizedBatch {
    let mut notes = Vec::new();
    let mut last_id = 0u64;
    let mut cancel = false;
    let stop_id = state.stop_id();
    let regid = state.regid();

    for raw in events {
        let flags = raw.flags;

        if rescan_required(flags) {
            let mut event = ChangeEvent::CANCELED | ChangeEvent::RESCAN;
            let path = raw.path.clone();
            let mut new_path = None;
            if flags.contains(RawFlags::ROOT_CHANGED) && !exists(&path) {
                match state.canonical_root_path() {
                    Some(current) if exists(&current) => {
                        event |= ChangeEvent::RENAMED;
                        event &= !ChangeEvent::RESCAN;
                        new_path = Some(current);
                    }
                    _ => {
                        event |= ChangeEvent::REMOVED;
                    }
                }
            }
            notes.push(ChangeNotification::new(
                path,
                new_path,
                event,
                FileType::Directory,
                raw.id,
                regid,
            ));
            cancel = true;
            break; // further events are invalid
        }

        let mut negated = RawFlags::empty();
        if flags.contains(RawFlags::ITEM_REMOVED)
            && (flags & RawFlags::ITEM_CHANGE_FLAGS) != RawFlags::ITEM_REMOVED
        {
            // A remove event has been coalesced with later changes to the same path. There is a
            // potential race with the filesystem here, but it is the only way to tell the cases
            // apart.
            if exists(&raw.path) {
                negated = RawFlags::ITEM_REMOVED;
            }
        }

        let history_done = flags == RawFlags::HISTORY_DONE;
        if !history_done {
            last_id = raw.id;
            notes.push(ChangeNotification::new(
                raw.path.clone(),
                None,
                to_event(flags & !negated),
                to_type(flags),
                raw.id,
                regid,
            ));
        }

        // The history-done marker should be enough, but use the stop id as a fallback in case
        // the platform never delivers one.
        if stop_id > 0 && (history_done || last_id >= stop_id) {
            notes.push(ChangeNotification::new(
                PathBuf::new(),
                None,
                ChangeEvent::REPLAY_END,
                FileType::None,
                0,
                regid,
            ));
            cancel = true;
            break;
        }
    }

    NormalizedBatch {
        notes,
        last_id,
        cancel,
    }
}

/// Pairs rename halves that share an event id.
///
/// The first half receives the second's path as its rename destination and the second is
/// removed. When the second half also carries `REMOVED` it became a cross-tree remove: its
/// `RENAMED` bit is cleared instead and no merge happens.
///
/// XXX: this fails if the platform merged other events into one half (the merged event will
/// not have the same id as the pure rename event), and it cannot pair across batches. Other
/// methods of detecting a rename (such as examining the paths of renamed events) are prone to
/// race conditions.
pub(crate) fn process_renames(notes: &mut Vec<ChangeNotification>) {
    let mut count = notes.len();
    let mut i = 0;
    while i < count {
        if notes[i].event.contains(ChangeEvent::RENAMED) && notes[i].event_id > 0 {
            let id = notes[i].event_id;
            let mut j = i + 1;
            while j < count {
                if notes[j].event.contains(ChangeEvent::RENAMED) && notes[j].event_id == id {
                    if !notes[j].event.contains(ChangeEvent::REMOVED) {
                        // A rename within the tree and within the same latency period.
                        let second = notes.remove(j);
                        notes[i].renamed_to_path = Some(second.path);
                        count -= 1;
                    } else {
                        notes[j].event.remove(ChangeEvent::RENAMED);
                    }
                    break;
                }
                j += 1;
            }
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ChangeState;
    use std::fs::File;
    use std::sync::Arc;

    fn raw(path: &Path, flags: RawFlags, id: u64) -> RawEvent {
        RawEvent {
            path: path.to_path_buf(),
            flags,
            id,
        }
    }

    fn test_state(stop_id: u64) -> (tempfile::TempDir, Arc<ChangeState>) {
        let dir = tempfile::tempdir().unwrap();
        let state = ChangeState::for_tests(dir.path(), stop_id);
        (dir, state)
    }

    #[test]
    fn event_conversion() {
        assert_eq!(to_event(RawFlags::empty()), ChangeEvent::empty());
        assert_eq!(to_event(RawFlags::MOUNT), ChangeEvent::RESCAN);
        assert_eq!(to_event(RawFlags::UNMOUNT), ChangeEvent::RESCAN);
        // Mount wins over item flags; the two should be mutually exclusive anyway.
        assert_eq!(
            to_event(RawFlags::MOUNT | RawFlags::ITEM_CREATED),
            ChangeEvent::RESCAN
        );
        assert_eq!(
            to_event(RawFlags::ITEM_CREATED | RawFlags::ITEM_MODIFIED | RawFlags::ITEM_REMOVED),
            ChangeEvent::REMOVED
        );
        assert_eq!(
            to_event(RawFlags::ITEM_CREATED | RawFlags::ITEM_MODIFIED),
            ChangeEvent::CREATED | ChangeEvent::CONTENT_MODIFIED
        );
        assert_eq!(
            to_event(RawFlags::ITEM_CREATED | RawFlags::ITEM_RENAMED),
            ChangeEvent::CREATED | ChangeEvent::RENAMED
        );
        assert_eq!(
            to_event(RawFlags::ITEM_REMOVED | RawFlags::ITEM_RENAMED),
            ChangeEvent::REMOVED | ChangeEvent::RENAMED
        );
        let allmod = ChangeEvent::CONTENT_MODIFIED | ChangeEvent::METADATA_MODIFIED;
        for meta in [
            RawFlags::INODE_META_MOD,
            RawFlags::FINDER_INFO_MOD,
            RawFlags::CHANGE_OWNER,
            RawFlags::XATTR_MOD,
        ] {
            assert_eq!(to_event(RawFlags::ITEM_MODIFIED | meta), allmod);
        }
    }

    #[test]
    fn type_conversion() {
        assert_eq!(to_type(RawFlags::empty()), FileType::None);
        assert_eq!(to_type(RawFlags::IS_FILE), FileType::Regular);
        assert_eq!(to_type(RawFlags::IS_DIR), FileType::Directory);
        assert_eq!(to_type(RawFlags::IS_SYMLINK), FileType::Symlink);
    }

    #[test]
    fn rescan_detection() {
        assert!(rescan_required(RawFlags::ROOT_CHANGED));
        assert!(rescan_required(RawFlags::MUST_SCAN_SUBDIRS));
        assert!(rescan_required(
            RawFlags::ROOT_CHANGED | RawFlags::MUST_SCAN_SUBDIRS
        ));
        assert!(!rescan_required(RawFlags::ITEM_CREATED));
    }

    #[test]
    fn empty_batch() {
        let (_dir, state) = test_state(0);
        let batch = normalize_batch(&state, &[]);
        assert!(batch.notes.is_empty());
        assert_eq!(batch.last_id, 0);
        assert!(!batch.cancel);
    }

    #[test]
    fn root_removed_cancels_and_drops_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let state = ChangeState::for_tests(&root, 0);
        std::fs::remove_dir(&root).unwrap();

        let events = [
            raw(&root, RawFlags::ROOT_CHANGED, 0),
            raw(
                &root.join("x"),
                RawFlags::ITEM_CREATED | RawFlags::IS_FILE,
                1,
            ),
        ];
        let batch = normalize_batch(&state, &events);
        assert!(batch.cancel);
        // all events after the canceling event are dropped
        assert_eq!(batch.notes.len(), 1);
        let n = &batch.notes[0];
        assert_eq!(
            n.event(),
            ChangeEvent::REMOVED | ChangeEvent::CANCELED | ChangeEvent::RESCAN
        );
        assert_eq!(n.path(), root);
        assert!(n.renamed_to_path().is_none());
        assert_eq!(n.file_type(), FileType::Directory);
    }

    #[test]
    fn root_rename_recovers_the_new_path() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        std::fs::create_dir(&first).unwrap();
        let state = ChangeState::for_tests(&first, 0);

        let second = dir.path().join("second");
        std::fs::rename(&first, &second).unwrap();

        let events = [raw(&first, RawFlags::ROOT_CHANGED, 0)];
        let batch = normalize_batch(&state, &events);
        assert!(batch.cancel);
        assert_eq!(batch.notes.len(), 1);
        let n = &batch.notes[0];
        assert_eq!(n.event(), ChangeEvent::RENAMED | ChangeEvent::CANCELED);
        assert_eq!(n.path(), first);
        assert_eq!(
            n.renamed_to_path().unwrap(),
            second.canonicalize().unwrap()
        );
        assert_eq!(n.file_type(), FileType::Directory);
    }

    #[test]
    fn scan_subdirs_cancels_with_rescan() {
        let (_dir, state) = test_state(0);
        let events = [
            raw(state.root(), RawFlags::MUST_SCAN_SUBDIRS, 0),
            raw(
                &state.root().join("x"),
                RawFlags::ITEM_CREATED | RawFlags::IS_FILE,
                1,
            ),
        ];
        let batch = normalize_batch(&state, &events);
        assert!(batch.cancel);
        assert_eq!(batch.notes.len(), 1);
        assert_eq!(
            batch.notes[0].event(),
            ChangeEvent::CANCELED | ChangeEvent::RESCAN
        );
    }

    #[test]
    fn lone_remove_is_removed_even_if_the_path_exists() {
        let (dir, state) = test_state(0);
        let p = dir.path().join("f");
        File::create(&p).unwrap();
        let events = [raw(&p, RawFlags::ITEM_REMOVED | RawFlags::IS_FILE, 1)];
        let batch = normalize_batch(&state, &events);
        // Only coalesced removes consult the filesystem.
        assert_eq!(batch.notes[0].event(), ChangeEvent::REMOVED);
        assert_eq!(batch.notes[0].file_type(), FileType::Regular);
        assert_eq!(batch.last_id, 1);
    }

    #[test]
    fn coalesced_remove_with_existing_path_drops_the_remove() {
        let (dir, state) = test_state(0);
        let p = dir.path().join("f");
        File::create(&p).unwrap();
        let events = [raw(
            &p,
            RawFlags::ITEM_CREATED | RawFlags::ITEM_REMOVED | RawFlags::IS_FILE,
            1,
        )];
        let batch = normalize_batch(&state, &events);
        assert_eq!(batch.notes[0].event(), ChangeEvent::CREATED);
    }

    #[test]
    fn coalesced_remove_with_missing_path_stays_removed() {
        let (dir, state) = test_state(0);
        let p = dir.path().join("f");
        let events = [raw(
            &p,
            RawFlags::ITEM_CREATED | RawFlags::ITEM_REMOVED | RawFlags::IS_FILE,
            1,
        )];
        let batch = normalize_batch(&state, &events);
        assert_eq!(batch.notes[0].event(), ChangeEvent::REMOVED);
    }

    #[test]
    fn mount_and_unmount_map_to_rescan_only() {
        let (dir, state) = test_state(0);
        let p = dir.path().join("vol");
        let events = [raw(&p, RawFlags::MOUNT, 1), raw(&p, RawFlags::UNMOUNT, 2)];
        let batch = normalize_batch(&state, &events);
        assert!(!batch.cancel);
        assert_eq!(batch.notes.len(), 2);
        for n in &batch.notes {
            assert_eq!(n.event(), ChangeEvent::RESCAN);
            assert!(!n.type_known());
        }
        assert_eq!(batch.last_id, 2);
    }

    #[test]
    fn history_done_alone_produces_nothing() {
        let (dir, state) = test_state(0);
        let events = [raw(dir.path(), RawFlags::HISTORY_DONE, 0)];
        let batch = normalize_batch(&state, &events);
        assert!(batch.notes.is_empty());
        assert!(!batch.cancel);
    }

    #[test]
    fn history_done_with_stop_id_emits_the_replay_boundary() {
        let (dir, state) = test_state(2);
        let events = [raw(dir.path(), RawFlags::HISTORY_DONE, 0)];
        let batch = normalize_batch(&state, &events);
        assert!(batch.cancel);
        assert_eq!(batch.notes.len(), 1);
        let n = &batch.notes[0];
        assert_eq!(n.event(), ChangeEvent::REPLAY_END);
        assert_eq!(n.path(), Path::new(""));
        assert_eq!(n.file_type(), FileType::None);
        assert_eq!(n.event_id(), 0);
    }

    #[test]
    fn reaching_the_stop_id_emits_the_replay_boundary() {
        let (dir, state) = test_state(2);
        let p = dir.path().join("f");
        let events = [
            raw(&p, RawFlags::ITEM_CREATED | RawFlags::IS_FILE, 1),
            raw(&p, RawFlags::ITEM_MODIFIED | RawFlags::IS_FILE, 2),
            raw(&p, RawFlags::ITEM_MODIFIED | RawFlags::IS_FILE, 3),
        ];
        let batch = normalize_batch(&state, &events);
        assert!(batch.cancel);
        // id 1, id 2, replay end; id 3 dropped
        assert_eq!(batch.notes.len(), 3);
        assert_eq!(batch.notes[2].event(), ChangeEvent::REPLAY_END);
        assert_eq!(batch.last_id, 2);
    }

    #[test]
    fn renames_with_matching_ids_merge() {
        let (dir, state) = test_state(0);
        let p = dir.path().join("test");
        let np = dir.path().join("test2");
        let events = [
            raw(&p, RawFlags::ITEM_RENAMED | RawFlags::IS_FILE, 1),
            raw(&np, RawFlags::ITEM_RENAMED | RawFlags::IS_FILE, 1),
        ];
        let mut batch = normalize_batch(&state, &events);
        assert_eq!(batch.notes.len(), 2);
        process_renames(&mut batch.notes);
        assert_eq!(batch.notes.len(), 1);
        let n = &batch.notes[0];
        assert_eq!(n.event(), ChangeEvent::RENAMED);
        assert_eq!(n.path(), p);
        assert_eq!(n.renamed_to_path().unwrap(), np);
        assert_eq!(n.file_type(), FileType::Regular);
        assert_eq!(batch.last_id, 1);
    }

    #[test]
    fn rename_second_half_with_removed_becomes_a_remove() {
        let (dir, state) = test_state(0);
        let p = dir.path().join("test");
        let np = dir.path().join("test2");
        let events = [
            raw(&p, RawFlags::ITEM_RENAMED | RawFlags::IS_FILE, 1),
            raw(
                &np,
                RawFlags::ITEM_RENAMED | RawFlags::ITEM_REMOVED | RawFlags::IS_FILE,
                1,
            ),
        ];
        let mut batch = normalize_batch(&state, &events);
        assert_eq!(batch.notes.len(), 2);
        assert_eq!(
            batch.notes[1].event(),
            ChangeEvent::RENAMED | ChangeEvent::REMOVED
        );
        process_renames(&mut batch.notes);
        assert_eq!(batch.notes.len(), 2);
        assert_eq!(batch.notes[0].event(), ChangeEvent::RENAMED);
        assert!(batch.notes[0].renamed_to_path().is_none());
        assert_eq!(batch.notes[1].event(), ChangeEvent::REMOVED);
    }

    #[test]
    fn rename_pairing_is_idempotent() {
        let (dir, state) = test_state(0);
        let p = dir.path().join("test");
        let np = dir.path().join("test2");
        let events = [
            raw(&p, RawFlags::ITEM_RENAMED | RawFlags::IS_FILE, 1),
            raw(&np, RawFlags::ITEM_RENAMED | RawFlags::IS_FILE, 1),
            raw(&p, RawFlags::ITEM_CREATED | RawFlags::IS_FILE, 2),
        ];
        let mut batch = normalize_batch(&state, &events);
        process_renames(&mut batch.notes);
        let once: Vec<_> = batch
            .notes
            .iter()
            .map(|n| (n.path().to_path_buf(), n.event(), n.event_id()))
            .collect();
        process_renames(&mut batch.notes);
        let twice: Vec<_> = batch
            .notes
            .iter()
            .map(|n| (n.path().to_path_buf(), n.event(), n.event_id()))
            .collect();
        assert_eq!(once, twice);
    }

    #[test]
    fn unmatched_rename_halves_are_left_alone() {
        let (dir, state) = test_state(0);
        let p = dir.path().join("test");
        let events = [raw(&p, RawFlags::ITEM_RENAMED | RawFlags::IS_FILE, 4)];
        let mut batch = normalize_batch(&state, &events);
        process_renames(&mut batch.notes);
        assert_eq!(batch.notes.len(), 1);
        assert_eq!(batch.notes[0].event(), ChangeEvent::RENAMED);
        assert!(batch.notes[0].renamed_to_path().is_none());
    }
}
