//! Configuration types

use crate::error::{Error, ErrorKind, Result};
use crate::event::ChangeEvent;
use crate::state::ResumeState;
use bitflags::bitflags;
use std::time::Duration;

/// Platform passthrough: do not report events caused by this process.
pub const RESERVED_FLAG_IGNORE_SELF: u32 = 0x0000_0008;
/// Platform passthrough: mark (rather than drop) events caused by this process.
pub const RESERVED_FLAG_MARK_SELF: u32 = 0x0000_0020;

const VALID_RESERVED_FLAGS: u32 = RESERVED_FLAG_IGNORE_SELF | RESERVED_FLAG_MARK_SELF;

/// Change monitor configuration.
///
/// ```rust
/// # use std::time::Duration;
/// # use dirwatch::{ChangeConfig, ChangeEvent};
/// let config = ChangeConfig::default()
///     .with_events(ChangeEvent::CREATED | ChangeEvent::REMOVED)
///     .with_notification_latency(Duration::from_millis(100));
/// ```
#[derive(Debug, Clone)]
pub struct ChangeConfig {
    events: ChangeEvent,
    notification_latency: Duration,
    reserved_flags: u32,
    state: Option<ResumeState>,
}

impl ChangeConfig {
    /// Subscribe only to the given event bits.
    ///
    /// The mask must intersect [`ChangeEvent::ALL`]; an empty subscription is rejected at
    /// monitor creation.
    pub fn with_events(mut self, events: ChangeEvent) -> Self {
        self.events = events;
        self
    }

    /// Returns current setting
    pub fn events(&self) -> ChangeEvent {
        self.events
    }

    /// How often to post notifications.
    ///
    /// A larger value allows the platform to coalesce changes into fewer callbacks; zero
    /// delivers as soon as possible. The default is one second.
    pub fn with_notification_latency(mut self, latency: Duration) -> Self {
        self.notification_latency = latency;
        self
    }

    /// Returns current setting
    pub fn notification_latency(&self) -> Duration {
        self.notification_latency
    }

    /// Platform specific passthrough flags.
    ///
    /// Restricted to [`RESERVED_FLAG_IGNORE_SELF`] and [`RESERVED_FLAG_MARK_SELF`].
    pub fn with_reserved_flags(mut self, flags: u32) -> Self {
        self.reserved_flags = flags;
        self
    }

    /// Returns current setting
    pub fn reserved_flags(&self) -> u32 {
        self.reserved_flags
    }

    /// Resume the event stream from a previously serialized state.
    ///
    /// See [`ResumeState::deserialize`](crate::ResumeState::deserialize).
    pub fn with_state(mut self, state: ResumeState) -> Self {
        self.state = Some(state);
        self
    }

    /// Returns current setting
    pub fn state(&self) -> Option<&ResumeState> {
        self.state.as_ref()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.events.intersects(ChangeEvent::ALL | ChangeEvent::RESCAN_REQUIRED) {
            return Err(Error::new(ErrorKind::InvalidArgument(Some(self.events))));
        }
        if self.reserved_flags & !VALID_RESERVED_FLAGS != 0 {
            return Err(Error::invalid_argument());
        }
        Ok(())
    }
}

impl Default for ChangeConfig {
    fn default() -> Self {
        Self {
            events: ChangeEvent::ALL,
            notification_latency: Duration::from_millis(1000),
            reserved_flags: 0,
            state: None,
        }
    }
}

bitflags! {
    /// Options controlling directory traversal and, for the change iterator, which change
    /// events feed it.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct DirOptions: u32 {
        /// Descend into directories reached through symbolic links. The canonical target path
        /// is used for descent.
        const FOLLOW_DIRECTORY_SYMLINK = 1 << 0;
        /// Silently skip directories that cannot be opened due to missing permissions.
        const SKIP_PERMISSION_DENIED = 1 << 1;
        /// Do not recurse at all; list only the immediate children of the root.
        const SKIP_SUBDIRECTORY_DESCENDANTS = 1 << 2;
        /// Skip hidden files and directories.
        const SKIP_HIDDEN_DESCENDANTS = 1 << 3;
        /// Do not descend into packages (macOS bundle directories). The package directory
        /// itself is still yielded.
        const SKIP_PACKAGE_CONTENT_DESCENDANTS = 1 << 4;
        /// Cross mount points. By default a mounted subtree is yielded but not entered.
        const FOLLOW_MOUNTPOINTS = 1 << 5;
        /// Additionally yield each directory after all of its descendants.
        const INCLUDE_POSTORDER_DIRECTORIES = 1 << 6;
        /// Yield AppleDouble (`._name`) sidecar files even when their sibling exists. macOS
        /// only; elsewhere sidecars are always yielded.
        const INCLUDE_APPLE_DOUBLE_FILES = 1 << 7;
        /// Change iterator: queue paths for created and renamed items.
        const INCLUDE_CREATED_EVENTS = 1 << 8;
        /// Change iterator: queue paths for content-modified items.
        const INCLUDE_MODIFIED_EVENTS = 1 << 9;
    }
}

bitflags! {
    /// Options applied when deserializing a resume token.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct ThawOptions: u32 {
        /// After replaying historical events up to the stream position current at subscription
        /// time, emit a [`REPLAY_END`](crate::ChangeEvent::REPLAY_END) notification and cancel.
        const REPLAY_TO_CURRENT_EVENT = 1 << 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = ChangeConfig::default();
        assert_eq!(config.events(), ChangeEvent::ALL);
        assert_eq!(config.notification_latency(), Duration::from_millis(1000));
        assert_eq!(config.reserved_flags(), 0);
        assert!(config.state().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_rejects_empty_events() {
        let config = ChangeConfig::default().with_events(ChangeEvent::empty());
        assert!(matches!(
            config.validate().unwrap_err().kind,
            ErrorKind::InvalidArgument(_)
        ));
    }

    #[test]
    fn config_rejects_undocumented_reserved_flags() {
        let config = ChangeConfig::default().with_reserved_flags(0x4000_0000);
        assert!(config.validate().is_err());

        let config = ChangeConfig::default()
            .with_reserved_flags(RESERVED_FLAG_IGNORE_SELF | RESERVED_FLAG_MARK_SELF);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn dir_options_default_is_recursive() {
        let opts = DirOptions::default();
        assert!(!opts.contains(DirOptions::SKIP_SUBDIRECTORY_DESCENDANTS));
        assert!(!opts.contains(DirOptions::FOLLOW_MOUNTPOINTS));
    }
}
