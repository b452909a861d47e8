// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for confgenfs

use std::time::{SystemTime, UNIX_EPOCH};

use confgenfs_proto::FileKind;
use serde::{Deserialize, Serialize};

/// Stable node identifier. Never reused within a mount.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// The root directory of every mount.
    pub const ROOT: NodeId = NodeId(1);

    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(pub u64);

impl HandleId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mount session identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Directory,
    /// Contents produced by the provider on demand.
    Generated,
    /// Contents mirrored from an underlying mutable source.
    Passthrough,
    Symlink,
}

impl NodeKind {
    pub fn is_dir(self) -> bool {
        self == NodeKind::Directory
    }

    /// Whether the node carries byte content the provider materializes.
    pub fn has_content(self) -> bool {
        matches!(self, NodeKind::Generated | NodeKind::Passthrough)
    }

    pub fn wire(self) -> FileKind {
        match self {
            NodeKind::Directory => FileKind::Directory,
            NodeKind::Generated => FileKind::Generated,
            NodeKind::Passthrough => FileKind::Passthrough,
            NodeKind::Symlink => FileKind::Symlink,
        }
    }
}

/// Content-source token handed to the provider.
///
/// Descriptors are path-like (`/etc/app.conf`) by convention; the engine only
/// builds child descriptors through the provider and never interprets them.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Descriptor(pub String);

impl Descriptor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Default child naming: `<parent>/<name>`, with no doubled separator at
    /// the root.
    pub fn child(&self, name: &str) -> Descriptor {
        if self.0.is_empty() || self.0.ends_with('/') {
            Descriptor(format!("{}{}", self.0, name))
        } else {
            Descriptor(format!("{}/{}", self.0, name))
        }
    }
}

impl std::fmt::Display for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Timestamp with nanosecond precision since the Unix epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub secs: u64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn now() -> Self {
        let since = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            secs: since.as_secs(),
            nanos: since.subsec_nanos(),
        }
    }

    pub fn from_system(time: SystemTime) -> Self {
        let since = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            secs: since.as_secs(),
            nanos: since.subsec_nanos(),
        }
    }
}

/// File timestamps
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileTimes {
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
}

impl FileTimes {
    pub fn now() -> Self {
        let now = Timestamp::now();
        Self {
            atime: now,
            mtime: now,
            ctime: now,
        }
    }
}

/// Node metadata. `size` is a hint for generated files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub size: u64,
    pub times: FileTimes,
    /// Permission bits only (no file-type bits).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Node attributes as reported to the kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attributes {
    pub node: NodeId,
    pub kind: NodeKind,
    pub nlink: u32,
    pub meta: Metadata,
}

/// Directory entry information
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub node: NodeId,
    pub kind: NodeKind,
    /// Token resuming the listing right after this entry.
    pub next_offset: u64,
}

/// One page of a directory listing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirPage {
    pub entries: Vec<DirEntry>,
    /// `None` when the listing is complete.
    pub next_offset: Option<u64>,
}

#[cfg(target_os = "linux")]
const O_DIRECT: i32 = libc::O_DIRECT;
#[cfg(not(target_os = "linux"))]
const O_DIRECT: i32 = 0;

/// File open options
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
    /// Skip the per-handle snapshot; every read materializes afresh.
    pub live: bool,
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    pub fn write_only() -> Self {
        Self {
            write: true,
            ..Self::default()
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }

    /// Decode kernel `O_*` open flags. `O_DIRECT` selects live mode.
    pub fn from_flags(flags: u32) -> Self {
        let flags = flags as i32;
        let (read, write) = match flags & libc::O_ACCMODE {
            libc::O_WRONLY => (false, true),
            libc::O_RDWR => (true, true),
            _ => (true, false),
        };
        Self {
            read,
            write,
            append: flags & libc::O_APPEND != 0,
            truncate: flags & libc::O_TRUNC != 0,
            live: O_DIRECT != 0 && flags & O_DIRECT != 0,
        }
    }
}

/// Engine statistics
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FsStats {
    pub nodes: u64,
    pub open_handles: u64,
    pub cached_entries: u64,
    pub materializations: u64,
    pub commits: u64,
    pub close_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_descriptor_joins_once() {
        assert_eq!(Descriptor::new("/").child("a.conf"), Descriptor::new("/a.conf"));
        assert_eq!(Descriptor::new("/etc").child("a.conf"), Descriptor::new("/etc/a.conf"));
        assert_eq!(Descriptor::new("").child("a"), Descriptor::new("a"));
    }

    #[test]
    fn open_flags_decode() {
        let rw = OpenOptions::from_flags((libc::O_RDWR | libc::O_APPEND) as u32);
        assert!(rw.read && rw.write && rw.append && !rw.live);

        let wo = OpenOptions::from_flags((libc::O_WRONLY | libc::O_TRUNC) as u32);
        assert!(!wo.read && wo.write && wo.truncate);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn direct_flag_selects_live_mode() {
        let live = OpenOptions::from_flags(libc::O_DIRECT as u32);
        assert_eq!(live, OpenOptions { live: true, ..OpenOptions::read_only() });
    }
}
