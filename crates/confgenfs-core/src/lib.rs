// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! confgenfs core: a user-space filesystem engine for configuration data
//!
//! The engine serves a tree of directories, generated files, passthrough
//! files and symlinks. File bytes come from a [`ContentProvider`] on demand
//! and go back to it on flush; the tree, open handles, locks and the
//! materialization cache live here. Kernel adapters talk to a mount through
//! its [`Dispatcher`].

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod fault;
pub mod handle;
pub mod hostfs;
pub mod lock;
pub mod mount;
pub mod node;
pub mod notify;
pub mod provider;
pub mod session;
pub mod types;

pub use config::{
    CachePolicy, CaseSensitivity, EngineConfig, FsLimits, ProtocolConfig, SecurityPolicy,
};
pub use dispatch::Dispatcher;
pub use engine::{Cancellation, Engine, Opened};
pub use error::{CloseTimeError, FsError, FsResult, MountError};
pub use fault::{FaultOp, FaultPolicy, FaultRule, FaultyProvider};
pub use hostfs::HostDirProvider;
pub use mount::{mount, Mount, UnmountReport};
pub use notify::{InvalidationSink, NoopSink};
pub use provider::{ContentProvider, LayoutEntry, MemoryProvider, ProviderError, ProviderResult};
pub use session::{Capabilities, SessionState};
pub use types::{
    Attributes, Descriptor, DirEntry, DirPage, FsStats, HandleId, Metadata, NodeId, NodeKind,
    OpenOptions, SessionId,
};
