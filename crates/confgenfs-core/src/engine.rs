// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The filesystem engine
//!
//! `Engine` ties the node store, handle table, lock manager, materialization
//! cache and content provider together behind the operations the dispatcher
//! invokes. Every method takes `&self`; the engine is shared between worker
//! threads through an `Arc`.
//!
//! Lock order is fixed: handle mutex, then node locks (ascending id), then the
//! store's internal lock. Invalidation notices are sent after node locks are
//! released.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use confgenfs_proto::{validate_name, validate_new_name};
use crossbeam_queue::SegQueue;
use tracing::{debug, info, warn};

use crate::cache::{CacheOutcome, MaterializationCache};
use crate::config::EngineConfig;
use crate::error::{CloseTimeError, FsError, FsResult, MountError};
use crate::handle::{lock_handle, Handle, HandleState, HandleTable};
use crate::lock::LockManager;
use crate::node::{NewNode, NodeInfo, NodeStore};
use crate::notify::{InvalidationSink, NoopSink};
use crate::provider::{ContentProvider, LayoutEntry};
use crate::session::Session;
use crate::types::{
    Attributes, Descriptor, DirPage, FileTimes, FsStats, HandleId, Metadata, NodeId, NodeKind,
    OpenOptions, SessionId, Timestamp,
};

/// Largest content a single handle buffers.
pub const MAX_BUFFER_BYTES: usize = 64 * 1024 * 1024;

/// Marks an in-flight request as abandoned by its caller.
#[derive(Debug, Default)]
pub struct Cancellation {
    cancelled: AtomicBool,
}

impl Cancellation {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A freshly opened handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Opened {
    pub handle: HandleId,
    /// Bypass the kernel page cache; set for generated files, whose size
    /// hint may not match what a read produces.
    pub direct_io: bool,
}

/// Close-time errors kept for [`Engine::drain_close_errors`].
const MAX_QUEUED_CLOSE_ERRORS: usize = 1024;

#[derive(Default)]
struct Counters {
    materializations: AtomicU64,
    commits: AtomicU64,
    close_errors: AtomicU64,
}

pub struct Engine {
    config: EngineConfig,
    provider: Arc<dyn ContentProvider>,
    store: NodeStore,
    locks: LockManager,
    cache: MaterializationCache,
    handles: HandleTable,
    session: Session,
    sink: RwLock<Arc<dyn InvalidationSink>>,
    close_errors: SegQueue<CloseTimeError>,
    counters: Counters,
}

fn window(bytes: &[u8], offset: u64, size: u32) -> Vec<u8> {
    let len = bytes.len() as u64;
    if offset >= len {
        return Vec::new();
    }
    let end = len.min(offset.saturating_add(u64::from(size)));
    bytes[offset as usize..end as usize].to_vec()
}

impl Engine {
    pub fn new(
        provider: Arc<dyn ContentProvider>,
        root: Descriptor,
        config: EngineConfig,
        session: SessionId,
    ) -> Self {
        let root_meta = Metadata {
            size: 0,
            times: FileTimes::now(),
            mode: config.security.default_dir_mode,
            uid: config.security.uid(),
            gid: config.security.gid(),
        };
        Self {
            store: NodeStore::new(root, root_meta, config.case_sensitivity),
            locks: LockManager::new(),
            cache: MaterializationCache::new(config.cache.materialize_cache),
            handles: HandleTable::new(config.limits.max_open_handles as usize),
            session: Session::new(session, &config),
            sink: RwLock::new(Arc::new(NoopSink)),
            close_errors: SegQueue::new(),
            counters: Counters::default(),
            provider,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    pub fn set_invalidation_sink(&self, sink: Arc<dyn InvalidationSink>) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = sink;
    }

    fn sink(&self) -> Arc<dyn InvalidationSink> {
        self.sink.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn kernel_invalidates(&self) -> bool {
        self.session.capabilities().map_or(true, |caps| caps.kernel_invalidates())
    }

    fn new_meta(&self, kind: NodeKind, mode: Option<u32>, size: u64) -> Metadata {
        let security = &self.config.security;
        let default_mode = match kind {
            NodeKind::Directory => security.default_dir_mode,
            NodeKind::Symlink => 0o777,
            NodeKind::Generated | NodeKind::Passthrough => security.default_file_mode,
        };
        Metadata {
            size,
            times: FileTimes::now(),
            mode: mode.map_or(default_mode, |m| m & 0o7777),
            uid: security.uid(),
            gid: security.gid(),
        }
    }

    /// Populate the tree from a provider layout. Missing intermediate
    /// directories are created implicitly.
    pub(crate) fn seed(&self, entries: Vec<LayoutEntry>) -> Result<usize, MountError> {
        let mut created = 0;
        for entry in entries {
            let entry_err = |source: FsError| MountError::Entry {
                path: entry.path.clone(),
                source,
            };
            let components: Vec<&str> = entry.path.split('/').filter(|c| !c.is_empty()).collect();
            let Some((last, parents)) = components.split_last() else {
                continue;
            };
            let mut parent = NodeId::ROOT;
            for component in parents {
                parent = match self.store.lookup(parent, component) {
                    Ok(id) => id,
                    Err(FsError::NotFound) => {
                        validate_new_name(component.as_bytes()).map_err(|e| entry_err(e.into()))?;
                        let parent_desc = self.store.get(parent).map_err(entry_err)?.descriptor;
                        let node = NewNode {
                            kind: NodeKind::Directory,
                            descriptor: self.provider.child_descriptor(&parent_desc, component),
                            meta: self.new_meta(NodeKind::Directory, None, 0),
                            target: None,
                        };
                        created += 1;
                        self.store.create(parent, component, node).map_err(entry_err)?
                    }
                    Err(err) => return Err(entry_err(err)),
                };
            }
            validate_new_name(last.as_bytes()).map_err(|e| entry_err(e.into()))?;
            if entry.kind.is_dir() {
                if let Ok(existing) = self.store.lookup(parent, last) {
                    if self.store.get(existing).is_ok_and(|n| n.kind.is_dir()) {
                        continue;
                    }
                }
            }
            let node = NewNode {
                kind: entry.kind,
                descriptor: entry.descriptor.clone(),
                meta: self.new_meta(entry.kind, entry.mode, entry.size_hint),
                target: entry.target.clone(),
            };
            self.store.create(parent, last, node).map_err(entry_err)?;
            created += 1;
        }
        Ok(created)
    }

    /// Resolve a `/`-separated path from the root.
    pub fn lookup_path(&self, path: &str) -> FsResult<NodeId> {
        path.split('/')
            .filter(|c| !c.is_empty())
            .try_fold(NodeId::ROOT, |parent, name| self.store.lookup(parent, name))
    }

    pub fn lookup(&self, parent: NodeId, name: &str) -> FsResult<Attributes> {
        validate_name(name.as_bytes())?;
        let node = self.store.lookup(parent, name)?;
        debug!(parent = parent.0, name, node = node.0, "lookup");
        self.store.stat(node)
    }

    pub fn getattr(&self, node: NodeId) -> FsResult<Attributes> {
        self.store.stat(node)
    }

    pub fn readdir(&self, dir: NodeId, offset: u64, max_entries: usize) -> FsResult<DirPage> {
        let _guard = self.locks.shared(dir);
        self.store.list_children(dir, offset, max_entries)
    }

    pub fn readlink(&self, node: NodeId) -> FsResult<String> {
        let info = self.live_node(node)?;
        match (info.kind, info.target) {
            (NodeKind::Symlink, Some(target)) => Ok(target),
            _ => Err(FsError::InvalidArgument),
        }
    }

    fn live_node(&self, node: NodeId) -> FsResult<NodeInfo> {
        let info = self.store.get(node)?;
        if info.removed {
            return Err(FsError::StaleHandle);
        }
        Ok(info)
    }

    fn check_access(&self, meta: &Metadata, options: &OpenOptions) -> FsResult<()> {
        if !self.config.security.enforce_permissions {
            return Ok(());
        }
        let denied = (options.read && meta.mode & 0o400 == 0)
            || (options.write && meta.mode & 0o200 == 0);
        if denied {
            return Err(FsError::PermissionDenied);
        }
        Ok(())
    }

    /// Produce the node's current content through the cache, under a shared
    /// node lock. A cancelled request still runs to completion; its result
    /// is then discarded.
    fn materialize(
        &self,
        node: NodeId,
        descriptor: &Descriptor,
        cancel: &Cancellation,
    ) -> FsResult<Arc<Vec<u8>>> {
        let (bytes, outcome) = {
            let _guard = self.locks.shared(node);
            let version = self.provider.version(descriptor);
            self.cache.get_or_materialize(descriptor, version, || {
                self.counters.materializations.fetch_add(1, Ordering::Relaxed);
                self.provider.materialize(descriptor)
            })?
        };
        if outcome == CacheOutcome::Miss {
            let size = bytes.len() as u64;
            let _ = self.store.update_meta(node, |meta| meta.size = size);
            debug!(node = node.0, descriptor = %descriptor, size, "materialized");
        }
        if cancel.is_cancelled() {
            return Err(FsError::Interrupted);
        }
        Ok(bytes)
    }

    pub fn open(&self, node: NodeId, options: OpenOptions) -> FsResult<Opened> {
        self.open_cancellable(node, options, &Cancellation::default())
    }

    pub fn open_cancellable(
        &self,
        node: NodeId,
        options: OpenOptions,
        cancel: &Cancellation,
    ) -> FsResult<Opened> {
        let info = self.live_node(node)?;
        self.check_access(&info.meta, &options)?;
        self.open_node(info, options, cancel)
    }

    fn open_node(
        &self,
        info: NodeInfo,
        options: OpenOptions,
        cancel: &Cancellation,
    ) -> FsResult<Opened> {
        let caps = self.session.capabilities()?;
        match info.kind {
            NodeKind::Directory => return Err(FsError::IsADirectory),
            NodeKind::Symlink => return Err(FsError::InvalidArgument),
            NodeKind::Generated | NodeKind::Passthrough => {}
        }
        if !options.read && !options.write {
            return Err(FsError::InvalidArgument);
        }
        self.store.pin(info.id)?;
        let (id, handle) = match self.handles.insert(info.id, options.clone()) {
            Ok(inserted) => inserted,
            Err(err) => {
                self.store.unpin(info.id);
                return Err(err);
            }
        };

        let mut h = lock_handle(&handle);
        let prepared = if options.write && options.truncate {
            h.buffer = Some(Vec::new());
            h.dirty = true;
            if caps.write_buffering {
                Ok(())
            } else {
                self.commit_handle(&mut h, &info.descriptor)
            }
        } else if caps.favors_readahead() && options.read && !options.live {
            self.materialize(info.id, &info.descriptor, cancel).map(|bytes| {
                h.snapshot = Some(bytes);
            })
        } else {
            Ok(())
        };
        if let Err(err) = prepared {
            h.dirty = false;
            h.state = HandleState::Closed;
            drop(h);
            self.handles.remove(id);
            self.store.unpin(info.id);
            return Err(err);
        }
        debug!(
            handle = id.0,
            node = info.id.0,
            read = options.read,
            write = options.write,
            live = options.live,
            "open"
        );
        Ok(Opened {
            handle: id,
            direct_io: info.kind == NodeKind::Generated,
        })
    }

    /// Descriptor of the handle's node, or force-close the handle when the
    /// node is gone.
    fn live_descriptor(&self, h: &mut Handle) -> FsResult<Descriptor> {
        match self.store.get(h.node) {
            Ok(info) if !info.removed => Ok(info.descriptor),
            _ => {
                debug!(handle = h.id.0, node = h.node.0, "handle names a removed node");
                self.handles.force_remove(h.id);
                self.close_locked(h);
                Err(FsError::StaleHandle)
            }
        }
    }

    pub fn read(&self, handle: HandleId, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        self.read_cancellable(handle, offset, size, &Cancellation::default())
    }

    pub fn read_cancellable(
        &self,
        handle: HandleId,
        offset: u64,
        size: u32,
        cancel: &Cancellation,
    ) -> FsResult<Vec<u8>> {
        let size = size.min(self.session.capabilities()?.max_read);
        let shared = self.handles.get(handle)?;
        let mut h = lock_handle(&shared);
        if h.is_closed() || !h.options.read {
            return Err(FsError::BadHandle);
        }
        let descriptor = self.live_descriptor(&mut h)?;
        h.enter(HandleState::Reading)?;

        let result = if let Some(buffer) = &h.buffer {
            Ok(window(buffer, offset, size))
        } else if h.options.live {
            self.materialize(h.node, &descriptor, cancel).map(|bytes| window(&bytes, offset, size))
        } else {
            let snapshot = match &h.snapshot {
                Some(snapshot) => Ok(snapshot.clone()),
                None => self.materialize(h.node, &descriptor, cancel),
            };
            snapshot.map(|bytes| {
                let data = window(&bytes, offset, size);
                h.snapshot = Some(bytes);
                data
            })
        };
        h.state = HandleState::Opened;
        let data = result?;
        h.position = offset + data.len() as u64;
        Ok(data)
    }

    pub fn write(&self, handle: HandleId, offset: u64, data: &[u8]) -> FsResult<u32> {
        let caps = self.session.capabilities()?;
        if data.len() > caps.max_write as usize {
            return Err(FsError::InvalidArgument);
        }
        let shared = self.handles.get(handle)?;
        let mut h = lock_handle(&shared);
        if h.is_closed() || !h.options.write {
            return Err(FsError::BadHandle);
        }
        let descriptor = self.live_descriptor(&mut h)?;
        h.enter(HandleState::Writing)?;

        let result = self.apply_write(&mut h, &descriptor, offset, data);
        let result = match result {
            Ok(()) if !caps.write_buffering => self.commit_handle(&mut h, &descriptor),
            other => other,
        };
        h.state = HandleState::Opened;
        result?;
        Ok(data.len() as u32)
    }

    fn apply_write(
        &self,
        h: &mut Handle,
        descriptor: &Descriptor,
        offset: u64,
        data: &[u8],
    ) -> FsResult<()> {
        if h.buffer.is_none() {
            let seed = match &h.snapshot {
                Some(snapshot) => snapshot.as_ref().clone(),
                None => self.materialize(h.node, descriptor, &Cancellation::default())?.to_vec(),
            };
            h.buffer = Some(seed);
        }
        let Some(buffer) = h.buffer.as_mut() else {
            return Err(FsError::BadHandle);
        };
        let start = if h.options.append { buffer.len() } else { offset as usize };
        let end = start.checked_add(data.len()).ok_or(FsError::InvalidArgument)?;
        if end > MAX_BUFFER_BYTES {
            return Err(FsError::InvalidArgument);
        }
        if buffer.len() < end {
            buffer.resize(end, 0);
        }
        buffer[start..end].copy_from_slice(data);
        h.dirty = true;
        h.position = end as u64;
        debug!(
            target: "confgenfs::write",
            handle = h.id.0,
            node = h.node.0,
            offset = start,
            len = data.len(),
            "buffered write"
        );
        Ok(())
    }

    /// Hand the handle's buffer to the provider. A rejected buffer stays
    /// dirty.
    fn commit_handle(&self, h: &mut Handle, descriptor: &Descriptor) -> FsResult<()> {
        if !h.dirty {
            return Ok(());
        }
        let Some(buffer) = h.buffer.as_ref() else {
            h.dirty = false;
            return Ok(());
        };
        let previous = h.state;
        h.state = HandleState::Flushing;
        let result = {
            let _guard = self.locks.exclusive(h.node);
            let result = self.provider.commit(descriptor, buffer);
            if result.is_ok() {
                self.cache.invalidate(descriptor);
                let size = buffer.len() as u64;
                let now = Timestamp::now();
                let _ = self.store.update_meta(h.node, |meta| {
                    meta.size = size;
                    meta.times.mtime = now;
                    meta.times.ctime = now;
                });
            }
            result
        };
        h.state = previous;
        match result {
            Ok(()) => {
                h.dirty = false;
                self.counters.commits.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "confgenfs::write",
                    handle = h.id.0,
                    node = h.node.0,
                    descriptor = %descriptor,
                    bytes = h.buffer.as_ref().map_or(0, Vec::len),
                    "committed"
                );
                if !self.kernel_invalidates() {
                    self.sink().invalidate_content(h.node);
                }
                Ok(())
            }
            Err(err) => {
                warn!(handle = h.id.0, node = h.node.0, descriptor = %descriptor, error = %err, "commit failed");
                Err(err.into())
            }
        }
    }

    pub fn flush(&self, handle: HandleId) -> FsResult<()> {
        self.session.capabilities()?;
        let shared = self.handles.get(handle)?;
        let mut h = lock_handle(&shared);
        if h.is_closed() {
            return Err(FsError::BadHandle);
        }
        let descriptor = self.live_descriptor(&mut h)?;
        self.commit_handle(&mut h, &descriptor)
    }

    pub fn fsync(&self, handle: HandleId) -> FsResult<()> {
        self.flush(handle)
    }

    /// Close a handle, committing buffered writes first. A failed commit is
    /// reported through the close-time error queue, not to the caller.
    pub fn release(&self, handle: HandleId) -> FsResult<()> {
        let Some(shared) = self.handles.remove(handle) else {
            if self.handles.take_force_closed(handle) {
                return Ok(());
            }
            return Err(FsError::BadHandle);
        };
        let mut h = lock_handle(&shared);
        self.close_locked(&mut h);
        debug!(handle = handle.0, "release");
        Ok(())
    }

    /// Best-effort flush, then drop state and the node pin. The handle must
    /// already be out of the table.
    fn close_locked(&self, h: &mut Handle) {
        if h.is_closed() {
            return;
        }
        if h.dirty {
            match self.store.get(h.node) {
                // The name may already belong to a new node; never write through it.
                Ok(info) if info.removed => {
                    self.push_close_error(h.id, h.node, info.descriptor, FsError::StaleHandle)
                }
                Ok(info) => {
                    if let Err(err) = self.commit_handle(h, &info.descriptor) {
                        self.push_close_error(h.id, h.node, info.descriptor, err);
                    }
                }
                Err(err) => self.push_close_error(h.id, h.node, Descriptor::new(""), err),
            }
        }
        h.state = HandleState::Closed;
        h.buffer = None;
        h.snapshot = None;
        h.dirty = false;
        self.store.unpin(h.node);
    }

    fn push_close_error(&self, handle: HandleId, node: NodeId, descriptor: Descriptor, error: FsError) {
        let err = CloseTimeError {
            handle,
            node,
            descriptor,
            error,
        };
        warn!(handle = handle.0, node = node.0, "{}", err);
        self.counters.close_errors.fetch_add(1, Ordering::Relaxed);
        // Oldest entries go first once nobody drains the queue.
        while self.close_errors.len() >= MAX_QUEUED_CLOSE_ERRORS {
            if self.close_errors.pop().is_none() {
                break;
            }
        }
        self.close_errors.push(err);
    }

    /// Take every close-time error recorded so far.
    pub fn drain_close_errors(&self) -> Vec<CloseTimeError> {
        std::iter::from_fn(|| self.close_errors.pop()).collect()
    }

    /// Close every open handle; used at unmount.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for id in self.handles.ids() {
            if let Some(shared) = self.handles.remove(id) {
                let mut h = lock_handle(&shared);
                self.close_locked(&mut h);
                closed += 1;
            }
        }
        closed
    }

    fn parent_dir(&self, parent: NodeId) -> FsResult<NodeInfo> {
        let info = self.live_node(parent)?;
        if !info.kind.is_dir() {
            return Err(FsError::NotADirectory);
        }
        Ok(info)
    }

    /// Add a node under `parent` with the provider's consent.
    fn add_node(
        &self,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
        mode: Option<u32>,
        target: Option<String>,
    ) -> FsResult<NodeId> {
        self.session.capabilities()?;
        validate_new_name(name.as_bytes())?;
        let node = {
            let _guard = self.locks.exclusive(parent);
            let parent_info = self.parent_dir(parent)?;
            match self.store.lookup(parent, name) {
                Ok(_) => return Err(FsError::AlreadyExists),
                Err(FsError::NotFound) => {}
                Err(err) => return Err(err),
            }
            let descriptor = self.provider.child_descriptor(&parent_info.descriptor, name);
            self.provider.on_create(&descriptor, kind)?;
            let size = target.as_ref().map_or(0, |t| t.len() as u64);
            let new = NewNode {
                kind,
                descriptor,
                meta: self.new_meta(kind, mode, size),
                target,
            };
            self.store.create(parent, name, new)?
        };
        if self.config.cache.negative_ttl_ms > 0 {
            self.sink().invalidate_entry(parent, name);
        }
        info!(parent = parent.0, name, node = node.0, kind = ?kind, "created");
        Ok(node)
    }

    /// Create a regular file and open it. The new file's permission bits do
    /// not restrict this first handle.
    pub fn create(
        &self,
        parent: NodeId,
        name: &str,
        mode: u32,
        options: OpenOptions,
    ) -> FsResult<(Attributes, Opened)> {
        let node = self.add_node(parent, name, NodeKind::Passthrough, Some(mode), None)?;
        let options = OpenOptions {
            truncate: false,
            ..options
        };
        let opened = self.open_node(self.live_node(node)?, options, &Cancellation::default())?;
        Ok((self.store.stat(node)?, opened))
    }

    pub fn mkdir(&self, parent: NodeId, name: &str, mode: u32) -> FsResult<Attributes> {
        let node = self.add_node(parent, name, NodeKind::Directory, Some(mode), None)?;
        self.store.stat(node)
    }

    pub fn symlink(&self, parent: NodeId, name: &str, target: &str) -> FsResult<Attributes> {
        if target.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        let node = self.add_node(parent, name, NodeKind::Symlink, None, Some(target.to_string()))?;
        self.store.stat(node)
    }

    pub fn unlink(&self, parent: NodeId, name: &str) -> FsResult<()> {
        self.remove_entry(parent, name, false)
    }

    pub fn rmdir(&self, parent: NodeId, name: &str) -> FsResult<()> {
        self.remove_entry(parent, name, true)
    }

    fn remove_entry(&self, parent: NodeId, name: &str, directory: bool) -> FsResult<()> {
        self.session.capabilities()?;
        validate_new_name(name.as_bytes())?;
        let removed = loop {
            let child = self.store.lookup(parent, name)?;
            let _guard = self.locks.exclusive_many(&[parent, child]);
            if self.store.lookup(parent, name)? != child {
                continue;
            }
            let info = self.live_node(child)?;
            match (directory, info.kind.is_dir()) {
                (false, true) => return Err(FsError::IsADirectory),
                (true, false) => return Err(FsError::NotADirectory),
                _ => {}
            }
            if directory && !self.store.list_children(child, 0, 1)?.entries.is_empty() {
                return Err(FsError::NotEmpty);
            }
            self.provider.on_remove(&info.descriptor, info.kind)?;
            let removed = self.store.remove(parent, name)?;
            self.cache.invalidate(&removed.descriptor);
            break removed;
        };
        self.sink().invalidate_entry(parent, name);
        info!(parent = parent.0, name, node = removed.id.0, "removed");
        Ok(())
    }

    pub fn rename(
        &self,
        parent: NodeId,
        name: &str,
        new_parent: NodeId,
        new_name: &str,
    ) -> FsResult<()> {
        self.session.capabilities()?;
        validate_new_name(name.as_bytes())?;
        validate_new_name(new_name.as_bytes())?;
        let moved = loop {
            let moved = self.store.lookup(parent, name)?;
            let target = match self.store.lookup(new_parent, new_name) {
                Ok(id) => Some(id),
                Err(FsError::NotFound) => None,
                Err(err) => return Err(err),
            };
            let mut nodes = vec![parent, new_parent, moved];
            nodes.extend(target);
            let _guard = self.locks.exclusive_many(&nodes);
            let still_moved = self.store.lookup(parent, name)? == moved;
            let still_target = self.store.lookup(new_parent, new_name).ok() == target;
            if !still_moved || !still_target {
                continue;
            }
            self.store.validate_rename(parent, name, new_parent, new_name)?;

            let from = self.live_node(moved)?.descriptor;
            let to = self.provider.child_descriptor(&self.parent_dir(new_parent)?.descriptor, new_name);
            if from != to {
                self.provider.on_rename(&from, &to)?;
            }
            let outcome = self.store.rename(parent, name, new_parent, new_name, |p, n| {
                self.provider.child_descriptor(p, n)
            })?;
            for descriptor in &outcome.old_descriptors {
                self.cache.invalidate(descriptor);
            }
            if let Some(replaced) = &outcome.replaced {
                self.cache.invalidate(&replaced.descriptor);
            }
            break moved;
        };
        let sink = self.sink();
        sink.invalidate_entry(parent, name);
        sink.invalidate_entry(new_parent, new_name);
        info!(
            node = moved.0,
            from_parent = parent.0,
            from = name,
            to_parent = new_parent.0,
            to = new_name,
            "renamed"
        );
        Ok(())
    }

    pub fn stats(&self) -> FsStats {
        FsStats {
            nodes: self.store.len() as u64,
            open_handles: self.handles.len() as u64,
            cached_entries: self.cache.len() as u64,
            materializations: self.counters.materializations.load(Ordering::Relaxed),
            commits: self.counters.commits.load(Ordering::Relaxed),
            close_errors: self.counters.close_errors.load(Ordering::Relaxed),
        }
    }
}
