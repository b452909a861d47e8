// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Open handle table
//!
//! Each handle sits behind its own mutex, which serializes operations on one
//! handle. The table lock is only held to insert, find or remove an entry.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{FsError, FsResult};
use crate::types::{HandleId, NodeId, OpenOptions};

/// Handle lifecycle: `Opened -> (Reading | Writing)* -> Flushing -> Closed`.
/// Any state may move to `Closed` on error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleState {
    Opened,
    Reading,
    Writing,
    Flushing,
    Closed,
}

#[derive(Debug)]
pub struct Handle {
    pub id: HandleId,
    pub node: NodeId,
    pub options: OpenOptions,
    pub state: HandleState,
    /// Offset following the last read or write.
    pub position: u64,
    /// Content observed by this handle, fixed for its lifetime unless live.
    pub snapshot: Option<Arc<Vec<u8>>>,
    /// Full new content once the handle has written (or truncated).
    pub buffer: Option<Vec<u8>>,
    /// Buffer holds bytes the provider has not accepted yet.
    pub dirty: bool,
}

impl Handle {
    /// Move to `next`, refusing any transition out of `Closed`.
    pub fn enter(&mut self, next: HandleState) -> FsResult<()> {
        if self.state == HandleState::Closed {
            return Err(FsError::BadHandle);
        }
        self.state = next;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state == HandleState::Closed
    }
}

pub type SharedHandle = Arc<Mutex<Handle>>;

pub fn lock_handle(handle: &SharedHandle) -> MutexGuard<'_, Handle> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct TableInner {
    open: HashMap<HandleId, SharedHandle>,
    /// Handles closed by the engine after a stale-node error. Their owner
    /// still releases them; that release succeeds quietly.
    force_closed: HashSet<HandleId>,
}

pub struct HandleTable {
    inner: Mutex<TableInner>,
    next_id: AtomicU64,
    max_open: usize,
}

impl HandleTable {
    pub fn new(max_open: usize) -> Self {
        Self {
            inner: Mutex::new(TableInner::default()),
            next_id: AtomicU64::new(1),
            max_open,
        }
    }

    fn inner(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(
        &self,
        node: NodeId,
        options: OpenOptions,
    ) -> FsResult<(HandleId, SharedHandle)> {
        let mut inner = self.inner();
        if inner.open.len() >= self.max_open {
            return Err(FsError::TooManyOpenFiles);
        }
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handle = Arc::new(Mutex::new(Handle {
            id,
            node,
            options,
            state: HandleState::Opened,
            position: 0,
            snapshot: None,
            buffer: None,
            dirty: false,
        }));
        inner.open.insert(id, handle.clone());
        Ok((id, handle))
    }

    pub fn get(&self, id: HandleId) -> FsResult<SharedHandle> {
        self.inner().open.get(&id).cloned().ok_or(FsError::BadHandle)
    }

    pub fn remove(&self, id: HandleId) -> Option<SharedHandle> {
        self.inner().open.remove(&id)
    }

    /// Remove and remember `id` as force-closed.
    pub fn force_remove(&self, id: HandleId) -> Option<SharedHandle> {
        let mut inner = self.inner();
        let handle = inner.open.remove(&id);
        if handle.is_some() {
            inner.force_closed.insert(id);
        }
        handle
    }

    /// Consume the force-closed marker of `id`, if any.
    pub fn take_force_closed(&self, id: HandleId) -> bool {
        self.inner().force_closed.remove(&id)
    }

    pub fn ids(&self) -> Vec<HandleId> {
        let mut ids: Vec<_> = self.inner().open.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner().open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_enforces_limit_and_unique_ids() {
        let table = HandleTable::new(2);
        let (a, _) = table.insert(NodeId(2), OpenOptions::read_only()).unwrap();
        let (b, _) = table.insert(NodeId(2), OpenOptions::read_only()).unwrap();
        assert_ne!(a, b);
        assert!(matches!(
            table.insert(NodeId(3), OpenOptions::read_only()),
            Err(FsError::TooManyOpenFiles)
        ));
        table.remove(a);
        let (c, _) = table.insert(NodeId(3), OpenOptions::read_only()).unwrap();
        assert!(c != a && c != b);
        assert!(matches!(table.get(a), Err(FsError::BadHandle)));
    }

    #[test]
    fn closed_handles_refuse_transitions() {
        let table = HandleTable::new(4);
        let (_, handle) = table.insert(NodeId(2), OpenOptions::read_write()).unwrap();
        let mut guard = lock_handle(&handle);
        guard.enter(HandleState::Writing).unwrap();
        guard.enter(HandleState::Closed).unwrap();
        assert!(matches!(guard.enter(HandleState::Reading), Err(FsError::BadHandle)));
    }

    #[test]
    fn force_closed_marker_is_consumed_once() {
        let table = HandleTable::new(4);
        let (id, _) = table.insert(NodeId(2), OpenOptions::read_only()).unwrap();
        assert!(table.force_remove(id).is_some());
        assert!(table.take_force_closed(id));
        assert!(!table.take_force_closed(id));
    }
}
