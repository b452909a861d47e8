// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-node advisory locks
//!
//! Exclusive for tree-shape mutation and commit, shared for materialization
//! and listing. Multi-node acquisition always proceeds in ascending node-id
//! order with duplicates removed, so two operations over overlapping node
//! sets cannot wait on each other in a cycle.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::types::NodeId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Default)]
struct LockState {
    readers: u32,
    writer: bool,
}

impl LockState {
    fn admits(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => !self.writer,
            LockMode::Exclusive => !self.writer && self.readers == 0,
        }
    }
}

#[derive(Default)]
pub struct LockManager {
    table: Mutex<HashMap<NodeId, LockState>>,
    released: Condvar,
}

/// Held lock tokens; released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct NodeLockGuard<'a> {
    manager: &'a LockManager,
    nodes: Vec<NodeId>,
    mode: LockMode,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<NodeId, LockState>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn shared(&self, node: NodeId) -> NodeLockGuard<'_> {
        self.acquire(vec![node], LockMode::Shared)
    }

    pub fn exclusive(&self, node: NodeId) -> NodeLockGuard<'_> {
        self.acquire(vec![node], LockMode::Exclusive)
    }

    pub fn exclusive_many(&self, nodes: &[NodeId]) -> NodeLockGuard<'_> {
        self.acquire(nodes.to_vec(), LockMode::Exclusive)
    }

    fn acquire(&self, mut nodes: Vec<NodeId>, mode: LockMode) -> NodeLockGuard<'_> {
        nodes.sort_unstable();
        nodes.dedup();
        let mut table = self.table();
        for node in &nodes {
            while !table.get(node).map_or(true, |state| state.admits(mode)) {
                table = self.released.wait(table).unwrap_or_else(PoisonError::into_inner);
            }
            let state = table.entry(*node).or_default();
            match mode {
                LockMode::Shared => state.readers += 1,
                LockMode::Exclusive => state.writer = true,
            }
        }
        NodeLockGuard {
            manager: self,
            nodes,
            mode,
        }
    }

    /// Nodes with at least one holder.
    #[cfg(test)]
    fn held(&self) -> usize {
        self.table().len()
    }
}

impl NodeLockGuard<'_> {
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for NodeLockGuard<'_> {
    fn drop(&mut self) {
        let mut table = self.manager.table();
        for node in &self.nodes {
            let vacant = match table.get_mut(node) {
                Some(state) => {
                    match self.mode {
                        LockMode::Shared => state.readers = state.readers.saturating_sub(1),
                        LockMode::Exclusive => state.writer = false,
                    }
                    state.readers == 0 && !state.writer
                }
                None => false,
            };
            if vacant {
                table.remove(node);
            }
        }
        drop(table);
        self.manager.released.notify_all();
    }
}
