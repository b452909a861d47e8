// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory node tree
//!
//! The store exclusively owns every node record. Parents are back-references
//! by id, used for path reconstruction only. Each directory keeps its
//! children keyed by an insertion sequence number; listings page over that
//! sequence, so a continuation token stays valid when earlier entries are
//! removed in between.
//!
//! All state sits behind one `RwLock`: every operation applies atomically and
//! listings copy their page under the read lock.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::CaseSensitivity;
use crate::error::{FsError, FsResult};
use crate::types::{Attributes, Descriptor, DirEntry, DirPage, Metadata, NodeId, NodeKind};

#[derive(Default)]
struct Children {
    /// seq -> (display name, child)
    by_seq: BTreeMap<u64, (String, NodeId)>,
    /// folded name -> seq
    by_key: HashMap<String, u64>,
    next_seq: u64,
}

impl Children {
    fn get(&self, key: &str) -> Option<NodeId> {
        self.by_key.get(key).and_then(|seq| self.by_seq.get(seq)).map(|(_, id)| *id)
    }

    fn insert(&mut self, key: String, name: String, id: NodeId) {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.by_key.insert(key, seq);
        self.by_seq.insert(seq, (name, id));
    }

    fn remove(&mut self, key: &str) -> Option<NodeId> {
        let seq = self.by_key.remove(key)?;
        self.by_seq.remove(&seq).map(|(_, id)| id)
    }

    fn len(&self) -> usize {
        self.by_seq.len()
    }

    fn subdirs(&self, store: &HashMap<NodeId, Node>) -> u32 {
        self.by_seq
            .values()
            .filter(|(_, id)| store.get(id).is_some_and(|n| n.kind.is_dir()))
            .count() as u32
    }
}

struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    name: String,
    descriptor: Descriptor,
    meta: Metadata,
    target: Option<String>,
    children: Option<Children>,
    open_handles: u32,
    removed: bool,
}

/// Copy of a node record handed out of the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub name: String,
    pub descriptor: Descriptor,
    pub meta: Metadata,
    pub target: Option<String>,
    pub removed: bool,
}

/// Parameters of a node being added to the tree.
#[derive(Clone, Debug)]
pub struct NewNode {
    pub kind: NodeKind,
    pub descriptor: Descriptor,
    pub meta: Metadata,
    pub target: Option<String>,
}

/// What a rename did.
#[derive(Debug, Default)]
pub struct RenameOutcome {
    /// Target that was replaced, if any.
    pub replaced: Option<NodeInfo>,
    /// Descriptors the moved subtree had before the rename.
    pub old_descriptors: Vec<Descriptor>,
}

struct StoreInner {
    nodes: HashMap<NodeId, Node>,
}

pub struct NodeStore {
    inner: RwLock<StoreInner>,
    next_id: AtomicU64,
    case: CaseSensitivity,
}

impl NodeStore {
    pub fn new(root_descriptor: Descriptor, root_meta: Metadata, case: CaseSensitivity) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            NodeId::ROOT,
            Node {
                kind: NodeKind::Directory,
                parent: None,
                name: String::new(),
                descriptor: root_descriptor,
                meta: root_meta,
                target: None,
                children: Some(Children::default()),
                open_handles: 0,
                removed: false,
            },
        );
        Self {
            inner: RwLock::new(StoreInner { nodes }),
            next_id: AtomicU64::new(NodeId::ROOT.0 + 1),
            case,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn info(id: NodeId, node: &Node) -> NodeInfo {
        NodeInfo {
            id,
            kind: node.kind,
            parent: node.parent,
            name: node.name.clone(),
            descriptor: node.descriptor.clone(),
            meta: node.meta.clone(),
            target: node.target.clone(),
            removed: node.removed,
        }
    }

    /// Live node or `StaleHandle`.
    fn live(inner: &StoreInner, id: NodeId) -> FsResult<&Node> {
        match inner.nodes.get(&id) {
            Some(node) if !node.removed => Ok(node),
            _ => Err(FsError::StaleHandle),
        }
    }

    fn live_dir(inner: &StoreInner, id: NodeId) -> FsResult<(&Node, &Children)> {
        let node = Self::live(inner, id)?;
        node.children.as_ref().map(|c| (node, c)).ok_or(FsError::NotADirectory)
    }

    pub fn get(&self, id: NodeId) -> FsResult<NodeInfo> {
        let inner = self.read();
        inner.nodes.get(&id).map(|n| Self::info(id, n)).ok_or(FsError::StaleHandle)
    }

    pub fn stat(&self, id: NodeId) -> FsResult<Attributes> {
        let inner = self.read();
        let node = Self::live(&inner, id)?;
        let nlink = match &node.children {
            Some(children) => 2 + children.subdirs(&inner.nodes),
            None => 1,
        };
        Ok(Attributes {
            node: id,
            kind: node.kind,
            nlink,
            meta: node.meta.clone(),
        })
    }

    pub fn lookup(&self, parent: NodeId, name: &str) -> FsResult<NodeId> {
        let inner = self.read();
        let (dir, children) = Self::live_dir(&inner, parent)?;
        match name {
            "." => Ok(parent),
            ".." => Ok(dir.parent.unwrap_or(parent)),
            _ => children.get(&self.case.fold(name)).ok_or(FsError::NotFound),
        }
    }

    /// A page of at most `max` entries following the continuation token
    /// `offset` (0 starts from the beginning).
    pub fn list_children(&self, dir: NodeId, offset: u64, max: usize) -> FsResult<DirPage> {
        let inner = self.read();
        let (_, children) = Self::live_dir(&inner, dir)?;
        let mut page = DirPage::default();
        let mut range = children.by_seq.range((Bound::Excluded(offset), Bound::Unbounded));
        for (seq, (name, id)) in range.by_ref().take(max) {
            let kind = inner.nodes.get(id).map_or(NodeKind::Passthrough, |n| n.kind);
            page.entries.push(DirEntry {
                name: name.clone(),
                node: *id,
                kind,
                next_offset: *seq,
            });
        }
        if range.next().is_some() {
            page.next_offset = page.entries.last().map(|e| e.next_offset);
        }
        Ok(page)
    }

    pub fn create(&self, parent: NodeId, name: &str, new: NewNode) -> FsResult<NodeId> {
        let key = self.case.fold(name);
        let mut inner = self.write();
        let (_, children) = Self::live_dir(&inner, parent)?;
        if children.get(&key).is_some() {
            return Err(FsError::AlreadyExists);
        }
        let id = NodeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let children = new.kind.is_dir().then(Children::default);
        inner.nodes.insert(
            id,
            Node {
                kind: new.kind,
                parent: Some(parent),
                name: name.to_string(),
                descriptor: new.descriptor,
                meta: new.meta,
                target: new.target,
                children,
                open_handles: 0,
                removed: false,
            },
        );
        if let Some(children) = inner.nodes.get_mut(&parent).and_then(|p| p.children.as_mut()) {
            children.insert(key, name.to_string(), id);
        }
        Ok(id)
    }

    /// Detach `name` from `parent`. The record is dropped at once unless an
    /// open handle still names it, in which case it lingers as removed until
    /// the last [`unpin`](Self::unpin).
    pub fn remove(&self, parent: NodeId, name: &str) -> FsResult<NodeInfo> {
        let key = self.case.fold(name);
        let mut inner = self.write();
        let (_, children) = Self::live_dir(&inner, parent)?;
        let id = children.get(&key).ok_or(FsError::NotFound)?;
        if inner.nodes.get(&id).and_then(|n| n.children.as_ref()).is_some_and(|c| c.len() > 0) {
            return Err(FsError::NotEmpty);
        }
        if let Some(children) = inner.nodes.get_mut(&parent).and_then(|p| p.children.as_mut()) {
            children.remove(&key);
        }
        Self::detach(&mut inner, id).ok_or(FsError::StaleHandle)
    }

    fn detach(inner: &mut StoreInner, id: NodeId) -> Option<NodeInfo> {
        let node = inner.nodes.get_mut(&id)?;
        node.removed = true;
        let info = Self::info(id, node);
        if node.open_handles == 0 {
            inner.nodes.remove(&id);
        }
        Some(info)
    }

    fn is_ancestor(inner: &StoreInner, ancestor: NodeId, mut node: NodeId) -> bool {
        loop {
            if node == ancestor {
                return true;
            }
            match inner.nodes.get(&node).and_then(|n| n.parent) {
                Some(parent) => node = parent,
                None => return false,
            }
        }
    }

    /// Move `parent/name` to `new_parent/new_name`, replacing a compatible
    /// target. `describe` builds the descriptor of a child from its parent's
    /// descriptor and its name; it is applied to the whole moved subtree.
    pub fn rename<F>(
        &self,
        parent: NodeId,
        name: &str,
        new_parent: NodeId,
        new_name: &str,
        describe: F,
    ) -> FsResult<RenameOutcome>
    where
        F: Fn(&Descriptor, &str) -> Descriptor,
    {
        let key = self.case.fold(name);
        let new_key = self.case.fold(new_name);
        let mut inner = self.write();

        let moved = Self::live_dir(&inner, parent)?.1.get(&key).ok_or(FsError::NotFound)?;
        let target = Self::live_dir(&inner, new_parent)?.1.get(&new_key);
        self.check_rename(&inner, moved, target, new_parent)?;

        if target == Some(moved) {
            if inner.nodes.get(&moved).is_some_and(|n| n.name == new_name) {
                return Ok(RenameOutcome::default());
            }
            // Case-only rename under case-insensitive lookup.
            if let Some(children) = inner.nodes.get_mut(&parent).and_then(|p| p.children.as_mut()) {
                children.remove(&key);
                children.insert(new_key, new_name.to_string(), moved);
            }
            if let Some(node) = inner.nodes.get_mut(&moved) {
                node.name = new_name.to_string();
            }
            let old_descriptors = self.redescribe(&mut inner, moved, &describe);
            return Ok(RenameOutcome {
                replaced: None,
                old_descriptors,
            });
        }

        let replaced = match target {
            Some(target) => {
                if let Some(children) =
                    inner.nodes.get_mut(&new_parent).and_then(|p| p.children.as_mut())
                {
                    children.remove(&new_key);
                }
                Self::detach(&mut inner, target)
            }
            None => None,
        };

        if let Some(children) = inner.nodes.get_mut(&parent).and_then(|p| p.children.as_mut()) {
            children.remove(&key);
        }
        if let Some(children) = inner.nodes.get_mut(&new_parent).and_then(|p| p.children.as_mut()) {
            children.insert(new_key, new_name.to_string(), moved);
        }
        if let Some(node) = inner.nodes.get_mut(&moved) {
            node.parent = Some(new_parent);
            node.name = new_name.to_string();
        }
        let old_descriptors = self.redescribe(&mut inner, moved, &describe);
        Ok(RenameOutcome {
            replaced,
            old_descriptors,
        })
    }

    /// Validate a rename without applying it.
    pub fn validate_rename(
        &self,
        parent: NodeId,
        name: &str,
        new_parent: NodeId,
        new_name: &str,
    ) -> FsResult<()> {
        let inner = self.read();
        let moved = Self::live_dir(&inner, parent)?
            .1
            .get(&self.case.fold(name))
            .ok_or(FsError::NotFound)?;
        let target = Self::live_dir(&inner, new_parent)?.1.get(&self.case.fold(new_name));
        self.check_rename(&inner, moved, target, new_parent)
    }

    fn check_rename(
        &self,
        inner: &StoreInner,
        moved: NodeId,
        target: Option<NodeId>,
        new_parent: NodeId,
    ) -> FsResult<()> {
        if target == Some(moved) {
            return Ok(());
        }
        let moved_node = Self::live(inner, moved)?;
        if moved_node.kind.is_dir() && Self::is_ancestor(inner, moved, new_parent) {
            return Err(FsError::InvalidArgument);
        }
        if let Some(target) = target {
            let target_node = Self::live(inner, target)?;
            match (moved_node.kind.is_dir(), &target_node.children) {
                (true, Some(children)) if children.len() > 0 => return Err(FsError::NotEmpty),
                (true, Some(_)) => {}
                (true, None) => return Err(FsError::NotADirectory),
                (false, Some(_)) => return Err(FsError::IsADirectory),
                (false, None) => {}
            }
        }
        Ok(())
    }

    /// Recompute descriptors below (and including) `root`; returns the old ones.
    fn redescribe<F>(&self, inner: &mut StoreInner, root: NodeId, describe: &F) -> Vec<Descriptor>
    where
        F: Fn(&Descriptor, &str) -> Descriptor,
    {
        let mut old = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let Some(parent_desc) = inner
                .nodes
                .get(&id)
                .and_then(|n| n.parent)
                .and_then(|p| inner.nodes.get(&p))
                .map(|p| p.descriptor.clone())
            else {
                continue;
            };
            if let Some(node) = inner.nodes.get_mut(&id) {
                let fresh = describe(&parent_desc, &node.name);
                old.push(std::mem::replace(&mut node.descriptor, fresh));
                if let Some(children) = &node.children {
                    stack.extend(children.by_seq.values().map(|(_, child)| *child));
                }
            }
        }
        old
    }

    /// `/`-joined path from the root, for logging and diagnostics.
    pub fn path_of(&self, id: NodeId) -> FsResult<String> {
        let inner = self.read();
        let mut parts = Vec::new();
        let mut current = id;
        loop {
            let node = Self::live(&inner, current)?;
            match node.parent {
                Some(parent) => {
                    parts.push(node.name.clone());
                    current = parent;
                }
                None => break,
            }
        }
        parts.reverse();
        Ok(format!("/{}", parts.join("/")))
    }

    /// Record an open handle on a live node.
    pub fn pin(&self, id: NodeId) -> FsResult<()> {
        let mut inner = self.write();
        match inner.nodes.get_mut(&id) {
            Some(node) if !node.removed => {
                node.open_handles += 1;
                Ok(())
            }
            _ => Err(FsError::StaleHandle),
        }
    }

    /// Drop an open-handle reference; reclaims a removed node on the last one.
    pub fn unpin(&self, id: NodeId) {
        let mut inner = self.write();
        let reclaim = match inner.nodes.get_mut(&id) {
            Some(node) => {
                node.open_handles = node.open_handles.saturating_sub(1);
                node.removed && node.open_handles == 0
            }
            None => false,
        };
        if reclaim {
            inner.nodes.remove(&id);
        }
    }

    pub fn update_meta<F>(&self, id: NodeId, update: F) -> FsResult<()>
    where
        F: FnOnce(&mut Metadata),
    {
        let mut inner = self.write();
        let node = inner.nodes.get_mut(&id).ok_or(FsError::StaleHandle)?;
        update(&mut node.meta);
        Ok(())
    }
}
