// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Content provider interface
//!
//! A provider is the external source of truth behind every file. The engine
//! asks it for bytes (`materialize`) and hands it bytes back (`commit`); it
//! never retries a failed call. The remaining hooks have defaults so a
//! provider serving a fixed tree only implements the first two.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::types::{Descriptor, NodeKind};

#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
    #[error("generation failed: {0}")]
    GenerationFailed(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("no such source")]
    NotFound,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// One entry of the tree a provider exposes at mount.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayoutEntry {
    /// `/`-separated path relative to the mount root.
    pub path: String,
    pub kind: NodeKind,
    pub descriptor: Descriptor,
    pub size_hint: u64,
    /// Permission bits; config defaults apply when unset.
    pub mode: Option<u32>,
    /// Symlink target.
    pub target: Option<String>,
}

impl LayoutEntry {
    pub fn new(path: impl Into<String>, kind: NodeKind, descriptor: Descriptor) -> Self {
        Self {
            path: path.into(),
            kind,
            descriptor,
            size_hint: 0,
            mode: None,
            target: None,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait ContentProvider: Send + Sync {
    /// Produce the current bytes for a descriptor. Must not touch engine state.
    fn materialize(&self, descriptor: &Descriptor) -> ProviderResult<Vec<u8>>;

    /// Accept new bytes for a descriptor.
    fn commit(&self, descriptor: &Descriptor, data: &[u8]) -> ProviderResult<()>;

    /// Version tag of the descriptor's current content. Materializations are
    /// cached per (descriptor, version); `None` disables caching.
    fn version(&self, _descriptor: &Descriptor) -> Option<u64> {
        None
    }

    /// Entries seeded into the tree at mount, parents before children.
    fn layout(&self, _root: &Descriptor) -> ProviderResult<Vec<LayoutEntry>> {
        Ok(Vec::new())
    }

    fn child_descriptor(&self, parent: &Descriptor, name: &str) -> Descriptor {
        parent.child(name)
    }

    fn on_create(&self, _descriptor: &Descriptor, _kind: NodeKind) -> ProviderResult<()> {
        Ok(())
    }

    fn on_remove(&self, _descriptor: &Descriptor, _kind: NodeKind) -> ProviderResult<()> {
        Ok(())
    }

    fn on_rename(&self, _from: &Descriptor, _to: &Descriptor) -> ProviderResult<()> {
        Ok(())
    }
}

type Generator = Arc<dyn Fn() -> Result<Vec<u8>, String> + Send + Sync>;

enum Source {
    Bytes(Vec<u8>),
    Generator(Generator),
    Directory,
    Symlink(String),
}

struct MemoryEntry {
    source: Source,
    version: u64,
}

#[derive(Default)]
struct MemoryState {
    entries: BTreeMap<Descriptor, MemoryEntry>,
    commits: Vec<(Descriptor, Vec<u8>)>,
}

/// In-memory provider: a descriptor → bytes map with per-descriptor version
/// counters and optional generator closures.
#[derive(Default)]
pub struct MemoryProvider {
    state: Mutex<MemoryState>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, descriptor: &str, source: Source) {
        let mut state = self.state();
        let version = state.entries.get(&Descriptor::new(descriptor)).map_or(1, |e| e.version + 1);
        state.entries.insert(Descriptor::new(descriptor), MemoryEntry { source, version });
    }

    pub fn with_file(self, descriptor: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(descriptor, Source::Bytes(bytes.into()));
        self
    }

    /// A generated file whose bytes come from `generator` on every
    /// materialization. Commits to it are rejected.
    pub fn with_generator<F>(self, descriptor: &str, generator: F) -> Self
    where
        F: Fn() -> Result<Vec<u8>, String> + Send + Sync + 'static,
    {
        self.insert(descriptor, Source::Generator(Arc::new(generator)));
        self
    }

    pub fn with_dir(self, descriptor: &str) -> Self {
        self.insert(descriptor, Source::Directory);
        self
    }

    pub fn with_symlink(self, descriptor: &str, target: &str) -> Self {
        self.insert(descriptor, Source::Symlink(target.to_string()));
        self
    }

    /// Replace content out of band, as an external writer would.
    pub fn set_content(&self, descriptor: &str, bytes: impl Into<Vec<u8>>) {
        self.insert(descriptor, Source::Bytes(bytes.into()));
    }

    pub fn content(&self, descriptor: &str) -> Option<Vec<u8>> {
        match self.state().entries.get(&Descriptor::new(descriptor)).map(|e| &e.source) {
            Some(Source::Bytes(bytes)) => Some(bytes.clone()),
            _ => None,
        }
    }

    pub fn contains(&self, descriptor: &str) -> bool {
        self.state().entries.contains_key(&Descriptor::new(descriptor))
    }

    /// Every successful commit, in order.
    pub fn commits(&self) -> Vec<(Descriptor, Vec<u8>)> {
        self.state().commits.clone()
    }
}

fn relative_path(root: &Descriptor, descriptor: &Descriptor) -> Option<String> {
    let rest = descriptor.as_str().strip_prefix(root.as_str())?;
    if !root.as_str().ends_with('/') && !rest.starts_with('/') {
        return None;
    }
    let rest = rest.trim_start_matches('/');
    (!rest.is_empty()).then(|| rest.to_string())
}

impl ContentProvider for MemoryProvider {
    fn materialize(&self, descriptor: &Descriptor) -> ProviderResult<Vec<u8>> {
        let generator = match self.state().entries.get(descriptor).map(|e| &e.source) {
            Some(Source::Bytes(bytes)) => return Ok(bytes.clone()),
            Some(Source::Generator(generator)) => generator.clone(),
            Some(Source::Directory) | Some(Source::Symlink(_)) => {
                return Err(ProviderError::GenerationFailed(format!(
                    "{} has no byte content",
                    descriptor
                )))
            }
            None => return Err(ProviderError::NotFound),
        };
        // Run outside the state lock; generators may take a while.
        generator().map_err(ProviderError::GenerationFailed)
    }

    fn commit(&self, descriptor: &Descriptor, data: &[u8]) -> ProviderResult<()> {
        let mut state = self.state();
        let entry = state.entries.get_mut(descriptor).ok_or(ProviderError::NotFound)?;
        match entry.source {
            Source::Bytes(_) => {
                entry.source = Source::Bytes(data.to_vec());
                entry.version += 1;
            }
            Source::Generator(_) => {
                return Err(ProviderError::Rejected(format!(
                    "{} is produced by a generator",
                    descriptor
                )))
            }
            Source::Directory | Source::Symlink(_) => {
                return Err(ProviderError::Rejected(format!("{} is not a file", descriptor)))
            }
        }
        state.commits.push((descriptor.clone(), data.to_vec()));
        Ok(())
    }

    fn version(&self, descriptor: &Descriptor) -> Option<u64> {
        match self.state().entries.get(descriptor) {
            Some(MemoryEntry {
                source: Source::Bytes(_),
                version,
            }) => Some(*version),
            _ => None,
        }
    }

    fn layout(&self, root: &Descriptor) -> ProviderResult<Vec<LayoutEntry>> {
        let state = self.state();
        let mut entries = Vec::new();
        for (descriptor, entry) in &state.entries {
            let Some(path) = relative_path(root, descriptor) else {
                continue;
            };
            let mut layout = LayoutEntry::new(path, NodeKind::Generated, descriptor.clone());
            match &entry.source {
                Source::Bytes(bytes) => layout.size_hint = bytes.len() as u64,
                Source::Generator(_) => {}
                Source::Directory => layout.kind = NodeKind::Directory,
                Source::Symlink(target) => {
                    layout.kind = NodeKind::Symlink;
                    layout.target = Some(target.clone());
                }
            }
            entries.push(layout);
        }
        Ok(entries)
    }

    fn on_create(&self, descriptor: &Descriptor, kind: NodeKind) -> ProviderResult<()> {
        let source = match kind {
            NodeKind::Directory => Source::Directory,
            NodeKind::Symlink => return Ok(()),
            NodeKind::Generated | NodeKind::Passthrough => Source::Bytes(Vec::new()),
        };
        let mut state = self.state();
        if state.entries.contains_key(descriptor) {
            return Err(ProviderError::Rejected(format!("{} already exists", descriptor)));
        }
        state.entries.insert(descriptor.clone(), MemoryEntry { source, version: 1 });
        Ok(())
    }

    fn on_remove(&self, descriptor: &Descriptor, _kind: NodeKind) -> ProviderResult<()> {
        self.state().entries.remove(descriptor);
        Ok(())
    }

    fn on_rename(&self, from: &Descriptor, to: &Descriptor) -> ProviderResult<()> {
        let mut state = self.state();
        let moved: Vec<Descriptor> = state
            .entries
            .keys()
            .filter(|d| *d == from || relative_path(from, d).is_some())
            .cloned()
            .collect();
        // A replaced target and anything beneath it goes away.
        state.entries.retain(|d, _| !(d == to || relative_path(to, d).is_some()));
        for old in moved {
            if let Some(mut entry) = state.entries.remove(&old) {
                let suffix = &old.as_str()[from.as_str().len()..];
                entry.version += 1;
                state.entries.insert(Descriptor::new(format!("{}{}", to, suffix)), entry);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_bumps_version() {
        let provider = MemoryProvider::new().with_file("/version.conf", "1.0\n");
        let desc = Descriptor::new("/version.conf");
        let before = provider.version(&desc).unwrap();

        provider.commit(&desc, b"2.0\n").unwrap();

        assert!(provider.version(&desc).unwrap() > before);
        assert_eq!(provider.materialize(&desc).unwrap(), b"2.0\n");
        assert_eq!(provider.commits(), vec![(desc, b"2.0\n".to_vec())]);
    }

    #[test]
    fn generator_output_is_not_cached_or_writable() {
        let provider = MemoryProvider::new().with_generator("/gen", || Ok(b"x".to_vec()));
        let desc = Descriptor::new("/gen");
        assert_eq!(provider.version(&desc), None);
        assert_eq!(provider.materialize(&desc).unwrap(), b"x");
        assert!(matches!(provider.commit(&desc, b"y"), Err(ProviderError::Rejected(_))));
    }

    #[test]
    fn layout_is_relative_to_root() {
        let provider = MemoryProvider::new()
            .with_dir("/etc")
            .with_file("/etc/app.conf", "a=1\n")
            .with_file("/etcetera", "")
            .with_symlink("/etc/current", "app.conf");

        let layout = provider.layout(&Descriptor::new("/etc")).unwrap();
        let paths: Vec<_> = layout.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["app.conf", "current"]);
        assert_eq!(layout[0].size_hint, 4);
        assert_eq!(layout[1].target.as_deref(), Some("app.conf"));
    }

    #[test]
    fn rename_moves_subtree() {
        let provider = MemoryProvider::new()
            .with_dir("/a")
            .with_file("/a/x.conf", "x")
            .with_file("/b", "old");

        provider.on_rename(&Descriptor::new("/a"), &Descriptor::new("/b")).unwrap();

        assert!(!provider.contains("/a/x.conf"));
        assert_eq!(provider.content("/b/x.conf").as_deref(), Some(&b"x"[..]));
        assert!(provider.content("/b").is_none());
    }
}
