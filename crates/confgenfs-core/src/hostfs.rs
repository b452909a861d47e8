// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Passthrough provider backed by a host directory

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::debug;
use walkdir::WalkDir;

use crate::provider::{ContentProvider, LayoutEntry, ProviderError, ProviderResult};
use crate::types::{Descriptor, NodeKind};

const TMP_SUFFIX: &str = ".confgenfs-tmp";

/// Serves every file under `root` verbatim. Descriptors are absolute,
/// `/`-separated paths relative to `root`.
pub struct HostDirProvider {
    root: PathBuf,
}

impl HostDirProvider {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let metadata = fs::metadata(&root)?;
        if !metadata.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", root.display()),
            ));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn host_path(&self, descriptor: &Descriptor) -> ProviderResult<PathBuf> {
        let relative = descriptor.as_str().trim_start_matches('/');
        let mut path = self.root.clone();
        for component in relative.split('/').filter(|c| !c.is_empty()) {
            if component == ".." || component == "." {
                return Err(ProviderError::Rejected(format!(
                    "descriptor {} escapes the source root",
                    descriptor
                )));
            }
            path.push(component);
        }
        Ok(path)
    }
}

fn map_io(err: io::Error) -> ProviderError {
    if err.kind() == io::ErrorKind::NotFound {
        ProviderError::NotFound
    } else {
        ProviderError::Io(err)
    }
}

impl ContentProvider for HostDirProvider {
    fn materialize(&self, descriptor: &Descriptor) -> ProviderResult<Vec<u8>> {
        fs::read(self.host_path(descriptor)?).map_err(map_io)
    }

    fn commit(&self, descriptor: &Descriptor, data: &[u8]) -> ProviderResult<()> {
        let path = self.host_path(descriptor)?;
        if path.is_dir() {
            return Err(ProviderError::Rejected(format!("{} is a directory", descriptor)));
        }
        let file_name = path
            .file_name()
            .ok_or_else(|| ProviderError::Rejected(format!("{} names no file", descriptor)))?;
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(TMP_SUFFIX);
        let tmp = path.with_file_name(tmp_name);

        let mut file = fs::File::create(&tmp).map_err(map_io)?;
        file.write_all(data)?;
        file.sync_all()?;
        if let Ok(existing) = fs::metadata(&path) {
            let _ = fs::set_permissions(&tmp, fs::Permissions::from_mode(existing.permissions().mode()));
        }
        if let Err(err) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(map_io(err));
        }
        debug!(descriptor = %descriptor, bytes = data.len(), "host file committed");
        Ok(())
    }

    fn version(&self, descriptor: &Descriptor) -> Option<u64> {
        let metadata = fs::metadata(self.host_path(descriptor).ok()?).ok()?;
        let mtime = metadata.modified().ok()?.duration_since(UNIX_EPOCH).ok()?;
        Some((mtime.as_nanos() as u64).wrapping_mul(31) ^ metadata.len())
    }

    fn layout(&self, root: &Descriptor) -> ProviderResult<Vec<LayoutEntry>> {
        let base = self.host_path(root)?;
        let mut entries = Vec::new();
        let walker = WalkDir::new(&base).min_depth(1).follow_links(false).sort_by_file_name();
        for entry in walker {
            let entry = entry.map_err(|e| {
                ProviderError::Io(e.into_io_error().unwrap_or_else(|| io::Error::other("walk failed")))
            })?;
            let Ok(relative) = entry.path().strip_prefix(&base) else {
                continue;
            };
            let Some(relative) = relative.to_str().map(str::to_string) else {
                debug!(path = %entry.path().display(), "skipping non UTF-8 path");
                continue;
            };
            if relative.ends_with(TMP_SUFFIX) {
                continue;
            }
            let descriptor = root.child(&relative);
            let metadata = entry.metadata().map_err(|e| {
                ProviderError::Io(e.into_io_error().unwrap_or_else(|| io::Error::other("stat failed")))
            })?;
            let file_type = entry.file_type();
            let mut layout = LayoutEntry::new(relative, NodeKind::Passthrough, descriptor);
            layout.mode = Some(metadata.permissions().mode() & 0o7777);
            if file_type.is_dir() {
                layout.kind = NodeKind::Directory;
            } else if file_type.is_symlink() {
                layout.kind = NodeKind::Symlink;
                layout.target = Some(fs::read_link(entry.path())?.to_string_lossy().into_owned());
            } else if file_type.is_file() {
                layout.size_hint = metadata.len();
            } else {
                continue;
            }
            entries.push(layout);
        }
        Ok(entries)
    }

    fn on_create(&self, descriptor: &Descriptor, kind: NodeKind) -> ProviderResult<()> {
        let path = self.host_path(descriptor)?;
        match kind {
            NodeKind::Directory => fs::create_dir(&path).map_err(map_io),
            NodeKind::Generated | NodeKind::Passthrough => fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .map(|_| ())
                .map_err(map_io),
            // Symlink targets live in the node tree only.
            NodeKind::Symlink => Ok(()),
        }
    }

    fn on_remove(&self, descriptor: &Descriptor, kind: NodeKind) -> ProviderResult<()> {
        let path = self.host_path(descriptor)?;
        let result = match kind {
            NodeKind::Directory => fs::remove_dir(&path),
            NodeKind::Symlink => match fs::symlink_metadata(&path) {
                Ok(_) => fs::remove_file(&path),
                Err(_) => Ok(()),
            },
            NodeKind::Generated | NodeKind::Passthrough => fs::remove_file(&path),
        };
        match result {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other.map_err(ProviderError::Io),
        }
    }

    fn on_rename(&self, from: &Descriptor, to: &Descriptor) -> ProviderResult<()> {
        let from_path = self.host_path(from)?;
        if fs::symlink_metadata(&from_path).is_err() {
            // Engine-only symlinks have no host counterpart.
            return Ok(());
        }
        fs::rename(from_path, self.host_path(to)?).map_err(map_io)
    }
}
