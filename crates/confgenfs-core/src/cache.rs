// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Materialization cache
//!
//! Entries are keyed on descriptor and tagged with the provider version they
//! were produced at. Each entry has its own mutex, held across the provider
//! call, so concurrent readers of one descriptor share a single
//! materialization while other descriptors proceed independently. The outer
//! map lock is only held to find or drop a slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::provider::ProviderResult;
use crate::types::Descriptor;

struct Cached {
    version: u64,
    bytes: Arc<Vec<u8>>,
}

#[derive(Default)]
struct Slot {
    content: Mutex<Option<Cached>>,
}

/// Whether a lookup was served from the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
}

pub struct MaterializationCache {
    enabled: bool,
    slots: Mutex<HashMap<Descriptor, Arc<Slot>>>,
}

impl MaterializationCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<Descriptor, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return cached bytes for `(descriptor, version)` or run `produce`.
    /// Without a version (or with caching disabled) `produce` always runs.
    pub fn get_or_materialize<F>(
        &self,
        descriptor: &Descriptor,
        version: Option<u64>,
        produce: F,
    ) -> ProviderResult<(Arc<Vec<u8>>, CacheOutcome)>
    where
        F: FnOnce() -> ProviderResult<Vec<u8>>,
    {
        let version = match version {
            Some(version) if self.enabled => version,
            _ => return produce().map(|bytes| (Arc::new(bytes), CacheOutcome::Miss)),
        };
        let slot = self.slots().entry(descriptor.clone()).or_default().clone();
        let mut content = slot.content.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = content.as_ref().filter(|c| c.version == version) {
            return Ok((cached.bytes.clone(), CacheOutcome::Hit));
        }
        let bytes = Arc::new(produce()?);
        *content = Some(Cached {
            version,
            bytes: bytes.clone(),
        });
        Ok((bytes, CacheOutcome::Miss))
    }

    pub fn invalidate(&self, descriptor: &Descriptor) {
        self.slots().remove(descriptor);
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
