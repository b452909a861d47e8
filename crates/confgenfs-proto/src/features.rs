// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Negotiable feature bits
//!
//! Only the features the engine acts on are named here. Bit positions follow
//! the kernel's `fuse_init_in.flags` word so a peer's flag word can be
//! intersected directly.

use bitflags::bitflags;

/// Set in `fuse_init_in.flags` when a second flag word follows.
pub const FUSE_INIT_EXT: u64 = 1 << 30;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct FeatureFlags: u64 {
        /// Kernel may issue reads asynchronously and read ahead.
        const ASYNC_READ = 1 << 0;
        /// Kernel invalidates cached data on its own when attributes change.
        const AUTO_INVAL_DATA = 1 << 12;
        /// Kernel supports READDIRPLUS.
        const READDIRPLUS = 1 << 13;
        /// Kernel buffers writes and flushes them lazily.
        const WRITEBACK_CACHE = 1 << 16;
        /// Directory operations on one directory may run in parallel.
        const PARALLEL_DIROPS = 1 << 18;
    }
}

impl FeatureFlags {
    /// Interpret a peer flag word, ignoring bits this engine does not know.
    pub fn from_peer(bits: u64) -> Self {
        Self::from_bits_truncate(bits)
    }

    /// Names for logging, in bit order.
    pub fn names(self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| name).collect()
    }
}
