// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Kernel cache invalidation notices

use crate::types::NodeId;

/// Receives notices when kernel-cached data or entries went stale. Calls
/// happen after the engine released its own locks and must not block for
/// long.
#[cfg_attr(test, mockall::automock)]
pub trait InvalidationSink: Send + Sync {
    /// Cached pages and attributes of `node` are stale.
    fn invalidate_content(&self, node: NodeId);

    /// The name `name` under `parent` no longer resolves as it did.
    fn invalidate_entry(&self, parent: NodeId, name: &str);
}

/// Sink that drops every notice.
pub struct NoopSink;

impl InvalidationSink for NoopSink {
    fn invalidate_content(&self, _node: NodeId) {}

    fn invalidate_entry(&self, _parent: NodeId, _name: &str) {}
}
