// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount lifecycle
//!
//! A `Mount` owns one engine and its dispatcher. Several mounts may live in
//! one process; each gets its own session id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{error, info};

use crate::config::EngineConfig;
use crate::dispatch::Dispatcher;
use crate::engine::Engine;
use crate::error::{CloseTimeError, MountError};
use crate::provider::ContentProvider;
use crate::types::{Descriptor, FsStats, SessionId};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

pub struct Mount {
    session: SessionId,
    dispatcher: Arc<Dispatcher>,
}

/// What an unmount left behind.
#[derive(Debug)]
pub struct UnmountReport {
    /// Handles still open at unmount, flushed and closed.
    pub flushed_handles: usize,
    /// Every close-time error not drained before unmount.
    pub close_errors: Vec<CloseTimeError>,
    pub stats: FsStats,
}

/// Seed a tree from the provider's layout and build the engine around it.
/// The session is pending until the peer's INIT is dispatched.
pub fn mount(
    provider: Arc<dyn ContentProvider>,
    root: Descriptor,
    config: EngineConfig,
) -> Result<Mount, MountError> {
    config.validate().map_err(MountError::Config)?;
    let layout = provider.layout(&root).map_err(|err| {
        error!(root = %root, error = %err, "provider layout failed");
        MountError::Layout(err)
    })?;
    let session = SessionId(NEXT_SESSION.fetch_add(1, Ordering::Relaxed));
    let engine = Engine::new(provider, root.clone(), config, session);
    let seeded = engine.seed(layout)?;
    info!(session = session.0, root = %root, nodes = seeded, "mounted");
    Ok(Mount {
        session,
        dispatcher: Arc::new(Dispatcher::new(Arc::new(engine))),
    })
}

impl Mount {
    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn engine(&self) -> &Arc<Engine> {
        self.dispatcher.engine()
    }

    /// Drain in-flight requests, flush and close every handle, then close
    /// the session.
    pub fn unmount(self) -> UnmountReport {
        let engine = self.dispatcher.engine();
        self.dispatcher.drain();
        let flushed_handles = engine.close_all();
        engine.session().close();
        let report = UnmountReport {
            flushed_handles,
            close_errors: engine.drain_close_errors(),
            stats: engine.stats(),
        };
        info!(
            session = self.session.0,
            flushed_handles,
            close_errors = report.close_errors.len(),
            commits = report.stats.commits,
            "unmounted"
        );
        report
    }
}
