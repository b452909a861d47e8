// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Protocol session: version and feature negotiation
//!
//! Negotiation happens once per session. The outcome is stored in a
//! `OnceLock` and never changes afterwards; a second INIT is a protocol
//! violation. A peer below the minimum major version moves the session into
//! a failed state in which every later request is refused.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use confgenfs_proto::{FeatureFlags, InitRequest, PeerVersion};
use tracing::{error, info};

use crate::config::EngineConfig;
use crate::error::{FsError, FsResult};
use crate::types::SessionId;

const PENDING: u8 = 0;
const NEGOTIATING: u8 = 1;
const ACTIVE: u8 = 2;
const FAILED: u8 = 3;
const CLOSED: u8 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Active,
    Failed,
    Closed,
}

/// Capability set recorded at negotiation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub major: u32,
    pub minor: u32,
    pub features: FeatureFlags,
    pub max_readahead: u32,
    pub max_write: u32,
    pub max_read: u32,
    pub write_buffering: bool,
}

impl Capabilities {
    /// Eager materialization at open pays off when the kernel reads ahead.
    pub fn favors_readahead(&self) -> bool {
        self.features.contains(FeatureFlags::ASYNC_READ) && self.max_readahead > 0
    }

    /// The kernel revalidates cached pages on its own.
    pub fn kernel_invalidates(&self) -> bool {
        self.features.contains(FeatureFlags::AUTO_INVAL_DATA)
    }
}

/// Result of one INIT exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Negotiation {
    /// Session is active with these capabilities.
    Established(Capabilities),
    /// Peer speaks a newer major; answer with ours and expect another INIT.
    Downgrade { major: u32, minor: u32 },
}

#[derive(Clone, Debug)]
struct Offer {
    min_major: u32,
    major: u32,
    minor: u32,
    max_readahead: u32,
    max_write: u32,
    max_read: u32,
    features: FeatureFlags,
    write_buffering: bool,
}

pub struct Session {
    id: SessionId,
    state: AtomicU8,
    capabilities: OnceLock<Capabilities>,
    offer: Offer,
}

impl Session {
    /// `config` must already have passed `EngineConfig::validate`.
    pub fn new(id: SessionId, config: &EngineConfig) -> Self {
        let features = config.protocol.wanted_features().unwrap_or_default();
        Self {
            id,
            state: AtomicU8::new(PENDING),
            capabilities: OnceLock::new(),
            offer: Offer {
                min_major: config.protocol.min_major,
                major: config.protocol.major,
                minor: config.protocol.minor,
                max_readahead: config.protocol.max_readahead,
                max_write: config.limits.max_write_bytes,
                max_read: config.limits.max_read_bytes,
                features,
                write_buffering: config.cache.write_buffering,
            },
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(Ordering::Acquire) {
            PENDING | NEGOTIATING => SessionState::Pending,
            ACTIVE => SessionState::Active,
            FAILED => SessionState::Failed,
            _ => SessionState::Closed,
        }
    }

    pub fn negotiate(&self, peer: &InitRequest) -> FsResult<Negotiation> {
        if let Err(current) =
            self.state.compare_exchange(PENDING, NEGOTIATING, Ordering::AcqRel, Ordering::Acquire)
        {
            return Err(match current {
                FAILED => FsError::MountNegotiationFailed("session already failed".into()),
                CLOSED => FsError::SessionClosed,
                _ => FsError::ProtocolViolation("INIT on a negotiated session".into()),
            });
        }

        let version = peer.version();
        if version.major < self.offer.min_major {
            self.state.store(FAILED, Ordering::Release);
            error!(
                session = self.id.0,
                peer = %version,
                min_major = self.offer.min_major,
                "refusing mount: peer protocol too old"
            );
            return Err(FsError::MountNegotiationFailed(format!(
                "peer protocol {} is below the minimum major {}",
                version, self.offer.min_major
            )));
        }
        if version.major > self.offer.major {
            self.state.store(PENDING, Ordering::Release);
            info!(session = self.id.0, peer = %version, "peer is newer, offering {}.{}", self.offer.major, self.offer.minor);
            return Ok(Negotiation::Downgrade {
                major: self.offer.major,
                minor: self.offer.minor,
            });
        }

        let capabilities = Capabilities {
            major: version.major,
            minor: version.minor.min(self.offer.minor),
            features: FeatureFlags::from_peer(peer.flags) & self.offer.features,
            max_readahead: peer.max_readahead.min(self.offer.max_readahead),
            max_write: self.offer.max_write,
            max_read: self.offer.max_read,
            write_buffering: self.offer.write_buffering,
        };
        let capabilities = self.capabilities.get_or_init(|| capabilities).clone();
        self.state.store(ACTIVE, Ordering::Release);
        info!(
            session = self.id.0,
            version = %PeerVersion { major: capabilities.major, minor: capabilities.minor },
            features = ?capabilities.features.names(),
            max_readahead = capabilities.max_readahead,
            write_buffering = capabilities.write_buffering,
            "session negotiated"
        );
        Ok(Negotiation::Established(capabilities))
    }

    /// Capabilities for dispatching a request; fails unless active.
    pub fn capabilities(&self) -> FsResult<&Capabilities> {
        match self.state.load(Ordering::Acquire) {
            ACTIVE => self
                .capabilities
                .get()
                .ok_or_else(|| FsError::ProtocolViolation("session has no capabilities".into())),
            PENDING | NEGOTIATING => {
                Err(FsError::ProtocolViolation("request before INIT".into()))
            }
            FAILED => Err(FsError::MountNegotiationFailed("session failed negotiation".into())),
            _ => Err(FsError::SessionClosed),
        }
    }

    pub fn close(&self) {
        self.state.store(CLOSED, Ordering::Release);
    }
}
