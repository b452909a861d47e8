// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the confgenfs engine

use std::io;

use confgenfs_proto::{ResultCode, ValidationError};

use crate::provider::ProviderError;
use crate::types::{Descriptor, HandleId, NodeId};

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("mount negotiation failed: {0}")]
    MountNegotiationFailed(String),
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("permission denied")]
    PermissionDenied,
    #[error("content generation failed: {0}")]
    GenerationFailed(String),
    #[error("commit rejected: {0}")]
    Rejected(String),
    #[error("stale handle")]
    StaleHandle,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("bad handle")]
    BadHandle,
    #[error("name not allowed: {0}")]
    InvalidName(ValidationError),
    #[error("invalid argument")]
    InvalidArgument,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("interrupted")]
    Interrupted,
    #[error("session closed")]
    SessionClosed,
    #[error("unsupported")]
    Unsupported,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    /// Protocol result code reported for this error.
    pub fn code(&self) -> ResultCode {
        match self {
            FsError::MountNegotiationFailed(_) => ResultCode::NotSupported,
            FsError::NotFound => ResultCode::NoEntry,
            FsError::AlreadyExists => ResultCode::AlreadyExists,
            FsError::NotADirectory => ResultCode::NotADirectory,
            FsError::IsADirectory => ResultCode::IsADirectory,
            FsError::NotEmpty => ResultCode::NotEmpty,
            FsError::PermissionDenied => ResultCode::PermissionDenied,
            FsError::GenerationFailed(_) | FsError::Rejected(_) | FsError::Io(_) => ResultCode::Io,
            FsError::StaleHandle => ResultCode::StaleHandle,
            FsError::ProtocolViolation(_) | FsError::InvalidArgument => {
                ResultCode::InvalidArgument
            }
            FsError::BadHandle => ResultCode::BadHandle,
            FsError::InvalidName(err) => err.code(),
            FsError::TooManyOpenFiles => ResultCode::TooManyOpenFiles,
            FsError::Interrupted => ResultCode::Interrupted,
            FsError::SessionClosed | FsError::Unsupported => ResultCode::NotSupported,
        }
    }
}

impl From<ProviderError> for FsError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::GenerationFailed(reason) => FsError::GenerationFailed(reason),
            ProviderError::Rejected(reason) => FsError::Rejected(reason),
            ProviderError::NotFound => FsError::NotFound,
            ProviderError::Io(err) => FsError::Io(err),
        }
    }
}

impl From<ValidationError> for FsError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::OffsetOutOfRange(_)
            | ValidationError::EmptyTarget
            | ValidationError::EmptyPage => FsError::InvalidArgument,
            ValidationError::SszDecode(reason) => FsError::ProtocolViolation(reason),
            other => FsError::InvalidName(other),
        }
    }
}

/// A failure that happened while closing a handle, after the caller's own
/// request had already been answered (or had failed for another reason).
#[derive(Debug)]
pub struct CloseTimeError {
    pub handle: HandleId,
    pub node: NodeId,
    pub descriptor: Descriptor,
    pub error: FsError,
}

impl std::fmt::Display for CloseTimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "close of handle {} on node {} ({}) failed: {}",
            self.handle, self.node, self.descriptor, self.error
        )
    }
}

/// Errors raised while mounting.
#[derive(thiserror::Error, Debug)]
pub enum MountError {
    #[error("invalid engine config: {0}")]
    Config(String),
    #[error("provider layout failed: {0}")]
    Layout(#[from] ProviderError),
    #[error("layout entry '{path}' rejected: {source}")]
    Entry {
        path: String,
        #[source]
        source: FsError,
    },
}
