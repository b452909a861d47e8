// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Result codes carried in every reply

use libc::c_int;

/// Fixed result vocabulary of the kernel-facing protocol.
///
/// The numeric values are part of the wire format and must not be reordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResultCode {
    Success = 0,
    NoEntry = 1,
    PermissionDenied = 2,
    IsADirectory = 3,
    NotADirectory = 4,
    NotEmpty = 5,
    Io = 6,
    NotSupported = 7,
    AlreadyExists = 8,
    StaleHandle = 9,
    BadHandle = 10,
    InvalidArgument = 11,
    NameTooLong = 12,
    TooManyOpenFiles = 13,
    Interrupted = 14,
}

impl ResultCode {
    pub const ALL: [ResultCode; 15] = [
        ResultCode::Success,
        ResultCode::NoEntry,
        ResultCode::PermissionDenied,
        ResultCode::IsADirectory,
        ResultCode::NotADirectory,
        ResultCode::NotEmpty,
        ResultCode::Io,
        ResultCode::NotSupported,
        ResultCode::AlreadyExists,
        ResultCode::StaleHandle,
        ResultCode::BadHandle,
        ResultCode::InvalidArgument,
        ResultCode::NameTooLong,
        ResultCode::TooManyOpenFiles,
        ResultCode::Interrupted,
    ];

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|code| code.as_u32() == value)
    }

    /// Errno reported to the calling process for this code.
    pub fn errno(self) -> c_int {
        match self {
            ResultCode::Success => 0,
            ResultCode::NoEntry => libc::ENOENT,
            ResultCode::PermissionDenied => libc::EACCES,
            ResultCode::IsADirectory => libc::EISDIR,
            ResultCode::NotADirectory => libc::ENOTDIR,
            ResultCode::NotEmpty => libc::ENOTEMPTY,
            ResultCode::Io => libc::EIO,
            ResultCode::NotSupported => libc::ENOSYS,
            ResultCode::AlreadyExists => libc::EEXIST,
            ResultCode::StaleHandle => libc::ESTALE,
            ResultCode::BadHandle => libc::EBADF,
            ResultCode::InvalidArgument => libc::EINVAL,
            ResultCode::NameTooLong => libc::ENAMETOOLONG,
            ResultCode::TooManyOpenFiles => libc::EMFILE,
            ResultCode::Interrupted => libc::EINTR,
        }
    }

    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResultCode::Success => "success",
            ResultCode::NoEntry => "no such entry",
            ResultCode::PermissionDenied => "permission denied",
            ResultCode::IsADirectory => "is a directory",
            ResultCode::NotADirectory => "not a directory",
            ResultCode::NotEmpty => "directory not empty",
            ResultCode::Io => "i/o error",
            ResultCode::NotSupported => "not supported",
            ResultCode::AlreadyExists => "already exists",
            ResultCode::StaleHandle => "stale handle",
            ResultCode::BadHandle => "bad handle",
            ResultCode::InvalidArgument => "invalid argument",
            ResultCode::NameTooLong => "name too long",
            ResultCode::TooManyOpenFiles => "too many open files",
            ResultCode::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}
