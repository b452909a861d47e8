// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Structural validation of decoded requests
//!
//! Checks here depend only on the request itself. Anything that needs engine
//! state (does the node exist, is the handle open) is left to the engine.

use ssz::{Decode, Encode};
use thiserror::Error;

use crate::codes::ResultCode;
use crate::messages::*;

/// Longest single path component accepted, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Validation error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("empty name")]
    EmptyName,
    #[error("name contains a path separator or NUL byte")]
    IllegalByte,
    #[error("name is not valid UTF-8")]
    NotUtf8,
    #[error("name is {0} bytes, limit is {MAX_NAME_LEN}")]
    NameTooLong(usize),
    #[error("reserved name '{0}'")]
    ReservedName(String),
    #[error("offset {0} exceeds the signed 64-bit range")]
    OffsetOutOfRange(u64),
    #[error("empty symlink target")]
    EmptyTarget,
    #[error("directory page of zero entries")]
    EmptyPage,
    #[error("SSZ decoding failed: {0}")]
    SszDecode(String),
}

impl ValidationError {
    /// Result code reported for this violation.
    pub fn code(&self) -> ResultCode {
        match self {
            ValidationError::NameTooLong(_) => ResultCode::NameTooLong,
            _ => ResultCode::InvalidArgument,
        }
    }
}

/// Validate a single path component used to look up an existing entry.
pub fn validate_name(name: &[u8]) -> Result<&str, ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ValidationError::NameTooLong(name.len()));
    }
    if name.iter().any(|b| *b == b'/' || *b == 0) {
        return Err(ValidationError::IllegalByte);
    }
    std::str::from_utf8(name).map_err(|_| ValidationError::NotUtf8)
}

/// Like [`validate_name`], but also refuses `.` and `..`, which can never be
/// created, removed or used as a rename endpoint.
pub fn validate_new_name(name: &[u8]) -> Result<&str, ValidationError> {
    let name = validate_name(name)?;
    if name == "." || name == ".." {
        return Err(ValidationError::ReservedName(name.to_string()));
    }
    Ok(name)
}

pub fn validate_offset(offset: u64) -> Result<u64, ValidationError> {
    if offset > i64::MAX as u64 {
        return Err(ValidationError::OffsetOutOfRange(offset));
    }
    Ok(offset)
}

/// Validate a decoded request against its logical schema
pub fn validate_request(request: &Request) -> Result<(), ValidationError> {
    match request {
        Request::Lookup(req) => validate_name(&req.name).map(|_| ()),
        Request::ReadDir(req) => {
            validate_offset(req.offset)?;
            if req.max_entries == 0 {
                return Err(ValidationError::EmptyPage);
            }
            Ok(())
        }
        Request::Read(req) => validate_offset(req.offset).map(|_| ()),
        Request::Write(req) => {
            validate_offset(req.offset)?;
            validate_offset(req.offset.saturating_add(req.data.len() as u64)).map(|_| ())
        }
        Request::Create(req) => validate_new_name(&req.name).map(|_| ()),
        Request::Mkdir(req) => validate_new_name(&req.name).map(|_| ()),
        Request::Unlink(req) | Request::Rmdir(req) => validate_new_name(&req.name).map(|_| ()),
        Request::Rename(req) => {
            validate_new_name(&req.name)?;
            validate_new_name(&req.new_name).map(|_| ())
        }
        Request::Symlink(req) => {
            validate_new_name(&req.name)?;
            if req.target.is_empty() {
                return Err(ValidationError::EmptyTarget);
            }
            if req.target.contains(&0) {
                return Err(ValidationError::IllegalByte);
            }
            Ok(())
        }
        Request::Init(_)
        | Request::GetAttr(_)
        | Request::Open(_)
        | Request::Flush(_)
        | Request::Fsync(_)
        | Request::Release(_)
        | Request::ReadLink(_)
        | Request::Interrupt(_) => Ok(()),
    }
}

/// Decode one request frame.
pub fn decode_envelope(frame: &[u8]) -> Result<Envelope, ValidationError> {
    Envelope::from_ssz_bytes(frame).map_err(|e| ValidationError::SszDecode(format!("{:?}", e)))
}

/// Decode one reply frame.
pub fn decode_reply(frame: &[u8]) -> Result<Reply, ValidationError> {
    Reply::from_ssz_bytes(frame).map_err(|e| ValidationError::SszDecode(format!("{:?}", e)))
}

pub fn encode_envelope(envelope: &Envelope) -> Vec<u8> {
    envelope.as_ssz_bytes()
}

pub fn encode_reply(reply: &Reply) -> Vec<u8> {
    reply.as_ssz_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_rules() {
        assert_eq!(validate_name(b"app.conf"), Ok("app.conf"));
        assert_eq!(validate_name(b""), Err(ValidationError::EmptyName));
        assert_eq!(validate_name(b"a/b"), Err(ValidationError::IllegalByte));
        assert_eq!(validate_name(b"a\0b"), Err(ValidationError::IllegalByte));
        assert_eq!(validate_name(&[0xff, 0xfe]), Err(ValidationError::NotUtf8));
        assert_eq!(validate_name(b".."), Ok(".."));
        assert!(matches!(validate_new_name(b".."), Err(ValidationError::ReservedName(_))));
    }

    #[test]
    fn name_length_boundary() {
        let max = vec![b'x'; MAX_NAME_LEN];
        assert!(validate_name(&max).is_ok());
        let over = vec![b'x'; MAX_NAME_LEN + 1];
        let err = validate_name(&over).unwrap_err();
        assert_eq!(err.code(), ResultCode::NameTooLong);
    }

    #[test]
    fn write_end_must_fit_signed_range() {
        let edge = i64::MAX as u64;
        assert!(validate_request(&Request::write(1, edge, vec![])).is_ok());
        assert!(validate_request(&Request::write(1, edge, vec![1])).is_err());
        assert!(validate_request(&Request::read(1, edge + 1, 1)).is_err());
    }
}
