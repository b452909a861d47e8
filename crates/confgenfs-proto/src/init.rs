// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Extraction of the kernel `INIT` payload
//!
//! `fuse_init_in` mixes fixed-width fields with packed flag words and grows
//! with every protocol minor. Nothing here reinterprets the structure as a
//! whole: each field group the engine consumes has its own accessor reading
//! fixed offsets from the raw bytes. Review these offsets whenever the kernel
//! protocol version we target changes.
//!
//! ```text
//! offset  field
//!      0  major          u32
//!      4  minor          u32
//!      8  max_readahead  u32
//!     12  flags          u32
//!     16  flags2         u32   (minor >= 36, only meaningful with FUSE_INIT_EXT)
//! ```

use crate::features::FUSE_INIT_EXT;
use crate::messages::InitRequest;

const MAJOR_OFFSET: usize = 0;
const MINOR_OFFSET: usize = 4;
const MAX_READAHEAD_OFFSET: usize = 8;
const FLAGS_OFFSET: usize = 12;
const FLAGS2_OFFSET: usize = 16;

/// First minor carrying the `flags2` word.
pub const FLAGS2_MINOR: u32 = 36;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ExtractError {
    #[error("init payload truncated: field at offset {offset} needs {needed} bytes, got {got}")]
    Truncated {
        offset: usize,
        needed: usize,
        got: usize,
    },
}

/// Protocol version pair announced by the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerVersion {
    pub major: u32,
    pub minor: u32,
}

impl std::fmt::Display for PeerVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

fn read_u32(raw: &[u8], offset: usize) -> Result<u32, ExtractError> {
    let end = offset + 4;
    let bytes = raw.get(offset..end).ok_or(ExtractError::Truncated {
        offset,
        needed: end,
        got: raw.len(),
    })?;
    let mut word = [0u8; 4];
    word.copy_from_slice(bytes);
    Ok(u32::from_ne_bytes(word))
}

/// Version pair (offsets 0 and 4).
pub fn extract_version(raw: &[u8]) -> Result<PeerVersion, ExtractError> {
    Ok(PeerVersion {
        major: read_u32(raw, MAJOR_OFFSET)?,
        minor: read_u32(raw, MINOR_OFFSET)?,
    })
}

/// Read-ahead limit proposed by the peer (offset 8).
pub fn extract_max_readahead(raw: &[u8]) -> Result<u32, ExtractError> {
    read_u32(raw, MAX_READAHEAD_OFFSET)
}

/// Flag words (offset 12, plus offset 16 when the peer sets `FUSE_INIT_EXT`
/// on a minor that defines it). `flags2` lands in the high 32 bits.
pub fn extract_flags(raw: &[u8], version: PeerVersion) -> Result<u64, ExtractError> {
    let low = u64::from(read_u32(raw, FLAGS_OFFSET)?);
    if version.minor >= FLAGS2_MINOR && low & FUSE_INIT_EXT != 0 {
        let high = u64::from(read_u32(raw, FLAGS2_OFFSET)?);
        return Ok(low | (high << 32));
    }
    Ok(low)
}

impl InitRequest {
    /// Build an init request from a raw kernel `fuse_init_in` buffer.
    pub fn from_kernel_bytes(raw: &[u8]) -> Result<Self, ExtractError> {
        let version = extract_version(raw)?;
        Ok(InitRequest {
            major: version.major,
            minor: version.minor,
            max_readahead: extract_max_readahead(raw)?,
            flags: extract_flags(raw, version)?,
        })
    }

    pub fn version(&self) -> PeerVersion {
        PeerVersion {
            major: self.major,
            minor: self.minor,
        }
    }
}
