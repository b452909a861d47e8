// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Engine configuration

use confgenfs_proto::FeatureFlags;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseSensitivity {
    #[default]
    Sensitive,
    /// Names keep their spelling but compare case-insensitively.
    InsensitivePreserving,
}

impl CaseSensitivity {
    /// Key under which a name is indexed in its directory.
    pub fn fold(self, name: &str) -> String {
        match self {
            CaseSensitivity::Sensitive => name.to_string(),
            CaseSensitivity::InsensitivePreserving => name.to_lowercase(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsLimits {
    pub max_open_handles: u32,
    /// Upper bound for a single read request.
    pub max_read_bytes: u32,
    /// Upper bound for a single write request; advertised as `max_write`.
    pub max_write_bytes: u32,
}

impl Default for FsLimits {
    fn default() -> Self {
        Self {
            max_open_handles: 4096,
            max_read_bytes: 1024 * 1024,
            max_write_bytes: 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    pub attr_ttl_ms: u64,
    pub entry_ttl_ms: u64,
    pub negative_ttl_ms: u64,
    /// Keep materialized bytes keyed on (descriptor, provider version).
    pub materialize_cache: bool,
    /// Buffer writes per handle until flush/release. When off, every write
    /// commits synchronously.
    pub write_buffering: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            attr_ttl_ms: 1000,
            entry_ttl_ms: 1000,
            negative_ttl_ms: 0,
            materialize_cache: true,
            write_buffering: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Lowest peer major version accepted.
    pub min_major: u32,
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    /// Feature names the engine asks for (see `FeatureFlags`).
    pub features: Vec<String>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            min_major: 7,
            major: 7,
            minor: 31,
            max_readahead: 128 * 1024,
            features: ["ASYNC_READ", "AUTO_INVAL_DATA", "READDIRPLUS", "PARALLEL_DIROPS"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ProtocolConfig {
    /// Resolve feature names into flags. Unknown names are a config error.
    pub fn wanted_features(&self) -> Result<FeatureFlags, String> {
        self.features.iter().try_fold(FeatureFlags::empty(), |acc, name| {
            FeatureFlags::from_name(&name.to_ascii_uppercase())
                .map(|flag| acc | flag)
                .ok_or_else(|| format!("unknown protocol feature '{}'", name))
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicy {
    /// Check owner permission bits against the requested access mode.
    pub enforce_permissions: bool,
    /// Owner of every node; the engine process' effective ids when unset.
    pub default_uid: Option<u32>,
    pub default_gid: Option<u32>,
    pub default_file_mode: u32,
    pub default_dir_mode: u32,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            enforce_permissions: true,
            default_uid: None,
            default_gid: None,
            default_file_mode: 0o644,
            default_dir_mode: 0o755,
        }
    }
}

impl SecurityPolicy {
    pub fn uid(&self) -> u32 {
        // SAFETY: geteuid has no failure modes.
        self.default_uid.unwrap_or_else(|| unsafe { libc::geteuid() })
    }

    pub fn gid(&self) -> u32 {
        // SAFETY: getegid has no failure modes.
        self.default_gid.unwrap_or_else(|| unsafe { libc::getegid() })
    }
}

/// Top-level engine configuration. Every field has a default, so partial
/// JSON documents load.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub case_sensitivity: CaseSensitivity,
    pub limits: FsLimits,
    pub cache: CachePolicy,
    pub protocol: ProtocolConfig,
    pub security: SecurityPolicy,
}

impl EngineConfig {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Reject combinations the engine cannot serve.
    pub fn validate(&self) -> Result<(), String> {
        if self.protocol.major < self.protocol.min_major {
            return Err(format!(
                "protocol.major {} is below protocol.min_major {}",
                self.protocol.major, self.protocol.min_major
            ));
        }
        if self.limits.max_open_handles == 0 {
            return Err("limits.max_open_handles must be positive".to_string());
        }
        if self.limits.max_write_bytes == 0 || self.limits.max_read_bytes == 0 {
            return Err("limits.max_read_bytes and max_write_bytes must be positive".to_string());
        }
        self.protocol.wanted_features().map(|_| ())
    }
}
