// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! confgenfs FUSE Host
//!
//! Mounts a host directory as a confgenfs tree through libfuse (Linux).

#[cfg(all(feature = "fuse", target_os = "linux"))]
mod adapter;
#[cfg_attr(not(all(feature = "fuse", target_os = "linux")), allow(dead_code))]
mod pool;

#[cfg(all(feature = "fuse", target_os = "linux"))]
use adapter::ConfgenFuse;
use anyhow::{Context, Result};
use clap::Parser;
use confgenfs_core::{mount, Descriptor, EngineConfig, HostDirProvider};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "confgenfs-fuse-host", about = "Serve a configuration directory over FUSE")]
struct Args {
    /// Mount point for the filesystem
    mount_point: PathBuf,

    /// Host directory whose files back the tree
    #[arg(short, long)]
    source: PathBuf,

    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Allow other users to access the filesystem
    #[arg(long)]
    allow_other: bool,

    /// Allow root to access the filesystem
    #[arg(long)]
    allow_root: bool,

    /// Auto unmount on process exit
    #[arg(long)]
    auto_unmount: bool,

    /// Ask the kernel to cache writes until flush or close.
    #[arg(long)]
    writeback_cache: bool,
}

/// Host settings outside the engine config.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostOptions {
    pub writeback_cache: bool,
    pub workers: usize,
    pub trace_writes: bool,
}

impl HostOptions {
    /// Combine CLI flags with `CONFGENFS_*` variables read through `var`.
    fn resolve(writeback_flag: bool, var: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |name: &str| {
            var(name)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        };
        let workers = var("CONFGENFS_WORKERS")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or_else(|| thread::available_parallelism().map(|p| p.get()).unwrap_or(1).max(2));
        Self {
            writeback_cache: writeback_flag || flag("CONFGENFS_WRITEBACK_CACHE"),
            workers,
            trace_writes: flag("CONFGENFS_TRACE_WRITES"),
        }
    }

    fn apply(&self, config: &mut EngineConfig) {
        if self.writeback_cache && !config.protocol.features.iter().any(|f| f == "WRITEBACK_CACHE") {
            config.protocol.features.push("WRITEBACK_CACHE".to_string());
        }
    }
}

fn load_config(config_path: Option<&Path>) -> Result<EngineConfig> {
    let config = match config_path {
        Some(path) => {
            let content = fs::read(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            EngineConfig::from_json_bytes(&content)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    config.validate().map_err(anyhow::Error::msg).context("invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();

    info!(mount_point = %args.mount_point.display(), source = %args.source.display(), "starting confgenfs FUSE host");

    let options = HostOptions::resolve(args.writeback_cache, |name| std::env::var(name).ok());
    let mut config = load_config(args.config.as_deref())?;
    options.apply(&mut config);
    info!(
        attr_ttl_ms = config.cache.attr_ttl_ms,
        entry_ttl_ms = config.cache.entry_ttl_ms,
        write_buffering = config.cache.write_buffering,
        features = ?config.protocol.features,
        workers = options.workers,
        "configuration loaded"
    );

    let provider = HostDirProvider::new(&args.source)
        .with_context(|| format!("failed to open source directory {}", args.source.display()))?;
    let mounted = mount(Arc::new(provider), Descriptor::new("/"), config)?;

    #[cfg(all(feature = "fuse", target_os = "linux"))]
    {
        let filesystem = ConfgenFuse::new(mounted, options);
        let notifier_slot = filesystem.notifier_slot();

        let mut mount_options = vec![
            fuser::MountOption::FSName("confgenfs".to_string()),
            fuser::MountOption::Subtype("confgenfs".to_string()),
        ];

        if args.allow_other {
            mount_options.push(fuser::MountOption::AllowOther);
        }

        if args.allow_root {
            mount_options.push(fuser::MountOption::AllowRoot);
        }

        if args.auto_unmount {
            mount_options.push(fuser::MountOption::AutoUnmount);
        }

        info!("mounting filesystem");
        let session = fuser::spawn_mount2(filesystem, &args.mount_point, &mount_options)
            .with_context(|| format!("failed to mount at {}", args.mount_point.display()))?;
        notifier_slot.install(session.notifier());
        info!("confgenfs FUSE host mounted; blocking until unmount");
        session.join();
    }

    #[cfg(not(all(feature = "fuse", target_os = "linux")))]
    {
        let _ = (args.allow_other, args.allow_root, args.auto_unmount);
        warn!("FUSE support not compiled in; source and config validated only");
        let report = mounted.unmount();
        info!(nodes = report.stats.nodes, "source tree seeded successfully");
        info!("To enable FUSE support, compile with: cargo build --features fuse");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_config_loading_default() {
        let config = load_config(None).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_config_loading_partial_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let config_json = r#"{
            "cache": { "attr_ttl_ms": 500, "write_buffering": false },
            "limits": { "max_open_handles": 100 },
            "protocol": { "features": ["ASYNC_READ"] }
        }"#;
        temp_file.write_all(config_json.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let config = load_config(Some(temp_file.path())).unwrap();
        assert_eq!(config.cache.attr_ttl_ms, 500);
        assert!(!config.cache.write_buffering);
        assert_eq!(config.limits.max_open_handles, 100);
        assert_eq!(config.cache.entry_ttl_ms, EngineConfig::default().cache.entry_ttl_ms);
    }

    #[test]
    fn test_config_rejects_unknown_feature() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(br#"{ "protocol": { "features": ["TELEPATHY"] } }"#).unwrap();
        temp_file.flush().unwrap();
        assert!(load_config(Some(temp_file.path())).is_err());
        assert!(load_config(Some(Path::new("/nonexistent/confgenfs.json"))).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let options = HostOptions::resolve(
            false,
            env(&[
                ("CONFGENFS_WRITEBACK_CACHE", "TRUE"),
                ("CONFGENFS_WORKERS", "3"),
                ("CONFGENFS_TRACE_WRITES", "1"),
            ]),
        );
        assert_eq!(
            options,
            HostOptions {
                writeback_cache: true,
                workers: 3,
                trace_writes: true
            }
        );

        let defaults = HostOptions::resolve(false, env(&[("CONFGENFS_WORKERS", "0")]));
        assert!(!defaults.writeback_cache);
        assert!(!defaults.trace_writes);
        assert!(defaults.workers >= 2);
    }

    #[test]
    fn test_writeback_feature_added_once() {
        let options = HostOptions::resolve(true, env(&[]));
        let mut config = EngineConfig::default();
        options.apply(&mut config);
        options.apply(&mut config);
        let count = config.protocol.features.iter().filter(|f| *f == "WRITEBACK_CACHE").count();
        assert_eq!(count, 1);
        assert!(config.validate().is_ok());
    }
}
