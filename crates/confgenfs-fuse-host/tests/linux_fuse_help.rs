// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

#![allow(clippy::disallowed_methods)]

#[cfg(target_os = "linux")]
mod linux_tests {
    use std::process::Command;

    const BIN: &str = env!("CARGO_BIN_EXE_confgenfs-fuse-host");

    #[test]
    fn fuse_host_binary_help_runs() {
        // --help never mounts
        let output = Command::new(BIN)
            .arg("--help")
            .output()
            .expect("able to execute confgenfs-fuse-host");

        assert!(output.status.success(), "--help should succeed");
        let help = String::from_utf8_lossy(&output.stdout);
        assert!(help.contains("--source"));
        assert!(help.contains("--writeback-cache"));
    }

    #[test]
    fn fuse_host_requires_a_source() {
        let mount_point = tempfile::tempdir().unwrap();
        let status = Command::new(BIN)
            .arg(mount_point.path())
            .status()
            .expect("able to execute confgenfs-fuse-host");
        assert!(!status.success());
    }

    #[test]
    fn fuse_host_refuses_a_missing_source_directory() {
        let mount_point = tempfile::tempdir().unwrap();
        let status = Command::new(BIN)
            .arg(mount_point.path())
            .arg("--source")
            .arg(mount_point.path().join("absent"))
            .env("RUST_LOG", "off")
            .status()
            .expect("able to execute confgenfs-fuse-host");
        assert!(!status.success());
    }
}
