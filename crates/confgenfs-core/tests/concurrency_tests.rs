// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

mod support;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use confgenfs_core::{mount, Descriptor, EngineConfig, FsError, MemoryProvider, NodeId, OpenOptions};
use confgenfs_proto::{FeatureFlags, Request, ReplyBody, ResultCode};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use support::{Client, GatedProvider};

const FILES: usize = 16;
const THREADS: usize = 6;
const ROUNDS: usize = 400;

#[test]
fn concurrent_reads_of_one_node_agree() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let provider = MemoryProvider::new()
        .with_file("/static.conf", "a = 1\nb = 2\n")
        .with_generator("/rendered.conf", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(b"rendered\n".repeat(64))
        });
    let mount = mount(Arc::new(provider), Descriptor::new("/"), EngineConfig::default()).unwrap();
    let client = Client::new(&mount);
    client.init();
    let engine = mount.engine().clone();

    for name in ["static.conf", "rendered.conf"] {
        let node = engine.lookup(NodeId::ROOT, name).unwrap().node;
        let barrier = Arc::new(Barrier::new(8));
        let readers: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let opened = engine.open(node, OpenOptions::read_only()).unwrap();
                    let mut bytes = Vec::new();
                    loop {
                        let chunk = engine.read(opened.handle, bytes.len() as u64, 100).unwrap();
                        if chunk.is_empty() {
                            break;
                        }
                        bytes.extend(chunk);
                    }
                    engine.release(opened.handle).unwrap();
                    bytes
                })
            })
            .collect();
        let results: Vec<_> = readers.into_iter().map(|r| r.join().unwrap()).collect();
        assert!(results.windows(2).all(|pair| pair[0] == pair[1]), "{} reads diverged", name);
        assert!(!results[0].is_empty());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 8);
}

/// Threads move files back and forth between two directories in random
/// order, so cross-directory renames constantly take the same pair of
/// directory locks from opposite sides.
#[test]
fn opposite_order_renames_never_deadlock() {
    let mut provider = MemoryProvider::new().with_dir("/left").with_dir("/right");
    for i in 0..FILES {
        provider = provider.with_file(&format!("/left/f{}", i), format!("{}", i));
    }
    let provider = Arc::new(provider);
    let mount = mount(provider.clone(), Descriptor::new("/"), EngineConfig::default()).unwrap();
    Client::new(&mount).init();
    let engine = mount.engine().clone();
    let left = engine.lookup(NodeId::ROOT, "left").unwrap().node;
    let right = engine.lookup(NodeId::ROOT, "right").unwrap().node;

    let moved = Arc::new(AtomicUsize::new(0));
    let workers: Vec<_> = (0..THREADS)
        .map(|seed| {
            let engine = engine.clone();
            let moved = moved.clone();
            thread::spawn(move || {
                let mut rng = SmallRng::seed_from_u64(seed as u64);
                for _ in 0..ROUNDS {
                    let name = format!("f{}", rng.gen_range(0..FILES));
                    let (from, to) = if rng.gen_bool(0.5) { (left, right) } else { (right, left) };
                    match engine.rename(from, &name, to, &name) {
                        Ok(()) => {
                            moved.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(FsError::NotFound) => {}
                        Err(err) => panic!("rename {} failed: {}", name, err),
                    }
                }
            })
        })
        .collect();

    let lister = {
        let engine = engine.clone();
        thread::spawn(move || {
            for _ in 0..ROUNDS {
                for dir in [left, right] {
                    let page = engine.readdir(dir, 0, FILES * 2).unwrap();
                    let names: BTreeSet<_> = page.entries.iter().map(|e| e.name.clone()).collect();
                    assert_eq!(names.len(), page.entries.len());
                }
            }
        })
    };

    for worker in workers {
        worker.join().unwrap();
    }
    lister.join().unwrap();
    assert!(moved.load(Ordering::Relaxed) > 0);

    // Every file lives in exactly one directory, in the tree and the provider.
    let names = |dir| -> BTreeSet<String> {
        engine.readdir(dir, 0, FILES * 2).unwrap().entries.into_iter().map(|e| e.name).collect()
    };
    let (in_left, in_right) = (names(left), names(right));
    assert!(in_left.is_disjoint(&in_right));
    assert_eq!(in_left.len() + in_right.len(), FILES);
    for name in &in_left {
        assert!(provider.contains(&format!("/left/{}", name)));
        assert!(!provider.contains(&format!("/right/{}", name)));
    }
    for name in &in_right {
        let node = engine.lookup(right, name).unwrap().node;
        let opened = engine.open(node, OpenOptions::read_only()).unwrap();
        assert_eq!(engine.read(opened.handle, 0, 8).unwrap(), name[1..].as_bytes());
        engine.release(opened.handle).unwrap();
    }
}

#[test]
fn interrupted_read_is_discarded_and_handle_survives() {
    let provider = Arc::new(GatedProvider::new(MemoryProvider::new().with_file("/slow.conf", "late")));
    let mount = mount(provider.clone(), Descriptor::new("/"), EngineConfig::default()).unwrap();
    let dispatcher = mount.dispatcher().clone();
    let client = Client::new(&mount);
    client.init_with(FeatureFlags::empty());
    let node = client.lookup(1, "slow.conf").node;
    let handle = client.open(node, libc::O_RDONLY);

    let session = mount.session_id().0;
    let reader = {
        let dispatcher = dispatcher.clone();
        thread::spawn(move || {
            dispatcher.dispatch(confgenfs_proto::Envelope::new(500, session, Request::read(handle, 0, 64)))
        })
    };
    provider.wait_for_waiters(1);
    assert_eq!(dispatcher.in_flight_count(), 1);
    client.ok(Request::interrupt(500));
    provider.open_gate();

    let reply = reader.join().unwrap();
    assert_eq!(reply.code(), ResultCode::Interrupted);
    assert_eq!(client.read(handle, 0, 64), b"late");
}

#[test]
fn interrupted_flush_still_commits() {
    let provider = Arc::new(GatedProvider::new(MemoryProvider::new().with_file("/slow.conf", "v1")));
    let mount = mount(provider.clone(), Descriptor::new("/"), EngineConfig::default()).unwrap();
    let dispatcher = mount.dispatcher().clone();
    let client = Client::new(&mount);
    client.init_with(FeatureFlags::empty());
    let node = client.lookup(1, "slow.conf").node;
    let handle = client.open(node, libc::O_WRONLY);
    provider.open_gate();
    client.write(handle, 0, b"v2");
    provider.close_gate();

    let session = mount.session_id().0;
    let flusher = {
        let dispatcher = dispatcher.clone();
        thread::spawn(move || {
            dispatcher.dispatch(confgenfs_proto::Envelope::new(700, session, Request::flush(handle)))
        })
    };
    provider.wait_for_waiters(1);
    assert!(provider.commits().is_empty());
    client.ok(Request::interrupt(700));
    provider.open_gate();

    let reply = flusher.join().unwrap();
    assert_eq!(reply.code(), ResultCode::Success);
    assert_eq!(provider.commits(), vec![(Descriptor::new("/slow.conf"), b"v2".to_vec())]);
    client.ok(Request::release(handle));
    assert_eq!(provider.commits().len(), 1);
}

#[test]
fn a_reused_unique_is_refused_while_in_flight() {
    let provider = Arc::new(GatedProvider::new(MemoryProvider::new().with_file("/slow.conf", "late")));
    let mount = mount(provider.clone(), Descriptor::new("/"), EngineConfig::default()).unwrap();
    let dispatcher = mount.dispatcher().clone();
    let client = Client::new(&mount);
    client.init_with(FeatureFlags::empty());
    let node = client.lookup(1, "slow.conf").node;
    let handle = client.open(node, libc::O_RDONLY);

    let session = mount.session_id().0;
    let reader = {
        let dispatcher = dispatcher.clone();
        thread::spawn(move || {
            dispatcher.dispatch(confgenfs_proto::Envelope::new(600, session, Request::read(handle, 0, 64)))
        })
    };
    provider.wait_for_waiters(1);
    assert_eq!(client.call_as(600, Request::getattr(1)).code(), ResultCode::InvalidArgument);
    assert_eq!(dispatcher.in_flight_count(), 1);

    // The interrupt still reaches the original request.
    client.ok(Request::interrupt(600));
    provider.open_gate();
    assert_eq!(reader.join().unwrap().code(), ResultCode::Interrupted);
    assert_eq!(dispatcher.in_flight_count(), 0);
    assert_eq!(client.call_as(600, Request::getattr(1)).code(), ResultCode::Success);
}

#[test]
fn unmount_waits_for_in_flight_requests() {
    let provider = Arc::new(GatedProvider::new(MemoryProvider::new().with_file("/slow.conf", "v1")));
    let mount = mount(provider.clone(), Descriptor::new("/"), EngineConfig::default()).unwrap();
    let dispatcher = mount.dispatcher().clone();
    let client = Client::new(&mount);
    client.init_with(FeatureFlags::empty());
    let node = client.lookup(1, "slow.conf").node;
    let handle = client.open(node, libc::O_RDWR);
    let session = mount.session_id().0;

    let writer = {
        let dispatcher = dispatcher.clone();
        thread::spawn(move || {
            // The first write seeds its buffer from current content.
            dispatcher.dispatch(confgenfs_proto::Envelope::new(
                900,
                session,
                Request::write(handle, 0, b"v2".to_vec()),
            ))
        })
    };
    provider.wait_for_waiters(1);
    let drainer = {
        let dispatcher = dispatcher.clone();
        thread::spawn(move || dispatcher.drain())
    };
    while !drainer.is_finished() && dispatcher.in_flight_count() == 1 {
        // New work is refused as soon as draining starts.
        if client.code(Request::getattr(1)) == ResultCode::NotSupported {
            break;
        }
        thread::yield_now();
    }
    assert!(!drainer.is_finished());
    provider.open_gate();
    drainer.join().unwrap();
    assert!(matches!(writer.join().unwrap().body, ReplyBody::Written(_)));

    let report = mount.unmount();
    assert_eq!(report.flushed_handles, 1);
    assert!(report.close_errors.is_empty());
    assert_eq!(report.stats.commits, 1);
}
