// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

mod support;

use std::collections::BTreeSet;
use std::sync::Arc;

use confgenfs_core::{mount, ContentProvider, Descriptor, EngineConfig, MemoryProvider};
use confgenfs_proto::{decode_reply, Reply, ReplyBody, Request, ResultCode};
use support::Client;

const ROOT: u64 = 1;

#[test]
fn version_conf_write_flush_and_fresh_read() {
    let provider = Arc::new(MemoryProvider::new().with_file("/version.conf", "1.0\n"));
    let mount = mount(provider.clone(), Descriptor::new("/"), EngineConfig::default()).unwrap();
    let client = Client::new(&mount);
    client.init();

    let file = client.lookup(ROOT, "version.conf");
    assert_eq!(file.size, 4);

    let reader = client.open(file.node, libc::O_RDONLY);
    assert_eq!(client.read(reader, 0, 64), b"1.0\n");
    client.ok(Request::release(reader));

    let writer = client.open(file.node, libc::O_RDWR);
    client.write(writer, 0, b"2.0\n");
    client.ok(Request::flush(writer));
    assert_eq!(
        provider.commits(),
        vec![(Descriptor::new("/version.conf"), b"2.0\n".to_vec())]
    );

    let fresh = client.open(file.node, libc::O_RDONLY);
    assert_eq!(client.read(fresh, 0, 64), b"2.0\n");
    client.ok(Request::release(fresh));
    client.ok(Request::release(writer));
    // Nothing new to commit at release.
    assert_eq!(provider.commits().len(), 1);
}

#[test]
fn generated_files_bypass_the_page_cache() {
    let provider = Arc::new(MemoryProvider::new().with_generator("/hostname", || Ok(b"box\n".to_vec())));
    let mount = mount(provider, Descriptor::new("/"), EngineConfig::default()).unwrap();
    let client = Client::new(&mount);
    client.init();

    let file = client.lookup(ROOT, "hostname");
    let ReplyBody::Opened(open) = client.call(Request::open(file.node, libc::O_RDONLY as u32)).body
    else {
        panic!("open failed");
    };
    assert!(open.direct_io);
    assert_eq!(client.read(open.handle, 0, 64), b"box\n");
}

#[test]
fn generator_failure_surfaces_as_read_error() {
    let provider = Arc::new(MemoryProvider::new().with_generator("/broken", || Err("template error".into())));
    let mount = mount(provider, Descriptor::new("/"), EngineConfig::default()).unwrap();
    let client = Client::new(&mount);
    // Without read-ahead the open succeeds and the failure shows on read.
    client.init_with(confgenfs_proto::FeatureFlags::empty());

    let file = client.lookup(ROOT, "broken");
    let handle = client.open(file.node, libc::O_RDONLY);
    let reply = client.call(Request::read(handle, 0, 16));
    assert_eq!(reply.code(), ResultCode::Io);
    let ReplyBody::Error(err) = reply.body else {
        unreachable!()
    };
    assert!(String::from_utf8_lossy(&err.message).contains("template error"));
}

#[test]
fn garbage_frames_leave_the_session_serving() {
    let provider = Arc::new(MemoryProvider::new().with_file("/a", "x"));
    let mount = mount(provider, Descriptor::new("/"), EngineConfig::default()).unwrap();
    let client = Client::new(&mount);
    client.init();

    let reply: Reply = decode_reply(&mount.dispatcher().dispatch_frame(&[0xff, 0x00, 0x13])).unwrap();
    assert_eq!(reply.unique, 0);
    assert_eq!(reply.code(), ResultCode::InvalidArgument);

    assert_eq!(client.code(Request::getattr(ROOT)), ResultCode::Success);
}

#[test]
fn listing_tracks_creates_and_removes() {
    let provider = Arc::new(MemoryProvider::new().with_dir("/conf.d"));
    let mount = mount(provider.clone(), Descriptor::new("/"), EngineConfig::default()).unwrap();
    let client = Client::new(&mount);
    client.init();
    let dir = client.lookup(ROOT, "conf.d").node;

    let mut expected = BTreeSet::new();
    for i in 0..12 {
        let name = format!("{:02}-rule.conf", i);
        let ReplyBody::Created(created) =
            client.call(Request::create(dir, &name, 0o644, libc::O_WRONLY as u32)).body
        else {
            panic!("create {} failed", name);
        };
        client.ok(Request::release(created.handle));
        expected.insert(name);
    }
    for i in (0..12).step_by(3) {
        let name = format!("{:02}-rule.conf", i);
        client.ok(Request::unlink(dir, &name));
        expected.remove(&name);
    }
    assert_eq!(
        client.code(Request::create(dir, "01-rule.conf", 0o644, libc::O_WRONLY as u32)),
        ResultCode::AlreadyExists
    );

    let listed = client.list(dir, 5);
    let unique: BTreeSet<_> = listed.iter().cloned().collect();
    assert_eq!(unique.len(), listed.len(), "duplicate entries in {:?}", listed);
    assert_eq!(unique, expected);
    for name in &expected {
        assert_eq!(client.lookup(dir, name).kind, confgenfs_proto::FileKind::Passthrough.as_u8());
        assert!(provider.contains(&format!("/conf.d/{}", name)));
    }
    assert!(!provider.contains("/conf.d/00-rule.conf"));
}

#[test]
fn listing_resumes_after_removal_of_seen_entries() {
    let provider = Arc::new(
        MemoryProvider::new()
            .with_file("/a", "")
            .with_file("/b", "")
            .with_file("/c", "")
            .with_file("/d", ""),
    );
    let mount = mount(provider, Descriptor::new("/"), EngineConfig::default()).unwrap();
    let client = Client::new(&mount);
    client.init();

    let ReplyBody::Entries(first) = client.call(Request::readdir(ROOT, 0, 2)).body else {
        panic!("readdir failed");
    };
    let names: Vec<_> = first.entries.iter().map(|e| e.name_lossy()).collect();
    assert_eq!(names, ["a", "b"]);
    client.ok(Request::unlink(ROOT, "a"));
    client.ok(Request::unlink(ROOT, "b"));

    let ReplyBody::Entries(rest) =
        client.call(Request::readdir(ROOT, first.next_offset.unwrap(), 10)).body
    else {
        panic!("readdir failed");
    };
    let names: Vec<_> = rest.entries.iter().map(|e| e.name_lossy()).collect();
    assert_eq!(names, ["c", "d"]);
    assert_eq!(rest.next_offset, None);
}

#[test]
fn directories_symlinks_and_renames() {
    let provider = Arc::new(
        MemoryProvider::new()
            .with_file("/app/main.conf", "port = 80\n")
            .with_symlink("/current", "app/main.conf"),
    );
    let mount = mount(provider.clone(), Descriptor::new("/"), EngineConfig::default()).unwrap();
    let client = Client::new(&mount);
    client.init();

    let link = client.lookup(ROOT, "current");
    assert_eq!(link.mode & libc::S_IFMT as u32, libc::S_IFLNK as u32);
    assert_eq!(
        client.call(Request::readlink(link.node)).body,
        ReplyBody::link(b"app/main.conf".to_vec())
    );

    let ReplyBody::Entry(archive) = client.call(Request::mkdir(ROOT, "archive", 0o750)).body else {
        panic!("mkdir failed");
    };
    assert_eq!(archive.mode & 0o7777, 0o750);
    let app = client.lookup(ROOT, "app").node;

    client.ok(Request::rename(app, "main.conf", archive.node, "main.conf.old"));
    assert_eq!(client.code(Request::lookup(app, "main.conf")), ResultCode::NoEntry);
    let moved = client.lookup(archive.node, "main.conf.old");
    let handle = client.open(moved.node, libc::O_RDONLY);
    assert_eq!(client.read(handle, 0, 64), b"port = 80\n");
    assert_eq!(provider.content("/archive/main.conf.old").unwrap(), b"port = 80\n");

    assert_eq!(client.code(Request::rmdir(ROOT, "archive")), ResultCode::NotEmpty);
    assert_eq!(client.code(Request::rmdir(ROOT, "current")), ResultCode::NotADirectory);
    assert_eq!(client.code(Request::unlink(ROOT, "app")), ResultCode::IsADirectory);
    assert_eq!(client.code(Request::rename(ROOT, "app", app, "nested")), ResultCode::InvalidArgument);
    client.ok(Request::rmdir(ROOT, "app"));

    let ReplyBody::Entry(new_link) = client.call(Request::symlink(ROOT, "prev", "archive/main.conf.old")).body
    else {
        panic!("symlink failed");
    };
    assert_eq!(new_link.size, "archive/main.conf.old".len() as u64);
}

#[test]
fn invalid_names_are_refused_before_the_store() {
    let provider = Arc::new(MemoryProvider::new());
    let mount = mount(provider.clone(), Descriptor::new("/"), EngineConfig::default()).unwrap();
    let client = Client::new(&mount);
    client.init();

    assert_eq!(client.code(Request::mkdir(ROOT, "..", 0o755)), ResultCode::InvalidArgument);
    assert_eq!(client.code(Request::mkdir(ROOT, "a/b", 0o755)), ResultCode::InvalidArgument);
    assert_eq!(client.code(Request::mkdir(ROOT, &"x".repeat(256), 0o755)), ResultCode::NameTooLong);
    assert_eq!(client.code(Request::symlink(ROOT, "l", "")), ResultCode::InvalidArgument);
    assert_eq!(client.code(Request::readdir(ROOT, 0, 0)), ResultCode::InvalidArgument);
    assert_eq!(mount.engine().stats().nodes, 1);
    assert!(provider.layout(&Descriptor::new("/")).unwrap().is_empty());
}
