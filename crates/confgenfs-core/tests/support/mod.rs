// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use confgenfs_core::{
    ContentProvider, Descriptor, Dispatcher, LayoutEntry, MemoryProvider, Mount, NodeKind,
    ProviderResult,
};
use confgenfs_proto::{
    decode_reply, encode_envelope, AttrReply, Envelope, FeatureFlags, Reply, ReplyBody, Request,
    ResultCode,
};

/// Talks to a mount through encoded frames, as a kernel adapter would.
pub struct Client<'a> {
    dispatcher: &'a Dispatcher,
    session: u64,
    next_unique: AtomicU64,
}

impl<'a> Client<'a> {
    pub fn new(mount: &'a Mount) -> Self {
        Self {
            dispatcher: mount.dispatcher(),
            session: mount.session_id().0,
            next_unique: AtomicU64::new(1),
        }
    }

    pub fn call(&self, request: Request) -> Reply {
        let unique = self.next_unique.fetch_add(1, Ordering::Relaxed);
        self.call_as(unique, request)
    }

    pub fn call_as(&self, unique: u64, request: Request) -> Reply {
        let frame = encode_envelope(&Envelope::new(unique, self.session, request));
        let reply = decode_reply(&self.dispatcher.dispatch_frame(&frame)).expect("reply decodes");
        assert_eq!(reply.unique, unique);
        reply
    }

    /// Negotiate with the given feature bits.
    pub fn init_with(&self, flags: FeatureFlags) -> Reply {
        self.call(Request::init(7, 31, 128 * 1024, flags.bits()))
    }

    pub fn init(&self) {
        let reply = self.init_with(FeatureFlags::ASYNC_READ | FeatureFlags::AUTO_INVAL_DATA);
        assert!(matches!(reply.body, ReplyBody::Init(_)), "init failed: {:?}", reply);
    }

    pub fn lookup(&self, parent: u64, name: &str) -> AttrReply {
        match self.call(Request::lookup(parent, name)).body {
            ReplyBody::Entry(attr) => attr,
            other => panic!("lookup {} failed: {:?}", name, other),
        }
    }

    pub fn open(&self, node: u64, flags: i32) -> u64 {
        match self.call(Request::open(node, flags as u32)).body {
            ReplyBody::Opened(open) => open.handle,
            other => panic!("open failed: {:?}", other),
        }
    }

    pub fn read(&self, handle: u64, offset: u64, size: u32) -> Vec<u8> {
        match self.call(Request::read(handle, offset, size)).body {
            ReplyBody::Data(data) => data.data,
            other => panic!("read failed: {:?}", other),
        }
    }

    pub fn write(&self, handle: u64, offset: u64, data: &[u8]) {
        match self.call(Request::write(handle, offset, data.to_vec())).body {
            ReplyBody::Written(written) => assert_eq!(written.size as usize, data.len()),
            other => panic!("write failed: {:?}", other),
        }
    }

    pub fn ok(&self, request: Request) {
        let reply = self.call(request);
        assert_eq!(reply.code(), ResultCode::Success, "{:?}", reply);
    }

    pub fn code(&self, request: Request) -> ResultCode {
        self.call(request).code()
    }

    /// Every entry name of a directory, paging `page` entries at a time.
    pub fn list(&self, dir: u64, page: u32) -> Vec<String> {
        let mut names = Vec::new();
        let mut offset = 0;
        loop {
            let ReplyBody::Entries(entries) = self.call(Request::readdir(dir, offset, page)).body
            else {
                panic!("readdir failed");
            };
            names.extend(entries.entries.iter().map(|e| e.name_lossy()));
            match entries.next_offset {
                Some(next) => offset = next,
                None => return names,
            }
        }
    }
}

#[derive(Default)]
struct Gate {
    open: bool,
    waiting: usize,
}

/// Holds every materialization and commit while the gate is closed.
pub struct GatedProvider {
    inner: MemoryProvider,
    gate: Mutex<Gate>,
    changed: Condvar,
}

impl GatedProvider {
    pub fn new(inner: MemoryProvider) -> Self {
        Self {
            inner,
            gate: Mutex::new(Gate::default()),
            changed: Condvar::new(),
        }
    }

    pub fn wait_for_waiters(&self, count: usize) {
        let mut gate = self.gate.lock().unwrap();
        while gate.waiting < count {
            gate = self.changed.wait(gate).unwrap();
        }
    }

    pub fn open_gate(&self) {
        self.gate.lock().unwrap().open = true;
        self.changed.notify_all();
    }

    pub fn close_gate(&self) {
        self.gate.lock().unwrap().open = false;
    }

    pub fn commits(&self) -> Vec<(Descriptor, Vec<u8>)> {
        self.inner.commits()
    }

    fn pass_gate(&self) {
        let mut gate = self.gate.lock().unwrap();
        gate.waiting += 1;
        self.changed.notify_all();
        while !gate.open {
            gate = self.changed.wait(gate).unwrap();
        }
        gate.waiting -= 1;
    }
}

impl ContentProvider for GatedProvider {
    fn materialize(&self, descriptor: &Descriptor) -> ProviderResult<Vec<u8>> {
        self.pass_gate();
        self.inner.materialize(descriptor)
    }

    fn commit(&self, descriptor: &Descriptor, data: &[u8]) -> ProviderResult<()> {
        self.pass_gate();
        self.inner.commit(descriptor, data)
    }

    fn version(&self, descriptor: &Descriptor) -> Option<u64> {
        self.inner.version(descriptor)
    }

    fn layout(&self, root: &Descriptor) -> ProviderResult<Vec<LayoutEntry>> {
        self.inner.layout(root)
    }

    fn on_create(&self, descriptor: &Descriptor, kind: NodeKind) -> ProviderResult<()> {
        self.inner.on_create(descriptor, kind)
    }
}
