// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! confgenfs FUSE adapter
//!
//! Maps kernel callbacks onto dispatcher requests. Inode numbers are node
//! ids, so the root is `FUSE_ROOT_ID`. Content operations go through the
//! request pool since providers may block.

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
compile_error!("This module requires the 'fuse' feature on Linux");

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};

use confgenfs_core::{Dispatcher, InvalidationSink, Mount, NodeId};
use confgenfs_proto::{
    AttrReply, CreateRequest, EntryRequest, Envelope, FeatureFlags, FileKind, GetAttrRequest,
    HandleRequest, LookupRequest, MkdirRequest, OpenRequest, ReadDirRequest, ReadRequest,
    RenameRequest, ReplyBody, Request as WireRequest, ResultCode, SymlinkRequest, WriteRequest,
};
use fuser::{
    FileAttr, FileType, KernelConfig, Notifier, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
};
use libc::c_int;
use tracing::{debug, error, info, warn};

use crate::pool::{PoolQueue, RequestPool};
use crate::HostOptions;

/// Kernel protocol major; fuser settles the version pair before `init`.
const KERNEL_MAJOR: u32 = 7;

const READDIR_PAGE: u32 = 128;
const DEFAULT_MAX_BACKGROUND: u16 = 64;
const BLOCK_SIZE: u32 = 512;

struct WriteTrace {
    req_id: u64,
    ino: u64,
    fh: u64,
    offset: i64,
    size: usize,
    start: Instant,
    inflight: Arc<AtomicU64>,
    max_inflight: Arc<AtomicU64>,
}

impl WriteTrace {
    fn finish(self) {
        let remaining = self.inflight.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        debug!(
            target: "confgenfs::write",
            event = "finish",
            req_id = self.req_id,
            ino = self.ino,
            fh = self.fh,
            offset = self.offset,
            size = self.size,
            duration_ms = self.start.elapsed().as_secs_f64() * 1000.0,
            inflight = remaining,
            max_inflight = self.max_inflight.load(Ordering::SeqCst)
        );
    }
}

/// Holds the session notifier once the mount is live.
#[derive(Clone, Default)]
pub struct NotifierSlot(Arc<OnceLock<Notifier>>);

impl NotifierSlot {
    pub fn install(&self, notifier: Notifier) {
        if self.0.set(notifier).is_err() {
            warn!("kernel notifier already installed");
        }
    }
}

/// Forwards engine invalidations to the kernel from a pool worker, never
/// from the callback that caused them.
struct KernelNotices {
    slot: NotifierSlot,
    queue: Arc<PoolQueue>,
}

impl InvalidationSink for KernelNotices {
    fn invalidate_content(&self, node: NodeId) {
        let slot = self.slot.clone();
        self.queue.submit(Box::new(move || {
            if let Some(notifier) = slot.0.get() {
                if let Err(err) = notifier.inval_inode(node.0, 0, 0) {
                    debug!(node = node.0, error = %err, "inode invalidation not delivered");
                }
            }
        }));
    }

    fn invalidate_entry(&self, parent: NodeId, name: &str) {
        let slot = self.slot.clone();
        let name = name.to_string();
        self.queue.submit(Box::new(move || {
            if let Some(notifier) = slot.0.get() {
                // ENOENT only means the kernel had nothing cached.
                if let Err(err) = notifier.inval_entry(parent.0, OsStr::new(&name)) {
                    debug!(parent = parent.0, name = %name, error = %err, "entry invalidation not delivered");
                }
            }
        }));
    }
}

/// confgenfs FUSE filesystem adapter
pub struct ConfgenFuse {
    /// Taken at `destroy` to unmount
    mount: Option<Mount>,
    dispatcher: Arc<Dispatcher>,
    session: u64,
    attr_ttl: Duration,
    entry_ttl: Duration,
    options: HostOptions,
    /// Whether the kernel caches writes (negotiated at init)
    writeback: bool,
    notifier: NotifierSlot,
    inflight_writes: Arc<AtomicU64>,
    max_write_depth: Arc<AtomicU64>,
    pool: RequestPool,
}

impl ConfgenFuse {
    pub fn new(mount: Mount, options: HostOptions) -> Self {
        let dispatcher = mount.dispatcher().clone();
        let cache = dispatcher.engine().config().cache.clone();
        let pool = RequestPool::new(options.workers);
        let notifier = NotifierSlot::default();
        dispatcher.engine().set_invalidation_sink(Arc::new(KernelNotices {
            slot: notifier.clone(),
            queue: pool.queue(),
        }));
        Self {
            session: mount.session_id().0,
            mount: Some(mount),
            dispatcher,
            attr_ttl: Duration::from_millis(cache.attr_ttl_ms),
            entry_ttl: Duration::from_millis(cache.entry_ttl_ms),
            options,
            writeback: false,
            notifier,
            inflight_writes: Arc::new(AtomicU64::new(0)),
            max_write_depth: Arc::new(AtomicU64::new(0)),
            pool,
        }
    }

    pub fn notifier_slot(&self) -> NotifierSlot {
        self.notifier.clone()
    }

    fn envelope(&self, req: &Request<'_>, request: WireRequest) -> Envelope {
        Envelope::new(req.unique(), self.session, request)
    }

    fn call(&self, req: &Request<'_>, request: WireRequest) -> Result<ReplyBody, c_int> {
        dispatch_to(&self.dispatcher, self.envelope(req, request))
    }

    /// Run `request` on the pool and hand its outcome to `reply`.
    fn offload<F>(&self, req: &Request<'_>, request: WireRequest, reply: F)
    where
        F: FnOnce(Result<ReplyBody, c_int>) + Send + 'static,
    {
        let envelope = self.envelope(req, request);
        let dispatcher = Arc::clone(&self.dispatcher);
        self.pool.submit(move || reply(dispatch_to(&dispatcher, envelope)));
    }

    fn reply_entry(&self, result: Result<ReplyBody, c_int>, reply: ReplyEntry) {
        match result {
            Ok(ReplyBody::Entry(attr)) => reply.entry(&self.entry_ttl, &file_attr(&attr), 0),
            Ok(other) => unexpected(reply_kind(&other), |errno| reply.error(errno)),
            Err(errno) => reply.error(errno),
        }
    }

    fn start_write_trace(
        &self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: usize,
    ) -> Option<WriteTrace> {
        if !self.options.trace_writes {
            return None;
        }
        let current = self.inflight_writes.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_write_depth.fetch_max(current, Ordering::SeqCst);
        debug!(
            target: "confgenfs::write",
            event = "start",
            req_id = req.unique(),
            ino,
            fh,
            offset,
            size,
            inflight = current
        );
        Some(WriteTrace {
            req_id: req.unique(),
            ino,
            fh,
            offset,
            size,
            start: Instant::now(),
            inflight: Arc::clone(&self.inflight_writes),
            max_inflight: Arc::clone(&self.max_write_depth),
        })
    }
}

fn dispatch_to(dispatcher: &Dispatcher, envelope: Envelope) -> Result<ReplyBody, c_int> {
    match dispatcher.dispatch(envelope).body {
        ReplyBody::Error(err) => Err(errno_of(err.code)),
        body => Ok(body),
    }
}

/// Log close-time errors the kernel can no longer be told about.
fn report_close_errors(dispatcher: &Dispatcher) -> usize {
    let errors = dispatcher.engine().drain_close_errors();
    for err in &errors {
        warn!(handle = err.handle.0, node = err.node.0, error = %err.error, "close-time error");
    }
    errors.len()
}

fn errno_of(code: u32) -> c_int {
    ResultCode::from_u32(code).map(ResultCode::errno).unwrap_or(libc::EIO)
}

fn reply_kind(body: &ReplyBody) -> &'static str {
    match body {
        ReplyBody::Init(_) => "init",
        ReplyBody::Entry(_) => "entry",
        ReplyBody::Attr(_) => "attr",
        ReplyBody::Entries(_) => "entries",
        ReplyBody::Opened(_) => "opened",
        ReplyBody::Data(_) => "data",
        ReplyBody::Written(_) => "written",
        ReplyBody::Created(_) => "created",
        ReplyBody::Link(_) => "link",
        ReplyBody::Ok(_) => "ok",
        ReplyBody::Error(_) => "error",
    }
}

fn unexpected(kind: &str, fail: impl FnOnce(c_int)) {
    error!(reply = kind, "dispatcher returned a mismatched reply");
    fail(libc::EIO);
}

fn timestamp(secs: u64, nanos: u32) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::new(secs, nanos)
}

fn file_type(kind: u8) -> FileType {
    match FileKind::from_u8(kind) {
        Some(FileKind::Directory) => FileType::Directory,
        Some(FileKind::Symlink) => FileType::Symlink,
        _ => FileType::RegularFile,
    }
}

fn file_attr(attr: &AttrReply) -> FileAttr {
    let mtime = timestamp(attr.mtime_secs, attr.mtime_nsecs);
    FileAttr {
        ino: attr.node,
        size: attr.size,
        blocks: (attr.size + 511) / 512,
        atime: timestamp(attr.atime_secs, attr.atime_nsecs),
        mtime,
        ctime: timestamp(attr.ctime_secs, attr.ctime_nsecs),
        crtime: mtime,
        kind: file_type(attr.kind),
        perm: (attr.mode & 0o7777) as u16,
        nlink: attr.nlink.max(1),
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

/// Open flags as the engine should see them. Under writeback caching the
/// kernel reads pages back from write-only files and positions appends
/// itself.
fn engine_open_flags(flags: i32, writeback: bool) -> u32 {
    let mut flags = flags;
    if writeback {
        if flags & libc::O_ACCMODE == libc::O_WRONLY {
            flags = (flags & !libc::O_ACCMODE) | libc::O_RDWR;
        }
        flags &= !libc::O_APPEND;
    }
    flags as u32
}

fn open_reply_flags(direct_io: bool) -> u32 {
    if direct_io {
        fuser::consts::FOPEN_DIRECT_IO
    } else {
        0
    }
}

fn configure_max_write(config: &mut KernelConfig, desired: u32) -> (u32, bool) {
    match config.set_max_write(desired) {
        Ok(_) => (desired, false),
        Err(limit) => {
            let _ = config.set_max_write(limit);
            (limit, true)
        }
    }
}

fn configure_max_readahead(config: &mut KernelConfig, desired: u32) -> (u32, bool) {
    match config.set_max_readahead(desired) {
        Ok(_) => (desired, false),
        Err(limit) => {
            let _ = config.set_max_readahead(limit);
            (limit, true)
        }
    }
}

fn configure_max_background(config: &mut KernelConfig) -> (u16, bool) {
    match config.set_max_background(DEFAULT_MAX_BACKGROUND) {
        Ok(_) => (DEFAULT_MAX_BACKGROUND, false),
        Err(limit) => {
            let _ = config.set_max_background(limit);
            (limit, true)
        }
    }
}

fn desired_congestion_threshold(max_background: u16) -> u16 {
    ((3 * u32::from(max_background)) / 4).max(1) as u16
}

fn configure_congestion_threshold(config: &mut KernelConfig, max_background: u16) -> (u16, bool) {
    let desired = desired_congestion_threshold(max_background);
    match config.set_congestion_threshold(desired) {
        Ok(_) => (desired, false),
        Err(limit) => {
            let _ = config.set_congestion_threshold(limit);
            (limit, true)
        }
    }
}

impl fuser::Filesystem for ConfgenFuse {
    fn init(&mut self, req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        let engine_config = self.dispatcher.engine().config().clone();
        let wanted = engine_config.protocol.wanted_features().map_err(|err| {
            error!(error = %err, "invalid feature list");
            libc::EINVAL
        })?;

        // The kernel refuses capabilities it lacks; offer them one at a time.
        let mut offered = FeatureFlags::empty();
        for flag in wanted.iter() {
            match config.add_capabilities(flag.bits() as _) {
                Ok(()) => offered |= flag,
                Err(_) => debug!(feature = ?flag.names(), "kernel lacks capability"),
            }
        }

        let (max_readahead, clamped) =
            configure_max_readahead(config, engine_config.protocol.max_readahead);
        if clamped {
            warn!(max_readahead, desired = engine_config.protocol.max_readahead, "kernel limited max_readahead");
        }
        let (max_write, clamped) = configure_max_write(config, engine_config.limits.max_write_bytes);
        if clamped {
            warn!(max_write, desired = engine_config.limits.max_write_bytes, "kernel limited max_write");
        }
        let (max_background, clamped) = configure_max_background(config);
        if clamped {
            warn!(max_background, desired = DEFAULT_MAX_BACKGROUND, "kernel limited max_background");
        }
        let (congestion, clamped) = configure_congestion_threshold(config, max_background);
        if clamped {
            warn!(congestion, max_background, "kernel limited congestion_threshold");
        }

        let request = WireRequest::init(
            KERNEL_MAJOR,
            engine_config.protocol.minor,
            max_readahead,
            offered.bits(),
        );
        match self.call(req, request) {
            Ok(ReplyBody::Init(init)) => {
                let features = FeatureFlags::from_peer(init.flags);
                self.writeback = features.contains(FeatureFlags::WRITEBACK_CACHE);
                info!(
                    major = init.major,
                    minor = init.minor,
                    max_write = init.max_write,
                    max_readahead = init.max_readahead,
                    features = ?features.names(),
                    workers = self.pool.worker_count(),
                    trace_writes = self.options.trace_writes,
                    "confgenfs FUSE adapter initialized"
                );
                Ok(())
            }
            Ok(other) => {
                error!(reply = reply_kind(&other), "negotiation returned a mismatched reply");
                Err(libc::EPROTO)
            }
            Err(errno) => {
                error!(errno, "negotiation refused");
                Err(errno)
            }
        }
    }

    fn destroy(&mut self) {
        let Some(mount) = self.mount.take() else {
            return;
        };
        let report = mount.unmount();
        for err in &report.close_errors {
            warn!(error = %err, "close-time error at unmount");
        }
        info!(
            flushed_handles = report.flushed_handles,
            commits = report.stats.commits,
            materializations = report.stats.materializations,
            "confgenfs FUSE adapter destroyed"
        );
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let request = WireRequest::Lookup(LookupRequest {
            parent,
            name: name.as_bytes().to_vec(),
        });
        let result = self.call(req, request);
        self.reply_entry(result, reply);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.call(req, WireRequest::GetAttr(GetAttrRequest { node: ino })) {
            Ok(ReplyBody::Attr(attr)) => reply.attr(&self.attr_ttl, &file_attr(&attr)),
            Ok(other) => unexpected(reply_kind(&other), |errno| reply.error(errno)),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.call(req, WireRequest::ReadLink(GetAttrRequest { node: ino })) {
            Ok(ReplyBody::Link(link)) => reply.data(&link.target),
            Ok(other) => unexpected(reply_kind(&other), |errno| reply.error(errno)),
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let request = WireRequest::Mkdir(MkdirRequest {
            parent,
            name: name.as_bytes().to_vec(),
            mode: mode & !umask & 0o7777,
        });
        let result = self.call(req, request);
        self.reply_entry(result, reply);
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let request = WireRequest::Unlink(EntryRequest {
            parent,
            name: name.as_bytes().to_vec(),
        });
        match self.call(req, request) {
            Ok(_) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let request = WireRequest::Rmdir(EntryRequest {
            parent,
            name: name.as_bytes().to_vec(),
        });
        match self.call(req, request) {
            Ok(_) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let request = WireRequest::Symlink(SymlinkRequest {
            parent,
            name: link_name.as_bytes().to_vec(),
            target: target.as_os_str().as_bytes().to_vec(),
        });
        let result = self.call(req, request);
        self.reply_entry(result, reply);
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        // RENAME_NOREPLACE and RENAME_EXCHANGE are not offered; callers fall back.
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let request = WireRequest::Rename(RenameRequest {
            parent,
            name: name.as_bytes().to_vec(),
            new_parent: newparent,
            new_name: newname.as_bytes().to_vec(),
        });
        match self.call(req, request) {
            Ok(_) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let request = WireRequest::Open(OpenRequest {
            node: ino,
            flags: engine_open_flags(flags, self.writeback),
        });
        // Read-ahead opens materialize eagerly, so they may block too.
        self.offload(req, request, move |result| match result {
            Ok(ReplyBody::Opened(open)) => {
                reply.opened(open.handle, open_reply_flags(open.direct_io))
            }
            Ok(other) => unexpected(reply_kind(&other), |errno| reply.error(errno)),
            Err(errno) => reply.error(errno),
        });
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let request = WireRequest::Read(ReadRequest {
            handle: fh,
            offset: offset as u64,
            size,
        });
        self.offload(req, request, move |result| match result {
            Ok(ReplyBody::Data(data)) => reply.data(&data.data),
            Ok(other) => unexpected(reply_kind(&other), |errno| reply.error(errno)),
            Err(errno) => reply.error(errno),
        });
    }

    fn write(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let trace = self.start_write_trace(req, ino, fh, offset, data.len());
        let request = WireRequest::Write(WriteRequest {
            handle: fh,
            offset: offset as u64,
            data: data.to_vec(),
        });
        self.offload(req, request, move |result| {
            match result {
                Ok(ReplyBody::Written(written)) => reply.written(written.size),
                Ok(other) => unexpected(reply_kind(&other), |errno| reply.error(errno)),
                Err(errno) => reply.error(errno),
            }
            if let Some(trace) = trace {
                trace.finish();
            }
        });
    }

    fn flush(&mut self, req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        self.offload(req, WireRequest::Flush(HandleRequest { handle: fh }), move |result| {
            match result {
                Ok(_) => reply.ok(),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn fsync(&mut self, req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        self.offload(req, WireRequest::Fsync(HandleRequest { handle: fh }), move |result| {
            match result {
                Ok(_) => reply.ok(),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn release(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let dispatcher = Arc::clone(&self.dispatcher);
        self.offload(req, WireRequest::Release(HandleRequest { handle: fh }), move |result| {
            match result {
                Ok(_) => reply.ok(),
                Err(errno) => reply.error(errno),
            }
            report_close_errors(&dispatcher);
        });
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let mut cursor = offset.max(0) as u64;
        loop {
            let request = WireRequest::ReadDir(ReadDirRequest {
                dir: ino,
                offset: cursor,
                max_entries: READDIR_PAGE,
            });
            let page = match self.call(req, request) {
                Ok(ReplyBody::Entries(page)) => page,
                Ok(other) => return unexpected(reply_kind(&other), |errno| reply.error(errno)),
                Err(errno) => return reply.error(errno),
            };
            for entry in &page.entries {
                let full = reply.add(
                    entry.node,
                    entry.next_offset as i64,
                    file_type(entry.kind),
                    OsStr::from_bytes(&entry.name),
                );
                if full {
                    return reply.ok();
                }
            }
            match page.next_offset {
                Some(next) => cursor = next,
                None => break,
            }
        }
        reply.ok();
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let request = WireRequest::Create(CreateRequest {
            parent,
            name: name.as_bytes().to_vec(),
            mode: mode & !umask & 0o7777,
            flags: engine_open_flags(flags, self.writeback),
        });
        match self.call(req, request) {
            Ok(ReplyBody::Created(created)) => reply.created(
                &self.entry_ttl,
                &file_attr(&created.attr),
                0,
                created.handle,
                open_reply_flags(created.direct_io),
            ),
            Ok(other) => unexpected(reply_kind(&other), |errno| reply.error(errno)),
            Err(errno) => reply.error(errno),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stats = self.dispatcher.engine().stats();
        let max_handles = u64::from(self.dispatcher.engine().config().limits.max_open_handles);
        reply.statfs(
            0,
            0,
            0,
            stats.nodes,
            max_handles.saturating_sub(stats.open_handles),
            BLOCK_SIZE,
            255,
            BLOCK_SIZE,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confgenfs_core::{mount, Descriptor, EngineConfig, MemoryProvider, OpenOptions};

    fn adapter(config: EngineConfig) -> ConfgenFuse {
        let provider = Arc::new(MemoryProvider::new().with_file("/a.conf", "x = 1\n"));
        let mount = mount(provider, Descriptor::new("/"), config).unwrap();
        ConfgenFuse::new(
            mount,
            HostOptions {
                writeback_cache: false,
                workers: 2,
                trace_writes: false,
            },
        )
    }

    #[test]
    fn release_reports_close_errors_once() {
        let provider = Arc::new(MemoryProvider::new().with_file("/a.conf", "x"));
        let mount = mount(provider, Descriptor::new("/"), EngineConfig::default()).unwrap();
        let dispatcher = mount.dispatcher().clone();
        let session = mount.session_id().0;
        let reply = dispatcher.dispatch(Envelope::new(1, session, WireRequest::init(7, 31, 4096, 0)));
        assert!(matches!(reply.body, ReplyBody::Init(_)));

        let engine = dispatcher.engine();
        let node = engine.lookup_path("a.conf").unwrap();
        let opened = engine.open(node, OpenOptions::read_write()).unwrap();
        engine.write(opened.handle, 0, b"y").unwrap();
        engine.unlink(NodeId::ROOT, "a.conf").unwrap();
        engine.release(opened.handle).unwrap();

        assert_eq!(report_close_errors(&dispatcher), 1);
        assert_eq!(report_close_errors(&dispatcher), 0);
        assert_eq!(engine.stats().close_errors, 1);
    }

    #[test]
    fn cache_ttls_follow_config() {
        let mut config = EngineConfig::default();
        config.cache.attr_ttl_ms = 1500;
        config.cache.entry_ttl_ms = 2500;
        let fuse = adapter(config);
        assert_eq!(fuse.attr_ttl, Duration::from_millis(1500));
        assert_eq!(fuse.entry_ttl, Duration::from_millis(2500));
        assert_eq!(fuse.pool.worker_count(), 2);
    }

    #[test]
    fn attributes_convert_to_fuse() {
        let attr = AttrReply {
            node: 7,
            kind: FileKind::Generated.as_u8(),
            size: 1025,
            mode: libc::S_IFREG as u32 | 0o640,
            nlink: 1,
            uid: 10,
            gid: 20,
            atime_secs: 1,
            atime_nsecs: 2,
            mtime_secs: 3,
            mtime_nsecs: 4,
            ctime_secs: 5,
            ctime_nsecs: 6,
        };
        let converted = file_attr(&attr);
        assert_eq!(converted.ino, 7);
        assert_eq!(converted.kind, FileType::RegularFile);
        assert_eq!(converted.perm, 0o640);
        assert_eq!(converted.blocks, 3);
        assert_eq!(converted.mtime, timestamp(3, 4));
        assert_eq!(file_type(FileKind::Symlink.as_u8()), FileType::Symlink);
        assert_eq!(file_type(FileKind::Directory.as_u8()), FileType::Directory);
    }

    #[test]
    fn writeback_widens_write_only_opens() {
        let flags = engine_open_flags(libc::O_WRONLY | libc::O_APPEND, true) as i32;
        assert_eq!(flags & libc::O_ACCMODE, libc::O_RDWR);
        assert_eq!(flags & libc::O_APPEND, 0);

        let untouched = engine_open_flags(libc::O_WRONLY | libc::O_APPEND, false) as i32;
        assert_eq!(untouched, libc::O_WRONLY | libc::O_APPEND);
    }

    #[test]
    fn result_codes_map_to_errno() {
        assert_eq!(errno_of(ResultCode::StaleHandle.as_u32()), libc::ESTALE);
        assert_eq!(errno_of(9999), libc::EIO);
        assert_eq!(open_reply_flags(false), 0);
        assert_ne!(open_reply_flags(true), 0);
    }

    #[test]
    fn congestion_threshold_is_three_quarters() {
        assert_eq!(desired_congestion_threshold(64), 48);
        assert_eq!(desired_congestion_threshold(1), 1);
    }
}
