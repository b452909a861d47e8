// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Request dispatcher
//!
//! Turns decoded protocol requests into engine calls and engine results into
//! replies. Every request is validated here first; malformed input is
//! answered with an error reply and never reaches the node store or the
//! content provider. Errors always become result codes, never panics.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use confgenfs_proto::{
    decode_envelope, encode_reply, validate_name, validate_request, AttrReply, CreatedReply,
    DirEntryReply, EntriesReply, Envelope, InitReply, InitRequest, Reply, ReplyBody, Request,
};
use tracing::{debug, warn};

use crate::engine::{Cancellation, Engine};
use crate::error::{FsError, FsResult};
use crate::session::Negotiation;
use crate::types::{Attributes, HandleId, NodeId, NodeKind, OpenOptions};

#[derive(Default)]
struct InFlight {
    count: usize,
    draining: bool,
}

pub struct Dispatcher {
    engine: Arc<Engine>,
    in_flight: Mutex<InFlight>,
    idle: Condvar,
    interrupts: Mutex<HashMap<u64, Arc<Cancellation>>>,
}

/// Registration of one in-flight request; dropping it retires the request.
struct Ticket<'a> {
    dispatcher: &'a Dispatcher,
    unique: u64,
    cancel: Arc<Cancellation>,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        self.dispatcher.interrupts().remove(&self.unique);
        let mut in_flight = self.dispatcher.in_flight();
        in_flight.count -= 1;
        if in_flight.count == 0 {
            self.dispatcher.idle.notify_all();
        }
    }
}

fn mode_with_type(attrs: &Attributes) -> u32 {
    let type_bits = match attrs.kind {
        NodeKind::Directory => libc::S_IFDIR,
        NodeKind::Symlink => libc::S_IFLNK,
        NodeKind::Generated | NodeKind::Passthrough => libc::S_IFREG,
    };
    type_bits as u32 | (attrs.meta.mode & 0o7777)
}

pub fn attr_reply(attrs: &Attributes) -> AttrReply {
    let times = &attrs.meta.times;
    AttrReply {
        node: attrs.node.0,
        kind: attrs.kind.wire().as_u8(),
        size: attrs.meta.size,
        mode: mode_with_type(attrs),
        nlink: attrs.nlink,
        uid: attrs.meta.uid,
        gid: attrs.meta.gid,
        atime_secs: times.atime.secs,
        atime_nsecs: times.atime.nanos,
        mtime_secs: times.mtime.secs,
        mtime_nsecs: times.mtime.nanos,
        ctime_secs: times.ctime.secs,
        ctime_nsecs: times.ctime.nanos,
    }
}

fn name(bytes: &[u8]) -> FsResult<&str> {
    Ok(validate_name(bytes)?)
}

impl Dispatcher {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            in_flight: Mutex::new(InFlight::default()),
            idle: Condvar::new(),
            interrupts: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    fn in_flight(&self) -> MutexGuard<'_, InFlight> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn interrupts(&self) -> MutexGuard<'_, HashMap<u64, Arc<Cancellation>>> {
        self.interrupts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of requests currently executing.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight().count
    }

    fn admit(&self, unique: u64) -> FsResult<Ticket<'_>> {
        let cancel = Arc::new(Cancellation::default());
        match self.interrupts().entry(unique) {
            Entry::Occupied(_) => {
                return Err(FsError::ProtocolViolation(format!(
                    "request {} is already in flight",
                    unique
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
            }
        }
        {
            let mut in_flight = self.in_flight();
            if in_flight.draining {
                drop(in_flight);
                self.interrupts().remove(&unique);
                return Err(FsError::SessionClosed);
            }
            in_flight.count += 1;
        }
        Ok(Ticket {
            dispatcher: self,
            unique,
            cancel,
        })
    }

    /// Refuse new requests and wait for the ones already admitted.
    pub fn drain(&self) {
        let mut in_flight = self.in_flight();
        in_flight.draining = true;
        while in_flight.count > 0 {
            in_flight = self.idle.wait(in_flight).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Decode a frame, dispatch it and encode the reply. An undecodable
    /// frame is answered with unique 0.
    pub fn dispatch_frame(&self, frame: &[u8]) -> Vec<u8> {
        let reply = match decode_envelope(frame) {
            Ok(envelope) => self.dispatch(envelope),
            Err(err) => {
                warn!(len = frame.len(), error = %err, "undecodable request frame");
                let err = FsError::from(err);
                Reply::error(0, err.code(), err.to_string())
            }
        };
        encode_reply(&reply)
    }

    pub fn dispatch(&self, envelope: Envelope) -> Reply {
        let Envelope {
            unique,
            session,
            request,
        } = envelope;
        let op = request.op_name();
        match self.route(unique, session, request) {
            Ok(body) => {
                debug!(unique, op, "ok");
                Reply::new(unique, body)
            }
            Err(err) => {
                match &err {
                    FsError::ProtocolViolation(_) => warn!(unique, op, error = %err, "protocol violation"),
                    _ => debug!(unique, op, error = %err, "failed"),
                }
                Reply::error(unique, err.code(), err.to_string())
            }
        }
    }

    fn route(&self, unique: u64, session: u64, request: Request) -> FsResult<ReplyBody> {
        let ours = self.engine.session().id();
        if session != ours.0 {
            return Err(FsError::ProtocolViolation(format!(
                "request for session {} on session {}",
                session, ours.0
            )));
        }
        validate_request(&request)?;
        match request {
            Request::Init(init) => self.init(&init),
            Request::Interrupt(req) => {
                if let Some(cancel) = self.interrupts().get(&req.target) {
                    cancel.cancel();
                    debug!(unique, target = req.target, "interrupt");
                }
                Ok(ReplyBody::ok())
            }
            request => {
                let caps = self.engine.session().capabilities()?;
                match &request {
                    Request::Read(req) if req.size > caps.max_read => {
                        return Err(FsError::InvalidArgument)
                    }
                    Request::Write(req) if req.data.len() > caps.max_write as usize => {
                        return Err(FsError::InvalidArgument)
                    }
                    _ => {}
                }
                let ticket = self.admit(unique)?;
                self.execute(request, &ticket.cancel)
            }
        }
    }

    fn init(&self, init: &InitRequest) -> FsResult<ReplyBody> {
        let reply = match self.engine.session().negotiate(init)? {
            Negotiation::Established(caps) => InitReply {
                major: caps.major,
                minor: caps.minor,
                max_readahead: caps.max_readahead,
                max_write: caps.max_write,
                flags: caps.features.bits(),
            },
            Negotiation::Downgrade { major, minor } => InitReply {
                major,
                minor,
                max_readahead: 0,
                max_write: 0,
                flags: 0,
            },
        };
        Ok(ReplyBody::Init(reply))
    }

    fn execute(&self, request: Request, cancel: &Cancellation) -> FsResult<ReplyBody> {
        let engine = &self.engine;
        let body = match request {
            Request::Lookup(req) => {
                ReplyBody::Entry(attr_reply(&engine.lookup(NodeId(req.parent), name(&req.name)?)?))
            }
            Request::GetAttr(req) => ReplyBody::Attr(attr_reply(&engine.getattr(NodeId(req.node))?)),
            Request::ReadDir(req) => {
                let page = engine.readdir(NodeId(req.dir), req.offset, req.max_entries as usize)?;
                ReplyBody::Entries(EntriesReply {
                    entries: page
                        .entries
                        .into_iter()
                        .map(|entry| DirEntryReply {
                            node: entry.node.0,
                            kind: entry.kind.wire().as_u8(),
                            name: entry.name.into_bytes(),
                            next_offset: entry.next_offset,
                        })
                        .collect(),
                    next_offset: page.next_offset,
                })
            }
            Request::Open(req) => {
                let opened = engine.open_cancellable(
                    NodeId(req.node),
                    OpenOptions::from_flags(req.flags),
                    cancel,
                )?;
                ReplyBody::opened(opened.handle.0, opened.direct_io)
            }
            Request::Read(req) => ReplyBody::data(engine.read_cancellable(
                HandleId(req.handle),
                req.offset,
                req.size,
                cancel,
            )?),
            Request::Write(req) => {
                ReplyBody::written(engine.write(HandleId(req.handle), req.offset, &req.data)?)
            }
            Request::Flush(req) => {
                engine.flush(HandleId(req.handle))?;
                ReplyBody::ok()
            }
            Request::Fsync(req) => {
                engine.fsync(HandleId(req.handle))?;
                ReplyBody::ok()
            }
            Request::Release(req) => {
                engine.release(HandleId(req.handle))?;
                ReplyBody::ok()
            }
            Request::Create(req) => {
                let (attrs, opened) = engine.create(
                    NodeId(req.parent),
                    name(&req.name)?,
                    req.mode,
                    OpenOptions::from_flags(req.flags),
                )?;
                ReplyBody::Created(CreatedReply {
                    attr: attr_reply(&attrs),
                    handle: opened.handle.0,
                    direct_io: opened.direct_io,
                })
            }
            Request::Mkdir(req) => ReplyBody::Entry(attr_reply(&engine.mkdir(
                NodeId(req.parent),
                name(&req.name)?,
                req.mode,
            )?)),
            Request::Unlink(req) => {
                engine.unlink(NodeId(req.parent), name(&req.name)?)?;
                ReplyBody::ok()
            }
            Request::Rmdir(req) => {
                engine.rmdir(NodeId(req.parent), name(&req.name)?)?;
                ReplyBody::ok()
            }
            Request::Rename(req) => {
                engine.rename(
                    NodeId(req.parent),
                    name(&req.name)?,
                    NodeId(req.new_parent),
                    name(&req.new_name)?,
                )?;
                ReplyBody::ok()
            }
            Request::Symlink(req) => {
                let target = std::str::from_utf8(&req.target).map_err(|_| FsError::InvalidArgument)?;
                ReplyBody::Entry(attr_reply(&engine.symlink(
                    NodeId(req.parent),
                    name(&req.name)?,
                    target,
                )?))
            }
            Request::ReadLink(req) => ReplyBody::link(engine.readlink(NodeId(req.node))?.into_bytes()),
            Request::Init(_) | Request::Interrupt(_) => {
                return Err(FsError::ProtocolViolation("control request on the data path".into()))
            }
        };
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::provider::{ContentProvider, MemoryProvider};
    use crate::types::{Descriptor, SessionId};
    use confgenfs_proto::{FeatureFlags, ResultCode};

    fn dispatcher() -> Dispatcher {
        let provider = Arc::new(MemoryProvider::new().with_file("/a.conf", "abc"));
        let engine = Engine::new(provider.clone(), Descriptor::new("/"), EngineConfig::default(), SessionId(3));
        engine.seed(provider.layout(&Descriptor::new("/")).unwrap()).unwrap();
        Dispatcher::new(Arc::new(engine))
    }

    fn send(d: &Dispatcher, unique: u64, request: Request) -> Reply {
        d.dispatch(Envelope::new(unique, 3, request))
    }

    #[test]
    fn requests_before_init_are_refused() {
        let d = dispatcher();
        let reply = send(&d, 1, Request::lookup(1, "a.conf"));
        assert_eq!(reply.code(), ResultCode::InvalidArgument);
        let reply = send(&d, 2, Request::init(7, 31, 4096, FeatureFlags::ASYNC_READ.bits()));
        assert!(matches!(reply.body, ReplyBody::Init(InitReply { major: 7, minor: 31, .. })));
        assert_eq!(send(&d, 3, Request::lookup(1, "a.conf")).code(), ResultCode::Success);
    }

    #[test]
    fn a_unique_is_admitted_once_at_a_time() {
        let d = dispatcher();
        let first = d.admit(7).unwrap();
        assert!(matches!(d.admit(7), Err(FsError::ProtocolViolation(_))));
        assert_eq!(d.in_flight_count(), 1);
        drop(first);
        assert_eq!(d.in_flight_count(), 0);
        let again = d.admit(7).unwrap();
        assert!(!again.cancel.is_cancelled());
    }

    #[test]
    fn wrong_session_is_rejected() {
        let d = dispatcher();
        send(&d, 1, Request::init(7, 31, 0, 0));
        let reply = d.dispatch(Envelope::new(2, 99, Request::getattr(1)));
        assert_eq!(reply.code(), ResultCode::InvalidArgument);
        assert_eq!(reply.unique, 2);
    }

    #[test]
    fn oversized_reads_and_negative_offsets_never_reach_the_engine() {
        let d = dispatcher();
        send(&d, 1, Request::init(7, 31, 0, 0));
        let ReplyBody::Entry(attr) = send(&d, 2, Request::lookup(1, "a.conf")).body else {
            panic!("lookup failed");
        };
        let ReplyBody::Opened(open) = send(&d, 3, Request::open(attr.node, libc::O_RDONLY as u32)).body
        else {
            panic!("open failed");
        };
        let too_big = d.engine().session().capabilities().unwrap().max_read + 1;
        assert_eq!(send(&d, 4, Request::read(open.handle, 0, too_big)).code(), ResultCode::InvalidArgument);
        assert_eq!(
            send(&d, 5, Request::read(open.handle, u64::MAX, 1)).code(),
            ResultCode::InvalidArgument
        );
        assert_eq!(d.engine().stats().materializations, 0);
        let reply = send(&d, 6, Request::read(open.handle, 1, 10));
        assert_eq!(reply.body, ReplyBody::data(b"bc".to_vec()));
    }

    #[test]
    fn attributes_carry_file_type_bits() {
        let d = dispatcher();
        send(&d, 1, Request::init(7, 31, 0, 0));
        let ReplyBody::Attr(root) = send(&d, 2, Request::getattr(1)).body else {
            panic!("getattr failed");
        };
        assert_eq!(root.mode & libc::S_IFMT as u32, libc::S_IFDIR as u32);
        assert_eq!(root.nlink, 2);
    }

    #[test]
    fn drained_dispatcher_refuses_work() {
        let d = dispatcher();
        send(&d, 1, Request::init(7, 31, 0, 0));
        d.drain();
        assert_eq!(send(&d, 2, Request::getattr(1)).code(), ResultCode::NotSupported);
        assert_eq!(d.in_flight_count(), 0);
    }
}
