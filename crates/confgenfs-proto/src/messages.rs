// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Request and reply types for the kernel-facing protocol

use ssz_derive::{Decode, Encode};

use crate::codes::ResultCode;

// SSZ has no string type; names and targets travel as raw bytes.

/// Every request travels inside an envelope naming the kernel's request id
/// and the session it was issued on.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct Envelope {
    pub unique: u64,
    pub session: u64,
    pub request: Request,
}

/// Request union, one variant per protocol operation.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
#[ssz(enum_behaviour = "union")]
pub enum Request {
    Init(InitRequest),
    Lookup(LookupRequest),
    GetAttr(GetAttrRequest),
    ReadDir(ReadDirRequest),
    Open(OpenRequest),
    Read(ReadRequest),
    Write(WriteRequest),
    Flush(HandleRequest),
    Fsync(HandleRequest),
    Release(HandleRequest),
    Create(CreateRequest),
    Mkdir(MkdirRequest),
    Unlink(EntryRequest),
    Rmdir(EntryRequest),
    Rename(RenameRequest),
    Symlink(SymlinkRequest),
    ReadLink(GetAttrRequest),
    Interrupt(InterruptRequest),
}

/// Reply to one envelope, carrying the same `unique`.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct Reply {
    pub unique: u64,
    pub body: ReplyBody,
}

/// Reply union: operation-specific success payloads or an error.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
#[ssz(enum_behaviour = "union")]
pub enum ReplyBody {
    Init(InitReply),
    Entry(AttrReply),
    Attr(AttrReply),
    Entries(EntriesReply),
    Opened(OpenReply),
    Data(DataReply),
    Written(WrittenReply),
    Created(CreatedReply),
    Link(LinkReply),
    Ok(OkReply),
    Error(ErrorReply),
}

/// Fields the engine consumes from the kernel's INIT payload.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct InitRequest {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u64,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct LookupRequest {
    pub parent: u64,
    pub name: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct GetAttrRequest {
    pub node: u64,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct ReadDirRequest {
    pub dir: u64,
    /// Continuation token from a previous page; 0 starts at the beginning.
    pub offset: u64,
    pub max_entries: u32,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct OpenRequest {
    pub node: u64,
    /// Kernel open flags (`O_*`).
    pub flags: u32,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct ReadRequest {
    pub handle: u64,
    pub offset: u64,
    pub size: u32,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct WriteRequest {
    pub handle: u64,
    pub offset: u64,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct HandleRequest {
    pub handle: u64,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct CreateRequest {
    pub parent: u64,
    pub name: Vec<u8>,
    pub mode: u32,
    pub flags: u32,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct MkdirRequest {
    pub parent: u64,
    pub name: Vec<u8>,
    pub mode: u32,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct EntryRequest {
    pub parent: u64,
    pub name: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct RenameRequest {
    pub parent: u64,
    pub name: Vec<u8>,
    pub new_parent: u64,
    pub new_name: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct SymlinkRequest {
    pub parent: u64,
    pub name: Vec<u8>,
    pub target: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct InterruptRequest {
    /// `unique` of the request being abandoned.
    pub target: u64,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct InitReply {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub max_write: u32,
    pub flags: u64,
}

/// Node attributes. Timestamps are seconds + nanoseconds since the epoch.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct AttrReply {
    pub node: u64,
    pub kind: u8,
    pub size: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime_secs: u64,
    pub atime_nsecs: u32,
    pub mtime_secs: u64,
    pub mtime_nsecs: u32,
    pub ctime_secs: u64,
    pub ctime_nsecs: u32,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct DirEntryReply {
    pub node: u64,
    pub kind: u8,
    pub name: Vec<u8>,
    /// Token resuming the listing right after this entry.
    pub next_offset: u64,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct EntriesReply {
    pub entries: Vec<DirEntryReply>,
    /// `None` once the listing is exhausted.
    pub next_offset: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct OpenReply {
    pub handle: u64,
    pub direct_io: bool,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct DataReply {
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct WrittenReply {
    pub size: u32,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct CreatedReply {
    pub attr: AttrReply,
    pub handle: u64,
    pub direct_io: bool,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct LinkReply {
    pub target: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct OkReply {}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct ErrorReply {
    pub code: u32,
    pub message: Vec<u8>,
}

/// Node type as carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileKind {
    Directory,
    Generated,
    Passthrough,
    Symlink,
}

impl FileKind {
    pub fn as_u8(self) -> u8 {
        match self {
            FileKind::Directory => 0,
            FileKind::Generated => 1,
            FileKind::Passthrough => 2,
            FileKind::Symlink => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(FileKind::Directory),
            1 => Some(FileKind::Generated),
            2 => Some(FileKind::Passthrough),
            3 => Some(FileKind::Symlink),
            _ => None,
        }
    }
}

impl Envelope {
    pub fn new(unique: u64, session: u64, request: Request) -> Self {
        Self {
            unique,
            session,
            request,
        }
    }
}

// Constructors for request union variants
impl Request {
    pub fn init(major: u32, minor: u32, max_readahead: u32, flags: u64) -> Self {
        Self::Init(InitRequest {
            major,
            minor,
            max_readahead,
            flags,
        })
    }

    pub fn lookup(parent: u64, name: &str) -> Self {
        Self::Lookup(LookupRequest {
            parent,
            name: name.as_bytes().to_vec(),
        })
    }

    pub fn getattr(node: u64) -> Self {
        Self::GetAttr(GetAttrRequest { node })
    }

    pub fn readdir(dir: u64, offset: u64, max_entries: u32) -> Self {
        Self::ReadDir(ReadDirRequest {
            dir,
            offset,
            max_entries,
        })
    }

    pub fn open(node: u64, flags: u32) -> Self {
        Self::Open(OpenRequest { node, flags })
    }

    pub fn read(handle: u64, offset: u64, size: u32) -> Self {
        Self::Read(ReadRequest {
            handle,
            offset,
            size,
        })
    }

    pub fn write(handle: u64, offset: u64, data: Vec<u8>) -> Self {
        Self::Write(WriteRequest {
            handle,
            offset,
            data,
        })
    }

    pub fn flush(handle: u64) -> Self {
        Self::Flush(HandleRequest { handle })
    }

    pub fn fsync(handle: u64) -> Self {
        Self::Fsync(HandleRequest { handle })
    }

    pub fn release(handle: u64) -> Self {
        Self::Release(HandleRequest { handle })
    }

    pub fn create(parent: u64, name: &str, mode: u32, flags: u32) -> Self {
        Self::Create(CreateRequest {
            parent,
            name: name.as_bytes().to_vec(),
            mode,
            flags,
        })
    }

    pub fn mkdir(parent: u64, name: &str, mode: u32) -> Self {
        Self::Mkdir(MkdirRequest {
            parent,
            name: name.as_bytes().to_vec(),
            mode,
        })
    }

    pub fn unlink(parent: u64, name: &str) -> Self {
        Self::Unlink(EntryRequest {
            parent,
            name: name.as_bytes().to_vec(),
        })
    }

    pub fn rmdir(parent: u64, name: &str) -> Self {
        Self::Rmdir(EntryRequest {
            parent,
            name: name.as_bytes().to_vec(),
        })
    }

    pub fn rename(parent: u64, name: &str, new_parent: u64, new_name: &str) -> Self {
        Self::Rename(RenameRequest {
            parent,
            name: name.as_bytes().to_vec(),
            new_parent,
            new_name: new_name.as_bytes().to_vec(),
        })
    }

    pub fn symlink(parent: u64, name: &str, target: &str) -> Self {
        Self::Symlink(SymlinkRequest {
            parent,
            name: name.as_bytes().to_vec(),
            target: target.as_bytes().to_vec(),
        })
    }

    pub fn readlink(node: u64) -> Self {
        Self::ReadLink(GetAttrRequest { node })
    }

    pub fn interrupt(target: u64) -> Self {
        Self::Interrupt(InterruptRequest { target })
    }

    /// Short operation name for logs.
    pub fn op_name(&self) -> &'static str {
        match self {
            Request::Init(_) => "init",
            Request::Lookup(_) => "lookup",
            Request::GetAttr(_) => "getattr",
            Request::ReadDir(_) => "readdir",
            Request::Open(_) => "open",
            Request::Read(_) => "read",
            Request::Write(_) => "write",
            Request::Flush(_) => "flush",
            Request::Fsync(_) => "fsync",
            Request::Release(_) => "release",
            Request::Create(_) => "create",
            Request::Mkdir(_) => "mkdir",
            Request::Unlink(_) => "unlink",
            Request::Rmdir(_) => "rmdir",
            Request::Rename(_) => "rename",
            Request::Symlink(_) => "symlink",
            Request::ReadLink(_) => "readlink",
            Request::Interrupt(_) => "interrupt",
        }
    }
}

impl Reply {
    pub fn new(unique: u64, body: ReplyBody) -> Self {
        Self { unique, body }
    }

    pub fn error(unique: u64, code: ResultCode, message: impl Into<String>) -> Self {
        Self::new(unique, ReplyBody::error(code, message))
    }

    /// Result code of this reply; success for every non-error body.
    pub fn code(&self) -> ResultCode {
        match &self.body {
            ReplyBody::Error(err) => ResultCode::from_u32(err.code).unwrap_or(ResultCode::Io),
            _ => ResultCode::Success,
        }
    }
}

impl ReplyBody {
    pub fn ok() -> Self {
        Self::Ok(OkReply {})
    }

    pub fn data(data: Vec<u8>) -> Self {
        Self::Data(DataReply { data })
    }

    pub fn written(size: u32) -> Self {
        Self::Written(WrittenReply { size })
    }

    pub fn opened(handle: u64, direct_io: bool) -> Self {
        Self::Opened(OpenReply { handle, direct_io })
    }

    pub fn link(target: Vec<u8>) -> Self {
        Self::Link(LinkReply { target })
    }

    pub fn error(code: ResultCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorReply {
            code: code.as_u32(),
            message: message.into().into_bytes(),
        })
    }
}

impl DirEntryReply {
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}
