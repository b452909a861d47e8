// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! confgenfs protocol: kernel-facing request/reply vocabulary
//!
//! This crate defines the SSZ request and reply unions exchanged between a
//! kernel driver adapter and the confgenfs engine, the fixed result-code
//! vocabulary, the negotiable feature bits and the narrow extraction of the
//! kernel `INIT` payload.

pub mod codes;
pub mod features;
pub mod init;
pub mod messages;
pub mod validation;

pub use codes::ResultCode;
pub use features::FeatureFlags;
pub use init::{ExtractError, PeerVersion};
pub use messages::{
    AttrReply, CreateRequest, CreatedReply, DataReply, DirEntryReply, EntriesReply, EntryRequest,
    Envelope, ErrorReply, FileKind, GetAttrRequest, HandleRequest, InitReply, InitRequest,
    InterruptRequest, LinkReply, LookupRequest, MkdirRequest, OkReply, OpenReply, OpenRequest,
    ReadDirRequest, ReadRequest, RenameRequest, Reply, ReplyBody, Request, SymlinkRequest,
    WriteRequest, WrittenReply,
};
pub use validation::*;
