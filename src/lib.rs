//! # Espejo
//!
//! rsync-style synchronization of a local directory tree against a remote
//! path store, in pure safe Rust.
//!
//! A sync run walks the local tree, fetches the sink's block-summary tree,
//! diffs the two, and then transfers only what changed: new files stream up
//! wholesale, changed files stream a delta of "reuse this block" and "here
//! are these literal bytes" records. The sink reconstructs each file in a
//! scratch area and swaps it in atomically, gated on a 512-bit stream hash.
//!
//! ## Features
//!
//! - **Rolling hash**: cyclic-polynomial 32-bit signature, O(1) per byte
//! - **Strong hash**: BLAKE3 block fingerprints and stream hashes
//! - **Streaming delta**: O(`block_size` + max literal) memory per file
//! - **Atomic store**: per-path locking, scratch files, rename swap
//!
//! ## Example
//!
//! ```rust
//! use std::io::Cursor;
//! use espejo::{
//!     generate_delta, summarize_with_block_size, DeltaEvent, FileInfo, FilePatcher,
//!     PatchEncoder,
//! };
//!
//! let sink = b"hello";
//! let info = FileInfo {
//!     name: "greeting".into(), size: 5, mode: 0o644, mtime: 0, is_dir: false,
//! };
//! let sum = summarize_with_block_size(&mut Cursor::new(&sink[..]), info, 4).unwrap();
//!
//! // Source side: emit a patch for the new content.
//! let mut wire = Vec::new();
//! let mut enc = PatchEncoder::new(&mut wire);
//! generate_delta(Cursor::new(&b"hello world"[..]), &sum, |event| match event {
//!     DeltaEvent::Literal(data) => enc.write_literal(data).map(|n| n as u64),
//!     DeltaEvent::BlockRef(i) => enc.write_block_ref(i).map(|n| n as u64),
//! })
//! .unwrap();
//!
//! // Sink side: rebuild the new content from the old file plus the patch.
//! let mut rebuilt = Vec::new();
//! let mut patcher = FilePatcher::new(Cursor::new(&sink[..]), &mut rebuilt, &sum);
//! patcher.apply_from(Cursor::new(&wire)).unwrap();
//! assert_eq!(rebuilt, b"hello world");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

#[cfg(feature = "async")]
pub mod async_engine;
mod client;
mod codec;
mod delta;
mod diff;
mod error;
mod orchestrate;
mod patcher;
mod relpath;
mod rolling;
mod service;
mod store;
mod strong;
mod sum;
mod tree;

pub use client::{Sink, StoreSink, DEFAULT_CREATE_BLOCK_SIZE, MIN_CREATE_BLOCK_SIZE};
pub use codec::{PatchDecoder, PatchEncoder, PatchRecord};
pub use delta::{generate_delta, DeltaEvent, MAX_LITERAL};
pub use diff::{diff_trees, CreateOp, DeleteOp, DirPatchOp, FilePatchOp, TreeDiff};
pub use error::{ErrorCode, EspejoError, Result, SyncFailures};
pub use orchestrate::{sync, CancelToken, SyncParams, SyncReport};
pub use patcher::FilePatcher;
pub use relpath::SyncPath;
pub use service::{CreateStep, FileBlockPatch, PatchStep, ReqMeta, SyncService};
pub use store::{FsStore, Namespace};
pub use strong::{HasherId, StreamHasher, StreamSum, StrongSig};
pub use sum::{
    block_size_for, file_matches_sum, summarize, summarize_with_block_size, BlockSum, FileInfo,
    FileSum, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE,
};
pub use tree::{
    open_source_file, trace_sink, trace_source, DirSum, FsSource, SourceDir, SourceFile,
    SourceOpen, SumDb,
};
pub use rolling::RollingHash;
