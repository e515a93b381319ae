//! The sync exchange: wire message types and the server-side handler.
//!
//! The RPC framing itself lives outside this crate; these are the payloads
//! it carries, plus [`SyncService`] which drives the path store from step
//! streams. A create exchange is `Creating`, zero or more `Writing` blocks,
//! then `Closing` with the announced stream hash; a patch exchange is
//! `Opening`, zero or more `Patching` records, then `Closing`. In both
//! cases the server verifies the hash it computed against the announced one
//! before the atomic swap becomes visible.


use serde::{Deserialize, Serialize};
use tracing::{info, info_span};

use crate::error::{EspejoError, Result};
use crate::patcher::FilePatcher;
use crate::relpath::SyncPath;
use crate::store::FsStore;
use crate::strong::{HasherId, StreamHasher, StreamSum};
use crate::sum::{FileInfo, FileSum};
use crate::tree::{DirSum, SumDb};

/// Identity every request carries: the namespace the paths live in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqMeta {
    /// Public account identifier.
    pub account_id: String,
    /// Public project identifier.
    pub project_id: String,
}

impl ReqMeta {
    /// Resolve the store namespace this request addresses.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for malformed identifiers.
    pub fn namespace(&self) -> Result<crate::store::Namespace> {
        crate::store::Namespace::new(&self.account_id, &self.project_id)
    }
}

/// One step of a create exchange (client → server).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateStep {
    /// Opens the exchange: where the entry goes and how it is hashed.
    Creating {
        /// Directory the entry lands in.
        parent: SyncPath,
        /// Metadata of the new entry.
        info: FileInfo,
        /// Hash algorithm for the stream sum.
        hasher: HasherId,
    },
    /// One content block.
    Writing {
        /// Raw content bytes.
        content_block: Vec<u8>,
    },
    /// Ends the exchange with the client-computed stream hash.
    Closing {
        /// 64-byte stream hash of everything written.
        stream_sum: Vec<u8>,
    },
}

/// One record of a patch stream, in exchange form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileBlockPatch {
    /// Reuse a block of the sink's copy.
    BlockRef(u32),
    /// Verbatim bytes.
    Data(Vec<u8>),
}

/// One step of a patch exchange (client → server).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchStep {
    /// Opens the exchange: which file, its new metadata, and the summary
    /// the delta was generated against.
    Opening {
        /// Directory containing the file.
        parent: SyncPath,
        /// Metadata the file should end up with.
        info: FileInfo,
        /// Hash algorithm for the stream sum.
        hasher: HasherId,
        /// The sink summary the client diffed against.
        sink_sum: FileSum,
    },
    /// One patch record.
    Patching {
        /// Block reference or literal data.
        patch: FileBlockPatch,
    },
    /// Ends the exchange with the client-computed stream hash.
    Closing {
        /// 64-byte stream hash of the reconstructed file.
        stream_sum: Vec<u8>,
    },
}

/// Compare the announced stream hash against the locally computed one.
fn verify_stream_sum(announced: &[u8], computed: &StreamSum) -> Result<()> {
    let announced = StreamSum::from_slice(announced)?;
    if &announced != computed {
        return Err(EspejoError::precondition(format!(
            "content hashes to {computed} but the requester announced {announced}"
        )));
    }
    Ok(())
}

/// Server-side handler: drives a namespace's [`FsStore`] from exchanges.
#[derive(Debug)]
pub struct SyncService {
    db: FsStore,
}

impl SyncService {
    /// Wrap a store.
    #[must_use]
    pub fn new(db: FsStore) -> Self {
        Self { db }
    }

    /// Borrow the underlying store (tests and tooling).
    #[must_use]
    pub fn db(&self) -> &FsStore {
        &self.db
    }

    /// Whole-tree summary of the namespace.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn get_signature(&self) -> Result<DirSum> {
        let _span = info_span!("get_signature").entered();
        self.db.get_signature()
    }

    /// Sorted entries of one directory.
    ///
    /// # Errors
    ///
    /// `NotFound` if the directory is missing.
    pub fn list_dir(&self, path: &SyncPath) -> Result<Vec<FileInfo>> {
        self.db.list_dir(path)
    }

    /// Metadata of one entry.
    ///
    /// # Errors
    ///
    /// `NotFound` if the entry is missing.
    pub fn stat(&self, path: &SyncPath) -> Result<FileInfo> {
        self.db.stat(path)
    }

    /// Block summary of one file.
    ///
    /// # Errors
    ///
    /// `NotFound` if the file is missing.
    pub fn get_file_sum(&self, path: &SyncPath) -> Result<FileSum> {
        self.db.get_file_sum(path)
    }

    /// Run a create exchange to completion.
    ///
    /// Content blocks accumulate into a scratch file while the server keeps
    /// its own stream hash; at `Closing` the announced hash must equal the
    /// computed one or the swap is abandoned with `Precondition`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the steps are malformed or out of order,
    /// `Precondition` on a hash mismatch, plus anything the store returns.
    pub fn create<I>(&self, steps: I) -> Result<()>
    where
        I: IntoIterator<Item = CreateStep>,
    {
        let mut steps = steps.into_iter();
        let Some(CreateStep::Creating {
            parent,
            info,
            hasher,
        }) = steps.next()
        else {
            return Err(EspejoError::InvalidArgument(
                "first step must be `creating`".to_string(),
            ));
        };
        let HasherId::Blake3_64_256 = hasher;

        let _span = info_span!("create", path = %parent, file = %info.name).entered();
        info!(is_dir = info.is_dir, size = info.size, "creating path");

        let path = parent.join(&info.name)?;
        self.db.create(&path, &info, |w| {
            // The server hashes what it writes and gates the swap on the
            // announced sum, independently of the store's own tee.
            // Directory creates never reach this producer; their trailing
            // steps are ignored, matching the client's closing-only stream.
            let mut hasher = StreamHasher::new();
            for step in steps.by_ref() {
                match step {
                    CreateStep::Writing { content_block } => {
                        w.write_all(&content_block)?;
                        hasher.update(&content_block);
                    }
                    CreateStep::Closing { stream_sum } => {
                        return verify_stream_sum(&stream_sum, &hasher.finish());
                    }
                    CreateStep::Creating { .. } => {
                        return Err(EspejoError::InvalidArgument(
                            "duplicate `creating` step".to_string(),
                        ));
                    }
                }
            }
            Err(EspejoError::InvalidArgument(
                "exchange ended without `closing`".to_string(),
            ))
        })?;
        Ok(())
    }

    /// Run a patch exchange to completion.
    ///
    /// The store first verifies the existing file still matches the
    /// announced `sink_sum` (`Precondition` otherwise); the patch records
    /// are then applied through the file patcher, and the swap is gated on
    /// the announced stream hash.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` on malformed step streams, `NotFound` if the file
    /// is missing, `Precondition` on summary or hash divergence,
    /// `InvalidPatch` on out-of-range block references.
    pub fn patch<I>(&self, steps: I) -> Result<()>
    where
        I: IntoIterator<Item = PatchStep>,
    {
        let mut steps = steps.into_iter();
        let Some(PatchStep::Opening {
            parent,
            info,
            hasher,
            sink_sum,
        }) = steps.next()
        else {
            return Err(EspejoError::InvalidArgument(
                "first step must be `opening`".to_string(),
            ));
        };
        let HasherId::Blake3_64_256 = hasher;

        let _span = info_span!("patch", path = %parent, file = %info.name).entered();
        info!(size = info.size, "patching path");

        let path = parent.join(&info.name)?;
        self.db.patch(&path, &info, &sink_sum, |original, w| {
            let mut patcher = FilePatcher::new(original, w, &sink_sum);
            for step in steps.by_ref() {
                match step {
                    PatchStep::Patching { patch } => match patch {
                        FileBlockPatch::BlockRef(index) => {
                            patcher.apply_block_ref(index)?;
                        }
                        FileBlockPatch::Data(data) => {
                            patcher.apply_literal(&mut data.as_slice())?;
                        }
                    },
                    PatchStep::Closing { stream_sum } => {
                        return verify_stream_sum(&stream_sum, &patcher.finish());
                    }
                    PatchStep::Opening { .. } => {
                        return Err(EspejoError::InvalidArgument(
                            "duplicate `opening` step".to_string(),
                        ));
                    }
                }
            }
            Err(EspejoError::InvalidArgument(
                "exchange ended without `closing`".to_string(),
            ))
        })?;
        Ok(())
    }

    /// Update a directory's metadata.
    ///
    /// # Errors
    ///
    /// `NotFound` if the directory is missing.
    pub fn patch_dir(&self, path: &SyncPath, info: &FileInfo) -> Result<()> {
        self.db.patch_dir_meta(path, info)
    }

    /// Delete a batch of paths. Failures are collected so one missing path
    /// does not abandon the rest of the batch.
    ///
    /// # Errors
    ///
    /// Returns a composite error naming every path that failed.
    pub fn delete_paths(&self, paths: &[SyncPath]) -> Result<()> {
        let _span = info_span!("deletes", count = paths.len()).entered();
        let mut failures = Vec::new();
        for path in paths {
            if let Err(err) = self.db.delete(path) {
                failures.push((path.to_string(), err));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(EspejoError::Sync(crate::error::SyncFailures { failures }))
        }
    }
}
