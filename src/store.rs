//! Atomic path store: the sink-side persistence for synced trees.
//!
//! Each `(account, project)` namespace owns an isolated subtree plus a
//! scratch area. Mutations write into a scratch file and become visible only
//! through the final rename; a crash mid-write leaves the canonical path
//! untouched and at worst an orphan scratch file, which is swept on startup.
//! Per-path locks serialize overlapping mutations without blocking: a
//! concurrent attempt fails fast with `Busy` and may be retried.

use std::collections::HashSet;
use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::error::{EspejoError, Result};
use crate::relpath::SyncPath;
use crate::strong::{StreamHasher, StreamSum};
use crate::sum::{
    block_size_for, file_matches_sum, summarize_with_block_size, FileInfo, FileSum,
};
use crate::tree::{trace_sink, DirSum, SumDb};

/// Isolation namespace of a path store: one account, one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    account_id: String,
    project_id: String,
}

impl Namespace {
    /// Validate and build a namespace.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if either name is empty or contains
    /// characters outside `[a-zA-Z0-9-+_]`.
    pub fn new(account_id: &str, project_id: &str) -> Result<Self> {
        validate_name("account", account_id)?;
        validate_name("project", project_id)?;
        Ok(Self {
            account_id: account_id.to_string(),
            project_id: project_id.to_string(),
        })
    }

    /// Account identifier.
    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Project identifier.
    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }
}

fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '+' | '_'))
    {
        return Err(EspejoError::InvalidArgument(format!(
            "invalid {kind} name: {name:?}"
        )));
    }
    Ok(())
}

/// Non-blocking per-path lock table.
///
/// The set of locked canonical paths is the only shared mutable state in the
/// store; one mutex guards insert and remove.
#[derive(Debug, Default, Clone)]
struct PathLockTable {
    locked: Arc<Mutex<HashSet<String>>>,
}

impl PathLockTable {
    fn acquire(&self, path: &SyncPath) -> Result<PathLockGuard> {
        let key = path.to_string();
        let mut locked = self.locked.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if !locked.insert(key.clone()) {
            return Err(EspejoError::Busy { path: key });
        }
        Ok(PathLockGuard {
            locked: Arc::clone(&self.locked),
            key,
        })
    }
}

struct PathLockGuard {
    locked: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for PathLockGuard {
    fn drop(&mut self) {
        let mut locked = self
            .locked
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        locked.remove(&self.key);
    }
}

/// Scratch file that self-destructs unless committed.
struct ScratchFile {
    path: PathBuf,
    file: Option<fs::File>,
}

impl ScratchFile {
    fn create(path: PathBuf) -> Result<Self> {
        let file = fs::File::create(&path)?;
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    fn file(&mut self) -> &mut fs::File {
        self.file.as_mut().expect("scratch file already committed")
    }

    /// Make the content visible at `dest`. The rename is the only step that
    /// publishes the new bytes.
    fn commit(mut self, dest: &Path) -> Result<()> {
        let file = self.file.take().expect("scratch file already committed");
        file.sync_all()?;
        drop(file);
        fs::rename(&self.path, dest)?;
        Ok(())
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            if let Err(err) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), %err, "failed to discard scratch file");
            }
        }
    }
}

/// Writer that tees everything into the stream hasher.
struct TeeWriter<'a, W: Write> {
    inner: W,
    hasher: &'a mut StreamHasher,
}

impl<W: Write> Write for TeeWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Filesystem-backed atomic path store for one namespace.
pub struct FsStore {
    tree_root: PathBuf,
    scratch_root: PathBuf,
    locks: PathLockTable,
    scratch_seq: AtomicU64,
}

impl std::fmt::Debug for FsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsStore")
            .field("tree_root", &self.tree_root)
            .finish_non_exhaustive()
    }
}

impl FsStore {
    /// Open (creating if needed) the store for one namespace under `base`.
    ///
    /// Orphan scratch files from earlier crashes are swept here.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directories cannot be created or swept.
    pub fn open(base: &Path, namespace: &Namespace) -> Result<Self> {
        let ns_root = base
            .join(namespace.account_id())
            .join(namespace.project_id());
        let tree_root = ns_root.join("tree");
        let scratch_root = ns_root.join("scratch");
        fs::create_dir_all(&tree_root)?;
        fs::create_dir_all(&scratch_root)?;

        let store = Self {
            tree_root,
            scratch_root,
            locks: PathLockTable::default(),
            scratch_seq: AtomicU64::new(0),
        };
        store.sweep_scratch()?;
        Ok(store)
    }

    /// Root of the canonical tree (exposed for tests and tooling).
    #[must_use]
    pub fn tree_root(&self) -> &Path {
        &self.tree_root
    }

    fn sweep_scratch(&self) -> Result<()> {
        for entry in fs::read_dir(&self.scratch_root)? {
            let entry = entry?;
            debug!(path = %entry.path().display(), "sweeping orphan scratch file");
            fs::remove_file(entry.path())?;
        }
        Ok(())
    }

    fn scratch_path_for(&self, path: &SyncPath) -> PathBuf {
        let seq = self.scratch_seq.fetch_add(1, Ordering::Relaxed);
        self.scratch_root
            .join(format!("{}-{seq}.tmp", path.scratch_token()))
    }

    /// Create a file or directory.
    ///
    /// Directories are created idempotently and hash as empty content. For
    /// files, `producer` writes the content into a scratch file that is
    /// atomically renamed into place afterwards. Returns the 512-bit stream
    /// hash of the produced content.
    ///
    /// # Errors
    ///
    /// `Busy` if the path is being mutated concurrently, `InvalidArgument`
    /// for the root path as a file, I/O errors otherwise. A failing
    /// `producer` leaves the canonical path unchanged.
    pub fn create<F>(&self, path: &SyncPath, info: &FileInfo, producer: F) -> Result<StreamSum>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        let _guard = self.locks.acquire(path)?;
        debug!(path = %path, is_dir = info.is_dir, "create");

        if info.is_dir {
            let dir = path.to_fs_path(&self.tree_root);
            fs::create_dir_all(&dir)?;
            apply_entry_meta(&dir, info)?;
            return Ok(StreamHasher::new().finish());
        }

        if path.is_root() {
            return Err(EspejoError::InvalidArgument(
                "cannot create a file at the tree root".to_string(),
            ));
        }

        let dest = path.to_fs_path(&self.tree_root);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut scratch = ScratchFile::create(self.scratch_path_for(path))?;
        let mut hasher = StreamHasher::new();
        {
            let mut tee = TeeWriter {
                inner: scratch.file(),
                hasher: &mut hasher,
            };
            producer(&mut tee)?;
            tee.flush()?;
        }
        scratch.commit(&dest)?;
        apply_entry_meta(&dest, info)?;
        Ok(hasher.finish())
    }

    /// Patch an existing file through a transformer.
    ///
    /// The current content is first summarized with `expected_sum`'s block
    /// size and compared against it; divergence fails with `Precondition`
    /// before any write happens. Otherwise `transformer` gets the original
    /// (rewound) and a scratch writer, and the result is renamed into place.
    /// Returns the stream hash of the new content.
    ///
    /// # Errors
    ///
    /// `Busy` on lock contention, `NotFound` if the file is missing,
    /// `Precondition` if the summary diverged, I/O errors otherwise.
    pub fn patch<F>(
        &self,
        path: &SyncPath,
        info: &FileInfo,
        expected_sum: &FileSum,
        transformer: F,
    ) -> Result<StreamSum>
    where
        F: FnOnce(&mut fs::File, &mut dyn Write) -> Result<()>,
    {
        if expected_sum.block_size < crate::sum::MIN_BLOCK_SIZE {
            return Err(EspejoError::InvalidArgument(format!(
                "block size {} below the minimum of {}",
                expected_sum.block_size,
                crate::sum::MIN_BLOCK_SIZE
            )));
        }

        let _guard = self.locks.acquire(path)?;
        debug!(path = %path, "patch");

        let dest = path.to_fs_path(&self.tree_root);
        let mut original = open_existing(&dest, path)?;

        if !file_matches_sum(&mut original, expected_sum)? {
            return Err(EspejoError::precondition(format!(
                "sink file {path} no longer matches the announced summary"
            )));
        }
        original.seek(SeekFrom::Start(0))?;

        let mut scratch = ScratchFile::create(self.scratch_path_for(path))?;
        let mut hasher = StreamHasher::new();
        {
            let mut tee = TeeWriter {
                inner: scratch.file(),
                hasher: &mut hasher,
            };
            transformer(&mut original, &mut tee)?;
            tee.flush()?;
        }
        drop(original);
        scratch.commit(&dest)?;
        apply_entry_meta(&dest, info)?;
        Ok(hasher.finish())
    }

    /// Update a directory's metadata without touching its content.
    ///
    /// # Errors
    ///
    /// `Busy` on lock contention, `NotFound` if the directory is missing.
    pub fn patch_dir_meta(&self, path: &SyncPath, info: &FileInfo) -> Result<()> {
        let _guard = self.locks.acquire(path)?;
        let dest = path.to_fs_path(&self.tree_root);
        if !dest.is_dir() {
            return Err(EspejoError::NotFound {
                path: path.to_string(),
            });
        }
        apply_entry_meta(&dest, info)
    }

    /// Remove a file or a whole directory subtree.
    ///
    /// # Errors
    ///
    /// `Busy` on lock contention, `NotFound` if the path does not exist.
    pub fn delete(&self, path: &SyncPath) -> Result<()> {
        let _guard = self.locks.acquire(path)?;
        debug!(path = %path, "delete");

        let dest = path.to_fs_path(&self.tree_root);
        let meta = fs::symlink_metadata(&dest).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EspejoError::NotFound {
                    path: path.to_string(),
                }
            } else {
                EspejoError::Io(e)
            }
        })?;
        if meta.is_dir() {
            fs::remove_dir_all(&dest)?;
        } else {
            fs::remove_file(&dest)?;
        }
        Ok(())
    }

    /// Summary of the whole namespace tree.
    ///
    /// # Errors
    ///
    /// Propagates walk failures.
    pub fn get_signature(&self) -> Result<DirSum> {
        trace_sink(self, &SyncPath::root())
    }
}

fn open_existing(dest: &Path, path: &SyncPath) -> Result<fs::File> {
    fs::File::open(dest).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            EspejoError::NotFound {
                path: path.to_string(),
            }
        } else {
            e.into()
        }
    })
}

/// Persist mode and mtime onto the stored entry so listings round-trip the
/// metadata the client announced.
fn apply_entry_meta(dest: &Path, info: &FileInfo) -> Result<()> {
    let mtime = if info.mtime >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(info.mtime.unsigned_abs())
    } else {
        SystemTime::UNIX_EPOCH
    };
    let handle = fs::File::open(dest)?;
    handle.set_modified(mtime)?;
    drop(handle);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dest, fs::Permissions::from_mode(info.mode & 0o7777))?;
    }
    Ok(())
}

impl SumDb for FsStore {
    fn list_dir(&self, path: &SyncPath) -> Result<Vec<FileInfo>> {
        let dir = path.to_fs_path(&self.tree_root);
        if !dir.is_dir() {
            return Err(EspejoError::NotFound {
                path: path.to_string(),
            });
        }
        let mut entries: Vec<fs::DirEntry> =
            fs::read_dir(&dir)?.collect::<std::io::Result<_>>()?;
        entries.sort_by_key(fs::DirEntry::file_name);

        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = fs::symlink_metadata(entry.path())?;
            out.push(FileInfo::from_metadata(&name, &meta));
        }
        Ok(out)
    }

    fn stat(&self, path: &SyncPath) -> Result<FileInfo> {
        let dest = path.to_fs_path(&self.tree_root);
        let meta = fs::symlink_metadata(&dest).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EspejoError::NotFound {
                    path: path.to_string(),
                }
            } else {
                EspejoError::Io(e)
            }
        })?;
        let name = path.name().unwrap_or("");
        Ok(FileInfo::from_metadata(name, &meta))
    }

    fn get_file_sum(&self, path: &SyncPath) -> Result<FileSum> {
        let dest = path.to_fs_path(&self.tree_root);
        let mut file = open_existing(&dest, path)?;
        let info = self.stat(path)?;
        let block_size = block_size_for(info.size);
        summarize_with_block_size(&mut file, info, block_size)
    }
}
