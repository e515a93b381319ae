//! Tree summaries: the local source tree and the remote sink tree.
//!
//! Both shapes are strict value-owning trees with children sorted
//! lexicographically by name and sizes rolled up during construction, so the
//! differ can merge-walk them level by level.

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EspejoError, Result};
use crate::relpath::SyncPath;
use crate::sum::{FileInfo, FileSum};

/// One regular file in the local source tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Normalized metadata of the file.
    pub info: FileInfo,
}

/// One directory level of the local source tree.
///
/// `dirs` and `files` are sorted by name; `info.size` is the recursive sum
/// of contained file sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDir {
    /// Metadata of the directory itself (size rolled up from children).
    pub info: FileInfo,
    /// Subdirectories, sorted by name.
    pub dirs: Vec<SourceDir>,
    /// Files, sorted by name.
    pub files: Vec<SourceFile>,
}

impl SourceDir {
    /// Total number of files in this subtree.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len() + self.dirs.iter().map(SourceDir::file_count).sum::<usize>()
    }
}

/// Block-summary tree of the sink, mirrored from [`SourceDir`]'s shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirSum {
    /// Metadata of the directory itself (size rolled up from children).
    pub info: FileInfo,
    /// Subdirectory summaries, sorted by name.
    pub dirs: Vec<DirSum>,
    /// File summaries, sorted by `info.name`.
    pub files: Vec<FileSum>,
}

impl DirSum {
    /// An empty directory summary with the given name.
    #[must_use]
    pub fn empty(name: &str) -> Self {
        Self {
            info: FileInfo {
                name: name.to_string(),
                size: 0,
                mode: 0o755,
                mtime: 0,
                is_dir: true,
            },
            dirs: Vec::new(),
            files: Vec::new(),
        }
    }

    /// Total number of file summaries in this subtree.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len() + self.dirs.iter().map(DirSum::file_count).sum::<usize>()
    }
}

/// Walk a local directory into a sorted, size-annotated summary.
///
/// Only regular files and directories are traversed; symlinks, sockets, and
/// other special entries are skipped. Children come back sorted by name and
/// directory sizes are the recursive sum of contained file sizes.
///
/// # Errors
///
/// Returns an I/O error if the root cannot be statted or any directory
/// cannot be read.
pub fn trace_source(root: &Path) -> Result<SourceDir> {
    let meta = fs::symlink_metadata(root)?;
    if !meta.is_dir() {
        return Err(EspejoError::InvalidArgument(format!(
            "source root is not a directory: {}",
            root.display()
        )));
    }
    let name = root
        .file_name()
        .map_or_else(|| ".".to_string(), |n| n.to_string_lossy().into_owned());
    walk_source(root, &name, &meta)
}

fn walk_source(dir: &Path, name: &str, meta: &fs::Metadata) -> Result<SourceDir> {
    let mut out = SourceDir {
        info: FileInfo::from_metadata(name, meta),
        dirs: Vec::new(),
        files: Vec::new(),
    };

    let mut entries: Vec<fs::DirEntry> = fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(fs::DirEntry::file_name);

    for entry in entries {
        let entry_name = entry.file_name().to_string_lossy().into_owned();
        // symlink_metadata so links are seen as links, not their targets
        let entry_meta = fs::symlink_metadata(entry.path())?;
        if entry_meta.is_dir() {
            let child = walk_source(&entry.path(), &entry_name, &entry_meta)?;
            out.info.size += child.info.size;
            out.dirs.push(child);
        } else if entry_meta.is_file() {
            let info = FileInfo::from_metadata(&entry_name, &entry_meta);
            out.info.size += info.size;
            out.files.push(SourceFile { info });
        }
        // anything else (symlink, fifo, socket, device) is skipped
    }
    Ok(out)
}

/// Open a source file for reading, relative to the tree root.
///
/// # Errors
///
/// Returns `NotFound` if the file vanished since the walk, or an I/O error.
pub fn open_source_file(root: &Path, path: &SyncPath) -> Result<fs::File> {
    let fs_path = path.to_fs_path(root);
    fs::File::open(&fs_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            EspejoError::NotFound {
                path: path.to_string(),
            }
        } else {
            e.into()
        }
    })
}

/// Capability set the sink walker needs from the remote store.
///
/// Listings come back sorted by name, per the store contract.
pub trait SumDb {
    /// Entries of one directory, sorted by name; `NotFound` if missing.
    fn list_dir(&self, path: &SyncPath) -> Result<Vec<FileInfo>>;

    /// Metadata of one entry; `NotFound` if missing.
    fn stat(&self, path: &SyncPath) -> Result<FileInfo>;

    /// Block summary of one file, cached or freshly computed.
    fn get_file_sum(&self, path: &SyncPath) -> Result<FileSum>;
}

/// Build the sink's [`DirSum`] tree by consulting the store.
///
/// # Errors
///
/// Propagates store failures; `NotFound` if the root is missing.
pub fn trace_sink<D: SumDb + ?Sized>(db: &D, root: &SyncPath) -> Result<DirSum> {
    let info = db.stat(root)?;
    walk_sink(db, root, info)
}

fn walk_sink<D: SumDb + ?Sized>(db: &D, path: &SyncPath, info: FileInfo) -> Result<DirSum> {
    let mut out = DirSum {
        info,
        dirs: Vec::new(),
        files: Vec::new(),
    };
    out.info.size = 0;

    for entry in db.list_dir(path)? {
        let child_path = path.join(&entry.name)?;
        if entry.is_dir {
            let child = walk_sink(db, &child_path, entry)?;
            out.info.size += child.info.size;
            out.dirs.push(child);
        } else {
            let file = db.get_file_sum(&child_path)?;
            out.info.size += file.info.size;
            out.files.push(file);
        }
    }
    Ok(out)
}

/// Read-oriented view of the local tree handed to the differ and the
/// orchestrator: resolves paths and opens file content.
pub trait SourceOpen {
    /// Open the file at `path` for sequential reading.
    fn open(&self, path: &SyncPath) -> Result<Box<dyn Read + Send>>;
}

/// Local-filesystem implementation of [`SourceOpen`].
#[derive(Debug, Clone)]
pub struct FsSource {
    root: std::path::PathBuf,
}

impl FsSource {
    /// Root the source at a local directory.
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// The local root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SourceOpen for FsSource {
    fn open(&self, path: &SyncPath) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(open_source_file(&self.root, path)?))
    }
}
