//! Tree differ: merge-walks the source and sink summaries into operation
//! sets.
//!
//! Both inputs keep their children sorted by name, so each level is a single
//! merge pass. A subtree missing from the sink expands up-front into creates
//! for every descendant (directory first, then its files, then its
//! subdirectories) so the orchestrator can stream whole directories in bulk.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::relpath::SyncPath;
use crate::sum::{file_matches_sum, FileInfo, FileSum};
use crate::tree::{DirSum, SourceDir, SourceFile, SourceOpen};

/// Create a file or directory that the sink does not hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOp {
    /// Directory the entry lands in.
    pub parent: SyncPath,
    /// Metadata of the new entry (`is_dir` distinguishes the two kinds).
    pub info: FileInfo,
}

impl CreateOp {
    /// Full path of the created entry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the entry name is not a valid path
    /// component.
    pub fn path(&self) -> Result<SyncPath> {
        self.parent.join(&self.info.name)
    }
}

/// Re-content an existing sink file through the delta pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatchOp {
    /// Path of the file on both sides.
    pub path: SyncPath,
    /// Metadata the file should end up with.
    pub info: FileInfo,
    /// The sink's current block summary the delta is generated against.
    pub sink_sum: FileSum,
}

/// Bring an existing sink directory's metadata up to date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirPatchOp {
    /// Path of the directory.
    pub path: SyncPath,
    /// Metadata the directory should end up with.
    pub info: FileInfo,
}

/// Remove a sink entry (recursively, for directories).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOp {
    /// Path of the entry to remove.
    pub path: SyncPath,
}

/// The three operation sets a sync run executes.
#[derive(Debug, Default)]
pub struct TreeDiff {
    /// New entries, in streaming order (parents before children, files
    /// before subdirectories within each created directory).
    pub creates: Vec<CreateOp>,
    /// Files whose content or metadata diverged.
    pub file_patches: Vec<FilePatchOp>,
    /// Directories whose metadata diverged.
    pub dir_patches: Vec<DirPatchOp>,
    /// Entries only the sink holds.
    pub deletes: Vec<DeleteOp>,
}

impl TreeDiff {
    /// Whether the trees already agree.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty()
            && self.file_patches.is_empty()
            && self.dir_patches.is_empty()
            && self.deletes.is_empty()
    }

    /// Total number of operations.
    #[must_use]
    pub fn op_count(&self) -> usize {
        self.creates.len()
            + self.file_patches.len()
            + self.dir_patches.len()
            + self.deletes.len()
    }
}

enum SrcEntry<'a> {
    Dir(&'a SourceDir),
    File(&'a SourceFile),
}

enum SinkEntry<'a> {
    Dir(&'a DirSum),
    File(&'a FileSum),
}

/// Diff the source tree against the sink summary.
///
/// Files whose normalized [`FileInfo`] already matches are re-verified
/// against the sink's block summary through `source`; a content mismatch
/// still emits a patch. The roots themselves are compared only through
/// their children.
///
/// # Errors
///
/// Returns an I/O error if re-verification cannot read a source file.
pub fn diff_trees<S: SourceOpen + ?Sized>(
    source: &SourceDir,
    sink: &DirSum,
    opener: &S,
) -> Result<TreeDiff> {
    let mut diff = TreeDiff::default();
    diff_level(source, sink, &SyncPath::root(), opener, &mut diff)?;
    Ok(diff)
}

fn diff_level<S: SourceOpen + ?Sized>(
    source: &SourceDir,
    sink: &DirSum,
    path: &SyncPath,
    opener: &S,
    diff: &mut TreeDiff,
) -> Result<()> {
    let mut src_entries: BTreeMap<&str, SrcEntry<'_>> = BTreeMap::new();
    for dir in &source.dirs {
        src_entries.insert(dir.info.name.as_str(), SrcEntry::Dir(dir));
    }
    for file in &source.files {
        src_entries.insert(file.info.name.as_str(), SrcEntry::File(file));
    }

    let mut sink_entries: BTreeMap<&str, SinkEntry<'_>> = BTreeMap::new();
    for dir in &sink.dirs {
        sink_entries.insert(dir.info.name.as_str(), SinkEntry::Dir(dir));
    }
    for file in &sink.files {
        sink_entries.insert(file.info.name.as_str(), SinkEntry::File(file));
    }

    let mut names: Vec<&str> = src_entries.keys().copied().collect();
    for name in sink_entries.keys() {
        if !src_entries.contains_key(name) {
            names.push(name);
        }
    }
    names.sort_unstable();

    for name in names {
        let child_path = path.join(name)?;
        match (src_entries.get(name), sink_entries.get(name)) {
            (Some(SrcEntry::Dir(src_dir)), None) => {
                emit_subtree_creates(src_dir, path, diff)?;
            }
            (Some(SrcEntry::File(src_file)), None) => {
                diff.creates.push(CreateOp {
                    parent: path.clone(),
                    info: src_file.info.clone(),
                });
            }
            (None, Some(_)) => {
                diff.deletes.push(DeleteOp { path: child_path });
            }
            (Some(SrcEntry::Dir(src_dir)), Some(SinkEntry::Dir(sink_dir))) => {
                if dir_info_changed(&src_dir.info, &sink_dir.info) {
                    diff.dir_patches.push(DirPatchOp {
                        path: child_path.clone(),
                        info: src_dir.info.clone(),
                    });
                }
                diff_level(src_dir, sink_dir, &child_path, opener, diff)?;
            }
            (Some(SrcEntry::File(src_file)), Some(SinkEntry::File(sink_file))) => {
                diff_file(src_file, sink_file, &child_path, opener, diff)?;
            }
            // Kind changed under the same name: replace wholesale.
            (Some(SrcEntry::Dir(src_dir)), Some(SinkEntry::File(_))) => {
                diff.deletes.push(DeleteOp {
                    path: child_path.clone(),
                });
                emit_subtree_creates(src_dir, path, diff)?;
            }
            (Some(SrcEntry::File(src_file)), Some(SinkEntry::Dir(_))) => {
                diff.deletes.push(DeleteOp { path: child_path });
                diff.creates.push(CreateOp {
                    parent: path.clone(),
                    info: src_file.info.clone(),
                });
            }
            (None, None) => unreachable!("name came from one of the maps"),
        }
    }
    Ok(())
}

fn diff_file<S: SourceOpen + ?Sized>(
    src_file: &SourceFile,
    sink_file: &FileSum,
    path: &SyncPath,
    opener: &S,
    diff: &mut TreeDiff,
) -> Result<()> {
    if src_file.info.normalized() != sink_file.info.normalized() {
        diff.file_patches.push(FilePatchOp {
            path: path.clone(),
            info: src_file.info.clone(),
            sink_sum: sink_file.clone(),
        });
        return Ok(());
    }
    // Metadata agrees; make sure the bytes do too.
    let mut reader = opener.open(path)?;
    if !file_matches_sum(&mut reader, sink_file)? {
        diff.file_patches.push(FilePatchOp {
            path: path.clone(),
            info: src_file.info.clone(),
            sink_sum: sink_file.clone(),
        });
    }
    Ok(())
}

fn dir_info_changed(src: &FileInfo, sink: &FileInfo) -> bool {
    let a = src.normalized();
    let b = sink.normalized();
    a.mode != b.mode || a.mtime != b.mtime
}

/// Creates for a whole missing subtree: the directory, then its files, then
/// its subdirectories, depth-first.
fn emit_subtree_creates(dir: &SourceDir, parent: &SyncPath, diff: &mut TreeDiff) -> Result<()> {
    diff.creates.push(CreateOp {
        parent: parent.clone(),
        info: dir.info.clone(),
    });
    let dir_path = parent.join(&dir.info.name)?;
    for file in &dir.files {
        diff.creates.push(CreateOp {
            parent: dir_path.clone(),
            info: file.info.clone(),
        });
    }
    for sub in &dir.dirs {
        emit_subtree_creates(sub, &dir_path, diff)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sum::summarize_with_block_size;
    use std::collections::HashMap;
    use std::io::{Cursor, Read};

    /// In-memory source tree for differ tests.
    struct MapSource {
        files: HashMap<String, Vec<u8>>,
    }

    impl MapSource {
        fn new(files: &[(&str, &[u8])]) -> Self {
            Self {
                files: files
                    .iter()
                    .map(|(p, c)| ((*p).to_string(), c.to_vec()))
                    .collect(),
            }
        }
    }

    impl SourceOpen for MapSource {
        fn open(&self, path: &SyncPath) -> Result<Box<dyn Read + Send>> {
            let content = self.files.get(&path.to_string()).ok_or_else(|| {
                crate::error::EspejoError::NotFound {
                    path: path.to_string(),
                }
            })?;
            Ok(Box::new(Cursor::new(content.clone())))
        }
    }

    fn file_info(name: &str, size: u64, mtime: i64) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            size,
            mode: 0o644,
            mtime,
            is_dir: false,
        }
    }

    fn dir_info(name: &str, mtime: i64) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            size: 0,
            mode: 0o755,
            mtime,
            is_dir: true,
        }
    }

    fn src_file(name: &str, content: &[u8], mtime: i64) -> SourceFile {
        SourceFile {
            info: file_info(name, content.len() as u64, mtime),
        }
    }

    fn sink_file(name: &str, content: &[u8], mtime: i64) -> FileSum {
        summarize_with_block_size(
            &mut Cursor::new(content),
            file_info(name, content.len() as u64, mtime),
            crate::sum::block_size_for(content.len() as u64),
        )
        .unwrap()
    }

    fn src_dir(name: &str, dirs: Vec<SourceDir>, files: Vec<SourceFile>) -> SourceDir {
        let size = files.iter().map(|f| f.info.size).sum::<u64>()
            + dirs.iter().map(|d| d.info.size).sum::<u64>();
        let mut info = dir_info(name, 100);
        info.size = size;
        SourceDir { info, dirs, files }
    }

    fn sink_dir(name: &str, dirs: Vec<DirSum>, files: Vec<FileSum>) -> DirSum {
        let size = files.iter().map(|f| f.info.size).sum::<u64>()
            + dirs.iter().map(|d| d.info.size).sum::<u64>();
        let mut info = dir_info(name, 100);
        info.size = size;
        DirSum { info, dirs, files }
    }

    fn no_source() -> MapSource {
        MapSource::new(&[])
    }

    // ==========================================================================
    // CREATES
    // ==========================================================================

    #[test]
    fn everything_created_against_empty_sink() {
        // root/{en/world, hello/{fr/le_monde, le_monde, world}, world}
        let source = src_dir(
            "root",
            vec![
                src_dir("en", vec![], vec![src_file("world", b"hello world", 1)]),
                src_dir(
                    "hello",
                    vec![src_dir(
                        "fr",
                        vec![],
                        vec![src_file("le_monde", b"hello le monde", 1)],
                    )],
                    vec![
                        src_file("le_monde", b"hello le monde", 1),
                        src_file("world", b"hello world", 1),
                    ],
                ),
            ],
            vec![src_file("world", b"hello world", 1)],
        );
        let sink = DirSum::empty("");

        let diff = diff_trees(&source, &sink, &no_source()).unwrap();
        assert!(diff.file_patches.is_empty());
        assert!(diff.deletes.is_empty());

        let created: Vec<(String, bool)> = diff
            .creates
            .iter()
            .map(|op| (op.path().unwrap().to_string(), op.info.is_dir))
            .collect();
        // Each level: directory first, then its files, then its subdirs.
        assert_eq!(
            created,
            vec![
                ("en".to_string(), true),
                ("en/world".to_string(), false),
                ("hello".to_string(), true),
                ("hello/le_monde".to_string(), false),
                ("hello/world".to_string(), false),
                ("hello/fr".to_string(), true),
                ("hello/fr/le_monde".to_string(), false),
                ("world".to_string(), false),
            ]
        );
    }

    #[test]
    fn created_files_are_covered_exactly_once() {
        let source = src_dir(
            "root",
            vec![src_dir(
                "a",
                vec![src_dir("b", vec![], vec![src_file("f", b"x", 1)])],
                vec![src_file("g", b"y", 1)],
            )],
            vec![],
        );
        let diff = diff_trees(&source, &DirSum::empty(""), &no_source()).unwrap();

        let mut paths: Vec<String> = diff
            .creates
            .iter()
            .map(|op| op.path().unwrap().to_string())
            .collect();
        let total = paths.len();
        paths.dedup();
        assert_eq!(paths.len(), total);
        assert_eq!(total, 4); // a, a/g, a/b, a/b/f
    }

    #[test]
    fn new_file_in_existing_dir() {
        let source = src_dir("root", vec![], vec![src_file("new", b"data", 1)]);
        let sink = sink_dir("", vec![], vec![]);
        let diff = diff_trees(&source, &sink, &no_source()).unwrap();
        assert_eq!(diff.creates.len(), 1);
        assert_eq!(diff.creates[0].parent, SyncPath::root());
        assert_eq!(diff.creates[0].info.name, "new");
    }

    // ==========================================================================
    // PATCHES
    // ==========================================================================

    #[test]
    fn changed_metadata_emits_patch() {
        let source = src_dir("root", vec![], vec![src_file("f", b"same", 2)]);
        let sink = sink_dir("", vec![], vec![sink_file("f", b"same", 1)]);

        let diff = diff_trees(&source, &sink, &no_source()).unwrap();
        assert!(diff.creates.is_empty());
        assert!(diff.deletes.is_empty());
        assert_eq!(diff.file_patches.len(), 1);
        assert_eq!(diff.file_patches[0].path.to_string(), "f");
        assert_eq!(diff.file_patches[0].info.mtime, 2);
    }

    #[test]
    fn equal_metadata_equal_content_emits_nothing() {
        let source = src_dir("root", vec![], vec![src_file("f", b"same", 1)]);
        let sink = sink_dir("", vec![], vec![sink_file("f", b"same", 1)]);
        let opener = MapSource::new(&[("f", b"same")]);

        let diff = diff_trees(&source, &sink, &opener).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn equal_metadata_changed_content_emits_patch() {
        // Same size and mtime, different bytes: only the content check
        // catches it.
        let source = src_dir("root", vec![], vec![src_file("f", b"aaaa", 1)]);
        let sink = sink_dir("", vec![], vec![sink_file("f", b"bbbb", 1)]);
        let opener = MapSource::new(&[("f", b"aaaa")]);

        let diff = diff_trees(&source, &sink, &opener).unwrap();
        assert_eq!(diff.file_patches.len(), 1);
    }

    #[test]
    fn changed_dir_metadata_emits_dir_patch() {
        let mut src_sub = src_dir("sub", vec![], vec![]);
        src_sub.info.mode = 0o700;
        let source = src_dir("root", vec![src_sub], vec![]);
        let sink = sink_dir("", vec![sink_dir("sub", vec![], vec![])], vec![]);

        let diff = diff_trees(&source, &sink, &no_source()).unwrap();
        assert_eq!(diff.dir_patches.len(), 1);
        assert_eq!(diff.dir_patches[0].path.to_string(), "sub");
        assert_eq!(diff.dir_patches[0].info.mode, 0o700);
    }

    // ==========================================================================
    // DELETES
    // ==========================================================================

    #[test]
    fn sink_only_entries_are_deleted() {
        let source = src_dir("root", vec![], vec![]);
        let sink = sink_dir(
            "",
            vec![sink_dir("old_dir", vec![], vec![])],
            vec![sink_file("old_file", b"x", 1)],
        );

        let diff = diff_trees(&source, &sink, &no_source()).unwrap();
        let mut deleted: Vec<String> =
            diff.deletes.iter().map(|op| op.path.to_string()).collect();
        deleted.sort();
        assert_eq!(deleted, ["old_dir", "old_file"]);
    }

    #[test]
    fn kind_change_is_delete_plus_create() {
        // "x" is a file in the source but a directory on the sink.
        let source = src_dir("root", vec![], vec![src_file("x", b"now a file", 1)]);
        let sink = sink_dir("", vec![sink_dir("x", vec![], vec![])], vec![]);

        let diff = diff_trees(&source, &sink, &no_source()).unwrap();
        assert_eq!(diff.deletes.len(), 1);
        assert_eq!(diff.deletes[0].path.to_string(), "x");
        assert_eq!(diff.creates.len(), 1);
        assert!(!diff.creates[0].info.is_dir);
    }

    // ==========================================================================
    // MIXED
    // ==========================================================================

    #[test]
    fn mixed_tree_produces_all_three_sets() {
        let source = src_dir(
            "root",
            vec![src_dir("newdir", vec![], vec![src_file("a", b"a", 1)])],
            vec![src_file("kept", b"new content", 2)],
        );
        let sink = sink_dir(
            "",
            vec![],
            vec![
                sink_file("gone", b"bye", 1),
                sink_file("kept", b"old content", 1),
            ],
        );

        let diff = diff_trees(&source, &sink, &no_source()).unwrap();
        assert_eq!(diff.creates.len(), 2); // newdir, newdir/a
        assert_eq!(diff.file_patches.len(), 1); // kept
        assert_eq!(diff.deletes.len(), 1); // gone
        assert_eq!(diff.op_count(), 4);
    }
}
