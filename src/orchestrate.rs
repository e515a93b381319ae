//! Sync orchestrator: drives the differ's operation sets against a sink.
//!
//! Directory creates run first so every file operation finds its parent in
//! place; file creates and patches then fan out over a worker pool of
//! exactly `max_parallel_file_streams` workers; deletes go out as one
//! terminal batch; finally directory metadata is settled for every
//! directory the content phases touched (renames and removals bump parent
//! mtimes, so fixing them last keeps re-syncs quiet). Per-file failures are
//! collected; successful files stay applied.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, info_span, warn};

use crate::client::Sink;
use crate::diff::{diff_trees, CreateOp, FilePatchOp};
use crate::error::{EspejoError, Result, SyncFailures};
use crate::relpath::SyncPath;
use crate::sum::FileInfo;
use crate::tree::{trace_source, FsSource, SourceDir, SourceOpen};

/// Tuning for one sync run.
#[derive(Debug, Clone)]
pub struct SyncParams {
    /// Upper bound on files being uploaded or patched at any given time.
    pub max_parallel_file_streams: usize,
}

impl Default for SyncParams {
    fn default() -> Self {
        Self {
            max_parallel_file_streams: 8,
        }
    }
}

/// Cooperative cancellation signal shared with all workers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// A token that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation; workers stop at their next suspension point.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(EspejoError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// What a completed sync run did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    /// Directories created on the sink.
    pub dirs_created: u64,
    /// Files created on the sink.
    pub files_created: u64,
    /// Files re-contented through the delta pipeline.
    pub files_patched: u64,
    /// Entries deleted from the sink.
    pub deleted: u64,
}

impl SyncReport {
    /// Whether the run had nothing to do.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.dirs_created == 0
            && self.files_created == 0
            && self.files_patched == 0
            && self.deleted == 0
    }
}

enum FileOp {
    Create(CreateOp),
    Patch(FilePatchOp),
}

impl FileOp {
    fn path(&self) -> Result<SyncPath> {
        match self {
            Self::Create(op) => op.path(),
            Self::Patch(op) => Ok(op.path.clone()),
        }
    }
}

/// Synchronize a local tree against a sink.
///
/// Returns the run's report when every operation succeeded. Per-file
/// failures do not stop the run: the composite error lists them while
/// everything that succeeded stays applied. Cancellation stops dispatching
/// and surfaces as [`EspejoError::Cancelled`].
///
/// # Errors
///
/// `Cancelled` on cancellation; `Sync` with the collected per-file
/// failures; setup errors (walking the source, fetching the sink summary)
/// directly.
pub fn sync(
    source_root: &Path,
    sink: &dyn Sink,
    params: &SyncParams,
    cancel: &CancelToken,
) -> Result<SyncReport> {
    let span = info_span!("sync", root = %source_root.display()).entered();

    cancel.check()?;
    let source_tree = trace_source(source_root)?;
    let opener = FsSource::new(source_root);

    cancel.check()?;
    let sink_tree = sink.get_signatures()?;

    let diff = diff_trees(&source_tree, &sink_tree, &opener)?;
    info!(
        creates = diff.creates.len(),
        patches = diff.file_patches.len(),
        deletes = diff.deletes.len(),
        "tree diff computed"
    );
    if diff.is_empty() {
        return Ok(SyncReport::default());
    }

    let mut report = SyncReport::default();
    let mut failures: Vec<(String, EspejoError)> = Vec::new();

    // An entry whose kind changed is both deleted and re-created; its delete
    // must land before the create phases or the create collides with the
    // old entry. Everything else deletes in the terminal batch.
    let create_paths: std::collections::HashSet<String> = diff
        .creates
        .iter()
        .filter_map(|op| op.path().ok())
        .map(|p| p.to_string())
        .collect();
    let (pre_deletes, deletes): (Vec<_>, Vec<_>) = diff
        .deletes
        .into_iter()
        .partition(|op| create_paths.contains(&op.path.to_string()));
    if !pre_deletes.is_empty() {
        cancel.check()?;
        let paths: Vec<SyncPath> = pre_deletes.iter().map(|op| op.path.clone()).collect();
        match sink.delete_paths(&paths) {
            Ok(()) => report.deleted += paths.len() as u64,
            Err(err) => {
                warn!(%err, "replaced-entry delete failed");
                failures.push(("<deletes>".to_string(), err));
            }
        }
    }

    // Phase 1: directories, in emission order (parents come first), so the
    // parallel file phase never races its parent's creation.
    let (dir_creates, file_creates): (Vec<_>, Vec<_>) =
        diff.creates.into_iter().partition(|op| op.info.is_dir);
    for op in &dir_creates {
        cancel.check()?;
        match sink.create(&op.parent, &op.info, &mut std::io::empty()) {
            Ok(()) => report.dirs_created += 1,
            Err(err) => {
                let path = op.path().map_or_else(|_| op.info.name.clone(), |p| p.to_string());
                warn!(%path, %err, "directory create failed");
                failures.push((path, err));
            }
        }
    }

    // Phase 2: file creates and patches on the bounded worker pool.
    let mut file_ops: Vec<FileOp> = Vec::with_capacity(file_creates.len() + diff.file_patches.len());
    file_ops.extend(file_creates.into_iter().map(FileOp::Create));
    file_ops.extend(diff.file_patches.into_iter().map(FileOp::Patch));

    let mut all_deletes: Vec<crate::diff::DeleteOp> = pre_deletes;
    all_deletes.extend(deletes.iter().cloned());
    let touched_dirs = touched_parents(&file_ops, &all_deletes, &dir_creates);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(params.max_parallel_file_streams.max(1))
        .build()
        .map_err(|e| EspejoError::InvalidArgument(format!("worker pool: {e}")))?;

    let outcomes: Vec<(String, Result<bool>)> = pool.install(|| {
        use rayon::prelude::*;
        file_ops
            .par_iter()
            .map(|op| {
                let path = match op.path() {
                    Ok(p) => p.to_string(),
                    Err(e) => return (String::new(), Err(e)),
                };
                (path, run_file_op(op, &opener, sink, cancel))
            })
            .collect()
    });
    for (path, outcome) in outcomes {
        match outcome {
            Ok(true) => report.files_created += 1,
            Ok(false) => report.files_patched += 1,
            Err(err) => {
                warn!(%path, %err, "file operation failed");
                failures.push((path, err));
            }
        }
    }

    // Phase 3: one terminal delete batch.
    if !deletes.is_empty() && !cancel.is_cancelled() {
        let paths: Vec<SyncPath> = deletes.iter().map(|op| op.path.clone()).collect();
        match sink.delete_paths(&paths) {
            Ok(()) => report.deleted += paths.len() as u64,
            Err(err) => {
                warn!(%err, "delete batch failed");
                failures.push(("<deletes>".to_string(), err));
            }
        }
    }

    // Phase 4: settle directory metadata last; the phases above bump parent
    // mtimes as a side effect of renames and removals.
    if !cancel.is_cancelled() {
        let mut dir_meta: Vec<(SyncPath, FileInfo)> = diff
            .dir_patches
            .iter()
            .map(|op| (op.path.clone(), op.info.clone()))
            .collect();
        for path in touched_dirs {
            if let Some(info) = lookup_dir_info(&source_tree, &path) {
                dir_meta.push((path, info));
            }
        }
        dir_meta.sort_by(|a, b| a.0.cmp(&b.0));
        dir_meta.dedup_by(|a, b| a.0 == b.0);
        for (path, info) in dir_meta {
            if path.is_root() {
                continue;
            }
            if let Err(err) = sink.patch_dir(&path, &info) {
                warn!(path = %path, %err, "directory metadata patch failed");
                failures.push((path.to_string(), err));
            }
        }
    }

    drop(span);

    if cancel.is_cancelled() {
        return Err(EspejoError::Cancelled);
    }
    if failures.is_empty() {
        Ok(report)
    } else {
        Err(EspejoError::Sync(SyncFailures { failures }))
    }
}

/// Execute one file operation; `Ok(true)` for a create, `Ok(false)` for a
/// patch.
fn run_file_op(
    op: &FileOp,
    opener: &FsSource,
    sink: &dyn Sink,
    cancel: &CancelToken,
) -> Result<bool> {
    cancel.check()?;
    match op {
        FileOp::Create(create) => {
            let path = create.path()?;
            let mut content = opener.open(&path)?;
            sink.create(&create.parent, &create.info, &mut content)?;
            Ok(true)
        }
        FileOp::Patch(patch) => {
            let mut content = opener.open(&patch.path)?;
            sink.patch_file(patch, &mut content)?;
            Ok(false)
        }
    }
}

/// Directories whose mtime the content phases disturb: parents of every
/// file op and delete, plus every created directory.
fn touched_parents(
    file_ops: &[FileOp],
    deletes: &[crate::diff::DeleteOp],
    dir_creates: &[CreateOp],
) -> Vec<SyncPath> {
    let mut out: Vec<SyncPath> = Vec::new();
    for op in file_ops {
        if let Ok(path) = op.path() {
            out.push(path.parent());
        }
    }
    for op in deletes {
        out.push(op.path.parent());
    }
    for op in dir_creates {
        if let Ok(path) = op.path() {
            out.push(path);
        }
    }
    out.sort();
    out.dedup();
    out
}

/// Metadata of the source directory at `path`, if it exists.
fn lookup_dir_info(tree: &SourceDir, path: &SyncPath) -> Option<FileInfo> {
    let mut current = tree;
    for element in path.elements() {
        current = current
            .dirs
            .iter()
            .find(|d| d.info.name == *element)?;
    }
    Some(current.info.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StoreSink;
    use crate::service::SyncService;
    use crate::store::{FsStore, Namespace};
    use std::fs;
    use tempfile::TempDir;

    fn service(tmp: &TempDir) -> SyncService {
        let ns = Namespace::new("acct", "proj").unwrap();
        SyncService::new(FsStore::open(tmp.path(), &ns).unwrap())
    }

    fn write_tree(root: &Path, files: &[(&str, &str)]) {
        for (path, content) in files {
            let full = root.join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
    }

    fn run(source: &Path, svc: &SyncService) -> Result<SyncReport> {
        let sink = StoreSink::new(svc);
        sync(source, &sink, &SyncParams::default(), &CancelToken::new())
    }

    #[test]
    fn initial_sync_uploads_everything() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_tree(
            src.path(),
            &[
                ("en/world", "hello world"),
                ("hello/fr/le_monde", "hello le monde"),
                ("hello/le_monde", "hello le monde"),
                ("hello/world", "hello world"),
                ("world", "hello world"),
            ],
        );

        let svc = service(&dst);
        let report = run(src.path(), &svc).unwrap();
        assert_eq!(report.files_created, 5);
        assert_eq!(report.dirs_created, 3); // en, hello, hello/fr
        assert_eq!(report.files_patched, 0);
        assert_eq!(report.deleted, 0);

        assert_eq!(
            fs::read(svc.db().tree_root().join("hello/fr/le_monde")).unwrap(),
            b"hello le monde"
        );
    }

    #[test]
    fn resync_is_noop() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_tree(src.path(), &[("a/b/c", "deep content"), ("top", "hi")]);

        let svc = service(&dst);
        run(src.path(), &svc).unwrap();
        let second = run(src.path(), &svc).unwrap();
        assert!(second.is_noop(), "second sync did work: {second:?}");
    }

    #[test]
    fn changed_file_is_patched_not_recreated() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_tree(src.path(), &[("f", "the original content of f")]);

        let svc = service(&dst);
        run(src.path(), &svc).unwrap();

        write_tree(src.path(), &[("f", "the modified content of f!")]);
        let report = run(src.path(), &svc).unwrap();
        assert_eq!(report.files_patched, 1);
        assert_eq!(report.files_created, 0);
        assert_eq!(
            fs::read(svc.db().tree_root().join("f")).unwrap(),
            b"the modified content of f!"
        );
    }

    #[test]
    fn removed_entries_are_deleted_in_one_batch() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_tree(src.path(), &[("keep", "k"), ("drop", "d"), ("dir/f", "x")]);

        let svc = service(&dst);
        run(src.path(), &svc).unwrap();

        fs::remove_file(src.path().join("drop")).unwrap();
        fs::remove_dir_all(src.path().join("dir")).unwrap();
        let report = run(src.path(), &svc).unwrap();
        assert_eq!(report.deleted, 2); // "drop" and "dir" (one op per entry)

        assert!(svc.db().tree_root().join("keep").exists());
        assert!(!svc.db().tree_root().join("drop").exists());
        assert!(!svc.db().tree_root().join("dir").exists());
    }

    #[test]
    fn sink_converges_to_source_tree() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_tree(
            src.path(),
            &[("a/one", "1111"), ("a/b/two", "22"), ("three", "333333")],
        );

        let svc = service(&dst);
        run(src.path(), &svc).unwrap();

        // Mutate in all three ways and re-run.
        write_tree(src.path(), &[("a/one", "1111 but longer"), ("four", "4")]);
        fs::remove_file(src.path().join("three")).unwrap();
        run(src.path(), &svc).unwrap();

        // The sink's summary now equals a fresh local summary of the source.
        let sink_sig = svc.get_signature().unwrap();
        let src_tree = trace_source(src.path()).unwrap();
        assert_eq!(sink_sig.file_count(), src_tree.file_count());
        assert_eq!(sink_sig.info.size, src_tree.info.size);
        assert_eq!(
            fs::read(svc.db().tree_root().join("a/one")).unwrap(),
            b"1111 but longer"
        );
        assert!(!svc.db().tree_root().join("three").exists());
    }

    #[test]
    fn empty_source_empties_the_sink() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_tree(src.path(), &[("doomed", "x")]);

        let svc = service(&dst);
        run(src.path(), &svc).unwrap();

        fs::remove_file(src.path().join("doomed")).unwrap();
        let report = run(src.path(), &svc).unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(svc.list_dir(&SyncPath::root()).unwrap().len(), 0);
    }

    #[test]
    fn kind_change_replaces_entry() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_tree(src.path(), &[("x/inner", "nested")]);

        let svc = service(&dst);
        run(src.path(), &svc).unwrap();

        // "x" turns from a directory into a plain file.
        fs::remove_dir_all(src.path().join("x")).unwrap();
        write_tree(src.path(), &[("x", "now a file")]);

        let report = run(src.path(), &svc).unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.files_created, 1);
        assert_eq!(
            fs::read(svc.db().tree_root().join("x")).unwrap(),
            b"now a file"
        );

        // And back again.
        fs::remove_file(src.path().join("x")).unwrap();
        write_tree(src.path(), &[("x/inner", "nested again")]);
        run(src.path(), &svc).unwrap();
        assert_eq!(
            fs::read(svc.db().tree_root().join("x/inner")).unwrap(),
            b"nested again"
        );
    }

    #[test]
    fn cancelled_before_start_does_nothing() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_tree(src.path(), &[("f", "content")]);

        let svc = service(&dst);
        let sink = StoreSink::new(&svc);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = sync(src.path(), &sink, &SyncParams::default(), &cancel).unwrap_err();
        assert!(matches!(err, EspejoError::Cancelled));
        assert!(matches!(
            svc.stat(&SyncPath::parse("f").unwrap()).unwrap_err(),
            EspejoError::NotFound { .. }
        ));
    }

    #[test]
    fn single_worker_still_completes() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_tree(src.path(), &[("a", "1"), ("b", "22"), ("c/d", "333")]);

        let svc = service(&dst);
        let sink = StoreSink::new(&svc);
        let params = SyncParams {
            max_parallel_file_streams: 1,
        };
        let report = sync(src.path(), &sink, &params, &CancelToken::new()).unwrap();
        assert_eq!(report.files_created, 3);
    }

    #[test]
    fn missing_source_root_fails_setup() {
        let dst = TempDir::new().unwrap();
        let svc = service(&dst);
        let sink = StoreSink::new(&svc);
        let err = sync(
            Path::new("/definitely/not/a/real/root"),
            &sink,
            &SyncParams::default(),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(err, EspejoError::Io(_)));
    }
}
