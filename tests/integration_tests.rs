//! Integration tests for espejo.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use espejo::{
    diff_trees, file_matches_sum, generate_delta, summarize_with_block_size, sync, trace_source,
    CancelToken, DeltaEvent, EspejoError, FileInfo, FilePatcher, FsSource, FsStore, Namespace,
    PatchEncoder, StoreSink, SyncParams, SyncPath, SyncService,
};
use tempfile::TempDir;

fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (path, content) in files {
        let full = root.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }
}

fn service(tmp: &TempDir) -> SyncService {
    let ns = Namespace::new("acct", "proj").unwrap();
    SyncService::new(FsStore::open(tmp.path(), &ns).unwrap())
}

fn test_info(name: &str, size: u64) -> FileInfo {
    FileInfo {
        name: name.to_string(),
        size,
        mode: 0o644,
        mtime: 1_700_000_000,
        is_dir: false,
    }
}

// =============================================================================
// END-TO-END FILE PIPELINE
// =============================================================================

#[test]
fn delta_pipeline_reconstructs_source() {
    let sink = b"The quick brown fox jumps over the lazy dog".to_vec();
    let src = b"The quick brown fox vaults over the lazy dog, twice".to_vec();

    let sum = summarize_with_block_size(
        &mut Cursor::new(sink.as_slice()),
        test_info("f", sink.len() as u64),
        4,
    )
    .unwrap();

    let mut wire = Vec::new();
    let mut enc = PatchEncoder::new(&mut wire);
    generate_delta(Cursor::new(src.as_slice()), &sum, |event| match event {
        DeltaEvent::Literal(data) => enc.write_literal(data).map(|n| n as u64),
        DeltaEvent::BlockRef(i) => enc.write_block_ref(i).map(|n| n as u64),
    })
    .unwrap();

    let mut rebuilt = Vec::new();
    let mut patcher = FilePatcher::new(Cursor::new(sink.as_slice()), &mut rebuilt, &sum);
    patcher.apply_from(Cursor::new(&wire)).unwrap();
    assert_eq!(rebuilt, src);
}

#[test]
fn reencoded_patch_is_byte_identical() {
    // Decode a patch and re-encode the same record sequence.
    let sink = b"some shared content in the middle".to_vec();
    let src = b"prefix, some shared content in the middle, suffix".to_vec();
    let sum = summarize_with_block_size(
        &mut Cursor::new(sink.as_slice()),
        test_info("f", sink.len() as u64),
        4,
    )
    .unwrap();

    let mut wire = Vec::new();
    let mut enc = PatchEncoder::new(&mut wire);
    generate_delta(Cursor::new(src.as_slice()), &sum, |event| match event {
        DeltaEvent::Literal(data) => enc.write_literal(data).map(|n| n as u64),
        DeltaEvent::BlockRef(i) => enc.write_block_ref(i).map(|n| n as u64),
    })
    .unwrap();

    let mut rewire = Vec::new();
    {
        let mut renc = PatchEncoder::new(&mut rewire);
        espejo::PatchDecoder::new(wire.as_slice())
            .decode(|record| {
                match record {
                    espejo::PatchRecord::BlockRef(i) => {
                        renc.write_block_ref(i)?;
                    }
                    espejo::PatchRecord::Literal(r) => {
                        let mut data = Vec::new();
                        std::io::Read::read_to_end(r, &mut data)?;
                        renc.write_literal(&data)?;
                    }
                }
                Ok(0)
            })
            .unwrap();
    }
    assert_eq!(wire, rewire);
}

// =============================================================================
// FULL TREE SYNC
// =============================================================================

#[test]
fn fresh_sync_then_matching_signature() {
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
    let sink = StoreSink::new(&svc);
    let report = sync(src.path(), &sink, &SyncParams::default(), &CancelToken::new()).unwrap();
    assert_eq!(report.files_created, 5);

    // The sink summary matches the source tree shape and sizes.
    let sig = svc.get_signature().unwrap();
    let tree = trace_source(src.path()).unwrap();
    assert_eq!(sig.file_count(), tree.file_count());
    assert_eq!(sig.info.size, tree.info.size);

    // Every synced file verifies against its stored summary.
    for rel in [
        "en/world",
        "hello/fr/le_monde",
        "hello/le_monde",
        "hello/world",
        "world",
    ] {
        let sum = svc.get_file_sum(&SyncPath::parse(rel).unwrap()).unwrap();
        let content = fs::read(src.path().join(rel)).unwrap();
        assert!(file_matches_sum(&mut Cursor::new(content.as_slice()), &sum).unwrap());
    }
}

#[test]
fn incremental_sync_transfers_only_changes() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    let mut big: String = String::new();
    for i in 0..2000 {
        big.push_str(&format!("line number {i} of the original file\n"));
    }
    write_tree(src.path(), &[("big.txt", &big), ("same.txt", "unchanged")]);

    let svc = service(&dst);
    let sink = StoreSink::new(&svc);
    sync(src.path(), &sink, &SyncParams::default(), &CancelToken::new()).unwrap();

    // Tweak one line in the middle of the big file.
    let modified = big.replace("line number 1000 ", "LINE NUMBER 1000 ");
    write_tree(src.path(), &[("big.txt", &modified)]);

    let report = sync(src.path(), &sink, &SyncParams::default(), &CancelToken::new()).unwrap();
    assert_eq!(report.files_patched, 1);
    assert_eq!(report.files_created, 0);

    assert_eq!(
        fs::read_to_string(svc.db().tree_root().join("big.txt")).unwrap(),
        modified
    );
    assert_eq!(
        fs::read_to_string(svc.db().tree_root().join("same.txt")).unwrap(),
        "unchanged"
    );
}

#[test]
fn sync_until_stable_then_noop() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_tree(
        src.path(),
        &[("a/x", "one"), ("a/b/y", "two"), ("c/z", "three")],
    );

    let svc = service(&dst);
    let sink = StoreSink::new(&svc);
    sync(src.path(), &sink, &SyncParams::default(), &CancelToken::new()).unwrap();
    let second = sync(src.path(), &sink, &SyncParams::default(), &CancelToken::new()).unwrap();
    assert!(second.is_noop());

    // And the diff itself is empty when computed directly.
    let tree = trace_source(src.path()).unwrap();
    let sig = svc.get_signature().unwrap();
    let diff = diff_trees(&tree, &sig, &FsSource::new(src.path())).unwrap();
    assert!(diff.is_empty(), "diff not empty: {diff:?}");
}

#[test]
fn deletes_follow_creates_and_patches() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_tree(src.path(), &[("old/gone", "x"), ("kept", "before")]);

    let svc = service(&dst);
    let sink = StoreSink::new(&svc);
    sync(src.path(), &sink, &SyncParams::default(), &CancelToken::new()).unwrap();

    fs::remove_dir_all(src.path().join("old")).unwrap();
    write_tree(src.path(), &[("kept", "after!"), ("fresh", "new")]);

    let report = sync(src.path(), &sink, &SyncParams::default(), &CancelToken::new()).unwrap();
    assert_eq!(report.deleted, 1); // the "old" dir, one op
    assert_eq!(report.files_created, 1);
    assert_eq!(report.files_patched, 1);

    assert!(!svc.db().tree_root().join("old").exists());
    assert_eq!(fs::read(svc.db().tree_root().join("kept")).unwrap(), b"after!");
    assert_eq!(fs::read(svc.db().tree_root().join("fresh")).unwrap(), b"new");
}

#[test]
fn binary_content_with_large_files() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();

    // Big enough to leave the fixed-700 block-size regime.
    let data: Vec<u8> = (0u32..150_000).flat_map(u32::to_le_bytes).collect();
    fs::write(src.path().join("blob"), &data).unwrap();

    let svc = service(&dst);
    let sink = StoreSink::new(&svc);
    sync(src.path(), &sink, &SyncParams::default(), &CancelToken::new()).unwrap();
    assert_eq!(fs::read(svc.db().tree_root().join("blob")).unwrap(), data);

    // Shift the content and patch.
    let mut shifted = b"#header#".to_vec();
    shifted.extend_from_slice(&data);
    fs::write(src.path().join("blob"), &shifted).unwrap();

    let report = sync(src.path(), &sink, &SyncParams::default(), &CancelToken::new()).unwrap();
    assert_eq!(report.files_patched, 1);
    assert_eq!(fs::read(svc.db().tree_root().join("blob")).unwrap(), shifted);
}

// =============================================================================
// FAILURE ISOLATION
// =============================================================================

#[test]
fn unreadable_source_file_fails_only_that_file() {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        write_tree(src.path(), &[("good", "fine"), ("bad", "secret")]);
        fs::set_permissions(src.path().join("bad"), fs::Permissions::from_mode(0o000)).unwrap();

        let svc = service(&dst);
        let sink = StoreSink::new(&svc);
        let err = sync(src.path(), &sink, &SyncParams::default(), &CancelToken::new());
        match err {
            Err(EspejoError::Sync(failures)) => {
                assert_eq!(failures.failures.len(), 1);
                assert_eq!(failures.failures[0].0, "bad");
            }
            other => panic!("expected a composite sync error, got {other:?}"),
        }

        // The good file still made it across.
        assert_eq!(fs::read(svc.db().tree_root().join("good")).unwrap(), b"fine");
    }
}

#[test]
fn store_survives_reopen() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();
    write_tree(src.path(), &[("persisted", "still here")]);

    let ns = Namespace::new("acct", "proj").unwrap();
    {
        let svc = SyncService::new(FsStore::open(dst.path(), &ns).unwrap());
        let sink = StoreSink::new(&svc);
        sync(src.path(), &sink, &SyncParams::default(), &CancelToken::new()).unwrap();
    }

    // Reopen: content and summaries are recomputable from disk alone.
    let svc = SyncService::new(FsStore::open(dst.path(), &ns).unwrap());
    let sum = svc.get_file_sum(&SyncPath::parse("persisted").unwrap()).unwrap();
    assert_eq!(sum.content_len(), 10);

    let sink = StoreSink::new(&svc);
    let report = sync(src.path(), &sink, &SyncParams::default(), &CancelToken::new()).unwrap();
    assert!(report.is_noop());
}
