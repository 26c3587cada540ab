mod fixtures;

use std::time::Duration;

use bucketfs_async::bucket::{Bucket, MemBucket, StoreError};
use bucketfs_async::error::Error;
use bucketfs_async::handles::DirentKind;
use bucketfs_async::inodes::{InodeKind, ROOT_INODE_ID};
use bucketfs_async::Options;

use fixtures::{new_fs, new_fs_on, options, patterned};

/// Poll until the folio cache covers `range` for `ino`; prefetch is
/// asynchronous.
async fn wait_covered(fs: &bucketfs_async::BucketFs, ino: u64, range: std::ops::Range<u64>) {
    for _ in 0..200 {
        if fs.cache().covers(ino, range.clone()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "cache never covered {:?} for inode {}: {:?}",
        range,
        ino,
        fs.cache_stats()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn implicit_directory_by_file() {
    let f = new_fs(&[("foo/bar", "hello")], &options());

    let root = f.list_names(ROOT_INODE_ID).await.unwrap();
    assert_eq!(root, [("foo".to_string(), DirentKind::Dir)]);

    let foo = f.lookup_path("foo").await.unwrap();
    assert_eq!(foo.kind, InodeKind::ImplicitDir);

    assert_eq!(f.read_all("foo/bar").await.unwrap(), b"hello");
    f.fs.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn conflict_resolution() {
    let f = new_fs(
        &[("foo", "taco"), ("foo/", ""), ("foo/bar", "burrito")],
        &options(),
    );

    let root = f.list_names(ROOT_INODE_ID).await.unwrap();
    assert_eq!(
        root,
        [
            ("foo".to_string(), DirentKind::Dir),
            ("foo\n".to_string(), DirentKind::File),
        ]
    );

    let dir = f.lookup_path("foo").await.unwrap();
    assert_eq!(dir.kind, InodeKind::ExplicitDir);

    let file = f.lookup_path("foo\n").await.unwrap();
    assert_eq!(file.kind, InodeKind::File);
    assert_eq!(file.size, 4);
    assert_eq!(f.read_range(file.id, 0, 4).await.unwrap(), b"taco");

    assert_eq!(f.read_all("foo/bar").await.unwrap(), b"burrito");
    f.fs.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn sequential_read_triggers_readahead() {
    let f = new_fs(&[], &options());
    let data = patterned(4 << 20);
    f.bucket.put("big", data.clone());

    let attr = f.lookup_path("big").await.unwrap();
    let (fh, keep_cache) = f.fs.open_file(attr.id).await.unwrap();
    assert!(keep_cache);

    let got = f.fs.read_file(fh, 0, 65536).await.unwrap();
    assert_eq!(&got[..], &data[..65536]);
    let state = f.fs.readahead_state(fh).await.unwrap();
    assert!(state.window_end >= 256 << 10, "window: {:?}", state);
    assert!(state.window_end <= 8 << 20);

    let got = f.fs.read_file(fh, 65536, 65536).await.unwrap();
    assert_eq!(&got[..], &data[65536..131072]);

    // The window prefetch runs asynchronously; the cache ends up holding
    // folios past the last requested byte.
    wait_covered(&f.fs, attr.id, 131072..state.window_end).await;

    f.fs.release_file(fh).await.unwrap();
    f.fs.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn readahead_idempotence() {
    let f = new_fs(&[], &options());
    let data = patterned(1 << 20);
    f.bucket.put("big", data.clone());

    let attr = f.lookup_path("big").await.unwrap();
    let (fh, _) = f.fs.open_file(attr.id).await.unwrap();
    let first = f.fs.read_file(fh, 0, 131072).await.unwrap();
    let state = f.fs.readahead_state(fh).await.unwrap();
    wait_covered(&f.fs, attr.id, 0..state.window_end).await;
    // Wait for the in-flight prefetch fills to settle before counting store
    // reads.
    let mut reads_before = f.bucket.reads();
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let now = f.bucket.reads();
        if now == reads_before {
            break;
        }
        reads_before = now;
    }
    let second = f.fs.read_file(fh, 0, 131072).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(f.bucket.reads(), reads_before, "read served from cache");

    f.fs.release_file(fh).await.unwrap();
    f.fs.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn large_read_bypasses_readahead() {
    use rand::{RngCore, SeedableRng};
    let opts = Options {
        folio_max_window: 1 << 20,
        ..options()
    };
    let f = new_fs(&[], &opts);
    let mut data = vec![0u8; 3 << 20];
    rand::rngs::StdRng::seed_from_u64(7).fill_bytes(&mut data);
    f.bucket.put("big", data.clone());

    let attr = f.lookup_path("big").await.unwrap();
    let (fh, _) = f.fs.open_file(attr.id).await.unwrap();
    let got = f.fs.read_file(fh, 0, 2 << 20).await.unwrap();
    assert_eq!(&got[..], &data[..2 << 20]);

    let state = f.fs.readahead_state(fh).await.unwrap();
    assert_eq!((state.window_start, state.window_end), (0, 0));
    assert_eq!(state.num_reads, 1);
    assert_eq!(state.prev_end_offset, 2 << 20);

    f.fs.release_file(fh).await.unwrap();
    f.fs.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn read_at_end_of_file_is_empty() {
    let f = new_fs(&[("small", "abc")], &options());
    let attr = f.lookup_path("small").await.unwrap();
    assert_eq!(f.read_range(attr.id, 3, 10).await.unwrap(), b"");
    assert_eq!(f.read_range(attr.id, 100, 10).await.unwrap(), b"");
    f.fs.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rename_directory_respects_descendant_limit() {
    let opts = Options {
        rename_dir_limit: 5,
        ..options()
    };
    let objects: Vec<(String, String)> = (0..6)
        .map(|i| (format!("src/f{}", i), format!("data{}", i)))
        .collect();
    let refs: Vec<(&str, &str)> = objects
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    let f = new_fs(&refs, &opts);

    let err = f
        .fs
        .rename(ROOT_INODE_ID, "src", ROOT_INODE_ID, "dst")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RenameLimitExceeded(5)));
    // Nothing moved.
    for (name, _) in &objects {
        assert!(f.bucket.contains(name));
        assert!(!f.bucket.contains(&name.replace("src/", "dst/")));
    }
    f.fs.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rename_directory_moves_descendants() {
    let opts = Options {
        rename_dir_limit: 16,
        ..options()
    };
    let f = new_fs(
        &[("src/", ""), ("src/a", "1"), ("src/sub/b", "2")],
        &opts,
    );

    f.fs
        .rename(ROOT_INODE_ID, "src", ROOT_INODE_ID, "dst")
        .await
        .unwrap();
    assert!(f.bucket.contains("dst/"));
    assert!(f.bucket.contains("dst/a"));
    assert!(f.bucket.contains("dst/sub/b"));
    assert!(!f.bucket.contains("src/"));
    assert!(!f.bucket.contains("src/a"));
    assert!(!f.bucket.contains("src/sub/b"));

    assert_eq!(f.read_all("dst/sub/b").await.unwrap(), b"2");
    f.fs.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rename_file_moves_content() {
    let f = new_fs(&[("a", "payload"), ("d/", "")], &options());
    f.fs
        .rename(ROOT_INODE_ID, "a", ROOT_INODE_ID, "b")
        .await
        .unwrap();
    assert!(matches!(
        f.lookup_path("a").await.unwrap_err(),
        Error::NotFound(_)
    ));
    assert_eq!(f.read_all("b").await.unwrap(), b"payload");

    // Into a subdirectory.
    let d = f.lookup_path("d").await.unwrap();
    f.fs.rename(ROOT_INODE_ID, "b", d.id, "c").await.unwrap();
    assert_eq!(f.read_all("d/c").await.unwrap(), b"payload");
    f.fs.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn generation_replacement_mints_a_new_inode() {
    let f = new_fs(&[("foo", "old contents")], &options());

    let first = f.lookup_path("foo").await.unwrap();
    let (fh, _) = f.fs.open_file(first.id).await.unwrap();
    let got = f.fs.read_file(fh, 0, 12).await.unwrap();
    assert_eq!(&got[..], b"old contents");

    // An external writer replaces the object.
    f.bucket.put("foo", "NEW".as_bytes().to_vec());

    // A fresh lookup observes the new generation under a new id.
    let second = f.lookup_path("foo").await.unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(second.size, 3);
    assert_eq!(f.read_range(second.id, 0, 3).await.unwrap(), b"NEW");

    // The open handle keeps serving pre-clobber bytes from the cache, and
    // the orphaned inode reports no links.
    let got = f.fs.read_file(fh, 0, 12).await.unwrap();
    assert_eq!(&got[..], b"old contents");
    let old_attr = f.fs.getattr(first.id).await.unwrap();
    assert_eq!(old_attr.nlink, 0);

    f.fs.release_file(fh).await.unwrap();
    f.fs.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn listing_round_trip_across_pages() {
    // Three entries per store page, plus a conflict pair.
    let bucket = MemBucket::with_page_size("test", 3);
    let f = new_fs_on(
        bucket,
        &[
            ("a", "1"),
            ("b/x", "2"),
            ("c", "3"),
            ("c/", ""),
            ("d", "4"),
            ("e/y", "5"),
            ("f", "6"),
        ],
        &options(),
    );

    let fh = f.fs.open_dir(ROOT_INODE_ID).await.unwrap();
    let all = f.collect_dir(fh).await.unwrap();
    let names: Vec<&str> = all.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["a", "b", "c", "c\n", "d", "e", "f"]);
    // Offsets are 1-based and contiguous.
    let offsets: Vec<u64> = all.iter().map(|e| e.offset).collect();
    assert_eq!(offsets, (1..=7).collect::<Vec<u64>>());

    // Reading entry-by-entry from a fresh handle yields the same sequence.
    let fh2 = f.fs.open_dir(ROOT_INODE_ID).await.unwrap();
    let mut collected = vec![];
    let mut offset = 0;
    loop {
        let entries = f.fs.read_dir(fh2, offset).await.unwrap();
        match entries.first() {
            Some(e) => {
                collected.push(e.name.clone());
                offset = e.offset;
            }
            None => break,
        }
    }
    assert_eq!(collected, names);

    // A prior offset returns the same entry it returned before.
    let again = f.fs.read_dir(fh2, 2).await.unwrap();
    assert_eq!(again.first().unwrap().name, "c");

    f.fs.release_dir(fh).await.unwrap();
    f.fs.release_dir(fh2).await.unwrap();
    f.fs.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn readdir_past_the_end_is_invalid() {
    let f = new_fs(&[("a", "1")], &options());
    let fh = f.fs.open_dir(ROOT_INODE_ID).await.unwrap();
    // Offset == len is the end, not an error.
    let all = f.fs.read_dir(fh, 0).await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(f.fs.read_dir(fh, 1).await.unwrap().is_empty());
    let err = f.fs.read_dir(fh, 5).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    f.fs.release_dir(fh).await.unwrap();
    f.fs.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn listing_errors_surface_and_transients_retry() {
    let f = new_fs(&[("a", "1")], &options());

    // A transient failure before anything was emitted is retried.
    f.bucket
        .inject_listing_error(StoreError::Transient("flaky".into()));
    let names = f.list_names(ROOT_INODE_ID).await.unwrap();
    assert_eq!(names.len(), 1);

    // A permanent failure lands in the error slot.
    f.bucket.inject_listing_error(StoreError::PermissionDenied);
    let err = f.list_dir(ROOT_INODE_ID).await.unwrap_err();
    assert!(matches!(err, Error::Store(StoreError::PermissionDenied)));
    f.fs.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn mkdir_create_unlink_rmdir() {
    let f = new_fs(&[], &options());

    let dir = f.fs.mkdir(ROOT_INODE_ID, "d").await.unwrap();
    assert_eq!(dir.kind, InodeKind::ExplicitDir);
    assert!(f.bucket.contains("d/"));
    let err = f.fs.mkdir(ROOT_INODE_ID, "d").await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));

    let (file, fh) = f.fs.create_file(dir.id, "f").await.unwrap();
    assert_eq!(file.kind, InodeKind::File);
    assert_eq!(file.size, 0);
    assert!(f.bucket.contains("d/f"));
    f.fs.release_file(fh).await.unwrap();
    let err = f.fs.create_file(dir.id, "f").await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));

    // Occupied directories cannot be removed.
    let err = f.fs.rmdir(ROOT_INODE_ID, "d").await.unwrap_err();
    assert!(matches!(err, Error::NotEmpty(_)));

    f.fs.unlink(dir.id, "f").await.unwrap();
    assert!(!f.bucket.contains("d/f"));
    let err = f.fs.unlink(dir.id, "f").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    f.fs.rmdir(ROOT_INODE_ID, "d").await.unwrap();
    assert!(!f.bucket.contains("d/"));
    f.fs.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn symlinks_round_trip() {
    let f = new_fs(&[], &options());
    let attr = f
        .fs
        .symlink(ROOT_INODE_ID, "link", "target/path")
        .await
        .unwrap();
    assert_eq!(attr.kind, InodeKind::Symlink);
    assert_eq!(f.fs.readlink(attr.id).await.unwrap(), "target/path");

    let names = f.list_names(ROOT_INODE_ID).await.unwrap();
    assert_eq!(names, [("link".to_string(), DirentKind::Symlink)]);
    f.fs.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn setattr_mtime_and_truncate() {
    let f = new_fs(&[("f", "0123456789")], &options());
    let attr = f.lookup_path("f").await.unwrap();

    let mtime = std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(1234567);
    let updated = f.fs.setattr(attr.id, None, Some(mtime)).await.unwrap();
    assert_eq!(updated.mtime, mtime);
    // The override is persisted in object metadata and survives a fresh
    // stat.
    let record = f
        .bucket
        .stat_object("f")
        .await
        .unwrap()
        .expect("object exists");
    assert_eq!(record.mtime(), Some(mtime));

    let truncated = f.fs.setattr(attr.id, Some(0), None).await.unwrap();
    assert_eq!(truncated.size, 0);
    assert_eq!(f.read_range(attr.id, 0, 10).await.unwrap(), b"");

    let err = f.fs.setattr(attr.id, Some(5), None).await.unwrap_err();
    assert!(matches!(err, Error::NotSupported(_)));
    f.fs.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn negative_lookups_cache_until_ttl() {
    let opts = Options {
        enable_nonexistent_type_cache: true,
        dir_type_cache_ttl_secs: 60,
        ..options()
    };
    let f = new_fs(&[], &opts);

    assert!(matches!(
        f.lookup_path("ghost").await.unwrap_err(),
        Error::NotFound(_)
    ));

    // The object appears externally, but the negative entry is still fresh.
    f.bucket.put("ghost", b"here".to_vec());
    assert!(matches!(
        f.lookup_path("ghost").await.unwrap_err(),
        Error::NotFound(_)
    ));

    f.clock.advance(Duration::from_secs(61));
    assert_eq!(f.lookup_path("ghost").await.unwrap().size, 4);
    f.fs.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn forget_destroys_and_drops_folios() {
    let f = new_fs(&[("f", "some contents")], &options());
    let attr = f.lookup_path("f").await.unwrap();
    assert_eq!(f.read_range(attr.id, 0, 13).await.unwrap(), b"some contents");
    assert!(f.fs.cache().covers(attr.id, 0..13));

    // Let the scheduled window prefetch finish so it cannot repopulate the
    // cache after the invalidation below.
    tokio::time::sleep(Duration::from_millis(50)).await;
    f.fs.forget(attr.id, 1).await;
    assert!(!f.fs.cache().covers(attr.id, 0..13));
    assert!(matches!(
        f.fs.getattr(attr.id).await.unwrap_err(),
        Error::BadInode(_)
    ));

    f.fs.assert_quiescent();
    f.fs.check_invariants();
    f.fs.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn lookup_counts_balance_to_quiescence() {
    let f = new_fs(&[("d/", ""), ("d/f", "x")], &options());

    // Two lookups of the same name share an inode and accumulate two
    // references.
    let a = f.lookup_path("d/f").await.unwrap();
    let b = f.lookup_path("d/f").await.unwrap();
    assert_eq!(a.id, b.id);

    let d = f.lookup_path("d").await.unwrap();
    f.fs.forget(a.id, 2).await;
    // The directory was looked up three times on the way.
    f.fs.forget(d.id, 3).await;
    f.fs.assert_quiescent();
    f.fs.stop().await;
}
