//! Test fixtures: an in-memory bucket mounted through the full core.
use std::sync::Arc;
use std::time::SystemTime;

use bucketfs_async::bucket::MemBucket;
use bucketfs_async::clock::SimulatedClock;
use bucketfs_async::error::Error;
use bucketfs_async::handles::{DirEntry, DirentKind};
use bucketfs_async::inodes::{InodeId, ROOT_INODE_ID};
use bucketfs_async::write::NullWriteBuffer;
use bucketfs_async::{AttrReply, BucketFs, Options};

pub struct Fixture {
    pub fs: Arc<BucketFs>,
    pub bucket: Arc<MemBucket>,
    pub clock: Arc<SimulatedClock>,
}

pub fn options() -> Options {
    Options {
        implicit_directories: true,
        ..Default::default()
    }
}

pub fn new_fs(objects: &[(&str, &str)], options: &Options) -> Fixture {
    new_fs_on(MemBucket::new("test"), objects, options)
}

pub fn new_fs_on(
    bucket: Arc<MemBucket>,
    objects: &[(&str, &str)],
    options: &Options,
) -> Fixture {
    for (name, contents) in objects {
        bucket.put(name, contents.as_bytes().to_vec());
    }
    let clock = Arc::new(SimulatedClock::new(SystemTime::UNIX_EPOCH));
    let fs = BucketFs::new(
        bucket.clone(),
        options,
        clock.clone(),
        Arc::new(NullWriteBuffer),
    )
    .unwrap();
    Fixture { fs, bucket, clock }
}

impl Fixture {
    /// Resolve a slash-separated path from the root, component by component.
    pub async fn lookup_path(&self, path: &str) -> Result<AttrReply, Error> {
        let mut attr = self.fs.getattr(ROOT_INODE_ID).await?;
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            attr = self.fs.lookup(attr.id, comp).await?;
        }
        Ok(attr)
    }

    pub async fn read_range(&self, ino: InodeId, offset: u64, size: u64) -> Result<Vec<u8>, Error> {
        let (fh, _) = self.fs.open_file(ino).await?;
        let result = self.fs.read_file(fh, offset, size).await;
        self.fs.release_file(fh).await?;
        result.map(|b| b.to_vec())
    }

    /// Full contents of the file at `path`, through lookup/open/read/release.
    pub async fn read_all(&self, path: &str) -> Result<Vec<u8>, Error> {
        let attr = self.lookup_path(path).await?;
        let data = self.read_range(attr.id, 0, attr.size.max(1)).await?;
        self.fs.forget(attr.id, 1).await;
        Ok(data)
    }

    /// One full listing of a directory inode, consumed the way the kernel
    /// consumes it: resuming from the last seen offset until an empty batch.
    pub async fn list_dir(&self, ino: InodeId) -> Result<Vec<DirEntry>, Error> {
        let fh = self.fs.open_dir(ino).await?;
        let result = self.collect_dir(fh).await;
        self.fs.release_dir(fh).await?;
        result
    }

    pub async fn collect_dir(&self, fh: u64) -> Result<Vec<DirEntry>, Error> {
        let mut entries: Vec<DirEntry> = Vec::new();
        loop {
            let offset = entries.last().map(|e| e.offset).unwrap_or(0);
            let batch = self.fs.read_dir(fh, offset).await?;
            if batch.is_empty() {
                return Ok(entries);
            }
            entries.extend(batch);
        }
    }

    pub async fn list_names(&self, ino: InodeId) -> Result<Vec<(String, DirentKind)>, Error> {
        Ok(self
            .list_dir(ino)
            .await?
            .into_iter()
            .map(|e| (e.name, e.kind))
            .collect())
    }
}

/// Deterministic file contents for read tests.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
