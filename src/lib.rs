#![doc = include_str!("../README.md")]

pub mod bucket;
mod bucketfuse;
pub mod cache;
pub mod clock;
pub mod error;
pub mod handles;
pub mod inodes;
pub mod names;
mod ops;
pub mod pools;
pub mod readahead;
#[doc(hidden)]
pub mod utils;
pub mod workers;
pub mod write;

pub use bucketfuse::BucketFuse;
pub use error::Error;
pub use ops::AttrReply;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::*;

use bucket::Bucket;
use cache::{CacheStats, FolioCache};
use clock::Clock;
use handles::HandleTable;
use inodes::InodeTable;
use pools::FolioPool;
use readahead::{dispatch_fetch, FetchTask, ReadaheadConfig};
use workers::WorkerPool;
use write::WriteBuffer;

/// Mount options.
#[derive(Parser)]
pub struct Options {
    /// Infer directories from object name prefixes, without requiring `name/`
    /// placeholder objects.
    #[clap(long)]
    pub implicit_directories: bool,
    /// Cache negative (nonexistent) name lookups.
    #[clap(long)]
    pub enable_nonexistent_type_cache: bool,
    /// TTL (s) for cached child-name to type mappings; 0 disables the cache.
    #[clap(long, default_value_t = 60)]
    pub dir_type_cache_ttl_secs: u64,
    /// Kernel attribute cache expiration (s).
    #[clap(long, default_value_t = 60)]
    pub inode_attribute_cache_ttl_secs: u64,
    /// Maximum descendants of a directory that rename will enumerate.
    #[clap(long, default_value_t = 0)]
    pub rename_dir_limit: usize,
    /// Baseline object-store read chunk size (MB); also the large folio
    /// class.
    #[clap(long, default_value_t = 1)]
    pub sequential_read_size_mb: usize,
    /// Permission bits for files (octal).
    #[clap(long, default_value = "644", parse(try_from_str = utils::parse_octal))]
    pub file_perms: u16,
    /// Permission bits for directories (octal).
    #[clap(long, default_value = "755", parse(try_from_str = utils::parse_octal))]
    pub dir_perms: u16,
    /// Owner uid of all inodes; defaults to the mounting user.
    #[clap(long)]
    pub uid: Option<u32>,
    /// Owner gid of all inodes; defaults to the mounting group.
    #[clap(long)]
    pub gid: Option<u32>,
    /// Folio alignment unit (B); defaults to the system page size.
    #[clap(long)]
    pub folio_page_size: Option<usize>,
    /// Upper bound (B) on the readahead window.
    #[clap(long, default_value_t = 8 << 20)]
    pub folio_max_window: u64,
    /// Forward gap (B) below which a read still counts as sequential.
    #[clap(long, default_value_t = 1 << 20)]
    pub folio_merge_gap: u64,
    /// Folio cache byte bound; 0 disables the limit.
    #[clap(long, default_value_t = 100 << 20)]
    pub cache_max_bytes: u64,
    /// Folio cache entry bound; 0 disables the limit.
    #[clap(long, default_value_t = 0)]
    pub cache_max_entries: usize,
    /// Number of prefetch/download workers.
    #[clap(long, default_value_t = 4)]
    pub workers: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            implicit_directories: false,
            enable_nonexistent_type_cache: false,
            dir_type_cache_ttl_secs: 60,
            inode_attribute_cache_ttl_secs: 60,
            rename_dir_limit: 0,
            sequential_read_size_mb: 1,
            file_perms: 0o644,
            dir_perms: 0o755,
            uid: None,
            gid: None,
            folio_page_size: None,
            folio_max_window: 8 << 20,
            folio_merge_gap: 1 << 20,
            cache_max_bytes: 100 << 20,
            cache_max_entries: 0,
            workers: 4,
        }
    }
}

/// Digested options.
pub(crate) struct Config {
    pub implicit_directories: bool,
    pub nonexistent_type_cache: bool,
    pub type_cache_ttl: Duration,
    pub attr_ttl: Duration,
    pub rename_dir_limit: usize,
    pub file_perms: u16,
    pub dir_perms: u16,
    pub uid: u32,
    pub gid: u32,
    pub readahead: ReadaheadConfig,
}

pub(crate) struct FsState {
    pub inodes: InodeTable,
    pub handles: HandleTable,
}

/// Base structure representing a mounted bucket.
///
/// All lookup, listing and read state is derived from the object store and
/// volatile; nothing is persisted. The environment (clock, folio pool and
/// cache, worker pool, write buffer) is constructed here and passed down, so
/// the whole core is testable with a simulated clock and an in-memory
/// bucket.
pub struct BucketFs {
    pub(crate) bucket: Arc<dyn Bucket>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) pool: Arc<FolioPool>,
    pub(crate) cache: Arc<FolioCache>,
    pub(crate) workers: Arc<WorkerPool<FetchTask>>,
    pub(crate) write_buffer: Arc<dyn WriteBuffer>,
    pub(crate) config: Config,
    /// The filesystem lock: inode and handle tables. Never held across
    /// store RPCs.
    pub(crate) state: parking_lot::Mutex<FsState>,
}

impl BucketFs {
    /// Build the mount environment. Must be called within a tokio runtime:
    /// the prefetch workers and directory listers are spawned onto it.
    pub fn new(
        bucket: Arc<dyn Bucket>,
        options: &Options,
        clock: Arc<dyn Clock>,
        write_buffer: Arc<dyn WriteBuffer>,
    ) -> Result<Arc<Self>, Error> {
        let page_size = options.folio_page_size.unwrap_or_else(page_size::get);
        if options.sequential_read_size_mb == 0 {
            return Err(Error::InvalidOptions("the read chunk size must be >= 1 MB"));
        }
        let large = utils::round_up(
            (options.sequential_read_size_mb as u64) << 20,
            page_size as u64,
        ) as usize;
        let small = utils::round_up((large / 16).max(page_size) as u64, page_size as u64) as usize;
        if options.folio_max_window == 0 || options.folio_max_window % page_size as u64 != 0 {
            return Err(Error::InvalidOptions(
                "the readahead window bound must be a positive multiple of the page size",
            ));
        }
        // Twice the cache bound, so eviction (which runs after insertion)
        // cannot be starved by the pool.
        let pool_budget = (options.cache_max_bytes as usize).saturating_mul(2);
        let pool = FolioPool::new(page_size, small, large, pool_budget)?;
        let cache = FolioCache::new(
            pool.clone(),
            options.cache_max_entries,
            options.cache_max_bytes,
        );
        let workers = Arc::new(WorkerPool::new(options.workers, dispatch_fetch)?);
        workers.start(&tokio::runtime::Handle::current());

        let uid = options.uid.unwrap_or_else(|| unsafe { libc::getuid() });
        let gid = options.gid.unwrap_or_else(|| unsafe { libc::getgid() });
        let config = Config {
            implicit_directories: options.implicit_directories,
            nonexistent_type_cache: options.enable_nonexistent_type_cache,
            type_cache_ttl: Duration::from_secs(options.dir_type_cache_ttl_secs),
            attr_ttl: Duration::from_secs(options.inode_attribute_cache_ttl_secs),
            rename_dir_limit: options.rename_dir_limit,
            file_perms: options.file_perms,
            dir_perms: options.dir_perms,
            uid,
            gid,
            readahead: ReadaheadConfig {
                page_size: page_size as u64,
                max_window: options.folio_max_window,
                merge_gap: options.folio_merge_gap,
            },
        };
        let now = clock.now();
        info!(bucket = bucket.name(), page_size, large, small, "initializing filesystem");
        Ok(Arc::new(Self {
            bucket,
            clock,
            pool,
            cache,
            workers,
            write_buffer,
            config,
            state: parking_lot::Mutex::new(FsState {
                inodes: InodeTable::new(now),
                handles: HandleTable::new(),
            }),
        }))
    }

    pub fn bucket_name(&self) -> &str {
        self.bucket.name()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// The folio cache, for diagnostics.
    pub fn cache(&self) -> &FolioCache {
        &self.cache
    }

    /// The folio pool, for diagnostics.
    pub fn pool(&self) -> &FolioPool {
        &self.pool
    }

    pub fn has_handles(&self) -> bool {
        !self.state.lock().handles.is_empty()
    }

    /// Stop the prefetch workers; pending fetches are dropped.
    pub async fn stop(&self) {
        self.workers.stop().await;
    }
}

impl std::fmt::Debug for BucketFs {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "BucketFs on bucket {:?}", self.bucket.name())?;
        writeln!(f, "{}", self.cache)?;
        writeln!(f, "{} live inodes", self.state.lock().inodes.len())?;
        Ok(())
    }
}
