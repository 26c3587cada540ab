//! Object-store client seam.
//!
//! The filesystem core consumes an object store through the [`Bucket`] trait;
//! production mounts implement it over the store's RPC client. [`MemBucket`]
//! is a complete in-memory implementation with paginated listings, used by the
//! tests and the demo binary. [`PrefixBucket`] and [`CachingBucket`] are
//! decorators composing over any `Bucket`.
mod caching;
mod mem;
mod prefix;
pub use caching::CachingBucket;
pub use mem::MemBucket;
pub use prefix::PrefixBucket;

use std::collections::BTreeMap;
use std::ops::Range;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

/// Metadata key overriding the attribute mtime, RFC 3339.
pub const MTIME_METADATA_KEY: &str = "gcsfuse_mtime";
/// Metadata key marking an object as a symlink; the value is the target.
pub const SYMLINK_METADATA_KEY: &str = "gcsfuse_symlink_target";

/// Structured store failure, as distinguished by the core.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,
    #[error("precondition failed")]
    PreconditionFailed,
    #[error("permission denied")]
    PermissionDenied,
    #[error("transient store failure: {0}")]
    Transient(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// One object version, as reported by the store.
#[derive(Clone, Debug)]
pub struct ObjectRecord {
    pub name: String,
    /// Changes on any content overwrite.
    pub generation: i64,
    /// Changes on metadata-only updates.
    pub meta_generation: i64,
    pub size: u64,
    pub content_type: String,
    pub metadata: BTreeMap<String, String>,
    pub updated_at: SystemTime,
}

impl ObjectRecord {
    /// The mtime override carried in metadata, if present and well-formed.
    pub fn mtime(&self) -> Option<SystemTime> {
        let raw = self.metadata.get(MTIME_METADATA_KEY)?;
        humantime::parse_rfc3339(raw).ok()
    }

    pub fn symlink_target(&self) -> Option<&str> {
        self.metadata.get(SYMLINK_METADATA_KEY).map(|s| s.as_str())
    }
}

#[derive(Clone, Debug, Default)]
pub struct ListRequest {
    pub prefix: String,
    pub delimiter: Option<char>,
    pub continuation: Option<String>,
    pub max_results: Option<usize>,
}

/// One page of a listing. `prefixes` are delimiter-collapsed directory
/// prefixes, each including the trailing delimiter.
#[derive(Clone, Debug, Default)]
pub struct Listing {
    pub objects: Vec<ObjectRecord>,
    pub prefixes: Vec<String>,
    pub continuation: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CreateRequest {
    pub name: String,
    pub contents: Bytes,
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// `Some(0)` requires that no live version exists.
    pub if_generation_match: Option<i64>,
}

impl CreateRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contents: Bytes::new(),
            content_type: None,
            metadata: BTreeMap::new(),
            if_generation_match: None,
        }
    }
    pub fn contents(mut self, contents: impl Into<Bytes>) -> Self {
        self.contents = contents.into();
        self
    }
    pub fn metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
    /// Fail with [`StoreError::PreconditionFailed`] if the object exists.
    pub fn if_not_exists(mut self) -> Self {
        self.if_generation_match = Some(0);
        self
    }
}

#[derive(Clone, Debug)]
pub struct DeleteRequest {
    pub name: String,
    pub generation: Option<i64>,
    pub meta_generation: Option<i64>,
}

impl DeleteRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            generation: None,
            meta_generation: None,
        }
    }
    pub fn generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }
}

pub type ByteStream = BoxStream<'static, Result<Bytes, StoreError>>;

/// The object-store operations the filesystem core requires.
#[async_trait]
pub trait Bucket: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn list_objects(&self, req: ListRequest) -> Result<Listing, StoreError>;

    async fn stat_object(&self, name: &str) -> Result<Option<ObjectRecord>, StoreError>;

    async fn create_object(&self, req: CreateRequest) -> Result<ObjectRecord, StoreError>;

    /// Apply metadata changes (`None` removes a key); bumps the
    /// meta-generation only.
    async fn update_object(
        &self,
        name: &str,
        changes: BTreeMap<String, Option<String>>,
    ) -> Result<ObjectRecord, StoreError>;

    /// Server-side copy of the given source generation; the destination gets
    /// a fresh generation.
    async fn copy_object(
        &self,
        src: &str,
        src_generation: i64,
        dst: &str,
    ) -> Result<ObjectRecord, StoreError>;

    async fn delete_object(&self, req: DeleteRequest) -> Result<(), StoreError>;

    /// Stream the byte range of an object. When `generation` is given, the
    /// read is pinned to that content version and fails with
    /// [`StoreError::NotFound`] if it is gone.
    async fn new_reader(
        &self,
        name: &str,
        generation: Option<i64>,
        range: Range<u64>,
    ) -> Result<ByteStream, StoreError>;
}
