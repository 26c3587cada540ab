//! Decorator caching `stat_object` results with a TTL.
//!
//! Negative results (name known absent) are cached only when requested, so a
//! mount can trade lookup traffic against visibility of externally created
//! objects.
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use super::{
    Bucket, ByteStream, CreateRequest, DeleteRequest, ListRequest, Listing, ObjectRecord,
    StoreError,
};
use crate::clock::Clock;

struct CachedStat {
    record: Option<ObjectRecord>,
    expires: SystemTime,
}

pub struct CachingBucket {
    inner: Arc<dyn Bucket>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    cache_negative: bool,
    entries: parking_lot::Mutex<lru::LruCache<String, CachedStat>>,
}

impl CachingBucket {
    /// `capacity == 0` leaves the entry count unbounded.
    pub fn new(
        inner: Arc<dyn Bucket>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        cache_negative: bool,
        capacity: usize,
    ) -> Arc<Self> {
        let entries = match NonZeroUsize::new(capacity) {
            Some(c) => lru::LruCache::new(c),
            None => lru::LruCache::unbounded(),
        };
        Arc::new(Self {
            inner,
            clock,
            ttl,
            cache_negative,
            entries: parking_lot::Mutex::new(entries),
        })
    }

    fn cached(&self, name: &str) -> Option<Option<ObjectRecord>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get(name) {
            Some(e) if e.expires > now => Some(e.record.clone()),
            Some(_) => {
                entries.pop(name);
                None
            }
            None => None,
        }
    }

    fn store(&self, name: &str, record: Option<ObjectRecord>) {
        if record.is_none() && !self.cache_negative {
            return;
        }
        let expires = self.clock.now() + self.ttl;
        self.entries
            .lock()
            .push(name.to_string(), CachedStat { record, expires });
    }

    fn forget(&self, name: &str) {
        self.entries.lock().pop(name);
    }
}

#[async_trait]
impl Bucket for CachingBucket {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn list_objects(&self, req: ListRequest) -> Result<Listing, StoreError> {
        self.inner.list_objects(req).await
    }

    async fn stat_object(&self, name: &str) -> Result<Option<ObjectRecord>, StoreError> {
        if let Some(hit) = self.cached(name) {
            return Ok(hit);
        }
        let record = self.inner.stat_object(name).await?;
        self.store(name, record.clone());
        Ok(record)
    }

    async fn create_object(&self, req: CreateRequest) -> Result<ObjectRecord, StoreError> {
        self.forget(&req.name);
        let record = self.inner.create_object(req).await?;
        self.store(&record.name, Some(record.clone()));
        Ok(record)
    }

    async fn update_object(
        &self,
        name: &str,
        changes: BTreeMap<String, Option<String>>,
    ) -> Result<ObjectRecord, StoreError> {
        self.forget(name);
        self.inner.update_object(name, changes).await
    }

    async fn copy_object(
        &self,
        src: &str,
        src_generation: i64,
        dst: &str,
    ) -> Result<ObjectRecord, StoreError> {
        self.forget(dst);
        self.inner.copy_object(src, src_generation, dst).await
    }

    async fn delete_object(&self, req: DeleteRequest) -> Result<(), StoreError> {
        self.forget(&req.name);
        self.inner.delete_object(req).await
    }

    async fn new_reader(
        &self,
        name: &str,
        generation: Option<i64>,
        range: Range<u64>,
    ) -> Result<ByteStream, StoreError> {
        self.inner.new_reader(name, generation, range).await
    }
}
