//! Decorator scoping a mount to a subtree of the bucket.
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use async_trait::async_trait;

use super::{
    Bucket, ByteStream, CreateRequest, DeleteRequest, ListRequest, Listing, ObjectRecord,
    StoreError,
};

pub struct PrefixBucket {
    inner: Arc<dyn Bucket>,
    prefix: String,
}

impl PrefixBucket {
    /// `prefix` is a directory path; a trailing slash is appended if missing.
    pub fn new(inner: Arc<dyn Bucket>, prefix: &str) -> Arc<Self> {
        let mut prefix = prefix.to_string();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        Arc::new(Self { inner, prefix })
    }

    fn qualify(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn strip(&self, name: &str) -> String {
        name.strip_prefix(&self.prefix).unwrap_or(name).to_string()
    }
}

#[async_trait]
impl Bucket for PrefixBucket {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn list_objects(&self, mut req: ListRequest) -> Result<Listing, StoreError> {
        req.prefix = self.qualify(&req.prefix);
        let mut listing = self.inner.list_objects(req).await?;
        for o in &mut listing.objects {
            o.name = self.strip(&o.name);
        }
        for p in &mut listing.prefixes {
            *p = self.strip(p);
        }
        Ok(listing)
    }

    async fn stat_object(&self, name: &str) -> Result<Option<ObjectRecord>, StoreError> {
        let mut record = self.inner.stat_object(&self.qualify(name)).await?;
        if let Some(r) = &mut record {
            r.name = self.strip(&r.name);
        }
        Ok(record)
    }

    async fn create_object(&self, mut req: CreateRequest) -> Result<ObjectRecord, StoreError> {
        req.name = self.qualify(&req.name);
        let mut record = self.inner.create_object(req).await?;
        record.name = self.strip(&record.name);
        Ok(record)
    }

    async fn update_object(
        &self,
        name: &str,
        changes: BTreeMap<String, Option<String>>,
    ) -> Result<ObjectRecord, StoreError> {
        let mut record = self.inner.update_object(&self.qualify(name), changes).await?;
        record.name = self.strip(&record.name);
        Ok(record)
    }

    async fn copy_object(
        &self,
        src: &str,
        src_generation: i64,
        dst: &str,
    ) -> Result<ObjectRecord, StoreError> {
        let mut record = self
            .inner
            .copy_object(&self.qualify(src), src_generation, &self.qualify(dst))
            .await?;
        record.name = self.strip(&record.name);
        Ok(record)
    }

    async fn delete_object(&self, mut req: DeleteRequest) -> Result<(), StoreError> {
        req.name = self.qualify(&req.name);
        self.inner.delete_object(req).await
    }

    async fn new_reader(
        &self,
        name: &str,
        generation: Option<i64>,
        range: Range<u64>,
    ) -> Result<ByteStream, StoreError> {
        self.inner
            .new_reader(&self.qualify(name), generation, range)
            .await
    }
}

#[cfg(test)]
mod test {
    use super::super::MemBucket;
    use super::*;

    #[tokio::test]
    async fn scopes_names() {
        let inner = MemBucket::new("test");
        inner.put("sub/a", "1");
        inner.put("other/b", "2");
        let scoped = PrefixBucket::new(inner.clone(), "sub");

        let l = scoped.list_objects(ListRequest::default()).await.unwrap();
        assert_eq!(l.objects.len(), 1);
        assert_eq!(l.objects[0].name, "a");

        assert!(scoped.stat_object("a").await.unwrap().is_some());
        assert!(scoped.stat_object("other/b").await.unwrap().is_none());

        scoped
            .create_object(CreateRequest::new("c").contents("3"))
            .await
            .unwrap();
        assert!(inner.contains("sub/c"));
    }
}
