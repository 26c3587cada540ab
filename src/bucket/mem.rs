//! In-memory bucket, with the same pagination and precondition semantics as
//! a remote store. Listing pages are capped at `page_size` entries so tests
//! can exercise the multi-page paths.
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use super::{
    Bucket, ByteStream, CreateRequest, DeleteRequest, ListRequest, Listing, ObjectRecord,
    StoreError,
};

const DEFAULT_PAGE_SIZE: usize = 1000;
const READER_CHUNK: usize = 128 * 1024;

struct Stored {
    data: Bytes,
    generation: i64,
    meta_generation: i64,
    content_type: String,
    metadata: BTreeMap<String, String>,
    updated_at: SystemTime,
}

#[derive(Default)]
struct Counters {
    reads: u64,
    lists: u64,
}

struct State {
    objects: BTreeMap<String, Stored>,
    next_generation: i64,
    inject_listing_error: Option<StoreError>,
    counters: Counters,
}

pub struct MemBucket {
    name: String,
    page_size: usize,
    state: parking_lot::Mutex<State>,
}

impl MemBucket {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_page_size(name, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(name: impl Into<String>, page_size: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            page_size: page_size.max(1),
            state: parking_lot::Mutex::new(State {
                objects: BTreeMap::new(),
                next_generation: 1,
                inject_listing_error: None,
                counters: Counters::default(),
            }),
        })
    }

    /// Insert or overwrite an object, bumping the generation. Returns the new
    /// generation.
    pub fn put(&self, name: &str, contents: impl Into<Bytes>) -> i64 {
        self.put_with_metadata(name, contents, BTreeMap::new())
    }

    pub fn put_with_metadata(
        &self,
        name: &str,
        contents: impl Into<Bytes>,
        metadata: BTreeMap<String, String>,
    ) -> i64 {
        let mut st = self.state.lock();
        let generation = st.next_generation;
        st.next_generation += 1;
        st.objects.insert(
            name.into(),
            Stored {
                data: contents.into(),
                generation,
                meta_generation: 1,
                content_type: String::new(),
                metadata,
                updated_at: SystemTime::now(),
            },
        );
        generation
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().objects.contains_key(name)
    }

    /// Fail the next `list_objects` call with the given error.
    pub fn inject_listing_error(&self, e: StoreError) {
        self.state.lock().inject_listing_error = Some(e);
    }

    /// Number of `new_reader` calls served so far.
    pub fn reads(&self) -> u64 {
        self.state.lock().counters.reads
    }

    pub fn lists(&self) -> u64 {
        self.state.lock().counters.lists
    }

    fn record(name: &str, s: &Stored) -> ObjectRecord {
        ObjectRecord {
            name: name.into(),
            generation: s.generation,
            meta_generation: s.meta_generation,
            size: s.data.len() as u64,
            content_type: s.content_type.clone(),
            metadata: s.metadata.clone(),
            updated_at: s.updated_at,
        }
    }
}

/// Smallest key strictly greater than every key starting with `prefix`.
/// The last character is always the ASCII delimiter, so incrementing it is
/// sound.
fn prefix_successor(prefix: &str) -> String {
    let mut bytes = prefix.as_bytes().to_vec();
    let last = bytes.pop().expect("prefix is never empty here");
    bytes.push(last + 1);
    String::from_utf8(bytes).expect("ASCII increment keeps UTF-8 valid")
}

/// Smallest key strictly greater than `key`.
fn key_successor(key: &str) -> String {
    let mut s = key.to_string();
    s.push('\0');
    s
}

#[async_trait]
impl Bucket for MemBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_objects(&self, req: ListRequest) -> Result<Listing, StoreError> {
        let mut st = self.state.lock();
        st.counters.lists += 1;
        if let Some(e) = st.inject_listing_error.take() {
            return Err(e);
        }

        let limit = req
            .max_results
            .unwrap_or(usize::MAX)
            .clamp(1, self.page_size);
        let mut out = Listing::default();
        let mut cursor = req.continuation.clone().unwrap_or_else(|| req.prefix.clone());
        loop {
            let Some((key, stored)) = st
                .objects
                .range(cursor.clone()..)
                .next()
                .map(|(k, v)| (k.clone(), v))
            else {
                break;
            };
            if !key.starts_with(&req.prefix) {
                break;
            }
            if out.objects.len() + out.prefixes.len() >= limit {
                out.continuation = Some(key);
                break;
            }
            let rest = &key[req.prefix.len()..];
            match req.delimiter.and_then(|d| rest.find(d)) {
                Some(i) => {
                    let collapsed = format!("{}{}", req.prefix, &rest[..=i]);
                    cursor = prefix_successor(&collapsed);
                    out.prefixes.push(collapsed);
                }
                None => {
                    out.objects.push(Self::record(&key, stored));
                    cursor = key_successor(&key);
                }
            }
        }
        Ok(out)
    }

    async fn stat_object(&self, name: &str) -> Result<Option<ObjectRecord>, StoreError> {
        let st = self.state.lock();
        Ok(st.objects.get(name).map(|s| Self::record(name, s)))
    }

    async fn create_object(&self, req: CreateRequest) -> Result<ObjectRecord, StoreError> {
        let mut st = self.state.lock();
        let existing = st.objects.get(&req.name).map(|s| s.generation);
        match req.if_generation_match {
            Some(0) if existing.is_some() => return Err(StoreError::PreconditionFailed),
            Some(g) if g != 0 && existing != Some(g) => {
                return Err(StoreError::PreconditionFailed)
            }
            _ => {}
        }
        let generation = st.next_generation;
        st.next_generation += 1;
        st.objects.insert(
            req.name.clone(),
            Stored {
                data: req.contents,
                generation,
                meta_generation: 1,
                content_type: req.content_type.unwrap_or_default(),
                metadata: req.metadata,
                updated_at: SystemTime::now(),
            },
        );
        Ok(Self::record(&req.name, &st.objects[&req.name]))
    }

    async fn update_object(
        &self,
        name: &str,
        changes: BTreeMap<String, Option<String>>,
    ) -> Result<ObjectRecord, StoreError> {
        let mut st = self.state.lock();
        let stored = st.objects.get_mut(name).ok_or(StoreError::NotFound)?;
        for (k, v) in changes {
            match v {
                Some(v) => {
                    stored.metadata.insert(k, v);
                }
                None => {
                    stored.metadata.remove(&k);
                }
            }
        }
        stored.meta_generation += 1;
        stored.updated_at = SystemTime::now();
        Ok(Self::record(name, stored))
    }

    async fn copy_object(
        &self,
        src: &str,
        src_generation: i64,
        dst: &str,
    ) -> Result<ObjectRecord, StoreError> {
        let mut st = self.state.lock();
        let source = st.objects.get(src).ok_or(StoreError::NotFound)?;
        if source.generation != src_generation {
            return Err(StoreError::NotFound);
        }
        let copied = Stored {
            data: source.data.clone(),
            generation: 0,
            meta_generation: 1,
            content_type: source.content_type.clone(),
            metadata: source.metadata.clone(),
            updated_at: SystemTime::now(),
        };
        let generation = st.next_generation;
        st.next_generation += 1;
        st.objects.insert(
            dst.into(),
            Stored {
                generation,
                ..copied
            },
        );
        Ok(Self::record(dst, &st.objects[dst]))
    }

    async fn delete_object(&self, req: DeleteRequest) -> Result<(), StoreError> {
        let mut st = self.state.lock();
        let stored = st.objects.get(&req.name).ok_or(StoreError::NotFound)?;
        if let Some(g) = req.generation {
            if stored.generation != g {
                return Err(StoreError::PreconditionFailed);
            }
        }
        if let Some(mg) = req.meta_generation {
            if stored.meta_generation != mg {
                return Err(StoreError::PreconditionFailed);
            }
        }
        st.objects.remove(&req.name);
        Ok(())
    }

    async fn new_reader(
        &self,
        name: &str,
        generation: Option<i64>,
        range: Range<u64>,
    ) -> Result<ByteStream, StoreError> {
        let data = {
            let mut st = self.state.lock();
            st.counters.reads += 1;
            let stored = st.objects.get(name).ok_or(StoreError::NotFound)?;
            if let Some(g) = generation {
                if stored.generation != g {
                    return Err(StoreError::NotFound);
                }
            }
            let start = (range.start as usize).min(stored.data.len());
            let end = (range.end as usize).min(stored.data.len());
            stored.data.slice(start..end)
        };
        let stream = async_stream::stream! {
            let mut off = 0;
            while off < data.len() {
                let end = (off + READER_CHUNK).min(data.len());
                yield Ok(data.slice(off..end));
                off = end;
            }
        };
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn names(l: &Listing) -> Vec<String> {
        l.objects
            .iter()
            .map(|o| o.name.clone())
            .chain(l.prefixes.iter().cloned())
            .collect()
    }

    #[tokio::test]
    async fn listing_collapses_prefixes() {
        let b = MemBucket::new("test");
        for n in ["a", "d/x", "d/y", "e"] {
            b.put(n, "");
        }
        let l = b
            .list_objects(ListRequest {
                delimiter: Some('/'),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(
            l.objects.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(),
            ["a", "e"]
        );
        assert_eq!(l.prefixes, ["d/"]);
        assert!(l.continuation.is_none());
    }

    #[tokio::test]
    async fn listing_paginates() {
        let b = MemBucket::with_page_size("test", 2);
        for n in ["a", "b", "c/x", "d"] {
            b.put(n, "");
        }
        let mut seen = vec![];
        let mut continuation = None;
        loop {
            let l = b
                .list_objects(ListRequest {
                    delimiter: Some('/'),
                    continuation: continuation.take(),
                    ..Default::default()
                })
                .await
                .unwrap();
            seen.extend(names(&l));
            match l.continuation {
                Some(c) => continuation = Some(c),
                None => break,
            }
        }
        assert_eq!(seen, ["a", "b", "c/", "d"]);
    }

    #[tokio::test]
    async fn preconditions() {
        let b = MemBucket::new("test");
        let g = b.put("x", "one");
        let err = b
            .create_object(CreateRequest::new("x").if_not_exists())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::PreconditionFailed);
        let err = b
            .delete_object(DeleteRequest::new("x").generation(g + 1))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::PreconditionFailed);
        b.delete_object(DeleteRequest::new("x").generation(g))
            .await
            .unwrap();
        assert!(!b.contains("x"));
    }

    #[tokio::test]
    async fn pinned_reader_misses_replaced_generation() {
        let b = MemBucket::new("test");
        let g1 = b.put("x", "old");
        b.put("x", "new");
        let err = match b.new_reader("x", Some(g1), 0..3).await {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err, StoreError::NotFound);
    }
}
