//! Shared LRU cache of folios, partitioned by inode.
//!
//! Entries for one inode are pairwise disjoint, page-aligned, and ordered by
//! offset. A request for a byte range returns a covering set of folios,
//! allocating fresh ones for any gaps; re-requesting a present region only
//! touches it, which is what makes concurrent fills idempotent.
use std::collections::BTreeMap;
use std::ops::Bound;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::*;

use crate::error::Error;
use crate::pools::{Folio, FolioPool};
use crate::utils::{round_down, round_up};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
}

/// Result of [`FolioCache::get`]: the covering folios in offset order, plus
/// the subset that was freshly allocated and still needs a fill scheduled.
pub struct GetResult {
    pub folios: Vec<Arc<Folio>>,
    pub created: Vec<Arc<Folio>>,
}

struct CacheInner {
    /// Per inode, `offset -> end` of each entry.
    by_inode: FxHashMap<u64, BTreeMap<u64, u64>>,
    /// Global recency order; key is `(inode, offset)`.
    recency: lru::LruCache<(u64, u64), Arc<Folio>>,
}

pub struct FolioCache {
    pool: Arc<FolioPool>,
    page_size: u64,
    /// 0 = unlimited.
    max_entries: usize,
    /// 0 = unlimited.
    max_bytes: u64,
    inner: Mutex<CacheInner>,
    // Mirrors of the counters, so `stats` does not take the lock.
    entries_count: AtomicUsize,
    bytes_count: AtomicU64,
}

/// Entries overlapping `[start, end)`, starting from the rightmost entry at
/// or before `start`.
fn overlapping(entries: &BTreeMap<u64, u64>, start: u64, end: u64) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    if let Some((&o, &e)) = entries.range(..=start).next_back() {
        if e > start {
            out.push((o, e));
        }
    }
    out.extend(
        entries
            .range((Bound::Excluded(start), Bound::Excluded(end)))
            .map(|(&o, &e)| (o, e)),
    );
    out
}

impl FolioCache {
    pub fn new(pool: Arc<FolioPool>, max_entries: usize, max_bytes: u64) -> Arc<Self> {
        let page_size = pool.page_size() as u64;
        Arc::new(Self {
            pool,
            page_size,
            max_entries,
            max_bytes,
            inner: Mutex::new(CacheInner {
                by_inode: FxHashMap::default(),
                recency: lru::LruCache::unbounded(),
            }),
            entries_count: AtomicUsize::new(0),
            bytes_count: AtomicU64::new(0),
        })
    }

    /// Return folios covering the page-aligned hull of `range`, creating and
    /// recording folios for gap regions. Existing folios are touched to the
    /// MRU end; failed folios are replaced by fresh ones.
    ///
    /// On allocation failure nothing new is inserted and the error surfaces;
    /// entries already touched keep their new recency position.
    pub fn get(&self, inode: u64, range: Range<u64>) -> Result<GetResult, Error> {
        let start = round_down(range.start, self.page_size);
        let end = round_up(range.end, self.page_size);
        if start >= end {
            return Ok(GetResult {
                folios: Vec::new(),
                created: Vec::new(),
            });
        }

        let mut inner = self.inner.lock();
        let CacheInner { by_inode, recency } = &mut *inner;

        let candidates = match by_inode.get(&inode) {
            Some(entries) => overlapping(entries, start, end),
            None => Vec::new(),
        };

        let mut result = GetResult {
            folios: Vec::new(),
            created: Vec::new(),
        };
        let mut cursor = start;
        let mut alloc_err = None;
        for (o, e) in candidates {
            match recency.get(&(inode, o)).cloned() {
                Some(folio) if !folio.is_failed() => {
                    if cursor < o {
                        if let Err(err) = self.fill_gap(inode, cursor..o.min(end), &mut result) {
                            alloc_err = Some(err);
                            break;
                        }
                    }
                    result.folios.push(folio);
                    cursor = cursor.max(e.min(end));
                }
                _ => {
                    // Dead entry; the gap allocation below covers its region
                    // with a fresh folio.
                    debug!(inode, offset = o, "replacing failed folio");
                    recency.pop(&(inode, o));
                    if let Some(entries) = by_inode.get_mut(&inode) {
                        if let Some(removed_end) = entries.remove(&o) {
                            self.entries_count.fetch_sub(1, Ordering::Relaxed);
                            self.bytes_count
                                .fetch_sub(removed_end - o, Ordering::Relaxed);
                        }
                    }
                }
            }
        }
        if alloc_err.is_none() && cursor < end {
            if let Err(err) = self.fill_gap(inode, cursor..end, &mut result) {
                alloc_err = Some(err);
            }
        }
        if let Some(err) = alloc_err {
            return Err(err);
        }

        // Record the new folios, MRU in creation order.
        let entries = by_inode.entry(inode).or_default();
        for folio in &result.created {
            let r = folio.range();
            entries.insert(r.start, r.end);
            recency.push((inode, r.start), folio.clone());
            self.entries_count.fetch_add(1, Ordering::Relaxed);
            self.bytes_count.fetch_add(r.end - r.start, Ordering::Relaxed);
        }

        self.evict(&mut inner);
        Ok(result)
    }

    fn fill_gap(&self, inode: u64, gap: Range<u64>, result: &mut GetResult) -> Result<(), Error> {
        let large = self.pool.large_size() as u64;
        let mut cursor = gap.start;
        while cursor < gap.end {
            // Split at size-class boundaries, larger class first.
            let boundary = round_down(cursor, large) + large;
            let chunk_end = gap.end.min(boundary);
            let folio = Folio::try_new(&self.pool, inode, cursor..chunk_end)?;
            result.folios.push(folio.clone());
            result.created.push(folio);
            cursor = chunk_end;
        }
        Ok(())
    }

    fn evict(&self, inner: &mut CacheInner) {
        loop {
            let over_entries = self.max_entries > 0
                && self.entries_count.load(Ordering::Relaxed) > self.max_entries;
            let over_bytes =
                self.max_bytes > 0 && self.bytes_count.load(Ordering::Relaxed) > self.max_bytes;
            if !over_entries && !over_bytes {
                return;
            }
            let Some(((inode, offset), folio)) = inner.recency.pop_lru() else {
                return;
            };
            let r = folio.range();
            trace!(inode, offset, "evicting folio");
            if let Some(entries) = inner.by_inode.get_mut(&inode) {
                entries.remove(&offset);
                if entries.is_empty() {
                    inner.by_inode.remove(&inode);
                }
            }
            self.entries_count.fetch_sub(1, Ordering::Relaxed);
            self.bytes_count.fetch_sub(r.end - r.start, Ordering::Relaxed);
        }
    }

    /// Remove all entries for an inode.
    pub fn invalidate(&self, inode: u64) {
        let mut inner = self.inner.lock();
        let Some(entries) = inner.by_inode.remove(&inode) else {
            return;
        };
        for (offset, end) in entries {
            inner.recency.pop(&(inode, offset));
            self.entries_count.fetch_sub(1, Ordering::Relaxed);
            self.bytes_count.fetch_sub(end - offset, Ordering::Relaxed);
        }
    }

    /// Remove the entries overlapping `range`.
    pub fn remove(&self, inode: u64, range: Range<u64>) {
        let start = round_down(range.start, self.page_size);
        let end = round_up(range.end, self.page_size);
        if start >= end {
            return;
        }
        let mut inner = self.inner.lock();
        let CacheInner { by_inode, recency } = &mut *inner;
        let Some(entries) = by_inode.get_mut(&inode) else {
            return;
        };
        for (o, e) in overlapping(entries, start, end) {
            entries.remove(&o);
            recency.pop(&(inode, o));
            self.entries_count.fetch_sub(1, Ordering::Relaxed);
            self.bytes_count.fetch_sub(e - o, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries_count.load(Ordering::Relaxed),
            bytes: self.bytes_count.load(Ordering::Relaxed),
        }
    }

    /// Whether `[range.start, range.end)` is fully covered by live entries.
    pub fn covers(&self, inode: u64, range: Range<u64>) -> bool {
        let inner = self.inner.lock();
        let Some(entries) = inner.by_inode.get(&inode) else {
            return range.is_empty();
        };
        let mut cursor = range.start;
        while cursor < range.end {
            match entries.range(..=cursor).next_back() {
                Some((_, &e)) if e > cursor => cursor = e,
                _ => return false,
            }
        }
        true
    }
}

impl std::fmt::Display for FolioCache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let stats = self.stats();
        write!(
            f,
            "Folio cache with {} entries, {} bytes",
            stats.entries, stats.bytes
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const PAGE: u64 = 4096;

    fn cache(max_entries: usize, max_bytes: u64) -> Arc<FolioCache> {
        let pool = FolioPool::new(PAGE as usize, PAGE as usize, 4 * PAGE as usize, 0).unwrap();
        FolioCache::new(pool, max_entries, max_bytes)
    }

    fn ranges(got: &GetResult) -> Vec<(u64, u64)> {
        got.folios
            .iter()
            .map(|f| (f.range().start, f.range().end))
            .collect()
    }

    #[test]
    fn get_creates_aligned_cover() {
        let c = cache(0, 0);
        let got = c.get(1, 100..PAGE + 1).unwrap();
        assert_eq!(ranges(&got), [(0, 2 * PAGE)]);
        assert_eq!(got.created.len(), 1);
        assert_eq!(
            c.stats(),
            CacheStats {
                entries: 1,
                bytes: 2 * PAGE
            }
        );
    }

    #[test]
    fn get_reuses_and_fills_gaps() {
        let c = cache(0, 0);
        let first = c.get(1, 0..PAGE).unwrap();
        assert_eq!(first.created.len(), 1);
        // Covers the old folio plus a fresh one for the gap.
        let second = c.get(1, 0..2 * PAGE).unwrap();
        assert_eq!(second.created.len(), 1);
        assert_eq!(ranges(&second), [(0, PAGE), (PAGE, 2 * PAGE)]);
        // Fully cached now.
        let third = c.get(1, 0..2 * PAGE).unwrap();
        assert!(third.created.is_empty());
    }

    #[test]
    fn gaps_split_at_class_boundaries() {
        let c = cache(0, 0);
        // [PAGE, 6*PAGE): the first chunk stops at the large-class boundary.
        let got = c.get(1, PAGE..6 * PAGE).unwrap();
        assert_eq!(ranges(&got), [(PAGE, 4 * PAGE), (4 * PAGE, 6 * PAGE)]);
    }

    #[test]
    fn entries_stay_disjoint() {
        let c = cache(0, 0);
        c.get(1, 0..3 * PAGE).unwrap();
        c.get(1, PAGE..5 * PAGE).unwrap();
        {
            let inner = c.inner.lock();
            let entries = inner.by_inode.get(&1).unwrap();
            let mut prev_end = 0;
            for (&o, &e) in entries.iter() {
                assert!(o >= prev_end);
                assert!(o % PAGE == 0 && e % PAGE == 0);
                prev_end = e;
            }
        }
        assert_eq!(c.stats().bytes, 5 * PAGE);
    }

    #[test]
    fn lru_eviction_by_count() {
        let c = cache(2, 0);
        c.get(1, 0..PAGE).unwrap();
        c.get(1, PAGE..2 * PAGE).unwrap();
        // Touch the first entry so the middle one is the LRU.
        c.get(1, 0..PAGE).unwrap();
        c.get(1, 2 * PAGE..3 * PAGE).unwrap();
        assert_eq!(c.stats().entries, 2);
        assert!(c.covers(1, 0..PAGE));
        assert!(!c.covers(1, PAGE..2 * PAGE));
        assert!(c.covers(1, 2 * PAGE..3 * PAGE));
    }

    #[test]
    fn lru_eviction_by_bytes() {
        let c = cache(0, 2 * PAGE);
        c.get(1, 0..PAGE).unwrap();
        c.get(2, 0..PAGE).unwrap();
        c.get(3, 0..PAGE).unwrap();
        assert_eq!(c.stats().bytes, 2 * PAGE);
        assert!(!c.covers(1, 0..PAGE));
        assert!(c.covers(3, 0..PAGE));
    }

    #[test]
    fn invalidate_and_remove() {
        let c = cache(0, 0);
        c.get(1, 0..2 * PAGE).unwrap();
        c.get(2, 0..PAGE).unwrap();
        c.invalidate(1);
        assert!(!c.covers(1, 0..PAGE));
        assert!(c.covers(2, 0..PAGE));
        c.remove(2, 0..1);
        assert_eq!(c.stats(), CacheStats::default());
    }

    #[test]
    fn failed_folios_are_replaced() {
        let c = cache(0, 0);
        let got = c.get(1, 0..PAGE).unwrap();
        got.created[0].fail(crate::bucket::StoreError::NotFound);
        let again = c.get(1, 0..PAGE).unwrap();
        assert_eq!(again.created.len(), 1);
        assert!(!again.created[0].is_failed());
        assert_eq!(c.stats().entries, 1);
    }

    #[test]
    fn pool_exhaustion_surfaces_without_insertion() {
        let pool =
            FolioPool::new(PAGE as usize, PAGE as usize, 4 * PAGE as usize, PAGE as usize).unwrap();
        let c = FolioCache::new(pool, 0, 0);
        let held = c.get(1, 0..PAGE).unwrap();
        assert!(matches!(c.get(1, PAGE..2 * PAGE), Err(Error::PoolExhausted)));
        assert_eq!(c.stats().entries, 1);
        drop(held);
    }
}
