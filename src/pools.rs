//! Folio pool, used when reading data through the cache.
//!
//! A folio is a page-aligned byte region of a file, the unit of caching and
//! prefetch. Buffers come from a tiered pool with two size classes: a large
//! class for aligned readahead chunks and a small class for residuals.
//! Buffers are reused through per-class free lists; a folio returns its
//! buffer when the last reference drops.
use std::ops::Range;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tokio::sync::watch;

use crate::bucket::StoreError;
use crate::error::Error;

/// Heap buffer whose start address is aligned to the page size.
pub struct AlignedBuf {
    ptr: std::ptr::NonNull<u8>,
    capacity: usize,
    align: usize,
}

// The buffer is uniquely owned; sharing happens behind the folio mutex.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    fn new(capacity: usize, align: usize) -> Self {
        let layout = std::alloc::Layout::from_size_align(capacity, align)
            .expect("pool validates the size classes");
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let Some(ptr) = std::ptr::NonNull::new(ptr) else {
            std::alloc::handle_alloc_error(layout);
        };
        Self {
            ptr,
            capacity,
            align,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.capacity) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        let layout = std::alloc::Layout::from_size_align(self.capacity, self.align)
            .expect("layout was valid at allocation");
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
    }
}

struct PoolState {
    free_small: Vec<AlignedBuf>,
    free_large: Vec<AlignedBuf>,
    /// All live buffer bytes, free-listed or handed out.
    total_bytes: usize,
}

/// Tiered pool of [`AlignedBuf`]s.
pub struct FolioPool {
    page_size: usize,
    small_size: usize,
    large_size: usize,
    /// 0 = unbounded.
    max_bytes: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl FolioPool {
    pub fn new(
        page_size: usize,
        small_size: usize,
        large_size: usize,
        max_bytes: usize,
    ) -> Result<Arc<Self>, Error> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(Error::InvalidOptions("page size must be a power of two"));
        }
        if small_size == 0 || small_size % page_size != 0 || large_size % page_size != 0 {
            return Err(Error::InvalidOptions(
                "folio size classes must be multiples of the page size",
            ));
        }
        if small_size > large_size {
            return Err(Error::InvalidOptions(
                "the small folio class cannot exceed the large class",
            ));
        }
        Ok(Arc::new(Self {
            page_size,
            small_size,
            large_size,
            max_bytes,
            state: Mutex::new(PoolState {
                free_small: Vec::new(),
                free_large: Vec::new(),
                total_bytes: 0,
            }),
            available: Condvar::new(),
        }))
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }
    pub fn small_size(&self) -> usize {
        self.small_size
    }
    pub fn large_size(&self) -> usize {
        self.large_size
    }

    fn class_size(&self, size: usize) -> Result<usize, Error> {
        if size <= self.small_size {
            Ok(self.small_size)
        } else if size <= self.large_size {
            Ok(self.large_size)
        } else {
            Err(Error::InvalidArgument("folio larger than the largest class"))
        }
    }

    /// Allocate a buffer of at least `size` bytes, failing with
    /// [`Error::PoolExhausted`] when the byte budget is spent.
    pub fn try_allocate(&self, size: usize) -> Result<AlignedBuf, Error> {
        let class = self.class_size(size)?;
        let mut state = self.state.lock();
        self.try_allocate_locked(&mut state, class)
    }

    /// Allocate a buffer of at least `size` bytes, blocking until capacity is
    /// available. Must not be called while holding a lock the releasing path
    /// needs.
    pub fn allocate(&self, size: usize) -> Result<AlignedBuf, Error> {
        let class = self.class_size(size)?;
        let mut state = self.state.lock();
        loop {
            match self.try_allocate_locked(&mut state, class) {
                Err(Error::PoolExhausted) => self.available.wait(&mut state),
                other => return other,
            }
        }
    }

    fn try_allocate_locked(&self, state: &mut PoolState, class: usize) -> Result<AlignedBuf, Error> {
        let free = if class == self.small_size {
            &mut state.free_small
        } else {
            &mut state.free_large
        };
        if let Some(buf) = free.pop() {
            return Ok(buf);
        }
        if self.max_bytes > 0 {
            // Shed idle buffers of the other class before giving up.
            while state.total_bytes + class > self.max_bytes {
                let other = if class == self.small_size {
                    &mut state.free_large
                } else {
                    &mut state.free_small
                };
                match other.pop() {
                    Some(buf) => state.total_bytes -= buf.capacity(),
                    None => return Err(Error::PoolExhausted),
                }
            }
        }
        state.total_bytes += class;
        Ok(AlignedBuf::new(class, self.page_size))
    }

    /// Return a buffer to its free list. Never blocks.
    pub fn release(&self, buf: AlignedBuf) {
        let mut state = self.state.lock();
        if buf.capacity() == self.small_size {
            state.free_small.push(buf);
        } else {
            state.free_large.push(buf);
        }
        drop(state);
        self.available.notify_one();
    }

    pub fn total_bytes(&self) -> usize {
        self.state.lock().total_bytes
    }
}

/// Fill progress of a folio. Immutable after leaving `Filling`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FillState {
    Filling,
    /// Bytes actually filled, `<=` the folio length (short at end of file).
    Ready(usize),
    Failed(StoreError),
}

/// A page-aligned byte region `[start, end)` of one inode's data.
pub struct Folio {
    inode: u64,
    range: Range<u64>,
    buf: Mutex<Option<AlignedBuf>>,
    state_tx: watch::Sender<FillState>,
    pool: Arc<FolioPool>,
}

impl Folio {
    pub fn try_new(pool: &Arc<FolioPool>, inode: u64, range: Range<u64>) -> Result<Arc<Self>, Error> {
        let size = (range.end - range.start) as usize;
        let buf = pool.try_allocate(size)?;
        let (state_tx, _) = watch::channel(FillState::Filling);
        Ok(Arc::new(Self {
            inode,
            range,
            buf: Mutex::new(Some(buf)),
            state_tx,
            pool: pool.clone(),
        }))
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn range(&self) -> Range<u64> {
        self.range.clone()
    }

    pub fn len(&self) -> usize {
        (self.range.end - self.range.start) as usize
    }

    pub fn state(&self) -> FillState {
        self.state_tx.borrow().clone()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state(), FillState::Failed(_))
    }

    /// Copy `data` into the folio at `offset` (relative to the folio start).
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        let mut buf = self.buf.lock();
        let buf = buf.as_mut().expect("buffer only taken on drop");
        buf.as_mut_slice()[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Copy `dst.len()` bytes out from `offset` (relative to the folio start).
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) {
        let buf = self.buf.lock();
        let buf = buf.as_ref().expect("buffer only taken on drop");
        dst.copy_from_slice(&buf.as_slice()[offset..offset + dst.len()]);
    }

    pub fn complete(&self, len: usize) {
        self.state_tx.send_if_modified(|s| {
            if matches!(s, FillState::Filling) {
                *s = FillState::Ready(len);
                true
            } else {
                false
            }
        });
    }

    pub fn fail(&self, e: StoreError) {
        self.state_tx.send_if_modified(|s| {
            if matches!(s, FillState::Filling) {
                *s = FillState::Failed(e);
                true
            } else {
                false
            }
        });
    }

    /// Wait until the fill task succeeds or fails; returns the filled length.
    pub async fn ready(&self) -> Result<usize, StoreError> {
        let mut rx = self.state_tx.subscribe();
        loop {
            match &*rx.borrow_and_update() {
                FillState::Ready(len) => return Ok(*len),
                FillState::Failed(e) => return Err(e.clone()),
                FillState::Filling => {}
            }
            if rx.changed().await.is_err() {
                return Err(StoreError::Transient("folio fill abandoned".into()));
            }
        }
    }
}

impl Drop for Folio {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.lock().take() {
            self.pool.release(buf);
        }
    }
}

impl std::fmt::Debug for Folio {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Folio(inode {}, [{}, {}), {:?})",
            self.inode,
            self.range.start,
            self.range.end,
            self.state()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const PAGE: usize = 4096;

    #[test]
    fn alignment_and_reuse() {
        let pool = FolioPool::new(PAGE, PAGE, 4 * PAGE, 0).unwrap();
        let buf = pool.try_allocate(10).unwrap();
        assert_eq!(buf.capacity(), PAGE);
        assert_eq!(buf.as_slice().as_ptr() as usize % PAGE, 0);
        assert_eq!(pool.total_bytes(), PAGE);
        pool.release(buf);
        let _again = pool.try_allocate(PAGE).unwrap();
        // Served from the free list, not a fresh allocation.
        assert_eq!(pool.total_bytes(), PAGE);
    }

    #[test]
    fn classes() {
        let pool = FolioPool::new(PAGE, PAGE, 4 * PAGE, 0).unwrap();
        assert_eq!(pool.try_allocate(PAGE + 1).unwrap().capacity(), 4 * PAGE);
        assert!(pool.try_allocate(5 * PAGE).is_err());
    }

    #[test]
    fn budget() {
        let pool = FolioPool::new(PAGE, PAGE, 4 * PAGE, 2 * PAGE).unwrap();
        let a = pool.try_allocate(PAGE).unwrap();
        let _b = pool.try_allocate(PAGE).unwrap();
        assert!(matches!(
            pool.try_allocate(PAGE),
            Err(Error::PoolExhausted)
        ));
        pool.release(a);
        assert!(pool.try_allocate(PAGE).is_ok());
    }

    #[test]
    fn invalid_configurations() {
        assert!(FolioPool::new(1000, 1000, 2000, 0).is_err());
        assert!(FolioPool::new(PAGE, 2 * PAGE, PAGE, 0).is_err());
        assert!(FolioPool::new(PAGE, PAGE - 1, PAGE, 0).is_err());
    }

    #[tokio::test]
    async fn folio_lifecycle() {
        let pool = FolioPool::new(PAGE, PAGE, 4 * PAGE, 0).unwrap();
        let folio = Folio::try_new(&pool, 7, 0..PAGE as u64).unwrap();
        assert_eq!(folio.state(), FillState::Filling);
        folio.write_at(0, b"hello");
        folio.complete(5);
        assert_eq!(folio.ready().await.unwrap(), 5);
        // Terminal states do not regress.
        folio.fail(StoreError::NotFound);
        assert_eq!(folio.state(), FillState::Ready(5));
        let mut out = [0u8; 5];
        folio.read_at(0, &mut out);
        assert_eq!(&out, b"hello");
        drop(folio);
        assert_eq!(pool.total_bytes(), PAGE);
    }
}
