//! Per-handle readahead: classify each read, size and advance a window, and
//! schedule cache fills.
//!
//! The window heuristic follows the kernel readahead shape: a cold sequential
//! start opens a window, crossing the trigger point shifts it forward with a
//! doubled-or-quadrupled size, small forward gaps restart it in place, and
//! random or oversized reads bypass it entirely.
use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::bucket::{Bucket, StoreError};
use crate::cache::FolioCache;
use crate::error::Error;
use crate::pools::{FillState, Folio};
use crate::utils::{round_down, round_up};
use crate::workers::WorkerPool;

#[derive(Clone, Copy, Debug)]
pub struct ReadaheadConfig {
    pub page_size: u64,
    pub max_window: u64,
    pub merge_gap: u64,
}

/// Readahead window state of one open file handle.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReadaheadState {
    pub window_start: u64,
    pub window_end: u64,
    pub trigger_start: u64,
    pub prev_window_start: u64,
    pub prev_end_offset: u64,
    pub num_reads: u64,
}

fn intersects(a: &Range<u64>, b: &Range<u64>) -> bool {
    a.start < b.end && b.start < a.end
}

impl ReadaheadState {
    /// Scaled window size for a request or window of `s` bytes: quadruple
    /// small sizes, double mid sizes, cap at the maximum window.
    fn next_window_size(cfg: &ReadaheadConfig, s: u64) -> u64 {
        let p2 = s.next_power_of_two();
        let scaled = if s <= cfg.max_window / 16 {
            p2 * 4
        } else if s <= cfg.max_window / 4 {
            p2 * 2
        } else {
            cfg.max_window
        };
        round_up(scaled, cfg.page_size).min(round_up(cfg.max_window, cfg.page_size))
    }

    /// Classify the read, advance the window, and return the readahead hint.
    pub fn update(
        &mut self,
        cfg: &ReadaheadConfig,
        offset: u64,
        size: u64,
        file_size: u64,
    ) -> Range<u64> {
        let end = offset + size;
        let gap = offset.checked_sub(self.prev_end_offset);
        self.num_reads += 1;
        let request = offset..end;

        let mut hint_is_window = true;
        if size > cfg.max_window {
            // Oversized read: hint exactly the request, leave the window be.
            hint_is_window = false;
        } else if offset == 0 && self.num_reads == 1 {
            // Cold sequential start.
            self.window_start = 0;
            self.window_end = Self::next_window_size(cfg, size);
            self.trigger_start = self.window_end / 2;
            self.prev_window_start = 0;
        } else if intersects(&(self.trigger_start..self.window_end), &request) {
            // Crossed the trigger point: shift forward.
            self.prev_window_start = self.window_start;
            let next = Self::next_window_size(cfg, self.window_end - self.window_start);
            self.window_start = self.window_end;
            self.window_end = self.window_start + next;
            self.trigger_start = self.window_start;
        } else if intersects(&(self.prev_window_start..self.window_end), &request) {
            // Still consuming the current or previous window.
        } else if matches!(gap, Some(g) if g < cfg.merge_gap) {
            // Small forward gap: restart the window at the read.
            let base = end.saturating_sub(self.window_start).max(size);
            let next = Self::next_window_size(cfg, base);
            self.window_start = round_down(offset, cfg.page_size);
            self.window_end = self.window_start + next;
            self.trigger_start = self.window_start + (self.window_end - self.window_start) / 2;
            self.prev_window_start = self.window_start;
        } else {
            // Random access.
            hint_is_window = false;
        }

        if hint_is_window {
            if self.window_start >= file_size {
                self.window_start = 0;
                self.window_end = 0;
                self.trigger_start = 0;
                self.prev_window_start = 0;
            } else if self.window_end > file_size {
                self.window_end = round_up(file_size, cfg.page_size);
            }
            if self.trigger_start > self.window_end {
                self.trigger_start = self.window_end;
            }
        }
        self.prev_end_offset = end;

        if hint_is_window && self.window_end > self.window_start {
            self.window_start..self.window_end
        } else {
            request
        }
    }
}

/// Everything a fill needs from the mount.
#[derive(Clone)]
pub(crate) struct ReadEnv {
    pub cache: Arc<FolioCache>,
    pub workers: Arc<WorkerPool<FetchTask>>,
    pub bucket: Arc<dyn Bucket>,
    pub config: ReadaheadConfig,
}

/// Work item for the worker pool: fill one folio (priority, a reader is
/// waiting on it) or populate a readahead window (normal).
pub(crate) enum FetchTask {
    Fill(FillTask),
    Window(WindowTask),
}

pub(crate) struct FillTask {
    pub bucket: Arc<dyn Bucket>,
    pub folio: Arc<Folio>,
    pub name: String,
    pub generation: i64,
    pub object_size: u64,
    pub cancel: CancellationToken,
}

impl Drop for FillTask {
    fn drop(&mut self) {
        // A task dropped before it ran (queue teardown) must not wedge the
        // readers waiting on its folio. No-op once the folio is terminal.
        self.folio
            .fail(StoreError::Transient("fill task dropped".into()));
    }
}

pub(crate) struct WindowTask {
    pub bucket: Arc<dyn Bucket>,
    pub cache: Arc<FolioCache>,
    pub inode: u64,
    pub name: String,
    pub generation: i64,
    pub object_size: u64,
    pub range: Range<u64>,
    pub cancel: CancellationToken,
}

pub(crate) fn dispatch_fetch(task: FetchTask) -> BoxFuture<'static, ()> {
    Box::pin(task.run())
}

impl FetchTask {
    async fn run(self) {
        match self {
            FetchTask::Fill(t) => {
                if t.cancel.is_cancelled() {
                    t.folio.fail(StoreError::Transient("fill cancelled".into()));
                    return;
                }
                fill_folio(&t.bucket, &t.folio, &t.name, t.generation, t.object_size).await;
            }
            FetchTask::Window(t) => {
                if t.cancel.is_cancelled() {
                    return;
                }
                let got = match t.cache.get(t.inode, t.range.clone()) {
                    Ok(got) => got,
                    Err(e) => {
                        debug!(inode = t.inode, "skipping prefetch: {}", e);
                        return;
                    }
                };
                trace!(
                    inode = t.inode,
                    start = t.range.start,
                    end = t.range.end,
                    fresh = got.created.len(),
                    "prefetching window",
                );
                for folio in got.created {
                    if t.cancel.is_cancelled() {
                        folio.fail(StoreError::Transient("fill cancelled".into()));
                        continue;
                    }
                    fill_folio(&t.bucket, &folio, &t.name, t.generation, t.object_size).await;
                }
            }
        }
    }
}

/// Fails the folio if the fill future is dropped before finishing, so
/// waiters never hang on an abandoned fill.
struct FillGuard(Arc<Folio>);
impl Drop for FillGuard {
    fn drop(&mut self) {
        if matches!(self.0.state(), FillState::Filling) {
            self.0.fail(StoreError::Transient("fill interrupted".into()));
        }
    }
}

async fn fill_folio(
    bucket: &Arc<dyn Bucket>,
    folio: &Arc<Folio>,
    name: &str,
    generation: i64,
    object_size: u64,
) {
    let _guard = FillGuard(folio.clone());
    let range = folio.range();
    let end = range.end.min(object_size);
    if end <= range.start {
        folio.complete(0);
        return;
    }
    let expected = (end - range.start) as usize;
    let mut stream = match bucket
        .new_reader(name, Some(generation), range.start..end)
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            warn!(name, generation, "folio fill failed to open reader: {}", e);
            folio.fail(e);
            return;
        }
    };
    let mut filled = 0;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                if filled + chunk.len() > folio.len() {
                    folio.fail(StoreError::Transient("store returned excess data".into()));
                    return;
                }
                folio.write_at(filled, &chunk);
                filled += chunk.len();
            }
            Err(e) => {
                warn!(name, generation, "folio fill failed mid-stream: {}", e);
                folio.fail(e);
                return;
            }
        }
    }
    if filled < expected {
        folio.fail(StoreError::Transient("short read from store".into()));
    } else {
        folio.complete(filled);
    }
}

/// Per-open-file reader state; mutations are serialized by the handle lock.
pub(crate) struct CachedReader {
    inode: u64,
    name: String,
    generation: i64,
    pub(crate) state: ReadaheadState,
    cancel: CancellationToken,
}

impl CachedReader {
    pub(crate) fn new(inode: u64, name: String, generation: i64, cancel: CancellationToken) -> Self {
        Self {
            inode,
            name,
            generation,
            state: ReadaheadState::default(),
            cancel,
        }
    }

    /// Serve a read through the folio cache, scheduling downloads for cache
    /// misses and a prefetch for the readahead window. End of file is a
    /// short read, not an error.
    pub(crate) async fn read(
        &mut self,
        env: &ReadEnv,
        offset: u64,
        size: u64,
        file_size: u64,
    ) -> Result<Bytes, Error> {
        if size == 0 || offset >= file_size {
            return Ok(Bytes::new());
        }
        let size = size.min(file_size - offset);
        let end = offset + size;
        let page = env.config.page_size;
        let file_pages = round_up(file_size, page);

        let hint = self.state.update(&env.config, offset, size, file_size);
        let aligned = round_down(offset, page)..round_up(end, page).min(file_pages);
        let got = env.cache.get(self.inode, aligned)?;

        for folio in &got.created {
            let task = FetchTask::Fill(FillTask {
                bucket: env.bucket.clone(),
                folio: folio.clone(),
                name: self.name.clone(),
                generation: self.generation,
                object_size: file_size,
                cancel: self.cancel.child_token(),
            });
            if env.workers.schedule(true, task).is_err() {
                folio.fail(StoreError::Transient("worker pool stopped".into()));
            }
        }

        if hint.end > end {
            let window = round_down(hint.start, page)..round_up(hint.end, page).min(file_pages);
            if window.start < window.end {
                let task = FetchTask::Window(WindowTask {
                    bucket: env.bucket.clone(),
                    cache: env.cache.clone(),
                    inode: self.inode,
                    name: self.name.clone(),
                    generation: self.generation,
                    object_size: file_size,
                    range: window,
                    cancel: self.cancel.child_token(),
                });
                let _ = env.workers.schedule(false, task);
            }
        }

        let mut buf = vec![0u8; size as usize];
        for folio in &got.folios {
            let fr = folio.range();
            let i_start = fr.start.max(offset);
            let i_end = fr.end.min(end);
            if i_start >= i_end {
                continue;
            }
            let filled = folio.ready().await.map_err(|e| match e {
                // The pinned generation is gone: the object was clobbered.
                StoreError::NotFound => Error::Clobbered,
                e => Error::Store(e),
            })?;
            if fr.start + (filled as u64) < i_end {
                return Err(Error::Store(StoreError::Transient(
                    "folio shorter than the requested range".into(),
                )));
            }
            folio.read_at(
                (i_start - fr.start) as usize,
                &mut buf[(i_start - offset) as usize..(i_end - offset) as usize],
            );
        }
        Ok(buf.into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const PAGE: u64 = 4096;
    const MAX: u64 = 8 << 20;

    fn cfg() -> ReadaheadConfig {
        ReadaheadConfig {
            page_size: PAGE,
            max_window: MAX,
            merge_gap: 1 << 20,
        }
    }

    fn check_invariants(s: &ReadaheadState, file_size: u64) {
        if s.window_start == 0 && s.window_end == 0 {
            return;
        }
        assert!(s.trigger_start <= s.window_end);
        assert!(s.window_end <= round_up(file_size, PAGE));
        assert!(s.window_start <= s.trigger_start || s.trigger_start == s.window_end);
    }

    #[test]
    fn cold_sequential_start() {
        let mut s = ReadaheadState::default();
        let file = 4 << 20;
        let hint = s.update(&cfg(), 0, 65536, file);
        // 64 KiB quadruples to a 256 KiB window.
        assert_eq!((s.window_start, s.window_end), (0, 262144));
        assert_eq!(s.trigger_start, 131072);
        assert_eq!(hint, 0..262144);
        check_invariants(&s, file);
    }

    #[test]
    fn in_window_read_leaves_state() {
        let mut s = ReadaheadState::default();
        let file = 4 << 20;
        s.update(&cfg(), 0, 65536, file);
        let before = s;
        let hint = s.update(&cfg(), 65536, 65536, file);
        assert_eq!((s.window_start, s.window_end), (before.window_start, before.window_end));
        assert_eq!(hint, 0..262144);
        check_invariants(&s, file);
    }

    #[test]
    fn trigger_zone_shifts_forward() {
        let mut s = ReadaheadState::default();
        let file = 16 << 20;
        s.update(&cfg(), 0, 65536, file);
        let hint = s.update(&cfg(), 131072, 65536, file);
        // 256 KiB <= max/16, so the next window quadruples to 1 MiB.
        assert_eq!((s.window_start, s.window_end), (262144, 262144 + (1 << 20)));
        assert_eq!(s.trigger_start, 262144);
        assert_eq!(s.prev_window_start, 0);
        assert_eq!(hint, 262144..262144 + (1 << 20));
        check_invariants(&s, file);
    }

    #[test]
    fn adjacent_read_restarts_window() {
        let mut s = ReadaheadState::default();
        let file = 16 << 20;
        s.update(&cfg(), 0, 65536, file);
        // Past the window, but within the merge gap.
        let offset = 300_000;
        let hint = s.update(&cfg(), offset, 65536, file);
        assert_eq!(s.window_start, round_down(offset, PAGE));
        assert!(s.window_end > offset + 65536);
        assert_eq!(
            s.trigger_start,
            s.window_start + (s.window_end - s.window_start) / 2
        );
        assert_eq!(hint, s.window_start..s.window_end);
        check_invariants(&s, file);
    }

    #[test]
    fn random_read_bypasses() {
        let mut s = ReadaheadState::default();
        let file = 64 << 20;
        s.update(&cfg(), 0, 65536, file);
        let before = s;
        let hint = s.update(&cfg(), 32 << 20, 4096, file);
        assert_eq!((s.window_start, s.window_end), (before.window_start, before.window_end));
        assert_eq!(hint, (32 << 20)..(32 << 20) + 4096);
        assert_eq!(s.prev_end_offset, (32 << 20) + 4096);
    }

    #[test]
    fn oversized_read_bypasses() {
        let mut s = ReadaheadState::default();
        let file = 1 << 30;
        let hint = s.update(&cfg(), 0, MAX + 1, file);
        assert_eq!(hint, 0..MAX + 1);
        assert_eq!((s.window_start, s.window_end), (0, 0));
        assert_eq!(s.num_reads, 1);
        assert_eq!(s.prev_end_offset, MAX + 1);
    }

    #[test]
    fn window_scaling_boundaries() {
        let c = cfg();
        // At max/16: quadruple.
        assert_eq!(ReadaheadState::next_window_size(&c, MAX / 16), MAX / 4);
        // Just above max/16: double the rounded size.
        assert_eq!(
            ReadaheadState::next_window_size(&c, MAX / 16 + 1),
            (MAX / 16 + 1).next_power_of_two() * 2
        );
        // At max/4: double.
        assert_eq!(ReadaheadState::next_window_size(&c, MAX / 4), MAX / 2);
        // Above max/4: capped.
        assert_eq!(ReadaheadState::next_window_size(&c, MAX / 4 + 1), MAX);
        assert_eq!(ReadaheadState::next_window_size(&c, MAX), MAX);
    }

    #[test]
    fn clamped_to_file_size() {
        let mut s = ReadaheadState::default();
        let file = 100_000;
        s.update(&cfg(), 0, 65536, file);
        assert_eq!(s.window_end, round_up(file, PAGE));
        check_invariants(&s, file);

        // A window starting past the file resets to empty.
        let mut s = ReadaheadState {
            window_start: 200_000,
            window_end: 300_000,
            trigger_start: 250_000,
            prev_window_start: 200_000,
            prev_end_offset: 150_000,
            num_reads: 3,
        };
        s.update(&cfg(), 150_000, 4096, file);
        check_invariants(&s, file);
    }
}
