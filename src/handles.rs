//! File and directory handles.
//!
//! A file handle owns the per-open readahead reader; a directory handle owns
//! a streaming listing produced by an asynchronous lister task. Handle ids
//! are monotonic and never reused.
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::bucket::{Bucket, ListRequest, StoreError};
use crate::error::Error;
use crate::inodes::{Inode, InodeId, LISTING_SENTINEL_INODE_ID};
use crate::names::CONFLICT_SUFFIX;
use crate::readahead::CachedReader;

/// Page-fetch retries for a listing that has not emitted anything yet.
const LISTER_RETRIES: usize = 3;

pub struct FileHandle {
    pub id: u64,
    pub inode: Arc<Inode>,
    pub(crate) reader: tokio::sync::Mutex<CachedReader>,
    /// Reads in flight on this handle, for diagnostics.
    pub io_depth: AtomicU64,
    cancel: CancellationToken,
}

impl FileHandle {
    fn new(id: u64, inode: Arc<Inode>, generation: i64) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let reader = CachedReader::new(
            inode.id,
            inode.name.object_name().to_string(),
            generation,
            cancel.clone(),
        );
        Arc::new(Self {
            id,
            inode,
            reader: tokio::sync::Mutex::new(reader),
            io_depth: AtomicU64::new(0),
            cancel,
        })
    }

    /// Tear down outstanding fills; they observe the cancellation at the
    /// next opportunity.
    pub(crate) fn release(&self) {
        self.cancel.cancel();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirentKind {
    File,
    Dir,
    Symlink,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    /// Base name, possibly carrying the conflict suffix.
    pub name: String,
    pub kind: DirentKind,
    /// 1-based, contiguous.
    pub offset: u64,
    pub inode_id: InodeId,
}

pub(crate) struct ListingState {
    pub entries: Vec<DirEntry>,
    pub fetch_complete: bool,
    pub error: Option<StoreError>,
    /// Bumped on every reset so a superseded lister discards its output.
    pub epoch: u64,
}

pub struct DirHandle {
    pub id: u64,
    pub inode: Arc<Inode>,
    pub(crate) state: tokio::sync::Mutex<ListingState>,
    wake_tx: watch::Sender<u64>,
    cancel: CancellationToken,
    lister: parking_lot::Mutex<Option<(CancellationToken, tokio::task::JoinHandle<()>)>>,
}

impl DirHandle {
    fn new(id: u64, inode: Arc<Inode>) -> Arc<Self> {
        let (wake_tx, _) = watch::channel(0);
        Arc::new(Self {
            id,
            inode,
            state: tokio::sync::Mutex::new(ListingState {
                entries: Vec::new(),
                fetch_complete: false,
                error: None,
                epoch: 0,
            }),
            wake_tx,
            cancel: CancellationToken::new(),
            lister: parking_lot::Mutex::new(None),
        })
    }

    fn wake(&self) {
        self.wake_tx.send_modify(|v| *v += 1);
    }

    /// Reset the listing and spawn a fresh lister for it.
    pub(crate) async fn restart_listing(self: &Arc<Self>, bucket: Arc<dyn Bucket>) {
        if let Some((token, task)) = self.lister.lock().take() {
            token.cancel();
            task.abort();
        }
        let epoch = {
            let mut st = self.state.lock().await;
            st.entries.clear();
            st.fetch_complete = false;
            st.error = None;
            st.epoch += 1;
            st.epoch
        };
        let token = self.cancel.child_token();
        let task = tokio::spawn(run_lister(self.clone(), bucket, epoch, token.clone()));
        *self.lister.lock() = Some((token, task));
    }

    /// Serve entries from `offset` once they exist, waiting on the lister
    /// when the listing has not caught up yet.
    pub(crate) async fn read(self: &Arc<Self>, offset: u64) -> Result<Vec<DirEntry>, Error> {
        let mut rx = self.wake_tx.subscribe();
        loop {
            {
                let st = self.state.lock().await;
                let len = st.entries.len() as u64;
                if offset > len && st.fetch_complete {
                    return Err(Error::InvalidArgument("readdir offset past the end"));
                }
                if offset < len || st.fetch_complete {
                    return Ok(st.entries[offset as usize..].to_vec());
                }
                if let Some(e) = &st.error {
                    return Err(Error::Store(e.clone()));
                }
            }
            if rx.changed().await.is_err() {
                return Err(Error::Store(StoreError::Transient(
                    "listing abandoned".into(),
                )));
            }
        }
    }

    pub(crate) fn release(&self) {
        self.cancel.cancel();
        if let Some((token, task)) = self.lister.lock().take() {
            token.cancel();
            task.abort();
        }
    }
}

struct RawEntry {
    base: String,
    kind: DirentKind,
}

fn sort_batch(batch: &mut [RawEntry]) {
    // Directories first among equal base names, so conflict resolution
    // renames the file and the final order is `foo` < `foo\n`.
    batch.sort_by(|a, b| {
        a.base
            .cmp(&b.base)
            .then_with(|| (b.kind == DirentKind::Dir).cmp(&(a.kind == DirentKind::Dir)))
    });
}

/// Append the conflict suffix to the non-directory of any adjacent pair
/// sharing a base name.
fn resolve_conflicts(batch: &mut [RawEntry]) {
    for i in 1..batch.len() {
        if batch[i].base == batch[i - 1].base {
            debug_assert!(batch[i - 1].kind == DirentKind::Dir);
            debug_assert!(batch[i].kind != DirentKind::Dir);
            batch[i].base.push(CONFLICT_SUFFIX);
        }
    }
}

/// Stream paginated batches into the handle's entry sequence. The last entry
/// of every non-final batch is held back, because it may collide with the
/// first entry of the next page.
async fn run_lister(
    handle: Arc<DirHandle>,
    bucket: Arc<dyn Bucket>,
    epoch: u64,
    cancel: CancellationToken,
) {
    let prefix = handle.inode.name.object_name().to_string();
    let mut continuation: Option<String> = None;
    let mut tail: Option<RawEntry> = None;
    let mut emitted = 0usize;
    let mut retries = 0usize;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let listing = match bucket
            .list_objects(ListRequest {
                prefix: prefix.clone(),
                delimiter: Some('/'),
                continuation: continuation.clone(),
                max_results: None,
            })
            .await
        {
            Ok(listing) => listing,
            Err(e) if e.is_transient() && emitted == 0 && retries < LISTER_RETRIES => {
                retries += 1;
                continue;
            }
            Err(e) => {
                warn!(dir = %handle.inode.name, "directory listing failed: {}", e);
                let mut st = handle.state.lock().await;
                if st.epoch == epoch {
                    st.error = Some(e);
                    handle.wake();
                }
                return;
            }
        };

        let mut batch: Vec<RawEntry> = Vec::new();
        if let Some(t) = tail.take() {
            batch.push(t);
        }
        for record in &listing.objects {
            // The directory's own placeholder is not a child.
            if record.name == prefix {
                continue;
            }
            batch.push(RawEntry {
                base: record.name[prefix.len()..].to_string(),
                kind: if record.symlink_target().is_some() {
                    DirentKind::Symlink
                } else {
                    DirentKind::File
                },
            });
        }
        for p in &listing.prefixes {
            let base = p[prefix.len()..].trim_end_matches('/').to_string();
            batch.push(RawEntry {
                base,
                kind: DirentKind::Dir,
            });
        }
        sort_batch(&mut batch);
        let more = listing.continuation.is_some();
        if more {
            tail = batch.pop();
        }
        resolve_conflicts(&mut batch);

        {
            let mut st = handle.state.lock().await;
            if st.epoch != epoch {
                return;
            }
            for e in batch {
                let offset = st.entries.len() as u64 + 1;
                st.entries.push(DirEntry {
                    name: e.base,
                    kind: e.kind,
                    offset,
                    inode_id: LISTING_SENTINEL_INODE_ID,
                });
                emitted += 1;
            }
            if !more {
                st.fetch_complete = true;
                debug!(dir = %handle.inode.name, entries = st.entries.len(), "listing complete");
            }
            handle.wake();
        }
        match listing.continuation {
            Some(c) => continuation = Some(c),
            None => return,
        }
    }
}

pub(crate) enum Handle {
    File(Arc<FileHandle>),
    Dir(Arc<DirHandle>),
}

/// Open handles, guarded by the filesystem lock.
pub(crate) struct HandleTable {
    handles: FxHashMap<u64, Handle>,
    next_handle_id: u64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: FxHashMap::default(),
            next_handle_id: 1,
        }
    }

    pub fn insert_file(&mut self, inode: Arc<Inode>, generation: i64) -> Arc<FileHandle> {
        let id = self.next_handle_id;
        self.next_handle_id += 1;
        let handle = FileHandle::new(id, inode, generation);
        self.handles.insert(id, Handle::File(handle.clone()));
        handle
    }

    pub fn insert_dir(&mut self, inode: Arc<Inode>) -> Arc<DirHandle> {
        let id = self.next_handle_id;
        self.next_handle_id += 1;
        let handle = DirHandle::new(id, inode);
        self.handles.insert(id, Handle::Dir(handle.clone()));
        handle
    }

    pub fn file(&self, id: u64) -> Result<Arc<FileHandle>, Error> {
        match self.handles.get(&id) {
            Some(Handle::File(h)) => Ok(h.clone()),
            _ => Err(Error::BadHandle(id)),
        }
    }

    pub fn dir(&self, id: u64) -> Result<Arc<DirHandle>, Error> {
        match self.handles.get(&id) {
            Some(Handle::Dir(h)) => Ok(h.clone()),
            _ => Err(Error::BadHandle(id)),
        }
    }

    pub fn remove(&mut self, id: u64) -> Option<Handle> {
        self.handles.remove(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn raw(base: &str, kind: DirentKind) -> RawEntry {
        RawEntry {
            base: base.into(),
            kind,
        }
    }

    #[test]
    fn conflicting_names_get_the_suffix() {
        let mut batch = vec![
            raw("foo", DirentKind::File),
            raw("bar", DirentKind::File),
            raw("foo", DirentKind::Dir),
        ];
        sort_batch(&mut batch);
        resolve_conflicts(&mut batch);
        let names: Vec<&str> = batch.iter().map(|e| e.base.as_str()).collect();
        assert_eq!(names, ["bar", "foo", "foo\n"]);
        assert_eq!(batch[1].kind, DirentKind::Dir);
        assert_eq!(batch[2].kind, DirentKind::File);
    }
}
