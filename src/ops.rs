//! The VFS operations, as methods on [`BucketFs`].
//!
//! Lock discipline: at most one handle lock, then at most one inode lock,
//! then the filesystem lock. The filesystem lock is never held across store
//! RPCs; inode and handle locks may be.
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::sync::OwnedMutexGuard;
use tracing::*;

use crate::bucket::{
    CreateRequest, DeleteRequest, ListRequest, ObjectRecord, StoreError, MTIME_METADATA_KEY,
    SYMLINK_METADATA_KEY,
};
use crate::error::Error;
use crate::handles::DirEntry;
use crate::inodes::{
    ChildType, Inode, InodeAttributes, InodeId, InodeKind, InodeState, LookupCore,
    SourceGeneration, ROOT_INODE_ID,
};
use crate::names::{strip_conflict_suffix, Name};
use crate::readahead::{ReadEnv, ReadaheadState};
use crate::BucketFs;

/// Bound on staleness-race retries in the lookup protocol.
const LOOKUP_RETRIES: usize = 3;
/// Bound on clone-then-delete retries when a rename races an overwrite.
const RENAME_RETRIES: usize = 3;

/// Attribute snapshot handed to the FUSE layer.
#[derive(Clone, Copy, Debug)]
pub struct AttrReply {
    pub id: InodeId,
    pub kind: InodeKind,
    pub size: u64,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub atime: SystemTime,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
}

impl BucketFs {
    fn inode(&self, id: InodeId) -> Result<Arc<Inode>, Error> {
        self.state.lock().inodes.get(id).ok_or(Error::BadInode(id))
    }

    fn dir_inode(&self, id: InodeId) -> Result<Arc<Inode>, Error> {
        let inode = self.inode(id)?;
        if !inode.is_dir() {
            return Err(Error::NotADirectory);
        }
        Ok(inode)
    }

    pub(crate) fn read_env(&self) -> ReadEnv {
        ReadEnv {
            cache: self.cache.clone(),
            workers: self.workers.clone(),
            bucket: self.bucket.clone(),
            config: self.config.readahead,
        }
    }

    pub fn attr_ttl(&self) -> Duration {
        self.config.attr_ttl
    }

    fn attr_reply(&self, inode: &Inode, state: &InodeState) -> AttrReply {
        let (perm, nlink) = match inode.kind {
            InodeKind::ExplicitDir | InodeKind::ImplicitDir => (self.config.dir_perms, 2),
            InodeKind::Symlink => (0o777, 1),
            InodeKind::File => (self.config.file_perms, 1),
        };
        AttrReply {
            id: inode.id,
            kind: inode.kind,
            size: state.attrs.size,
            mtime: state.attrs.mtime,
            ctime: state.attrs.ctime,
            atime: state.attrs.atime,
            perm,
            nlink: if state.clobbered { 0 } else { nlink },
            uid: self.config.uid,
            gid: self.config.gid,
        }
    }

    fn core_attrs(&self, core: &LookupCore) -> InodeAttributes {
        match &core.record {
            Some(r) => InodeAttributes::from_record(r),
            None => InodeAttributes::directory(self.clock.now()),
        }
    }

    /// The lookup-or-create protocol of the inode table. Returns the locked
    /// inode for `core`, or `None` when `core` lost a staleness race and the
    /// caller should re-stat.
    pub(crate) async fn lookup_or_create(
        &self,
        core: &LookupCore,
    ) -> Result<Option<(Arc<Inode>, OwnedMutexGuard<InodeState>)>, Error> {
        if core.record.is_none() {
            return Ok(self.lookup_or_create_implicit(core).await);
        }
        for _ in 0..LOOKUP_RETRIES {
            let existing = {
                let mut st = self.state.lock();
                match st.inodes.generation_backed(&core.name) {
                    Some(existing) => existing,
                    None => {
                        let inode = st.inodes.mint(core, self.core_attrs(core));
                        // Fresh inodes are uncontended.
                        match inode.try_lock() {
                            Some(guard) => return Ok(Some((inode, guard))),
                            None => continue,
                        }
                    }
                }
            };
            // Two-stage acquisition: the inode lock is taken with the
            // filesystem lock released, then the index is re-validated.
            let mut guard = existing.lock().await;
            let mut st = self.state.lock();
            if !st.inodes.still_indexed(&existing) {
                continue;
            }
            return match core.source().cmp(&guard.source) {
                std::cmp::Ordering::Equal => {
                    drop(st);
                    Ok(Some((existing, guard)))
                }
                // The caller's record is stale; it re-stats.
                std::cmp::Ordering::Less => Ok(None),
                std::cmp::Ordering::Greater => {
                    // Supersede: the old inode stays live for outstanding
                    // kernel references and is torn down at its last forget.
                    warn!(
                        name = %core.name,
                        old = guard.source.generation,
                        new = core.source().generation,
                        "object changed generation; minting replacement inode",
                    );
                    guard.clobbered = true;
                    let inode = st.inodes.mint(core, self.core_attrs(core));
                    drop(st);
                    drop(guard);
                    match inode.try_lock() {
                        Some(fresh) => Ok(Some((inode, fresh))),
                        None => Ok(None),
                    }
                }
            };
        }
        Ok(None)
    }

    async fn lookup_or_create_implicit(
        &self,
        core: &LookupCore,
    ) -> Option<(Arc<Inode>, OwnedMutexGuard<InodeState>)> {
        for _ in 0..LOOKUP_RETRIES {
            let existing = {
                let mut st = self.state.lock();
                match st.inodes.implicit_dir(&core.name) {
                    Some(existing) => existing,
                    None => {
                        let inode = st
                            .inodes
                            .mint(core, InodeAttributes::directory(self.clock.now()));
                        match inode.try_lock() {
                            Some(guard) => return Some((inode, guard)),
                            None => continue,
                        }
                    }
                }
            };
            let guard = existing.lock().await;
            let st = self.state.lock();
            if st.inodes.still_indexed(&existing) {
                drop(st);
                return Some((existing, guard));
            }
        }
        None
    }

    /// Install an inode for `core`, retrying with a fresh stat when the
    /// table already advanced past it. Counts the kernel reference.
    async fn install(&self, core: LookupCore) -> Result<(Arc<Inode>, AttrReply), Error> {
        let mut core = core;
        for _ in 0..LOOKUP_RETRIES {
            match self.lookup_or_create(&core).await? {
                Some((inode, mut guard)) => {
                    guard.lookup_count += 1;
                    let reply = self.attr_reply(&inode, &guard);
                    return Ok((inode, reply));
                }
                None => match self.bucket.stat_object(core.name.object_name()).await? {
                    Some(record) => core = LookupCore::from_record(core.name.clone(), record),
                    None => return Err(Error::NotFound(core.name.to_string())),
                },
            }
        }
        Err(Error::NotFound(core.name.to_string()))
    }

    /// Whether anything exists under the directory prefix.
    async fn implicit_dir_exists(&self, name: &Name) -> Result<bool, Error> {
        let listing = self
            .bucket
            .list_objects(ListRequest {
                prefix: name.object_name().to_string(),
                delimiter: None,
                continuation: None,
                max_results: Some(1),
            })
            .await?;
        Ok(!listing.objects.is_empty() || !listing.prefixes.is_empty())
    }

    /// Resolve a child name under a locked parent directory to a lookup
    /// core, consulting and refreshing the parent's type cache.
    async fn resolve_child(
        &self,
        parent: &Arc<Inode>,
        parent_state: &mut InodeState,
        base: &str,
    ) -> Result<Option<LookupCore>, Error> {
        // A conflict-suffixed name always denotes the file variant.
        if let Some(stripped) = strip_conflict_suffix(base) {
            let name = parent.name.child_file(stripped);
            return Ok(self
                .bucket
                .stat_object(name.object_name())
                .await?
                .map(|r| LookupCore::from_record(name, r)));
        }

        let file_name = parent.name.child_file(base);
        let dir_name = parent.name.child_dir(base);
        let now = self.clock.now();

        match parent_state.type_cache.get(base, now) {
            Some(ChildType::Nonexistent) => return Ok(None),
            Some(ChildType::File) | Some(ChildType::Symlink) => {
                if let Some(r) = self.bucket.stat_object(file_name.object_name()).await? {
                    return Ok(Some(LookupCore::from_record(file_name, r)));
                }
            }
            Some(ChildType::ExplicitDir) => {
                if let Some(r) = self.bucket.stat_object(dir_name.object_name()).await? {
                    return Ok(Some(LookupCore::from_record(dir_name, r)));
                }
            }
            Some(ChildType::ImplicitDir) => {
                if self.implicit_dir_exists(&dir_name).await? {
                    return Ok(Some(LookupCore::implicit_dir(dir_name)));
                }
            }
            None => {}
        }

        // Full resolution; the directory wins name conflicts.
        let (dir_stat, file_stat) = futures::join!(
            self.bucket.stat_object(dir_name.object_name()),
            self.bucket.stat_object(file_name.object_name()),
        );
        let (dir_stat, file_stat) = (dir_stat?, file_stat?);
        let core = if let Some(r) = dir_stat {
            Some(LookupCore::from_record(dir_name.clone(), r))
        } else if self.config.implicit_directories && self.implicit_dir_exists(&dir_name).await? {
            Some(LookupCore::implicit_dir(dir_name.clone()))
        } else {
            file_stat.map(|r| LookupCore::from_record(file_name.clone(), r))
        };

        if !self.config.type_cache_ttl.is_zero() {
            let expires = now + self.config.type_cache_ttl;
            match &core {
                Some(c) => {
                    let t = match c.kind() {
                        InodeKind::File => ChildType::File,
                        InodeKind::Symlink => ChildType::Symlink,
                        InodeKind::ExplicitDir => ChildType::ExplicitDir,
                        InodeKind::ImplicitDir => ChildType::ImplicitDir,
                    };
                    parent_state.type_cache.insert(base, t, expires);
                }
                None if self.config.nonexistent_type_cache => {
                    parent_state
                        .type_cache
                        .insert(base, ChildType::Nonexistent, expires);
                }
                None => {}
            }
        }
        Ok(core)
    }

    /// Resolve `base` under the parent and return the child's attributes,
    /// counting the kernel reference.
    pub async fn lookup(&self, parent_id: InodeId, base: &str) -> Result<AttrReply, Error> {
        let parent = self.dir_inode(parent_id)?;
        let core = {
            let mut guard = parent.lock().await;
            self.resolve_child(&parent, &mut guard, base).await?
        };
        // The parent lock is released before any child inode is locked.
        let Some(core) = core else {
            return Err(Error::NotFound(base.to_string()));
        };
        let (_, reply) = self.install(core).await?;
        Ok(reply)
    }

    pub async fn getattr(&self, id: InodeId) -> Result<AttrReply, Error> {
        let inode = self.inode(id)?;
        let guard = inode.lock().await;
        Ok(self.attr_reply(&inode, &guard))
    }

    /// Set mtime and/or truncate. Mode and atime updates are accepted and
    /// ignored.
    pub async fn setattr(
        &self,
        id: InodeId,
        size: Option<u64>,
        mtime: Option<SystemTime>,
    ) -> Result<AttrReply, Error> {
        let inode = self.inode(id)?;
        let mut guard = inode.lock().await;
        if let Some(size) = size {
            if inode.kind != InodeKind::File {
                return Err(Error::IsADirectory);
            }
            if size != 0 {
                return Err(Error::NotSupported(
                    "partial truncation belongs to the write path",
                ));
            }
            let record = self
                .bucket
                .create_object(CreateRequest::new(inode.name.object_name()))
                .await?;
            // Truncation rewrites the object: re-bind this inode to the new
            // generation and drop the stale folios.
            guard.source = SourceGeneration::of(&record);
            guard.attrs = InodeAttributes::from_record(&record);
            self.cache.invalidate(inode.id);
        }
        if let Some(mtime) = mtime {
            if inode.kind == InodeKind::File {
                let formatted = humantime::format_rfc3339_nanos(mtime).to_string();
                let changes = [(MTIME_METADATA_KEY.to_string(), Some(formatted))]
                    .into_iter()
                    .collect();
                let record = self
                    .bucket
                    .update_object(inode.name.object_name(), changes)
                    .await?;
                guard.source.meta_generation = record.meta_generation;
            }
            guard.attrs.mtime = mtime;
        }
        Ok(self.attr_reply(&inode, &guard))
    }

    /// Drop `n` kernel references; at zero the inode is detached from the
    /// table and indices and its cached folios are dropped.
    pub async fn forget(&self, id: InodeId, n: u64) {
        if id == ROOT_INODE_ID {
            return;
        }
        let inode = { self.state.lock().inodes.get(id) };
        let Some(inode) = inode else {
            return;
        };
        let mut guard = inode.lock().await;
        guard.lookup_count = guard.lookup_count.saturating_sub(n);
        if guard.lookup_count == 0 {
            debug!(id, name = %inode.name, "destroying inode");
            self.state.lock().inodes.remove(&inode);
            drop(guard);
            self.cache.invalidate(id);
        }
    }

    fn touch_type_cache(&self, parent: &Arc<Inode>, base: &str, t: Option<ChildType>) {
        // Best effort: skip when the parent is busy rather than queue behind
        // an RPC holding its lock.
        if let Some(mut guard) = parent.try_lock() {
            match t {
                Some(t) if !self.config.type_cache_ttl.is_zero() => {
                    let expires = self.clock.now() + self.config.type_cache_ttl;
                    guard.type_cache.insert(base, t, expires);
                }
                _ => guard.type_cache.remove(base),
            }
        }
    }

    pub async fn mkdir(&self, parent_id: InodeId, base: &str) -> Result<AttrReply, Error> {
        let parent = self.dir_inode(parent_id)?;
        let name = parent.name.child_dir(base);
        let record = self
            .bucket
            .create_object(CreateRequest::new(name.object_name()).if_not_exists())
            .await
            .map_err(|e| match e {
                StoreError::PreconditionFailed => Error::AlreadyExists(base.to_string()),
                e => Error::Store(e),
            })?;
        self.touch_type_cache(&parent, base, Some(ChildType::ExplicitDir));
        let (_, reply) = self.install(LookupCore::from_record(name, record)).await?;
        Ok(reply)
    }

    /// Create an empty object and a file handle for it.
    pub async fn create_file(&self, parent_id: InodeId, base: &str) -> Result<(AttrReply, u64), Error> {
        let parent = self.dir_inode(parent_id)?;
        let name = parent.name.child_file(base);
        let record = self
            .bucket
            .create_object(CreateRequest::new(name.object_name()).if_not_exists())
            .await
            .map_err(|e| match e {
                StoreError::PreconditionFailed => Error::AlreadyExists(base.to_string()),
                e => Error::Store(e),
            })?;
        self.touch_type_cache(&parent, base, Some(ChildType::File));
        let (inode, reply) = self.install(LookupCore::from_record(name, record)).await?;
        let generation = { inode.lock().await.source.generation };
        let fh = self.state.lock().handles.insert_file(inode, generation).id;
        Ok((reply, fh))
    }

    pub async fn symlink(
        &self,
        parent_id: InodeId,
        base: &str,
        target: &str,
    ) -> Result<AttrReply, Error> {
        let parent = self.dir_inode(parent_id)?;
        let name = parent.name.child_file(base);
        let record = self
            .bucket
            .create_object(
                CreateRequest::new(name.object_name())
                    .metadata(SYMLINK_METADATA_KEY, target)
                    .if_not_exists(),
            )
            .await
            .map_err(|e| match e {
                StoreError::PreconditionFailed => Error::AlreadyExists(base.to_string()),
                e => Error::Store(e),
            })?;
        self.touch_type_cache(&parent, base, Some(ChildType::Symlink));
        let (_, reply) = self.install(LookupCore::from_record(name, record)).await?;
        Ok(reply)
    }

    pub async fn readlink(&self, id: InodeId) -> Result<String, Error> {
        let inode = self.inode(id)?;
        if inode.kind != InodeKind::Symlink {
            return Err(Error::InvalidArgument("not a symlink"));
        }
        let guard = inode.lock().await;
        guard
            .symlink_target
            .clone()
            .ok_or(Error::InvalidArgument("symlink without a target"))
    }

    /// Delete the backing object. The inode's folios are dropped when the
    /// kernel forgets it.
    pub async fn unlink(&self, parent_id: InodeId, base: &str) -> Result<(), Error> {
        let parent = self.dir_inode(parent_id)?;
        let plain = strip_conflict_suffix(base).unwrap_or(base);
        let name = parent.name.child_file(plain);
        self.bucket
            .delete_object(DeleteRequest::new(name.object_name()))
            .await
            .map_err(|e| match e {
                StoreError::NotFound => Error::NotFound(base.to_string()),
                e => Error::Store(e),
            })?;
        self.touch_type_cache(&parent, base, None);
        Ok(())
    }

    /// Delete a directory placeholder after a single paginated emptiness
    /// probe. A concurrent insert racing the probe is accepted.
    pub async fn rmdir(&self, parent_id: InodeId, base: &str) -> Result<(), Error> {
        let parent = self.dir_inode(parent_id)?;
        let name = parent.name.child_dir(base);
        let listing = self
            .bucket
            .list_objects(ListRequest {
                prefix: name.object_name().to_string(),
                delimiter: Some('/'),
                continuation: None,
                max_results: Some(2),
            })
            .await?;
        let occupied = !listing.prefixes.is_empty()
            || listing.objects.iter().any(|o| o.name != name.object_name());
        if occupied {
            return Err(Error::NotEmpty(base.to_string()));
        }
        match self
            .bucket
            .delete_object(DeleteRequest::new(name.object_name()))
            .await
        {
            // An implicit directory has no placeholder to delete.
            Ok(()) | Err(StoreError::NotFound) => {}
            Err(e) => return Err(Error::Store(e)),
        }
        self.touch_type_cache(&parent, base, None);
        Ok(())
    }

    pub async fn rename(
        &self,
        old_parent_id: InodeId,
        old_base: &str,
        new_parent_id: InodeId,
        new_base: &str,
    ) -> Result<(), Error> {
        let old_parent = self.dir_inode(old_parent_id)?;
        let new_parent = self.dir_inode(new_parent_id)?;
        let core = {
            let mut guard = old_parent.lock().await;
            self.resolve_child(&old_parent, &mut guard, old_base).await?
        };
        let Some(core) = core else {
            return Err(Error::NotFound(old_base.to_string()));
        };
        match core.kind() {
            InodeKind::File | InodeKind::Symlink => {
                let record = core.record.as_ref().expect("files are generation-backed");
                let plain = strip_conflict_suffix(new_base).unwrap_or(new_base);
                let dst = new_parent.name.child_file(plain);
                self.rename_file(&core.name, record.generation, &dst).await?;
            }
            InodeKind::ExplicitDir | InodeKind::ImplicitDir => {
                let dst = new_parent.name.child_dir(new_base);
                self.rename_dir(&core, &dst).await?;
            }
        }
        self.touch_type_cache(&old_parent, old_base, None);
        self.touch_type_cache(&new_parent, new_base, None);
        Ok(())
    }

    /// Clone, then conditionally delete the source generation. A source
    /// overwritten mid-rename is re-cloned a bounded number of times.
    async fn rename_file(&self, src: &Name, generation: i64, dst: &Name) -> Result<(), Error> {
        let mut generation = generation;
        for _ in 0..RENAME_RETRIES {
            self.bucket
                .copy_object(src.object_name(), generation, dst.object_name())
                .await
                .map_err(|e| match e {
                    StoreError::NotFound => Error::NotFound(src.to_string()),
                    e => Error::Store(e),
                })?;
            match self
                .bucket
                .delete_object(DeleteRequest::new(src.object_name()).generation(generation))
                .await
            {
                Ok(()) | Err(StoreError::NotFound) => return Ok(()),
                Err(StoreError::PreconditionFailed) => {
                    match self.bucket.stat_object(src.object_name()).await? {
                        Some(record) => generation = record.generation,
                        None => return Ok(()),
                    }
                }
                Err(e) => return Err(Error::Store(e)),
            }
        }
        Err(Error::Store(StoreError::Transient(
            "source kept changing during rename".into(),
        )))
    }

    async fn rename_dir(&self, core: &LookupCore, dst: &Name) -> Result<(), Error> {
        let src = &core.name;
        // Destination must not exist as a populated directory.
        let probe = self
            .bucket
            .list_objects(ListRequest {
                prefix: dst.object_name().to_string(),
                delimiter: Some('/'),
                continuation: None,
                max_results: Some(2),
            })
            .await?;
        if !probe.prefixes.is_empty()
            || probe.objects.iter().any(|o| o.name != dst.object_name())
        {
            return Err(Error::NotEmpty(dst.to_string()));
        }

        // Enumerate every descendant before mutating anything.
        let limit = self.config.rename_dir_limit;
        let mut placeholder: Option<ObjectRecord> = None;
        let mut descendants: Vec<ObjectRecord> = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let listing = self
                .bucket
                .list_objects(ListRequest {
                    prefix: src.object_name().to_string(),
                    delimiter: None,
                    continuation: continuation.take(),
                    max_results: None,
                })
                .await?;
            for record in listing.objects {
                if record.name == src.object_name() {
                    placeholder = Some(record);
                    continue;
                }
                descendants.push(record);
                if descendants.len() > limit {
                    return Err(Error::RenameLimitExceeded(limit));
                }
            }
            match listing.continuation {
                Some(c) => continuation = Some(c),
                None => break,
            }
        }

        // Clone everything under the new parent, preserving suffixes.
        for record in &descendants {
            let suffix = &record.name[src.object_name().len()..];
            let target = format!("{}{}", dst.object_name(), suffix);
            self.bucket
                .copy_object(&record.name, record.generation, &target)
                .await?;
        }
        match &placeholder {
            Some(p) => {
                self.bucket
                    .copy_object(&p.name, p.generation, dst.object_name())
                    .await?;
            }
            None => {
                // Source was implicit; make the destination explicit so it
                // exists even while empty.
                self.bucket
                    .create_object(CreateRequest::new(dst.object_name()))
                    .await?;
            }
        }

        // Conditionally delete the sources, the placeholder last.
        for record in &descendants {
            match self
                .bucket
                .delete_object(DeleteRequest::new(&record.name).generation(record.generation))
                .await
            {
                Ok(()) | Err(StoreError::NotFound) => {}
                Err(e) => return Err(Error::Store(e)),
            }
        }
        if let Some(p) = placeholder {
            match self
                .bucket
                .delete_object(DeleteRequest::new(&p.name).generation(p.generation))
                .await
            {
                Ok(()) | Err(StoreError::NotFound) => {}
                Err(e) => return Err(Error::Store(e)),
            }
        }
        Ok(())
    }

    /// Allocate a file handle. The kernel may keep its page cache across
    /// opens: generation changes mint new inode ids, so stale pages can
    /// never be served for this id.
    pub async fn open_file(&self, id: InodeId) -> Result<(u64, bool), Error> {
        let inode = self.inode(id)?;
        if inode.is_dir() {
            return Err(Error::IsADirectory);
        }
        let generation = inode.lock().await.source.generation;
        let fh = {
            self.state
                .lock()
                .handles
                .insert_file(inode.clone(), generation)
                .id
        };
        trace!(id, fh, "opened file");
        Ok((fh, true))
    }

    /// Serve a read through the handle's readahead reader. Reads at or past
    /// end of file return empty.
    pub async fn read_file(&self, fh: u64, offset: u64, size: u64) -> Result<Bytes, Error> {
        let handle = self.state.lock().handles.file(fh)?;
        handle.io_depth.fetch_add(1, Ordering::SeqCst);
        let result = {
            let mut reader = handle.reader.lock().await;
            let file_size = { handle.inode.lock().await.attrs.size };
            reader.read(&self.read_env(), offset, size, file_size).await
        };
        handle.io_depth.fetch_sub(1, Ordering::SeqCst);
        result
    }

    pub async fn write_file(&self, fh: u64, offset: u64, data: Bytes) -> Result<u32, Error> {
        let handle = self.state.lock().handles.file(fh)?;
        self.write_buffer
            .write(handle.inode.id, fh, offset, data)
            .await
    }

    pub async fn flush_file(&self, fh: u64) -> Result<(), Error> {
        let handle = self.state.lock().handles.file(fh)?;
        self.write_buffer.flush(handle.inode.id, fh).await
    }

    pub async fn sync_file(&self, fh: u64) -> Result<(), Error> {
        let handle = self.state.lock().handles.file(fh)?;
        self.write_buffer.sync(handle.inode.id, fh).await
    }

    pub async fn release_file(&self, fh: u64) -> Result<(), Error> {
        let handle = {
            let mut st = self.state.lock();
            let handle = st.handles.file(fh)?;
            st.handles.remove(fh);
            handle
        };
        handle.release();
        Ok(())
    }

    pub async fn open_dir(&self, id: InodeId) -> Result<u64, Error> {
        let inode = self.dir_inode(id)?;
        let fh = self.state.lock().handles.insert_dir(inode).id;
        trace!(id, fh, "opened directory");
        Ok(fh)
    }

    /// Serve dirents from `offset` to the end of what the lister has
    /// produced. Offset zero resets the listing.
    pub async fn read_dir(&self, fh: u64, offset: u64) -> Result<Vec<DirEntry>, Error> {
        let handle = self.state.lock().handles.dir(fh)?;
        if offset == 0 {
            handle.restart_listing(self.bucket.clone()).await;
        }
        handle.read(offset).await
    }

    pub async fn release_dir(&self, fh: u64) -> Result<(), Error> {
        let handle = {
            let mut st = self.state.lock();
            let handle = st.handles.dir(fh)?;
            st.handles.remove(fh);
            handle
        };
        handle.release();
        Ok(())
    }

    /// Readahead window of an open file handle, for diagnostics and tests.
    pub async fn readahead_state(&self, fh: u64) -> Result<ReadaheadState, Error> {
        let handle = self.state.lock().handles.file(fh)?;
        let reader = handle.reader.lock().await;
        Ok(reader.state)
    }

    /// Assert the table-level invariants; test and teardown hook.
    pub fn check_invariants(&self) {
        self.state.lock().inodes.check();
    }

    /// Teardown audit: after the kernel has forgotten everything and closed
    /// every handle, only the root inode remains.
    pub fn assert_quiescent(&self) {
        let st = self.state.lock();
        st.inodes.check();
        assert!(st.handles.is_empty(), "open handles at teardown");
        let stray: Vec<_> = st
            .inodes
            .live()
            .filter(|i| i.id != ROOT_INODE_ID)
            .map(|i| format!("{:?}", i))
            .collect();
        assert!(stray.is_empty(), "live inodes at teardown: {:?}", stray);
    }
}
