//! Inode table.
//!
//! Inodes carry a stable id for the lifetime of the mount; ids are never
//! reused. A name-keyed index always points at the inode with the greatest
//! known generation for that name; implicit directories (inferred from name
//! prefixes, with no backing object) live in their own index so that
//! placeholder transitions never rewrite the main table.
mod type_cache;
pub use type_cache::{ChildType, TypeCache};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use rustc_hash::FxHashMap;
use tokio::sync::OwnedMutexGuard;
use tracing::*;

use crate::bucket::ObjectRecord;
use crate::names::Name;

pub type InodeId = u64;

/// The root directory's inode id, as expected by the kernel.
pub const ROOT_INODE_ID: InodeId = fuser::FUSE_ROOT_ID;

/// Inode id reported in directory listings. The kernel does not count
/// `readdir` as a lookup, so minting real ids there would leak them; real
/// ids are only minted at `lookup`.
pub const LISTING_SENTINEL_INODE_ID: InodeId = ROOT_INODE_ID + 1;

/// Content and metadata version of the backing object. The pair is totally
/// ordered and used for staleness comparisons.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct SourceGeneration {
    pub generation: i64,
    pub meta_generation: i64,
}

impl SourceGeneration {
    pub fn of(record: &ObjectRecord) -> Self {
        Self {
            generation: record.generation,
            meta_generation: record.meta_generation,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InodeKind {
    /// Directory backed by a `name/` placeholder object.
    ExplicitDir,
    /// Directory inferred from a shared name prefix.
    ImplicitDir,
    File,
    Symlink,
}

impl InodeKind {
    pub fn is_dir(&self) -> bool {
        matches!(self, InodeKind::ExplicitDir | InodeKind::ImplicitDir)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct InodeAttributes {
    pub size: u64,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub atime: SystemTime,
}

impl InodeAttributes {
    pub fn from_record(record: &ObjectRecord) -> Self {
        let mtime = record.mtime().unwrap_or(record.updated_at);
        Self {
            size: record.size,
            mtime,
            ctime: record.updated_at,
            atime: mtime,
        }
    }

    pub fn directory(now: SystemTime) -> Self {
        Self {
            size: 0,
            mtime: now,
            ctime: now,
            atime: now,
        }
    }
}

/// Mutable inode state, guarded by the inode lock.
pub struct InodeState {
    pub source: SourceGeneration,
    /// Outstanding kernel references; the inode is destroyed at zero.
    pub lookup_count: u64,
    pub attrs: InodeAttributes,
    /// Set when a newer generation superseded this inode; the kernel then
    /// sees `nlink == 0`.
    pub clobbered: bool,
    pub symlink_target: Option<String>,
    /// Child-name to type cache; only populated for directories.
    pub type_cache: TypeCache,
}

pub struct Inode {
    pub id: InodeId,
    pub name: Name,
    pub kind: InodeKind,
    state: Arc<tokio::sync::Mutex<InodeState>>,
}

impl Inode {
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Acquire the inode lock. May be held across store RPCs.
    pub async fn lock(&self) -> OwnedMutexGuard<InodeState> {
        self.state.clone().lock_owned().await
    }

    pub fn try_lock(&self) -> Option<OwnedMutexGuard<InodeState>> {
        self.state.clone().try_lock_owned().ok()
    }
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Inode({}, {:?}, {:?})", self.id, self.kind, self.name)
    }
}

/// A resolved name, input to the lookup-or-create protocol: either a backing
/// object record or an implicit-directory marker.
#[derive(Clone, Debug)]
pub struct LookupCore {
    pub name: Name,
    pub record: Option<ObjectRecord>,
}

impl LookupCore {
    pub fn implicit_dir(name: Name) -> Self {
        debug_assert!(name.is_dir());
        Self { name, record: None }
    }

    pub fn from_record(name: Name, record: ObjectRecord) -> Self {
        Self {
            name,
            record: Some(record),
        }
    }

    pub fn kind(&self) -> InodeKind {
        match &self.record {
            None => InodeKind::ImplicitDir,
            Some(_) if self.name.is_dir() => InodeKind::ExplicitDir,
            Some(r) if r.symlink_target().is_some() => InodeKind::Symlink,
            Some(_) => InodeKind::File,
        }
    }

    pub fn source(&self) -> SourceGeneration {
        self.record
            .as_ref()
            .map(SourceGeneration::of)
            .unwrap_or_default()
    }
}

/// The id- and name-keyed inode maps, guarded by the filesystem lock.
pub(crate) struct InodeTable {
    inodes: FxHashMap<InodeId, Arc<Inode>>,
    /// `name -> inode` for generation-backed inodes (files, symlinks,
    /// explicit directories); always the greatest known generation.
    generation_index: HashMap<Name, Arc<Inode>>,
    /// `name -> inode` for implicit directories.
    implicit_index: HashMap<Name, Arc<Inode>>,
    next_inode_id: InodeId,
}

impl InodeTable {
    pub fn new(now: SystemTime) -> Self {
        let mut table = Self {
            inodes: FxHashMap::default(),
            generation_index: HashMap::new(),
            implicit_index: HashMap::new(),
            next_inode_id: LISTING_SENTINEL_INODE_ID + 1,
        };
        let root = Arc::new(Inode {
            id: ROOT_INODE_ID,
            name: Name::root(),
            kind: InodeKind::ImplicitDir,
            state: Arc::new(tokio::sync::Mutex::new(InodeState {
                source: SourceGeneration::default(),
                // The kernel never sends a forget for the root.
                lookup_count: 1,
                attrs: InodeAttributes::directory(now),
                clobbered: false,
                symlink_target: None,
                type_cache: TypeCache::default(),
            })),
        });
        table.inodes.insert(ROOT_INODE_ID, root);
        table
    }

    pub fn get(&self, id: InodeId) -> Option<Arc<Inode>> {
        self.inodes.get(&id).cloned()
    }

    pub fn root(&self) -> Arc<Inode> {
        self.inodes[&ROOT_INODE_ID].clone()
    }

    pub fn generation_backed(&self, name: &Name) -> Option<Arc<Inode>> {
        self.generation_index.get(name).cloned()
    }

    pub fn implicit_dir(&self, name: &Name) -> Option<Arc<Inode>> {
        self.implicit_index.get(name).cloned()
    }

    /// Mint a fresh inode for `core` and install it in the main table and
    /// the matching index, superseding any existing index entry.
    pub fn mint(&mut self, core: &LookupCore, attrs: InodeAttributes) -> Arc<Inode> {
        let id = self.next_inode_id;
        self.next_inode_id += 1;
        let kind = core.kind();
        let symlink_target = core
            .record
            .as_ref()
            .and_then(|r| r.symlink_target())
            .map(String::from);
        let inode = Arc::new(Inode {
            id,
            name: core.name.clone(),
            kind,
            state: Arc::new(tokio::sync::Mutex::new(InodeState {
                source: core.source(),
                lookup_count: 0,
                attrs,
                clobbered: false,
                symlink_target,
                type_cache: TypeCache::default(),
            })),
        });
        debug!(id, kind = ?kind, name = %core.name, "minting inode");
        self.inodes.insert(id, inode.clone());
        if kind == InodeKind::ImplicitDir {
            self.implicit_index.insert(core.name.clone(), inode.clone());
        } else {
            self.generation_index.insert(core.name.clone(), inode.clone());
        }
        inode
    }

    /// Whether the index for this inode's kind still points at it. Used to
    /// re-validate after the two-stage lock acquisition.
    pub fn still_indexed(&self, inode: &Arc<Inode>) -> bool {
        let index = if inode.kind == InodeKind::ImplicitDir {
            &self.implicit_index
        } else {
            &self.generation_index
        };
        index
            .get(&inode.name)
            .map(|i| Arc::ptr_eq(i, inode))
            .unwrap_or(false)
    }

    /// Detach a dead inode from the main table and from any index that still
    /// points at it.
    pub fn remove(&mut self, inode: &Arc<Inode>) {
        self.inodes.remove(&inode.id);
        if let Some(indexed) = self.generation_index.get(&inode.name) {
            if Arc::ptr_eq(indexed, inode) {
                self.generation_index.remove(&inode.name);
            }
        }
        if let Some(indexed) = self.implicit_index.get(&inode.name) {
            if Arc::ptr_eq(indexed, inode) {
                self.implicit_index.remove(&inode.name);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    pub fn live(&self) -> impl Iterator<Item = &Arc<Inode>> {
        self.inodes.values()
    }

    /// Table-level invariants: indices only point at live inodes, under
    /// their own name.
    pub fn check(&self) {
        assert!(self.inodes.contains_key(&ROOT_INODE_ID));
        for (name, inode) in self.generation_index.iter().chain(self.implicit_index.iter()) {
            assert_eq!(&inode.name, name);
            let live = self
                .inodes
                .get(&inode.id)
                .map(|i| Arc::ptr_eq(i, inode))
                .unwrap_or(false);
            assert!(live, "index points at a detached inode: {:?}", inode);
        }
    }
}
