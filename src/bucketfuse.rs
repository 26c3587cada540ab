//! Implementation of `fuser::Filesystem` on [`BucketFs`].
//!
//! The FUSE dispatch loop is single-threaded; every request is spawned onto
//! the tokio runtime with its reply object moved into the task, so slow
//! store RPCs never stall the kernel queue.
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::SystemTime;

use fuser::consts::FOPEN_KEEP_CACHE;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use tracing::*;

use crate::handles::DirentKind;
use crate::inodes::InodeKind;
use crate::ops::AttrReply;
use crate::BucketFs;

pub struct BucketFuse {
    fs: Arc<BucketFs>,
    rt: tokio::runtime::Handle,
}

impl BucketFuse {
    /// Must be called within the tokio runtime the handlers should run on.
    pub fn new(fs: Arc<BucketFs>) -> Self {
        Self {
            fs,
            rt: tokio::runtime::Handle::current(),
        }
    }
}

fn file_attr(reply: &AttrReply, blksize: u32) -> FileAttr {
    FileAttr {
        ino: reply.id,
        size: reply.size,
        blocks: reply.size.div_ceil(512),
        atime: reply.atime,
        mtime: reply.mtime,
        ctime: reply.ctime,
        crtime: reply.ctime,
        kind: match reply.kind {
            InodeKind::File => FileType::RegularFile,
            InodeKind::Symlink => FileType::Symlink,
            InodeKind::ExplicitDir | InodeKind::ImplicitDir => FileType::Directory,
        },
        perm: reply.perm,
        nlink: reply.nlink,
        uid: reply.uid,
        gid: reply.gid,
        rdev: 0,
        flags: 0,
        blksize,
    }
}

fn dirent_type(kind: DirentKind) -> FileType {
    match kind {
        DirentKind::File => FileType::RegularFile,
        DirentKind::Dir => FileType::Directory,
        DirentKind::Symlink => FileType::Symlink,
    }
}

/// Object names are unicode; reject anything else before it reaches the
/// store.
fn utf8_name(name: &OsStr) -> Option<String> {
    name.to_str().map(String::from)
}

impl Filesystem for BucketFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("unmounted; {:?}", self.fs);
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = utf8_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let fs = self.fs.clone();
        self.rt.spawn(async move {
            match fs.lookup(parent, &name).await {
                Ok(attr) => {
                    let blksize = fs.pool().page_size() as u32;
                    reply.entry(&fs.attr_ttl(), &file_attr(&attr, blksize), 0)
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        let fs = self.fs.clone();
        self.rt.spawn(async move { fs.forget(ino, nlookup).await });
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let fs = self.fs.clone();
        self.rt.spawn(async move {
            match fs.getattr(ino).await {
                Ok(attr) => {
                    let blksize = fs.pool().page_size() as u32;
                    reply.attr(&fs.attr_ttl(), &file_attr(&attr, blksize))
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let fs = self.fs.clone();
        self.rt.spawn(async move {
            let mtime = mtime.map(|t| match t {
                TimeOrNow::SpecificTime(t) => t,
                TimeOrNow::Now => fs.clock.now(),
            });
            match fs.setattr(ino, size, mtime).await {
                Ok(attr) => {
                    let blksize = fs.pool().page_size() as u32;
                    reply.attr(&fs.attr_ttl(), &file_attr(&attr, blksize))
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let fs = self.fs.clone();
        self.rt.spawn(async move {
            match fs.readlink(ino).await {
                Ok(target) => reply.data(target.as_bytes()),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = utf8_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let fs = self.fs.clone();
        self.rt.spawn(async move {
            match fs.mkdir(parent, &name).await {
                Ok(attr) => {
                    let blksize = fs.pool().page_size() as u32;
                    reply.entry(&fs.attr_ttl(), &file_attr(&attr, blksize), 0)
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = utf8_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let fs = self.fs.clone();
        self.rt.spawn(async move {
            match fs.unlink(parent, &name).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = utf8_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let fs = self.fs.clone();
        self.rt.spawn(async move {
            match fs.rmdir(parent, &name).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &std::path::Path,
        reply: ReplyEntry,
    ) {
        let (Some(name), Some(target)) = (utf8_name(name), link.to_str().map(String::from)) else {
            reply.error(libc::EINVAL);
            return;
        };
        let fs = self.fs.clone();
        self.rt.spawn(async move {
            match fs.symlink(parent, &name, &target).await {
                Ok(attr) => {
                    let blksize = fs.pool().page_size() as u32;
                    reply.entry(&fs.attr_ttl(), &file_attr(&attr, blksize), 0)
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (utf8_name(name), utf8_name(newname)) else {
            reply.error(libc::EINVAL);
            return;
        };
        let fs = self.fs.clone();
        self.rt.spawn(async move {
            match fs.rename(parent, &name, newparent, &newname).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let fs = self.fs.clone();
        self.rt.spawn(async move {
            match fs.open_file(ino).await {
                Ok((fh, keep_cache)) => {
                    reply.opened(fh, if keep_cache { FOPEN_KEEP_CACHE } else { 0 })
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let fs = self.fs.clone();
        self.rt.spawn(async move {
            match fs.read_file(fh, offset as u64, size as u64).await {
                Ok(data) => reply.data(&data),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let data = bytes::Bytes::copy_from_slice(data);
        let fs = self.fs.clone();
        self.rt.spawn(async move {
            match fs.write_file(fh, offset as u64, data).await {
                Ok(written) => reply.written(written),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let fs = self.fs.clone();
        self.rt.spawn(async move {
            match fs.flush_file(fh).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let fs = self.fs.clone();
        self.rt.spawn(async move {
            match fs.sync_file(fh).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let fs = self.fs.clone();
        self.rt.spawn(async move {
            match fs.release_file(fh).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let fs = self.fs.clone();
        self.rt.spawn(async move {
            match fs.open_dir(ino).await {
                Ok(fh) => reply.opened(fh, 0),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let fs = self.fs.clone();
        self.rt.spawn(async move {
            match fs.read_dir(fh, offset as u64).await {
                Ok(entries) => {
                    for e in entries {
                        // `offset` is the offset of the next entry.
                        if reply.add(e.inode_id, e.offset as i64, dirent_type(e.kind), &e.name) {
                            break;
                        }
                    }
                    reply.ok()
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        let fs = self.fs.clone();
        self.rt.spawn(async move {
            match fs.release_dir(fh).await {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = utf8_name(name) else {
            reply.error(libc::EINVAL);
            return;
        };
        let fs = self.fs.clone();
        self.rt.spawn(async move {
            match fs.create_file(parent, &name).await {
                Ok((attr, fh)) => {
                    let blksize = fs.pool().page_size() as u32;
                    reply.created(
                        &fs.attr_ttl(),
                        &file_attr(&attr, blksize),
                        0,
                        fh,
                        FOPEN_KEEP_CACHE,
                    )
                }
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let blksize = self.fs.pool().page_size() as u32;
        reply.statfs(0, 0, 0, 0, 0, blksize, 255, blksize);
    }
}
