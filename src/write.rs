//! Seam to the write-buffer/upload subsystem.
//!
//! Buffering dirty data and uploading it back to the store is a separate
//! subsystem with its own invariants; the filesystem core only forwards
//! `write`/`flush`/`fsync` to an implementor of this trait. The crate ships
//! a stub that rejects writes.
use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Error;
use crate::inodes::InodeId;

#[async_trait]
pub trait WriteBuffer: Send + Sync + 'static {
    async fn write(&self, inode: InodeId, handle: u64, offset: u64, data: Bytes)
        -> Result<u32, Error>;
    async fn flush(&self, inode: InodeId, handle: u64) -> Result<(), Error>;
    async fn sync(&self, inode: InodeId, handle: u64) -> Result<(), Error>;
}

/// Stub for read-oriented mounts.
pub struct NullWriteBuffer;

#[async_trait]
impl WriteBuffer for NullWriteBuffer {
    async fn write(
        &self,
        _inode: InodeId,
        _handle: u64,
        _offset: u64,
        _data: Bytes,
    ) -> Result<u32, Error> {
        Err(Error::NotSupported("write buffering is not wired up"))
    }
    async fn flush(&self, _inode: InodeId, _handle: u64) -> Result<(), Error> {
        Ok(())
    }
    async fn sync(&self, _inode: InodeId, _handle: u64) -> Result<(), Error> {
        Ok(())
    }
}
