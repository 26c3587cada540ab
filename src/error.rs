//! Filesystem error taxonomy and errno translation.
use crate::bucket::StoreError;

/// Main error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no such entry: {0:?}")]
    NotFound(String),
    #[error("entry already exists: {0:?}")]
    AlreadyExists(String),
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),
    #[error("directory not empty: {0:?}")]
    NotEmpty(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),
    #[error("unknown handle {0}")]
    BadHandle(u64),
    #[error("unknown inode {0}")]
    BadInode(u64),
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("rename would touch more than {0} entries")]
    RenameLimitExceeded(usize),
    #[error("folio pool exhausted")]
    PoolExhausted,
    #[error("backing object changed generation under an open handle")]
    Clobbered,
    #[error("name is not valid unicode")]
    Encoding,
    #[error("worker pool is stopped")]
    WorkersStopped,
    #[error("{0}")]
    Store(#[from] StoreError),
}

impl Error {
    /// Nearest errno for surfacing the error to the kernel.
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::NotSupported(_) => libc::ENOTSUP,
            Error::NotEmpty(_) => libc::ENOTEMPTY,
            Error::InvalidArgument(_) | Error::InvalidOptions(_) | Error::Encoding => libc::EINVAL,
            Error::BadHandle(_) => libc::EBADF,
            Error::BadInode(_) => libc::ENOENT,
            Error::NotADirectory => libc::ENOTDIR,
            Error::IsADirectory => libc::EISDIR,
            Error::RenameLimitExceeded(_) => libc::EMFILE,
            Error::Clobbered => libc::ESTALE,
            Error::Store(e) => match e {
                StoreError::NotFound => libc::ENOENT,
                StoreError::PermissionDenied => libc::EACCES,
                StoreError::PreconditionFailed | StoreError::Transient(_) => libc::EIO,
            },
            Error::PoolExhausted | Error::WorkersStopped => libc::EIO,
        }
    }
}
