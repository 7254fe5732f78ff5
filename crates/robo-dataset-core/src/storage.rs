//! Filesystem storage backend.
//!
//! This module centralizes all byte-level IO performed by `robo-dataset-core`.
//! Higher layers (`packaging`, `dataset`) work with a [`StorageLocation`] (the
//! dataset root) plus relative paths produced by [`crate::layout`], and never
//! touch `std::fs` / `tokio::fs` directly for metadata files.
//!
//! Provided primitives:
//!
//! - atomic write-then-rename for small files such as the manifest,
//! - reads with `NotFound` classified separately from other IO errors,
//! - a head/tail read used to validate Parquet shard magic at open time,
//! - temp-file sinks for streaming shard output (see [`output`]).
//!
//! Only the local filesystem is supported. The API is shaped so an object
//! store backend could be added as another `StorageLocation` variant.

pub mod output;

use snafu::{Backtrace, prelude::*};
use std::{
    error::Error,
    fmt,
    io::{self, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

/// General result type used by storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Root location of a dataset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageLocation {
    /// A dataset stored on the local filesystem at the given path.
    Local(PathBuf),
}

impl StorageLocation {
    /// Creates a new `StorageLocation` for a local filesystem path.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        StorageLocation::Local(root.into())
    }

    /// Root directory of the location.
    pub fn root(&self) -> &Path {
        match self {
            StorageLocation::Local(root) => root,
        }
    }

    /// Resolve a path relative to the root into an absolute local path.
    pub fn resolve(&self, rel: &Path) -> PathBuf {
        join_local(self, rel)
    }
}

/// Errors produced by the storage backend implementation.
#[derive(Debug)]
pub enum BackendError {
    /// A local filesystem I/O error.
    Local(io::Error),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Local(e) => write!(f, "local I/O error: {e}"),
        }
    }
}

impl Error for BackendError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BackendError::Local(e) => Some(e),
        }
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    /// The specified path was not found.
    #[snafu(display("Path not found: {path}"))]
    NotFound {
        /// The path that was not found.
        path: String,
        /// Underlying backend error that caused the failure.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The specified path already exists when creation was requested with
    /// create-new semantics.
    #[snafu(display("Path already exists: {path}"))]
    AlreadyExists {
        /// The path that was found to already exist.
        path: String,
        /// Underlying backend error that indicates the existing resource.
        source: BackendError,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },

    /// A directory that must be fresh already has entries in it.
    #[snafu(display("Directory is not empty: {path}"))]
    NotEmpty {
        /// The offending directory.
        path: String,
        /// The backtrace captured when the error occurred.
        backtrace: Backtrace,
    },

    /// An I/O error occurred on the local filesystem.
    #[snafu(display("Local I/O error at {path}: {source}"))]
    OtherIo {
        /// The path where the I/O error occurred.
        path: String,
        /// Underlying backend I/O error with platform-specific details.
        source: BackendError,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

pub(crate) fn join_local(location: &StorageLocation, rel: &Path) -> PathBuf {
    match location {
        StorageLocation::Local(root) => root.join(rel),
    }
}

fn classify(e: io::Error, path: &Path) -> StorageError {
    let path = path.display().to_string();
    match e.kind() {
        io::ErrorKind::NotFound => StorageError::NotFound {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        },
        io::ErrorKind::AlreadyExists => StorageError::AlreadyExists {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        },
        _ => StorageError::OtherIo {
            path,
            source: BackendError::Local(e),
            backtrace: Backtrace::capture(),
        },
    }
}

pub(crate) async fn create_parent_dir(abs: &Path) -> StorageResult<()> {
    if let Some(parent) = abs.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: parent.display().to_string(),
            })?;
    }
    Ok(())
}

/// Guard that removes a temporary file on drop unless disarmed.
/// Used to ensure cleanup on error paths during atomic writes.
#[derive(Debug)]
pub(crate) struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// Disarm the guard so the file is NOT removed on drop.
    pub(crate) fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            // Best-effort cleanup; we are likely already unwinding another error.
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Make sure the location root exists and has no entries.
///
/// A missing root is created. An existing root with any entry in it yields
/// [`StorageError::NotEmpty`]: datasets are always written into a fresh
/// directory, never over an existing one.
pub async fn ensure_empty_root(location: &StorageLocation) -> StorageResult<()> {
    match location {
        StorageLocation::Local(root) => {
            fs::create_dir_all(root)
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: root.display().to_string(),
                })?;

            let mut entries = fs::read_dir(root).await.map_err(|e| classify(e, root))?;
            let first = entries.next_entry().await.map_err(|e| classify(e, root))?;
            if first.is_some() {
                return NotEmptySnafu {
                    path: root.display().to_string(),
                }
                .fail();
            }
            Ok(())
        }
    }
}

/// Write `contents` to `rel_path` inside `location` using an atomic write.
///
/// Writes the payload to a temporary file next to the target, syncs it and
/// renames it into place. The temporary file is removed on any error.
pub async fn write_atomic(
    location: &StorageLocation,
    rel_path: &Path,
    contents: &[u8],
) -> StorageResult<()> {
    match location {
        StorageLocation::Local(_) => {
            let abs = join_local(location, rel_path);

            create_parent_dir(&abs).await?;

            let tmp_path = abs.with_extension("tmp");
            let mut guard = TempFileGuard::new(tmp_path.clone());

            {
                let mut file = fs::File::create(&tmp_path)
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: tmp_path.display().to_string(),
                    })?;

                file.write_all(contents)
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: tmp_path.display().to_string(),
                    })?;

                file.sync_all()
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: tmp_path.display().to_string(),
                    })?;
            }

            fs::rename(&tmp_path, &abs)
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: abs.display().to_string(),
                })?;

            guard.disarm();

            Ok(())
        }
    }
}

/// Read the file at `rel_path` within the given `location` as a `String`.
///
/// A missing file yields [`StorageError::NotFound`]; other problems produce
/// [`StorageError::OtherIo`].
pub async fn read_to_string(location: &StorageLocation, rel_path: &Path) -> StorageResult<String> {
    match location {
        StorageLocation::Local(_) => {
            let abs = join_local(location, rel_path);

            match fs::read_to_string(&abs).await {
                Ok(s) => Ok(s),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BackendError::Local(e))
                    .context(NotFoundSnafu {
                        path: abs.display().to_string(),
                    }),
                Err(e) => Err(BackendError::Local(e)).context(OtherIoSnafu {
                    path: abs.display().to_string(),
                }),
            }
        }
    }
}

/// Length plus first/last 4 bytes of a file.
pub struct FileHeadTail4 {
    /// Length of the file in bytes.
    pub len: u64,
    /// First 4 bytes of the file (zero-filled if the file is shorter).
    pub head: [u8; 4],
    /// Last 4 bytes of the file (zero-filled if the file is shorter than 8 bytes).
    pub tail: [u8; 4],
}

/// Read the length, first 4 bytes, and last 4 bytes of a file at `rel_path`.
///
/// - On missing file (or a non-regular file): `StorageError::NotFound`.
/// - On other I/O problems: `StorageError::OtherIo`.
///
/// `tail` is only populated for files of at least 8 bytes so head and tail
/// never overlap; Parquet magic validation relies on that.
pub async fn read_head_tail_4(
    location: &StorageLocation,
    rel_path: &Path,
) -> StorageResult<FileHeadTail4> {
    match location {
        StorageLocation::Local(_) => {
            let abs = join_local(location, rel_path);
            let path_str = abs.display().to_string();

            let meta = match fs::metadata(&abs).await {
                Ok(m) => m,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(BackendError::Local(e)).context(NotFoundSnafu { path: path_str });
                }
                Err(e) => {
                    return Err(BackendError::Local(e)).context(OtherIoSnafu { path: path_str });
                }
            };

            if !meta.is_file() {
                let synthetic = io::Error::other("not a regular file");
                return Err(StorageError::NotFound {
                    path: path_str,
                    source: BackendError::Local(synthetic),
                    backtrace: Backtrace::capture(),
                });
            }

            let len = meta.len();

            let mut file = fs::File::open(&abs)
                .await
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: path_str.clone(),
                })?;

            let mut head = [0u8; 4];
            let mut tail = [0u8; 4];

            if len >= 4 {
                file.read_exact(&mut head)
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: path_str.clone(),
                    })?;
            }

            if len >= 8 {
                file.seek(SeekFrom::End(-4))
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: path_str.clone(),
                    })?;
                file.read_exact(&mut tail)
                    .await
                    .map_err(BackendError::Local)
                    .context(OtherIoSnafu {
                        path: path_str.clone(),
                    })?;
            }
            Ok(FileHeadTail4 { len, head, tail })
        }
    }
}
