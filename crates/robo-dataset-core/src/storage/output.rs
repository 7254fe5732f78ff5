use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
};

use snafu::ResultExt;
use tokio::fs;

use crate::storage::{
    BackendError, OtherIoSnafu, StorageLocation, StorageResult, TempFileGuard, create_parent_dir,
    join_local,
};

/// A file being streamed to a temporary path that becomes visible at its
/// final path only on [`PendingFile::commit`].
///
/// The writer is handed out separately so an owning encoder (the Parquet
/// `ArrowWriter` takes its sink by value) can wrap it; the encoder gives the
/// writer back when it is done and the caller passes it to `commit`.
/// Dropping a `PendingFile` without committing removes the temp file.
#[derive(Debug)]
pub struct PendingFile {
    tmp_path: PathBuf,
    final_path: PathBuf,
    guard: TempFileGuard,
}

impl PendingFile {
    /// Final path the file is renamed to on commit.
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Flush and fsync `writer`, rename the temp file into place and return
    /// the committed size in bytes.
    pub async fn commit(mut self, writer: BufWriter<File>) -> StorageResult<u64> {
        let file = writer
            .into_inner()
            .map_err(|e| BackendError::Local(e.into_error()))
            .context(OtherIoSnafu {
                path: self.tmp_path.display().to_string(),
            })?;

        file.sync_all()
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: self.tmp_path.display().to_string(),
            })?;

        let len = file
            .metadata()
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: self.tmp_path.display().to_string(),
            })?
            .len();
        drop(file);

        fs::rename(&self.tmp_path, &self.final_path)
            .await
            .map_err(BackendError::Local)
            .context(OtherIoSnafu {
                path: self.final_path.display().to_string(),
            })?;

        self.guard.disarm();
        Ok(len)
    }
}

/// Open a pending file at `location` + `rel_path`.
///
/// Returns the pending handle and a buffered writer over the temp file.
/// Uses `std::fs::File` because Arrow writers require `std::io::Write`.
pub async fn open_pending_file(
    location: &StorageLocation,
    rel_path: &Path,
) -> StorageResult<(PendingFile, BufWriter<File>)> {
    match location {
        StorageLocation::Local(_) => {
            let final_path = join_local(location, rel_path);
            create_parent_dir(&final_path).await?;

            let tmp_path = final_path.with_extension("tmp");
            let file = File::create(&tmp_path)
                .map_err(BackendError::Local)
                .context(OtherIoSnafu {
                    path: tmp_path.display().to_string(),
                })?;
            let guard = TempFileGuard::new(tmp_path.clone());

            Ok((
                PendingFile {
                    tmp_path,
                    final_path,
                    guard,
                },
                BufWriter::new(file),
            ))
        }
    }
}
