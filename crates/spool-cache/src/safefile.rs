//! Crash-safe file replacement
//!
//! Content is written to a sibling `.tmp` file and only moved over the
//! destination once it is complete and synced, so a reader never observes a
//! missing or truncated destination.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::warn;

const TMP_SUFFIX: &str = ".tmp";
const BACKUP_SUFFIX: &str = "~";

/// A pending replacement of `dest`
#[derive(Debug)]
pub struct SafeFile {
    dest: PathBuf,
    tmp: PathBuf,
    file: File,
}

impl SafeFile {
    /// Start writing a new version of `dest`
    pub async fn create(dest: impl Into<PathBuf>) -> io::Result<Self> {
        let dest = dest.into();
        let tmp = with_suffix(&dest, TMP_SUFFIX);
        let file = File::create(&tmp).await?;
        Ok(Self { dest, tmp, file })
    }

    pub fn destination(&self) -> &Path {
        &self.dest
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.file.write_all(buf).await
    }

    /// Sync the temporary file and move it over the destination.
    pub async fn commit(self) -> io::Result<()> {
        let SafeFile {
            dest,
            tmp,
            mut file,
        } = self;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        replace(&tmp, &dest).await
    }

    /// Give up on the new version and remove the temporary file.
    pub async fn abort(self) -> io::Result<()> {
        let SafeFile { tmp, file, .. } = self;
        drop(file);
        fs::remove_file(&tmp).await
    }
}

/// Replace `dest` with `contents`.
pub async fn write_atomic(dest: impl Into<PathBuf>, contents: &[u8]) -> io::Result<()> {
    let mut file = SafeFile::create(dest).await?;
    if let Err(e) = file.write_all(contents).await {
        let _ = file.abort().await;
        return Err(e);
    }
    file.commit().await
}

#[cfg(unix)]
async fn replace(tmp: &Path, dest: &Path) -> io::Result<()> {
    fs::rename(tmp, dest).await
}

#[cfg(not(unix))]
async fn replace(tmp: &Path, dest: &Path) -> io::Result<()> {
    replace_with_backup(tmp, dest).await
}

/// Move `tmp` over `dest` on filesystems where rename does not replace an
/// existing file. The previous destination is parked under a `~` name and
/// restored if the final rename fails.
pub async fn replace_with_backup(tmp: &Path, dest: &Path) -> io::Result<()> {
    let backup = with_suffix(dest, BACKUP_SUFFIX);

    let had_dest = match fs::metadata(dest).await {
        Ok(_) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => return Err(e),
    };

    if had_dest {
        match fs::remove_file(&backup).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::rename(dest, &backup).await?;
    }

    match fs::rename(tmp, dest).await {
        Ok(()) => {
            if had_dest {
                if let Err(e) = fs::remove_file(&backup).await {
                    warn!(backup = ?backup, error = %e, "Failed to remove backup file");
                }
            }
            Ok(())
        }
        Err(err) => {
            if had_dest {
                fs::rename(&backup, dest).await?;
            }
            Err(err)
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
