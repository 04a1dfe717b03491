//! Archive cache - package run output on first download, serve it thereafter
//!
//! Layout under the output root, per format:
//!
//! ```text
//! <output_root>/
//! ├── csv/
//! │   ├── <run_id>/                  # raw generator output, flat
//! │   └── <run_id>_csv.tar.zst       # built on first download
//! └── fhir/
//!     └── ...
//! ```
//!
//! Building an archive consumes the raw directory, so after the first download
//! only the archive remains. An existing archive is never rebuilt.
//!
//! Every mutation of one (run, format) pair happens under that pair's lock.
//! `purge` takes the locks of all formats in turn, so it never interleaves with
//! a build for the same run.

use dashmap::DashMap;
use popgen_core::{Error, Format, Result, RunId};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use walkdir::WalkDir;

/// File extension of built archives.
pub const ARCHIVE_EXTENSION: &str = "tar.zst";

const ZSTD_LEVEL: i32 = 3;

/// What is on disk for one (run, format) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactState {
    Raw,
    Archived,
    Missing,
}

pub struct ArchiveCache {
    output_root: PathBuf,
    locks: DashMap<(RunId, Format), Arc<Mutex<()>>>,
}

impl ArchiveCache {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            locks: DashMap::new(),
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    pub fn format_root(&self, format: Format) -> PathBuf {
        self.output_root.join(format.as_str())
    }

    pub fn raw_dir(&self, run_id: &RunId, format: Format) -> PathBuf {
        self.format_root(format).join(run_id.as_str())
    }

    pub fn archive_path(&self, run_id: &RunId, format: Format) -> PathBuf {
        self.format_root(format).join(archive_file_name(run_id, format))
    }

    pub fn state(&self, run_id: &RunId, format: Format) -> ArtifactState {
        if self.archive_path(run_id, format).is_file() {
            ArtifactState::Archived
        } else if self.raw_dir(run_id, format).is_dir() {
            ArtifactState::Raw
        } else {
            ArtifactState::Missing
        }
    }

    fn lock_for(&self, run_id: &RunId, format: Format) -> Arc<Mutex<()>> {
        self.locks
            .entry((run_id.clone(), format))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry for a key once no other task holds it.
    fn release(&self, run_id: &RunId, format: Format, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks
            .remove_if(&(run_id.clone(), format), |_, l| Arc::strong_count(l) == 1);
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.len()
    }

    /// Path of the ready archive for (run, format), building it if needed.
    pub async fn materialize(&self, run_id: &RunId, format: Format) -> Result<PathBuf> {
        let lock = self.lock_for(run_id, format);
        let guard = lock.lock().await;
        let result = self.materialize_locked(run_id, format).await;
        drop(guard);
        self.release(run_id, format, lock);
        result
    }

    async fn materialize_locked(&self, run_id: &RunId, format: Format) -> Result<PathBuf> {
        let archive = self.archive_path(run_id, format);
        let raw = self.raw_dir(run_id, format);

        if archive.is_file() {
            if raw.is_dir() {
                // Left behind by an interrupted build; the archive was already renamed in place.
                warn!("Removing stale raw output {} next to its archive", raw.display());
                remove_dir_if_present(&raw).await?;
            }
            return Ok(archive);
        }

        if !raw.is_dir() {
            return Err(Error::not_found(format!(
                "no {} output for run {}",
                format, run_id
            )));
        }

        let (src, dst) = (raw.clone(), archive.clone());
        let files = tokio::task::spawn_blocking(move || build_archive(&src, &dst))
            .await
            .map_err(|e| Error::Internal(format!("archive task failed: {}", e)))??;

        remove_dir_if_present(&raw).await?;
        info!(
            "Archived {} output of run {} ({} files) -> {}",
            format,
            run_id,
            files,
            archive.display()
        );
        Ok(archive)
    }

    /// Remove raw output and archives of every format for a run. Removing
    /// something that is not there is not an error.
    pub async fn purge(&self, run_id: &RunId) -> Result<()> {
        let mut first_error = None;

        for format in Format::ALL {
            let lock = self.lock_for(run_id, format);
            let guard = lock.lock().await;

            let raw = self.raw_dir(run_id, format);
            let archive = self.archive_path(run_id, format);
            for result in [
                remove_dir_if_present(&raw).await,
                remove_file_if_present(&archive).await,
            ] {
                if let Err(e) = result {
                    warn!("Failed to purge {} output of run {}: {}", format, run_id, e);
                    first_error.get_or_insert(e);
                }
            }

            drop(guard);
            self.release(run_id, format, lock);
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Purged all artifacts of run {}", run_id);
                Ok(())
            }
        }
    }
}

pub fn archive_file_name(run_id: &RunId, format: Format) -> String {
    format!("{}_{}.{}", run_id, format, ARCHIVE_EXTENSION)
}

/// Write every file directly inside `raw` into a zstd-compressed tar at
/// `archive`. The archive appears at its final path only once complete.
fn build_archive(raw: &Path, archive: &Path) -> Result<usize> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let partial = archive.with_file_name(format!("{}.partial-{}", name, uuid::Uuid::new_v4()));

    let result = write_archive(raw, &partial).and_then(|files| {
        std::fs::rename(&partial, archive)?;
        Ok(files)
    });
    if result.is_err() {
        let _ = std::fs::remove_file(&partial);
    }
    result
}

fn write_archive(raw: &Path, dest: &Path) -> Result<usize> {
    let file = File::create(dest)?;
    let encoder = zstd::Encoder::new(BufWriter::new(file), ZSTD_LEVEL)
        .map_err(|e| Error::archive(format!("zstd encoder: {}", e)))?;
    let mut builder = tar::Builder::new(encoder);

    let mut files = 0;
    for entry in WalkDir::new(raw).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::archive(e.to_string()))?;
        if !entry.file_type().is_file() {
            return Err(Error::archive(format!(
                "{} is not a regular file; raw output left in place",
                entry.path().display()
            )));
        }
        builder
            .append_path_with_name(entry.path(), entry.file_name())
            .map_err(|e| Error::archive(format!("add {}: {}", entry.path().display(), e)))?;
        files += 1;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| Error::archive(format!("finish tar: {}", e)))?;
    let mut writer = encoder
        .finish()
        .map_err(|e| Error::archive(format!("finish zstd: {}", e)))?;
    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| Error::archive(format!("flush archive: {}", e)))?;
    file.sync_all()?;
    Ok(files)
}

async fn remove_dir_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn remove_file_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
