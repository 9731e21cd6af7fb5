//! Temp-path + rename commits.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::core::{CaptureError, CaptureResult};

/// `<name>.<ext>.tmp` sibling of `target`.
pub fn temp_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    target.with_file_name(name)
}

/// `.<name>.tmp`: hidden sibling used by streaming writers.
pub fn hidden_temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.tmp"))
}

pub fn fsync_file(path: &Path) -> std::io::Result<()> {
    File::open(path)?.sync_all()
}

/// Makes a rename inside `dir` durable. Best effort on platforms that can't
/// open directories.
pub fn sync_directory(dir: &Path) {
    let dir = if dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        dir
    };
    match File::open(dir).and_then(|d| d.sync_all()) {
        Ok(()) => {}
        Err(e) => log::debug!("unable to sync directory {:?}: {}", dir, e),
    }
}

/// Temp file that is removed on drop unless it was committed.
#[derive(Debug)]
pub struct TempGuard {
    path: PathBuf,
    armed: bool,
}

impl TempGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// fsync, rename over `target`, fsync the parent directory.
    pub fn commit(mut self, target: &Path) -> CaptureResult<()> {
        fsync_file(&self.path).map_err(|e| CaptureError::persistence(&self.path, e.to_string()))?;
        fs::rename(&self.path, target)
            .map_err(|e| CaptureError::persistence(target, format!("rename failed: {e}")))?;
        self.armed = false;
        sync_directory(target.parent().unwrap_or_else(|| Path::new(".")));
        Ok(())
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.armed && self.path.exists() {
            if let Err(e) = fs::remove_file(&self.path) {
                log::warn!("failed to remove temp file {:?}: {}", self.path, e);
            }
        }
    }
}

/// Writes `target` through its `.tmp` sibling. On any error the destination
/// is left untouched and the temp file removed.
pub fn write_atomic<F>(target: &Path, write: F) -> CaptureResult<()>
where
    F: FnOnce(&mut BufWriter<File>) -> CaptureResult<()>,
{
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| CaptureError::persistence(parent, e.to_string()))?;
    }

    let guard = TempGuard::new(temp_path_for(target));
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(guard.path())
        .map_err(|e| CaptureError::persistence(guard.path(), e.to_string()))?;

    let mut writer = BufWriter::new(file);
    write(&mut writer)?;
    writer
        .flush()
        .map_err(|e| CaptureError::persistence(guard.path(), e.to_string()))?;
    drop(writer);

    guard.commit(target)
}
