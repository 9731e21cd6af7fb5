use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tempfile::NamedTempFile;

use crate::core::{CaptureResult, Sample};
use crate::storage::container::{decode_samples, encode_samples};

const SAMPLE_BYTES: u64 = 8;

/// Append-only safety buffer for one recording.
///
/// Chunks go to a temp file (`rf_capture_*.iq`, raw interleaved f32 I/Q) and
/// optionally to memory. The temp file is removed when the buffer is dropped
/// unless [`RecordingBuffer::keep`] hands it over for manual recovery.
pub struct RecordingBuffer {
    file: Option<NamedTempFile>,
    memory: Option<Vec<Sample>>,
    bytes_written: u64,
    last_flush: Instant,
    flush_interval: Duration,
    write_errors: u64,
}

/// Samples chosen after comparing memory and disk.
#[derive(Debug)]
pub struct Reconciled {
    pub samples: Vec<Sample>,
    /// Disk and memory disagreed, disk copy won.
    pub from_disk_mismatch: bool,
}

impl RecordingBuffer {
    /// Opens the temp file in `dir` (system temp when `None`). Failure to
    /// create it degrades to memory-only capture.
    pub fn open(dir: Option<&Path>, collect_in_memory: bool, flush_interval: Duration) -> Self {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("rf_capture_").suffix(".iq");
            b
        };
        let created = match dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        };

        let file = match created {
            Ok(file) => Some(file),
            Err(e) => {
                log::warn!(
                    "unable to create disk buffer, continuing without disk safety buffer: {}",
                    e
                );
                None
            }
        };

        // ohne Platte muss im Speicher gesammelt werden
        let memory = (collect_in_memory || file.is_none()).then(Vec::new);

        Self {
            file,
            memory,
            bytes_written: 0,
            last_flush: Instant::now(),
            flush_interval,
            write_errors: 0,
        }
    }

    pub fn has_disk(&self) -> bool {
        self.file.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn disk_sample_count(&self) -> usize {
        (self.bytes_written / SAMPLE_BYTES) as usize
    }

    pub fn memory_sample_count(&self) -> usize {
        self.memory.as_ref().map(Vec::len).unwrap_or(0)
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors
    }

    /// Appends one chunk. Disk errors are logged, never fatal.
    pub fn append(&mut self, chunk: &[Sample]) {
        if let Some(memory) = self.memory.as_mut() {
            memory.extend_from_slice(chunk);
        }

        let Some(file) = self.file.as_mut() else {
            return;
        };
        let bytes = encode_samples(chunk);
        match file.as_file_mut().write_all(&bytes) {
            Ok(()) => self.bytes_written += bytes.len() as u64,
            Err(e) => {
                self.write_errors += 1;
                log::warn!("disk buffer write failed: {}", e);
                self.rollback_torn_write();
                return;
            }
        }

        if self.last_flush.elapsed() >= self.flush_interval {
            if let Err(e) = file.as_file().sync_data() {
                log::warn!("disk buffer fsync failed: {}", e);
            }
            self.last_flush = Instant::now();
        }
    }

    /// Cuts a partially written chunk so the next append stays aligned.
    fn rollback_torn_write(&mut self) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let len = self.bytes_written;
        let file = file.as_file_mut();
        if let Err(e) = file.set_len(len).and_then(|_| file.seek(SeekFrom::Start(len))) {
            log::warn!("unable to truncate disk buffer to {} bytes: {}", len, e);
        }
    }

    /// Final fsync before the buffer is read back.
    pub fn sync(&mut self) {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.as_file().sync_all() {
                log::warn!("unable to flush disk buffer: {}", e);
            }
            self.last_flush = Instant::now();
        }
    }

    pub fn read_disk(&self) -> CaptureResult<Vec<Sample>> {
        match self.file.as_ref() {
            Some(file) => {
                let mut bytes = Vec::with_capacity(self.bytes_written as usize);
                File::open(file.path())?
                    .take(self.bytes_written)
                    .read_to_end(&mut bytes)?;
                Ok(decode_samples(&bytes))
            }
            None => Ok(Vec::new()),
        }
    }

    /// Picks the samples to persist. The disk copy reflects everything
    /// durably written, so it wins whenever the two disagree.
    pub fn reconcile(&mut self) -> CaptureResult<Reconciled> {
        let memory = self.memory.take();
        if self.disk_sample_count() == 0 {
            return Ok(Reconciled {
                samples: memory.unwrap_or_default(),
                from_disk_mismatch: false,
            });
        }

        let disk = self.read_disk()?;
        let mismatch = matches!(&memory, Some(m) if m.len() != disk.len());
        if mismatch {
            log::warn!(
                "buffered ({}) and in-memory ({}) sample counts differ, using buffered copy",
                disk.len(),
                memory.as_ref().map(Vec::len).unwrap_or(0)
            );
        }
        Ok(Reconciled {
            samples: disk,
            from_disk_mismatch: mismatch,
        })
    }

    /// Everything buffered so far, disk preferred. Used by the recovery path.
    pub fn buffered_samples(&self) -> CaptureResult<Vec<Sample>> {
        if self.disk_sample_count() > 0 {
            return self.read_disk();
        }
        Ok(self.memory.clone().unwrap_or_default())
    }

    /// Persists the temp file for manual recovery and returns its path.
    pub fn keep(mut self) -> Option<PathBuf> {
        let file = self.file.take()?;
        match file.keep() {
            Ok((_, path)) => Some(path),
            Err(e) => {
                log::error!("unable to retain disk buffer: {}", e);
                None
            }
        }
    }

    /// Removes the temp file. Only called once an artifact is committed.
    pub fn discard(mut self) {
        if let Some(file) = self.file.take() {
            let path = file.path().to_path_buf();
            if let Err(e) = file.close() {
                log::warn!("unable to remove temporary buffer {:?}: {}", path, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(n: usize, offset: f32) -> Vec<Sample> {
        (0..n).map(|i| Sample::new(offset + i as f32, 0.0)).collect()
    }

    #[test]
    fn test_append_tracks_disk_and_memory() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = RecordingBuffer::open(Some(dir.path()), true, Duration::from_secs(1));
        assert!(buffer.has_disk());
        let name = buffer.path().unwrap().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("rf_capture_") && name.ends_with(".iq"));

        buffer.append(&chunk(100, 0.0));
        buffer.append(&chunk(50, 100.0));
        buffer.sync();

        assert_eq!(buffer.bytes_written(), 150 * 8);
        assert_eq!(buffer.memory_sample_count(), 150);

        let reconciled = buffer.reconcile().unwrap();
        assert_eq!(reconciled.samples.len(), 150);
        assert!(!reconciled.from_disk_mismatch);
        assert_eq!(reconciled.samples[120], Sample::new(120.0, 0.0));
    }

    #[test]
    fn test_missing_dir_degrades_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does/not/exist");
        let mut buffer = RecordingBuffer::open(Some(&missing), false, Duration::from_secs(1));
        assert!(!buffer.has_disk());

        buffer.append(&chunk(10, 0.0));
        assert_eq!(buffer.memory_sample_count(), 10);
        assert_eq!(buffer.reconcile().unwrap().samples.len(), 10);
    }

    #[test]
    fn test_disk_only_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = RecordingBuffer::open(Some(dir.path()), false, Duration::from_secs(1));
        buffer.append(&chunk(32, 0.0));
        buffer.sync();

        let reconciled = buffer.reconcile().unwrap();
        assert_eq!(reconciled.samples.len(), 32);
        assert!(!reconciled.from_disk_mismatch);
    }

    #[test]
    fn test_torn_write_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = RecordingBuffer::open(Some(dir.path()), true, Duration::from_secs(1));
        buffer.append(&chunk(10, 0.0));

        // halber Chunk auf der Platte, wie nach einem abgebrochenen write_all
        buffer.file.as_mut().unwrap().as_file_mut().write_all(&[0xAB; 13]).unwrap();
        buffer.rollback_torn_write();
        buffer.append(&chunk(5, 10.0));
        buffer.sync();

        let on_disk = std::fs::metadata(buffer.path().unwrap()).unwrap().len();
        assert_eq!(on_disk, buffer.bytes_written());
        let reconciled = buffer.reconcile().unwrap();
        assert!(!reconciled.from_disk_mismatch);
        assert_eq!(reconciled.samples.len(), 15);
        assert_eq!(reconciled.samples[12], Sample::new(12.0, 0.0));
    }

    #[test]
    fn test_read_disk_ignores_uncounted_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = RecordingBuffer::open(Some(dir.path()), false, Duration::from_secs(1));
        buffer.append(&chunk(8, 0.0));
        buffer.file.as_mut().unwrap().as_file_mut().write_all(&[0xCD; 5]).unwrap();

        let samples = buffer.read_disk().unwrap();
        assert_eq!(samples.len(), buffer.disk_sample_count());
        assert_eq!(samples, chunk(8, 0.0));
    }

    #[test]
    fn test_keep_retains_and_discard_removes() {
        let dir = tempfile::tempdir().unwrap();

        let mut kept = RecordingBuffer::open(Some(dir.path()), false, Duration::from_secs(1));
        kept.append(&chunk(4, 0.0));
        let path = kept.keep().unwrap();
        assert!(path.exists());

        let mut dropped = RecordingBuffer::open(Some(dir.path()), false, Duration::from_secs(1));
        dropped.append(&chunk(4, 0.0));
        let temp = dropped.path().unwrap().to_path_buf();
        dropped.discard();
        assert!(!temp.exists());
    }
}
