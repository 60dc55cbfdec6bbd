//! Spill file and run directory.
//!
//! One spill file per collector, created lazily in a host-supplied temp
//! directory and unlinked on drop. The file moves through two discrete
//! phases: sequential buffered appends while runs are being written, then a
//! positioned-read phase for the merge. Reduction passes may append merged
//! runs while in the read phase; every read and append seeks explicitly, so
//! the interleaving is well-defined.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use rowuniq_error::{DedupError, Result};

/// Write-phase buffer size. Spills append one key at a time; batching them
/// into IO-cache-sized writes keeps the spill sequential on disk.
const SPILL_BUFFER_BYTES: usize = 256 * 1024;

/// Temp-file placement supplied by the host engine.
///
/// There are no hidden globals: the directory and filename prefix are passed
/// in explicitly, and concurrent collectors are expected to receive distinct
/// prefixes from the host's temp-file layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempConfig {
    /// Directory the spill file is created in.
    pub dir: PathBuf,
    /// Filename prefix for the spill file.
    pub prefix: String,
}

impl TempConfig {
    /// Create a config from explicit parts.
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Convenience config rooted at the OS temp directory.
    pub fn in_os_temp(prefix: impl Into<String>) -> Self {
        Self::new(std::env::temp_dir(), prefix)
    }
}

/// Descriptor of one sorted run inside the spill file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunDescriptor {
    /// Byte offset of the run's first key.
    pub offset: u64,
    /// Number of keys in the run.
    pub count: u64,
}

enum SpillState {
    /// No spill has happened; the physical file does not exist yet.
    Unopened,
    /// Write phase: sequential appends through the write buffer.
    Writing {
        file: NamedTempFile,
        buf: Vec<u8>,
        len: u64,
    },
    /// Read phase: positioned reads, plus positioned appends for merged runs.
    Reading { file: NamedTempFile, len: u64 },
}

/// Append-only scratch file of serialised sorted runs.
///
/// The backing temp file is removed when the `SpillFile` is dropped, in any
/// phase.
pub struct SpillFile {
    temp: TempConfig,
    state: SpillState,
    /// Test hook: fail every subsequent append, as a disk-full stand-in.
    #[cfg(test)]
    pub(crate) force_append_error: bool,
}

impl SpillFile {
    /// Create a spill file handle; the physical file is created on first
    /// append.
    pub fn new(temp: TempConfig) -> Self {
        Self {
            temp,
            state: SpillState::Unopened,
            #[cfg(test)]
            force_append_error: false,
        }
    }

    /// Total bytes appended so far, including write-buffered bytes.
    pub fn tell(&self) -> u64 {
        match &self.state {
            SpillState::Unopened => 0,
            SpillState::Writing { len, .. } | SpillState::Reading { len, .. } => *len,
        }
    }

    fn open_for_write(&mut self) -> Result<()> {
        fs::create_dir_all(&self.temp.dir).map_err(DedupError::spill_write)?;
        let file = tempfile::Builder::new()
            .prefix(self.temp.prefix.as_str())
            .suffix(".spill")
            .tempfile_in(&self.temp.dir)
            .map_err(DedupError::spill_write)?;
        debug!(path = %file.path().display(), "created spill file");
        let mut buf = Vec::new();
        buf.try_reserve(SPILL_BUFFER_BYTES)
            .map_err(|_| DedupError::oom("spill write buffer", SPILL_BUFFER_BYTES))?;
        self.state = SpillState::Writing { file, buf, len: 0 };
        Ok(())
    }

    /// Append bytes at the end of the file.
    ///
    /// In the write phase this goes through the write buffer; in the read
    /// phase it is a positioned write past the last appended byte.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        #[cfg(test)]
        if self.force_append_error {
            return Err(DedupError::spill_write(io::Error::other(
                "injected spill fault",
            )));
        }

        if matches!(self.state, SpillState::Unopened) {
            self.open_for_write()?;
        }
        match &mut self.state {
            SpillState::Writing { file, buf, len } => {
                if buf.len() + bytes.len() > SPILL_BUFFER_BYTES && !buf.is_empty() {
                    file.as_file_mut()
                        .write_all(buf)
                        .map_err(DedupError::spill_write)?;
                    buf.clear();
                }
                if bytes.len() >= SPILL_BUFFER_BYTES {
                    file.as_file_mut()
                        .write_all(bytes)
                        .map_err(DedupError::spill_write)?;
                } else {
                    buf.extend_from_slice(bytes);
                }
                *len += bytes.len() as u64;
                Ok(())
            }
            SpillState::Reading { file, len } => {
                let f = file.as_file_mut();
                f.seek(SeekFrom::Start(*len))
                    .map_err(DedupError::spill_write)?;
                f.write_all(bytes).map_err(DedupError::spill_write)?;
                *len += bytes.len() as u64;
                Ok(())
            }
            SpillState::Unopened => unreachable!("opened above"),
        }
    }

    /// Flush buffered writes and enter the read phase.
    ///
    /// Idempotent once in the read phase.
    pub fn switch_to_read(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, SpillState::Unopened) {
            SpillState::Unopened => Err(DedupError::merge(io::Error::other(
                "spill file was never written",
            ))),
            SpillState::Writing { mut file, buf, len } => {
                if !buf.is_empty() {
                    file.as_file_mut()
                        .write_all(&buf)
                        .map_err(DedupError::spill_write)?;
                }
                debug!(bytes = len, "spill file switched to read mode");
                self.state = SpillState::Reading { file, len };
                Ok(())
            }
            reading @ SpillState::Reading { .. } => {
                self.state = reading;
                Ok(())
            }
        }
    }

    /// Read exactly `buf.len()` bytes starting at `offset`.
    ///
    /// Only valid in the read phase.
    pub fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match &mut self.state {
            SpillState::Reading { file, len } => {
                debug_assert!(offset + buf.len() as u64 <= *len);
                let f = file.as_file_mut();
                f.seek(SeekFrom::Start(offset)).map_err(DedupError::merge)?;
                f.read_exact(buf).map_err(DedupError::merge)?;
                Ok(())
            }
            _ => Err(DedupError::merge(io::Error::other(
                "spill file is not in read mode",
            ))),
        }
    }
}

impl std::fmt::Debug for SpillFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match &self.state {
            SpillState::Unopened => "unopened",
            SpillState::Writing { .. } => "writing",
            SpillState::Reading { .. } => "reading",
        };
        f.debug_struct("SpillFile")
            .field("phase", &phase)
            .field("len", &self.tell())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp() -> (tempfile::TempDir, TempConfig) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = TempConfig::new(dir.path(), "rowuniq-test-");
        (dir, cfg)
    }

    #[test]
    fn lazy_open_and_tell() {
        let (_dir, cfg) = temp();
        let mut file = SpillFile::new(cfg);
        assert_eq!(file.tell(), 0);
        file.append(b"abcd").unwrap();
        assert_eq!(file.tell(), 4);
        file.append(b"efgh").unwrap();
        assert_eq!(file.tell(), 8);
    }

    #[test]
    fn write_then_read_roundtrip() {
        let (_dir, cfg) = temp();
        let mut file = SpillFile::new(cfg);
        for chunk in [b"run1" as &[u8], b"run2", b"run3"] {
            file.append(chunk).unwrap();
        }
        file.switch_to_read().unwrap();

        let mut buf = [0u8; 4];
        file.read_exact_at(4, &mut buf).unwrap();
        assert_eq!(&buf, b"run2");
        file.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"run1");
    }

    #[test]
    fn append_during_read_phase() {
        let (_dir, cfg) = temp();
        let mut file = SpillFile::new(cfg);
        file.append(b"first").unwrap();
        file.switch_to_read().unwrap();

        // A merged run appended mid-read lands past the existing bytes and
        // is readable at its recorded offset.
        let offset = file.tell();
        file.append(b"merged").unwrap();
        assert_eq!(file.tell(), offset + 6);

        let mut buf = [0u8; 6];
        file.read_exact_at(offset, &mut buf).unwrap();
        assert_eq!(&buf, b"merged");

        let mut head = [0u8; 5];
        file.read_exact_at(0, &mut head).unwrap();
        assert_eq!(&head, b"first");
    }

    #[test]
    fn read_requires_read_phase() {
        let (_dir, cfg) = temp();
        let mut file = SpillFile::new(cfg);
        file.append(b"data").unwrap();
        let mut buf = [0u8; 4];
        let err = file.read_exact_at(0, &mut buf).unwrap_err();
        assert!(matches!(err, DedupError::Merge { .. }));
    }

    #[test]
    fn switch_without_writes_is_an_error() {
        let (_dir, cfg) = temp();
        let mut file = SpillFile::new(cfg);
        assert!(file.switch_to_read().is_err());
    }

    #[test]
    fn injected_fault_surfaces_as_spill_write() {
        let (_dir, cfg) = temp();
        let mut file = SpillFile::new(cfg);
        file.append(b"ok").unwrap();
        file.force_append_error = true;
        let err = file.append(b"boom").unwrap_err();
        assert!(matches!(err, DedupError::SpillWrite { .. }));
    }

    #[test]
    fn spill_file_is_removed_on_drop() {
        let (_dir, cfg) = temp();
        let dir_path = cfg.dir.clone();
        {
            let mut file = SpillFile::new(cfg);
            file.append(b"bytes").unwrap();
            assert_eq!(fs::read_dir(&dir_path).unwrap().count(), 1);
        }
        assert_eq!(fs::read_dir(&dir_path).unwrap().count(), 0);
    }
}
