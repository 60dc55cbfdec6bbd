//! Output sinks for extracted keys.
//!
//! A sink receives the sorted, duplicate-free key sequence in one of two
//! modes: a single owned buffer when the whole set fit in memory, or a
//! streamed sequence of keys when the set was merged off disk. `finish` is
//! called exactly once after a successful extraction; on a failed extraction
//! the sink is never finished and its partial contents are to be discarded
//! by the caller.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};

use tempfile::NamedTempFile;

use rowuniq_error::{DedupError, Result};

use crate::spill::TempConfig;

/// Spool I/O buffer size for the streamed output file.
const SPOOL_BUFFER_BYTES: usize = 128 * 1024;

/// Destination for extracted keys.
pub trait KeySink {
    /// Fast path: take ownership of a buffer holding `keys.len() / key_size`
    /// sorted unique keys laid out contiguously.
    ///
    /// The default forwards each key to [`write_key`](Self::write_key) so
    /// stream-only sinks serve the fast path too.
    fn accept_buffer(&mut self, keys: Vec<u8>, key_size: usize) -> Result<()> {
        for key in keys.chunks(key_size.max(1)) {
            self.write_key(key)?;
        }
        Ok(())
    }

    /// Slow path: receive the next key in sorted unique order.
    fn write_key(&mut self, key: &[u8]) -> Result<()>;

    /// Called once after the last key of a successful extraction.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// In-memory sink collecting keys into one contiguous buffer.
#[derive(Debug, Default)]
pub struct VecSink {
    key_size: usize,
    buf: Vec<u8>,
}

impl VecSink {
    /// Create a sink for keys of `key_size` bytes.
    pub fn new(key_size: usize) -> Self {
        Self {
            key_size,
            buf: Vec::new(),
        }
    }

    /// Number of keys received.
    pub fn key_count(&self) -> usize {
        if self.key_size == 0 {
            0
        } else {
            self.buf.len() / self.key_size
        }
    }

    /// Iterate the received keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.buf.chunks(self.key_size.max(1))
    }

    /// Consume the sink, returning the raw contiguous key bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl KeySink for VecSink {
    fn accept_buffer(&mut self, keys: Vec<u8>, key_size: usize) -> Result<()> {
        debug_assert_eq!(key_size, self.key_size);
        if self.buf.is_empty() {
            self.buf = keys;
        } else {
            self.buf
                .try_reserve(keys.len())
                .map_err(|_| DedupError::oom("sink buffer", keys.len()))?;
            self.buf.extend_from_slice(&keys);
        }
        Ok(())
    }

    fn write_key(&mut self, key: &[u8]) -> Result<()> {
        self.buf
            .try_reserve(key.len())
            .map_err(|_| DedupError::oom("sink buffer", key.len()))?;
        self.buf.extend_from_slice(key);
        Ok(())
    }
}

/// Stream sink spooling keys to a temp file.
///
/// During extraction the spool is write-only; [`finish`](KeySink::finish)
/// flushes and switches it into a read cache, after which
/// [`keys`](SpoolSink::keys) iterates the emitted sequence in order. The
/// backing file is removed on drop.
pub struct SpoolSink {
    key_size: usize,
    file: NamedTempFile,
    /// `Some` while writing; `None` once finished.
    writer: Option<BufWriter<File>>,
    count: u64,
}

impl SpoolSink {
    /// Create a spool under the given temp configuration.
    pub fn create(key_size: usize, temp: &TempConfig) -> Result<Self> {
        std::fs::create_dir_all(&temp.dir)?;
        let file = tempfile::Builder::new()
            .prefix(temp.prefix.as_str())
            .suffix(".out")
            .tempfile_in(&temp.dir)?;
        let writer = BufWriter::with_capacity(SPOOL_BUFFER_BYTES, file.reopen()?);
        Ok(Self {
            key_size,
            file,
            writer: Some(writer),
            count: 0,
        })
    }

    /// Number of keys spooled so far.
    pub fn key_count(&self) -> u64 {
        self.count
    }

    /// Iterate the spooled keys after a successful `finish`.
    ///
    /// # Errors
    ///
    /// Fails if the spool has not been finished or the file cannot be
    /// reopened for reading.
    pub fn keys(&self) -> Result<SpoolKeys> {
        if self.writer.is_some() {
            return Err(DedupError::InvalidPhase {
                operation: "keys",
                phase: "writing",
            });
        }
        let mut reader = self.file.reopen()?;
        reader.seek(SeekFrom::Start(0))?;
        Ok(SpoolKeys {
            reader: BufReader::with_capacity(SPOOL_BUFFER_BYTES, reader),
            key_size: self.key_size,
            remaining: self.count,
        })
    }
}

impl KeySink for SpoolSink {
    fn write_key(&mut self, key: &[u8]) -> Result<()> {
        debug_assert_eq!(key.len(), self.key_size);
        match &mut self.writer {
            Some(writer) => {
                writer.write_all(key)?;
                self.count += 1;
                Ok(())
            }
            None => Err(DedupError::InvalidPhase {
                operation: "write_key",
                phase: "finished",
            }),
        }
    }

    fn finish(&mut self) -> Result<()> {
        match self.writer.take() {
            Some(mut writer) => {
                writer.flush()?;
                Ok(())
            }
            None => Err(DedupError::InvalidPhase {
                operation: "finish",
                phase: "finished",
            }),
        }
    }
}

/// Iterator over spooled keys, yielding each as an owned byte vector.
#[derive(Debug)]
pub struct SpoolKeys {
    reader: BufReader<File>,
    key_size: usize,
    remaining: u64,
}

impl Iterator for SpoolKeys {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let mut key = vec![0u8; self.key_size];
        match self.reader.read_exact(&mut key) {
            Ok(()) => Some(Ok(key)),
            Err(e) => {
                self.remaining = 0;
                Some(Err(e.into()))
            }
        }
    }
}
