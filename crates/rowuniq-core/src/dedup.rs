//! The duplicate-eliminating collector.
//!
//! Keys accumulate in an ordered in-memory set; when the set reaches the
//! byte budget the collector spills it to the spill file as one sorted,
//! duplicate-free run and starts over. Extraction either walks the set
//! straight into an output buffer (nothing ever spilled) or flushes the
//! residual set and streams a duplicate-suppressing merge of all runs into
//! the caller's sink.
//!
//! A collector goes through two phases, accumulation then extraction, with
//! no rewind. An unrecoverable extraction failure poisons it; only
//! destruction is valid afterwards.

use tracing::debug;

use rowuniq_error::{DedupError, Result};

use crate::keyset::{Insertion, KeySet};
use crate::merge::{merge_many, merge_runs, MergeDest, WorkBuffer, MERGE_FAN_IN_THRESHOLD};
use crate::order::KeyOrder;
use crate::sink::KeySink;
use crate::spill::{RunDescriptor, SpillFile, TempConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Accumulating,
    Extracted,
    Poisoned,
}

impl Phase {
    const fn name(self) -> &'static str {
        match self {
            Self::Accumulating => "accumulating",
            Self::Extracted => "extracted",
            Self::Poisoned => "poisoned",
        }
    }
}

/// Counters describing a collector's lifetime, for operator introspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeduperStats {
    /// Keys accepted by `put`, duplicates included.
    pub keys_put: u64,
    /// Keys absorbed by an equal in-memory key.
    pub duplicates_absorbed: u64,
    /// Sorted runs written to the spill file, final flush included.
    pub runs_spilled: u64,
    /// Key bytes written to the spill file by spills.
    pub spill_bytes: u64,
    /// Reduction passes performed during extraction.
    pub merge_passes: u64,
    /// Unique keys delivered to the sink.
    pub unique_emitted: u64,
}

/// Bounded-memory duplicate-eliminating set over fixed-width keys.
pub struct Deduper<C: KeyOrder> {
    cmp: C,
    key_size: usize,
    mem_budget: usize,
    /// Ceiling on in-memory elements: `mem_budget / (key_size + overhead)`.
    max_tree_keys: usize,
    tree: KeySet,
    file: SpillFile,
    runs: Vec<RunDescriptor>,
    spilled_keys: u64,
    phase: Phase,
    stats: DeduperStats,
}

impl<C: KeyOrder> Deduper<C> {
    /// Create a collector for `key_size`-byte keys under `mem_budget` bytes
    /// of in-memory budget, spilling under `temp`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `key_size` is zero or the budget cannot hold
    /// even one element.
    pub fn new(cmp: C, key_size: usize, mem_budget: usize, temp: TempConfig) -> Result<Self> {
        if key_size == 0 {
            return Err(DedupError::invalid_argument("key width must be nonzero"));
        }
        let per_key = key_size + KeySet::ELEMENT_OVERHEAD;
        if mem_budget < per_key {
            return Err(DedupError::invalid_argument(format!(
                "memory budget {mem_budget} cannot hold one {per_key}-byte element"
            )));
        }
        let max_tree_keys = mem_budget / per_key;
        // Reserve a fraction up front; the set grows on demand after that.
        let hint = (mem_budget / 16 / per_key).min(max_tree_keys);
        Ok(Self {
            cmp,
            key_size,
            mem_budget,
            max_tree_keys,
            tree: KeySet::new(key_size, hint),
            file: SpillFile::new(temp),
            runs: Vec::new(),
            spilled_keys: 0,
            phase: Phase::Accumulating,
            stats: DeduperStats::default(),
        })
    }

    /// Insert one key into the logical set.
    ///
    /// Inserting a key equal to one already in memory is a no-op and does
    /// not grow memory. If the in-memory set is at its ceiling the collector
    /// spills before inserting, so the ceiling is never exceeded.
    ///
    /// # Errors
    ///
    /// Allocation and spill-write failures are surfaced but leave the
    /// collector usable; the caller may retry or extract what it has.
    pub fn put(&mut self, key: &[u8]) -> Result<()> {
        self.ensure_accumulating("put")?;
        if key.len() != self.key_size {
            return Err(DedupError::KeyWidthMismatch {
                got: key.len(),
                expected: self.key_size,
            });
        }
        if self.tree.len() == self.max_tree_keys {
            self.spill()?;
        }
        if self.tree.insert(&self.cmp, key)? == Insertion::AlreadyPresent {
            self.stats.duplicates_absorbed += 1;
        }
        self.stats.keys_put += 1;
        Ok(())
    }

    /// Write the in-memory set to the spill file as one sorted run and
    /// clear it.
    ///
    /// The run descriptor is committed only after the walk completes, so an
    /// aborted spill leaves no descriptor behind and the set intact.
    fn spill(&mut self) -> Result<()> {
        if self.tree.is_empty() {
            return Ok(());
        }
        let offset = self.file.tell();
        let count = self.tree.len() as u64;

        let file = &mut self.file;
        self.tree.walk_in_order(|key| file.append(key))?;

        self.runs
            .try_reserve(1)
            .map_err(|_| DedupError::oom("run directory", std::mem::size_of::<RunDescriptor>()))?;
        self.runs.push(RunDescriptor { offset, count });
        self.spilled_keys += count;
        self.stats.runs_spilled += 1;
        self.stats.spill_bytes += count * self.key_size as u64;
        self.tree.clear();
        debug!(run = self.runs.len(), offset, keys = count, "spilled run");
        Ok(())
    }

    /// Finalise the set and emit its unique keys to `sink` in ascending
    /// comparator order. Returns the number of keys emitted.
    ///
    /// When nothing spilled, the keys are handed to the sink as one owned
    /// buffer; should that buffer fail to allocate, extraction falls back to
    /// the merge path. Otherwise the residual set is flushed as a final run
    /// and all runs are merged, reducing with bounded fan-in first if there
    /// are many.
    ///
    /// # Errors
    ///
    /// Any failure here poisons the collector: no partial output is
    /// committed to the sink, and only destruction remains valid.
    pub fn extract_into<S: KeySink>(&mut self, sink: &mut S) -> Result<u64> {
        self.ensure_accumulating("extract_into")?;

        if self.runs.is_empty() {
            let bytes = self.tree.len() * self.key_size;
            let mut buf = Vec::new();
            if buf.try_reserve_exact(bytes).is_ok() {
                let emitted = match self.extract_in_memory(buf, sink) {
                    Ok(n) => n,
                    Err(e) => {
                        self.phase = Phase::Poisoned;
                        return Err(e);
                    }
                };
                self.phase = Phase::Extracted;
                self.stats.unique_emitted = emitted;
                debug!(keys = emitted, "extracted in memory");
                return Ok(emitted);
            }
            // Output buffer allocation failed; the merge path needs only
            // bounded working memory, so fall through to it.
        }

        match self.extract_merged(sink) {
            Ok(emitted) => {
                self.phase = Phase::Extracted;
                self.stats.unique_emitted = emitted;
                debug!(
                    keys = emitted,
                    runs = self.runs.len(),
                    passes = self.stats.merge_passes,
                    "extracted via merge"
                );
                Ok(emitted)
            }
            Err(e) => {
                self.phase = Phase::Poisoned;
                Err(e)
            }
        }
    }

    /// Fast path: the whole set is in memory and `buf` already has capacity
    /// for it.
    fn extract_in_memory<S: KeySink>(&mut self, mut buf: Vec<u8>, sink: &mut S) -> Result<u64> {
        let count = self.tree.len() as u64;
        self.tree.walk_in_order(|key| {
            buf.extend_from_slice(key);
            Ok(())
        })?;
        sink.accept_buffer(buf, self.key_size)?;
        sink.finish()?;
        Ok(count)
    }

    /// Slow path: flush the residual set, then reduce and merge every run
    /// into the sink.
    fn extract_merged<S: KeySink>(&mut self, sink: &mut S) -> Result<u64> {
        self.spill()?;
        self.file.switch_to_read()?;

        let max_fan_in = self.runs.len().min(MERGE_FAN_IN_THRESHOLD);
        let mut work = WorkBuffer::allocate(self.mem_budget, self.key_size, max_fan_in)?;

        let passes = merge_many(
            &mut self.file,
            &mut self.runs,
            &self.cmp,
            self.key_size,
            &mut work,
        )?;
        self.stats.merge_passes = u64::from(passes);

        let emitted = merge_runs(
            &mut self.file,
            &self.runs,
            &self.cmp,
            self.key_size,
            &mut work,
            &mut MergeDest::Sink(sink),
            true,
        )?;
        sink.finish()?;
        Ok(emitted)
    }

    fn ensure_accumulating(&self, operation: &'static str) -> Result<()> {
        match self.phase {
            Phase::Accumulating => Ok(()),
            phase => Err(DedupError::InvalidPhase {
                operation,
                phase: phase.name(),
            }),
        }
    }

    /// Declared key width in bytes.
    pub fn key_size(&self) -> usize {
        self.key_size
    }

    /// Keys currently held in memory.
    pub fn in_memory_len(&self) -> usize {
        self.tree.len()
    }

    /// Ceiling on in-memory keys implied by the byte budget.
    pub fn max_in_memory_keys(&self) -> usize {
        self.max_tree_keys
    }

    /// Runs written to the spill file so far.
    pub fn spilled_run_count(&self) -> usize {
        self.runs.len()
    }

    /// Keys written to the spill file so far, cross-run duplicates included.
    pub fn spilled_key_count(&self) -> u64 {
        self.spilled_keys
    }

    /// Snapshot of the lifetime counters.
    pub fn stats(&self) -> DeduperStats {
        self.stats
    }
}

impl<C: KeyOrder> std::fmt::Debug for Deduper<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduper")
            .field("phase", &self.phase.name())
            .field("key_size", &self.key_size)
            .field("mem_budget", &self.mem_budget)
            .field("in_memory", &self.tree.len())
            .field("runs", &self.runs.len())
            .field("spilled_keys", &self.spilled_keys)
            .finish()
    }
}
