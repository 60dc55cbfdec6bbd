//! K-way merge of spilled runs with duplicate suppression.
//!
//! Every input run is sorted and internally duplicate-free, so duplicates
//! can only arise between runs and become adjacent in merge order; comparing
//! against the last emitted key is sufficient to drop them.
//!
//! The merger is a small binary min-heap over run cursors. The heap is
//! hand-rolled because the key order is a runtime comparator, and heap ties
//! break on cursor index purely to keep the internal pop order
//! deterministic; which run supplies the surviving copy of an equal key is
//! not observable through the output.

use std::cmp::Ordering;
use std::ops::Range;

use tracing::debug;

use rowuniq_error::{DedupError, Result};

use crate::order::KeyOrder;
use crate::sink::KeySink;
use crate::spill::{RunDescriptor, SpillFile};

/// Fan-in of one intermediate reduction merge.
pub const MERGE_FAN_IN: usize = 7;

/// Reduction stops once this many runs (or fewer) remain; the next merge is
/// the final one.
pub const MERGE_FAN_IN_THRESHOLD: usize = 15;

/// Merge working memory: one key slot for the last emitted key plus
/// `total_keys` slots shared out across run cursors.
pub(crate) struct WorkBuffer {
    bytes: Vec<u8>,
    total_keys: usize,
    key_size: usize,
}

impl WorkBuffer {
    /// Size the buffer from the collector's byte budget: `mem_budget /
    /// key_size` keys (at least one per possible cursor) plus the extra
    /// last-emitted slot.
    pub(crate) fn allocate(
        mem_budget: usize,
        key_size: usize,
        max_fan_in: usize,
    ) -> Result<Self> {
        let total_keys = (mem_budget / key_size).max(max_fan_in).max(1);
        let len = (total_keys + 1) * key_size;
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| DedupError::oom("merge work buffer", len))?;
        bytes.resize(len, 0);
        Ok(Self {
            bytes,
            total_keys,
            key_size,
        })
    }

    /// Staging-block capacity in bytes for an intermediate merge of
    /// `fan_in` runs, matching the per-cursor share.
    pub(crate) fn staging_capacity(&self, fan_in: usize) -> usize {
        (self.total_keys / (fan_in + 1)).max(1) * self.key_size
    }
}

/// Where merged keys go.
pub(crate) enum MergeDest<'a> {
    /// Append to the same spill file through a staging block (intermediate
    /// reduction passes).
    Spill { staging: &'a mut Vec<u8> },
    /// Stream to the caller's sink (final merge).
    Sink(&'a mut dyn KeySink),
}

/// A read cursor over one run, buffered in its slice of the work buffer.
struct RunCursor<'a> {
    /// File offset of the next unloaded byte.
    next_offset: u64,
    /// Keys not yet loaded into the block.
    remaining: u64,
    block: &'a mut [u8],
    /// Valid bytes in `block`.
    filled: usize,
    /// Byte position of the current key.
    pos: usize,
}

impl RunCursor<'_> {
    fn has_current(&self) -> bool {
        self.pos < self.filled
    }

    fn current(&self, key_size: usize) -> &[u8] {
        &self.block[self.pos..self.pos + key_size]
    }

    fn refill(&mut self, file: &mut SpillFile, key_size: usize) -> Result<()> {
        let cap_keys = (self.block.len() / key_size) as u64;
        let n = self.remaining.min(cap_keys) as usize;
        self.pos = 0;
        self.filled = 0;
        if n == 0 {
            return Ok(());
        }
        let bytes = n * key_size;
        file.read_exact_at(self.next_offset, &mut self.block[..bytes])?;
        self.next_offset += bytes as u64;
        self.remaining -= n as u64;
        self.filled = bytes;
        Ok(())
    }

    /// Consume the current key; returns whether another key is available.
    fn step(&mut self, file: &mut SpillFile, key_size: usize) -> Result<bool> {
        self.pos += key_size;
        if self.pos < self.filled {
            return Ok(true);
        }
        if self.remaining == 0 {
            return Ok(false);
        }
        self.refill(file, key_size)?;
        Ok(self.filled > 0)
    }
}

fn cursor_lt(
    cursors: &[RunCursor<'_>],
    cmp: &dyn KeyOrder,
    key_size: usize,
    a: usize,
    b: usize,
) -> bool {
    match cmp.compare(cursors[a].current(key_size), cursors[b].current(key_size)) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => a < b,
    }
}

fn sift_down(
    heap: &mut [usize],
    cursors: &[RunCursor<'_>],
    cmp: &dyn KeyOrder,
    key_size: usize,
    mut i: usize,
) {
    loop {
        let left = 2 * i + 1;
        if left >= heap.len() {
            return;
        }
        let right = left + 1;
        let mut smallest = i;
        if cursor_lt(cursors, cmp, key_size, heap[left], heap[smallest]) {
            smallest = left;
        }
        if right < heap.len() && cursor_lt(cursors, cmp, key_size, heap[right], heap[smallest]) {
            smallest = right;
        }
        if smallest == i {
            return;
        }
        heap.swap(i, smallest);
        i = smallest;
    }
}

fn emit(dest: &mut MergeDest<'_>, file: &mut SpillFile, key: &[u8]) -> Result<()> {
    match dest {
        MergeDest::Spill { staging } => {
            staging.extend_from_slice(key);
            if staging.len() + key.len() > staging.capacity() {
                file.append(staging)?;
                staging.clear();
            }
            Ok(())
        }
        MergeDest::Sink(sink) => sink.write_key(key),
    }
}

/// Merge `runs` into `dest`, suppressing equal-adjacent keys when
/// `drop_duplicates`. Returns the number of keys emitted.
pub(crate) fn merge_runs(
    file: &mut SpillFile,
    runs: &[RunDescriptor],
    cmp: &dyn KeyOrder,
    key_size: usize,
    work: &mut WorkBuffer,
    dest: &mut MergeDest<'_>,
    drop_duplicates: bool,
) -> Result<u64> {
    debug_assert!(!runs.is_empty());
    debug_assert!(work.total_keys >= runs.len());
    debug_assert_eq!(work.key_size, key_size);

    let chunk_keys = (work.total_keys / runs.len()).max(1);
    let chunk_bytes = chunk_keys * key_size;

    let (scratch, arena) = work.bytes.split_at_mut(key_size);
    let mut have_last = false;

    let mut cursors: Vec<RunCursor<'_>> = Vec::with_capacity(runs.len());
    for (run, block) in runs.iter().zip(arena.chunks_exact_mut(chunk_bytes)) {
        let mut cursor = RunCursor {
            next_offset: run.offset,
            remaining: run.count,
            block,
            filled: 0,
            pos: 0,
        };
        cursor.refill(file, key_size)?;
        cursors.push(cursor);
    }
    debug_assert_eq!(cursors.len(), runs.len());

    let mut heap: Vec<usize> = (0..cursors.len())
        .filter(|&i| cursors[i].has_current())
        .collect();
    for i in (0..heap.len() / 2).rev() {
        sift_down(&mut heap, &cursors, cmp, key_size, i);
    }

    let mut emitted = 0u64;
    while !heap.is_empty() {
        let top = heap[0];
        let duplicate = drop_duplicates
            && have_last
            && cmp.compare(cursors[top].current(key_size), scratch) == Ordering::Equal;
        if !duplicate {
            scratch.copy_from_slice(cursors[top].current(key_size));
            have_last = true;
            emit(dest, file, scratch)?;
            emitted += 1;
        }

        if cursors[top].step(file, key_size)? {
            sift_down(&mut heap, &cursors, cmp, key_size, 0);
        } else {
            let last = heap.len() - 1;
            heap.swap(0, last);
            heap.pop();
            sift_down(&mut heap, &cursors, cmp, key_size, 0);
        }
    }

    if let MergeDest::Spill { staging } = dest {
        if !staging.is_empty() {
            file.append(staging)?;
            staging.clear();
        }
    }

    Ok(emitted)
}

/// Grouping rule for one reduction pass over `count` runs.
///
/// Runs are walked left-to-right in groups of `fan_in`; the final group
/// absorbs the remainder and may hold up to `3 * fan_in / 2 - 1` runs, so no
/// pass leaves a pathological short tail.
pub(crate) fn plan_reduction_pass(count: usize, fan_in: usize) -> Vec<Range<usize>> {
    debug_assert!(count > 1);
    let mut groups = Vec::new();
    let mut i = 0;
    while i + 3 * fan_in / 2 + 1 <= count {
        groups.push(i..i + fan_in);
        i += fan_in;
    }
    groups.push(i..count);
    groups
}

/// Reduce `runs` with bounded-fan-in passes until at most
/// [`MERGE_FAN_IN_THRESHOLD`] remain. Intermediate merged runs are appended
/// to the same file and replace their group's descriptors. Returns the
/// number of passes performed.
pub(crate) fn merge_many(
    file: &mut SpillFile,
    runs: &mut Vec<RunDescriptor>,
    cmp: &dyn KeyOrder,
    key_size: usize,
    work: &mut WorkBuffer,
) -> Result<u32> {
    let mut passes = 0u32;
    while runs.len() > MERGE_FAN_IN_THRESHOLD {
        let groups = plan_reduction_pass(runs.len(), MERGE_FAN_IN);
        let mut next = Vec::with_capacity(groups.len());
        for group in &groups {
            let staging_cap = work.staging_capacity(group.len());
            let mut staging = Vec::new();
            staging
                .try_reserve_exact(staging_cap)
                .map_err(|_| DedupError::oom("merge staging block", staging_cap))?;
            let offset = file.tell();
            let count = merge_runs(
                file,
                &runs[group.clone()],
                cmp,
                key_size,
                work,
                &mut MergeDest::Spill {
                    staging: &mut staging,
                },
                true,
            )?;
            next.push(RunDescriptor { offset, count });
        }
        passes += 1;
        debug!(
            pass = passes,
            merged = runs.len(),
            remaining = next.len(),
            "reduced spill runs"
        );
        *runs = next;
    }
    Ok(passes)
}
