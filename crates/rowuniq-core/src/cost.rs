//! Planner cost model for the collector.
//!
//! [`estimate_cost`] predicts, in abstract seek-equivalents, what inserting
//! `n_keys` keys of a given width under a given memory budget will cost
//! across the whole insert → spill → merge → read pipeline, without
//! constructing a collector. The planner uses it to choose between this
//! strategy and alternatives.
//!
//! The merge term simulates the reduction driver on a vector of per-run
//! sizes using the same grouping rule ([`plan_reduction_pass`]) as the live
//! merge, rather than a closed-form approximation: run counts are small
//! while runs are big, and a closed form loses too much precision.

use std::f64::consts::{E, LN_2, PI};

use serde::{Deserialize, Serialize};

use crate::merge::{plan_reduction_pass, MERGE_FAN_IN, MERGE_FAN_IN_THRESHOLD};

/// Cost constants supplied by the host engine's cost configuration.
///
/// Nothing here is defaulted: the surrounding engine owns these numbers and
/// passes them in, the same way it supplies them to its other access-path
/// estimators.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostConfig {
    /// Bytes transferred per seek-sized I/O unit.
    pub io_block_size: u64,
    /// Cost of one random disk seek, in seek-equivalents.
    pub seek_base_cost: f64,
    /// Divisor scaling comparison counts into seek-equivalents (how many
    /// key comparisons cost as much as one I/O unit).
    pub compare_cost: f64,
    /// Per-element bookkeeping bytes of the in-memory set.
    pub node_overhead: usize,
}

/// log2(n!) via Stirling's approximation:
/// `log2(n!) = (ln(2πn)/2 + n·ln(n/e)) / ln 2`.
#[must_use]
pub fn log2_n_fact(n: f64) -> f64 {
    ((2.0 * PI * n).ln() / 2.0 + n * (n / E).ln()) / LN_2
}

/// Cost of one k-way merge call over `total_elems` keys from `n_buffers`
/// input runs: every byte is read and written back
/// (`2·total·W / io_block`), and each key passes through a heap of
/// `n_buffers` entries (`total·ln(n_buffers) / (compare_cost·ln 2)`).
///
/// No key elimination is assumed during the merge.
fn merge_buffers_cost(total_elems: f64, n_buffers: usize, key_size: usize, cfg: &CostConfig) -> f64 {
    let io = cfg.io_block_size as f64;
    2.0 * total_elems * key_size as f64 / io
        + total_elems * (n_buffers as f64).ln() / (cfg.compare_cost * LN_2)
}

/// Simulate the reduction driver plus the final merge on `n_full` runs of
/// `k_max` keys and one run of `n_last` keys.
fn merge_many_cost(
    n_full: u64,
    k_max: u64,
    n_last: u64,
    key_size: usize,
    cfg: &CostConfig,
) -> f64 {
    let mut sizes: Vec<u64> = vec![k_max; n_full as usize];
    sizes.push(n_last);

    let mut total = 0.0;
    while sizes.len() > MERGE_FAN_IN_THRESHOLD {
        let groups = plan_reduction_pass(sizes.len(), MERGE_FAN_IN);
        let mut next = Vec::with_capacity(groups.len());
        for group in &groups {
            let sum: u64 = sizes[group.clone()].iter().sum();
            total += merge_buffers_cost(sum as f64, group.len(), key_size, cfg);
            next.push(sum);
        }
        sizes = next;
    }

    let sum: u64 = sizes.iter().sum();
    total += merge_buffers_cost(sum as f64, sizes.len(), key_size, cfg);
    total
}

/// Estimate the cost, in seek-equivalents, of collecting `n_keys` keys of
/// `key_size` bytes under `mem_budget` bytes of memory.
///
/// The estimate decomposes as tree build + spill writes + merge + output
/// read. When everything fits in memory only the tree term remains. The
/// output-read term assumes no duplicates were eliminated, as the planner
/// cannot know the duplicate ratio in advance.
#[must_use]
pub fn estimate_cost(n_keys: u64, key_size: usize, mem_budget: usize, cfg: &CostConfig) -> f64 {
    let k_max = (mem_budget / (key_size + cfg.node_overhead)).max(1) as u64;
    let n_full = n_keys / k_max;
    let n_last = n_keys % k_max;
    let w = key_size as f64;
    let io = cfg.io_block_size as f64;

    // Tree build: inserting n keys into an initially empty ordered set costs
    // 2·log2((n+1)!) comparisons on average across balanced-tree descents.
    let mut cost = log2_n_fact(n_last as f64 + 1.0);
    if n_full > 0 {
        cost += n_full as f64 * log2_n_fact(k_max as f64 + 1.0);
    }
    cost *= 2.0 / cfg.compare_cost;

    if n_full == 0 {
        // One set, no disk involvement at all.
        return cost.max(0.0);
    }

    // Spill writes are sequential: one pass per full set plus the residual.
    cost += cfg.seek_base_cost
        * (n_full as f64 * (w * k_max as f64 / io).ceil() + (w * n_last as f64 / io).ceil());

    cost += merge_many_cost(n_full, k_max, n_last, key_size, cfg);

    // Reading the merged result back, assuming no dedup savings.
    cost += (w * n_keys as f64 / io).ceil();

    cost.max(0.0)
}
