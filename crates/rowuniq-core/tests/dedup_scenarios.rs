//! End-to-end scenarios for the collector: fast path, forced spills,
//! degenerate inputs, cost-model sanity, and lifecycle enforcement.

use rowuniq_core::{
    estimate_cost, log2_n_fact, CostConfig, Deduper, DedupError, ErrorKind, KeySet, LexicalOrder,
    SpoolSink, TempConfig, VecSink,
};

fn temp() -> (tempfile::TempDir, TempConfig) {
    let dir = tempfile::tempdir().unwrap();
    let cfg = TempConfig::new(dir.path(), "rowuniq-test-");
    (dir, cfg)
}

fn budget_for(key_size: usize, keys: usize) -> usize {
    keys * (key_size + KeySet::ELEMENT_OVERHEAD)
}

#[test]
fn fast_path_sorts_and_dedups_in_memory() {
    let (_dir, cfg) = temp();
    let mut dedup = Deduper::new(LexicalOrder, 4, 1 << 20, cfg).unwrap();
    for v in [5u32, 1, 3, 1, 5, 2, 4] {
        dedup.put(&v.to_be_bytes()).unwrap();
    }

    let mut sink = VecSink::new(4);
    let emitted = dedup.extract_into(&mut sink).unwrap();

    assert_eq!(emitted, 5);
    assert_eq!(dedup.stats().runs_spilled, 0, "no spills expected");
    let out: Vec<u32> = sink
        .keys()
        .map(|k| u32::from_be_bytes(k.try_into().unwrap()))
        .collect();
    assert_eq!(out, vec![1, 2, 3, 4, 5]);
    assert_eq!(dedup.stats().duplicates_absorbed, 2);
}

#[test]
fn forced_spills_produce_sorted_unique_output() {
    let (_dir, cfg) = temp();
    // Budget for exactly three in-memory keys.
    let mut dedup = Deduper::new(LexicalOrder, 8, budget_for(8, 3), cfg).unwrap();
    assert_eq!(dedup.max_in_memory_keys(), 3);

    for v in [9u64, 2, 7, 2, 5, 1, 4, 8, 6, 3, 7, 2] {
        dedup.put(&v.to_be_bytes()).unwrap();
    }

    let mut sink = VecSink::new(8);
    let emitted = dedup.extract_into(&mut sink).unwrap();

    // Three spills during accumulation plus the flush at extraction.
    assert_eq!(dedup.stats().runs_spilled, 4);
    assert_eq!(emitted, 9);
    let out: Vec<u64> = sink
        .keys()
        .map(|k| u64::from_be_bytes(k.try_into().unwrap()))
        .collect();
    assert_eq!(out, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
}

#[test]
fn all_duplicates_collapse_without_spilling() {
    let (_dir, cfg) = temp();
    let mut dedup = Deduper::new(LexicalOrder, 16, budget_for(16, 100), cfg).unwrap();
    assert_eq!(dedup.max_in_memory_keys(), 100);

    let key = [0xabu8; 16];
    for _ in 0..10_000 {
        dedup.put(&key).unwrap();
    }
    // Every insert after the first is absorbed by the in-memory set, so the
    // set never fills and at most one run can ever be written.
    assert_eq!(dedup.in_memory_len(), 1);
    assert!(dedup.spilled_run_count() <= 1);

    let mut sink = VecSink::new(16);
    let emitted = dedup.extract_into(&mut sink).unwrap();
    assert_eq!(emitted, 1);
    assert_eq!(sink.keys().next().unwrap(), &key);
    assert_eq!(dedup.stats().duplicates_absorbed, 9_999);
}

#[test]
fn reverse_insertion_order_still_sorts() {
    let (_dir, cfg) = temp();
    let mut dedup = Deduper::new(LexicalOrder, 2, 1 << 20, cfg).unwrap();
    for v in (1..=500u16).rev() {
        dedup.put(&v.to_be_bytes()).unwrap();
    }

    let mut sink = VecSink::new(2);
    let emitted = dedup.extract_into(&mut sink).unwrap();
    assert_eq!(emitted, 500);
    let out: Vec<u16> = sink
        .keys()
        .map(|k| u16::from_be_bytes(k.try_into().unwrap()))
        .collect();
    let expected: Vec<u16> = (1..=500).collect();
    assert_eq!(out, expected);
}

#[test]
fn many_runs_force_reduction_passes() {
    let (_dir, cfg) = temp();
    // Two keys per run; enough distinct keys to spill well past the fan-in
    // threshold so the reduction driver actually runs.
    let mut dedup = Deduper::new(LexicalOrder, 8, budget_for(8, 2), cfg).unwrap();
    let keys: Vec<u64> = (0..120).map(|i| (i * 37) % 120).collect();
    for v in &keys {
        dedup.put(&v.to_be_bytes()).unwrap();
    }
    assert!(dedup.spilled_run_count() > rowuniq_core::MERGE_FAN_IN_THRESHOLD);

    let mut sink = VecSink::new(8);
    let emitted = dedup.extract_into(&mut sink).unwrap();
    assert!(dedup.stats().merge_passes >= 1);
    assert_eq!(emitted, 120);
    let out: Vec<u64> = sink
        .keys()
        .map(|k| u64::from_be_bytes(k.try_into().unwrap()))
        .collect();
    let expected: Vec<u64> = (0..120).collect();
    assert_eq!(out, expected);
}

#[test]
fn custom_comparator_controls_output_order() {
    let (_dir, cfg) = temp();
    let descending = |a: &[u8], b: &[u8]| b.cmp(a);
    let mut dedup = Deduper::new(descending, 4, budget_for(4, 3), cfg).unwrap();
    for v in [5u32, 1, 3, 1, 5, 2, 4] {
        dedup.put(&v.to_be_bytes()).unwrap();
    }
    let mut sink = VecSink::new(4);
    dedup.extract_into(&mut sink).unwrap();
    let out: Vec<u32> = sink
        .keys()
        .map(|k| u32::from_be_bytes(k.try_into().unwrap()))
        .collect();
    assert_eq!(out, vec![5, 4, 3, 2, 1]);
}

#[test]
fn spool_sink_reads_back_exactly_what_was_emitted() {
    let (_dir, cfg) = temp();
    let keys: Vec<u64> = (0..200).map(|i| (i * 13) % 61).collect();

    let mut spilled = Deduper::new(LexicalOrder, 8, budget_for(8, 4), cfg.clone()).unwrap();
    let mut reference = Deduper::new(LexicalOrder, 8, 1 << 20, cfg.clone()).unwrap();
    for v in &keys {
        spilled.put(&v.to_be_bytes()).unwrap();
        reference.put(&v.to_be_bytes()).unwrap();
    }

    let mut spool = SpoolSink::create(8, &cfg).unwrap();
    let emitted = spilled.extract_into(&mut spool).unwrap();
    assert_eq!(emitted, spool.key_count());

    let mut vec_sink = VecSink::new(8);
    reference.extract_into(&mut vec_sink).unwrap();

    let spooled: Vec<Vec<u8>> = spool.keys().unwrap().map(|k| k.unwrap()).collect();
    let direct: Vec<Vec<u8>> = vec_sink.keys().map(|k| k.to_vec()).collect();
    assert_eq!(spooled, direct);
}

#[test]
fn construction_rejects_bad_arguments() {
    let (_dir, cfg) = temp();
    let err = Deduper::new(LexicalOrder, 0, 1024, cfg.clone()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    // Budget too small for a single element.
    let err = Deduper::new(LexicalOrder, 8, 8, cfg).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn key_width_is_enforced() {
    let (_dir, cfg) = temp();
    let mut dedup = Deduper::new(LexicalOrder, 8, 1 << 16, cfg).unwrap();
    let err = dedup.put(&[1, 2, 3]).unwrap_err();
    assert!(matches!(
        err,
        DedupError::KeyWidthMismatch { got: 3, expected: 8 }
    ));
}

#[test]
fn lifecycle_is_one_way() {
    let (_dir, cfg) = temp();
    let mut dedup = Deduper::new(LexicalOrder, 4, 1 << 16, cfg).unwrap();
    dedup.put(&7u32.to_be_bytes()).unwrap();

    let mut sink = VecSink::new(4);
    dedup.extract_into(&mut sink).unwrap();

    let err = dedup.put(&8u32.to_be_bytes()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPhase);

    let mut again = VecSink::new(4);
    let err = dedup.extract_into(&mut again).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPhase);
    assert_eq!(again.key_count(), 0);
}

#[test]
fn empty_extraction_yields_nothing() {
    let (_dir, cfg) = temp();
    let mut dedup = Deduper::new(LexicalOrder, 8, 1 << 16, cfg).unwrap();
    let mut sink = VecSink::new(8);
    assert_eq!(dedup.extract_into(&mut sink).unwrap(), 0);
    assert_eq!(sink.key_count(), 0);
}

#[test]
fn cost_model_orders_memory_budgets() {
    let cfg = CostConfig {
        io_block_size: 4096,
        seek_base_cost: 0.9,
        compare_cost: 5000.0,
        node_overhead: 64,
    };
    let n = 1_000_000u64;
    let w = 8;

    let tight = estimate_cost(n, w, 64 * 1024, &cfg);
    let medium = estimate_cost(n, w, 64 * 1024 * 1024, &cfg);
    let roomy = estimate_cost(n, w, 1024 * 1024 * 1024, &cfg);

    assert!(tight > medium, "{tight} vs {medium}");
    assert!(medium > roomy, "{medium} vs {roomy}");

    // The roomy budget never spills: pure in-memory build cost.
    let in_memory = 2.0 * log2_n_fact(n as f64 + 1.0) / cfg.compare_cost;
    assert!((roomy - in_memory).abs() < 1e-9, "{roomy} vs {in_memory}");
}
