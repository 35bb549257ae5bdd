use std::{
    collections::HashSet,
    sync::{Arc, Barrier},
    thread,
};

use crate::{
    compaction::level::FileState,
    engine::{mem::CompletionMode, SstFileMetadata},
    tests_internal::{assert_converged, live_runs, option, setup, CF},
};

fn file(name: &str, size: u64) -> SstFileMetadata {
    SstFileMetadata::new(name, size, "a", "z")
}

#[test]
fn three_flushes_over_k_merge_as_one_batch() {
    let (engine, policy) = setup(option(), CompletionMode::Manual);
    // keeps lazy level 0 below the largest one so K applies to it
    engine.ingest(CF, 2, file("base.sst", 4000)).unwrap();

    let a = engine.flush(CF, 1000).unwrap();
    let b = engine.flush(CF, 1000).unwrap();
    // two live runs sit exactly at K
    assert!(engine.submitted().is_empty());
    assert_eq!(live_runs(&policy.snapshot(CF).unwrap(), 0), 2);

    let c = engine.flush(CF, 1000).unwrap();
    let submitted = engine.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].input_files, vec![a.name, b.name, c.name]);
    // 3000 bytes fit the capacity of lazy level 0, so the output stays there
    assert_eq!(submitted[0].output_level, 1);
    assert_eq!(submitted[0].output_file_size_limit, 1 << 20);
    assert_eq!(policy.running_compactions(), 1);

    let snapshot = policy.snapshot(CF).unwrap();
    assert_eq!(live_runs(&snapshot, 0), 0);
    assert!(snapshot.levels()[0]
        .runs()
        .iter()
        .flat_map(|run| run.files())
        .all(|file| file.state() == FileState::Compacting));

    engine.complete_next().unwrap().unwrap();
    assert_eq!(policy.running_compactions(), 0);
    assert_eq!(policy.pending_triggers(), 1);
    assert_eq!(policy.process_pending(), 1);

    let snapshot = policy.snapshot(CF).unwrap();
    assert_eq!(live_runs(&snapshot, 0), 1);
    assert_eq!(snapshot.levels()[0].size_in_bytes(), 3000);
    assert_eq!(engine.submitted().len(), 1);
    assert_converged(&snapshot, &option());

    let metrics = policy.metrics();
    assert_eq!(metrics.scheduled, 1);
    assert_eq!(metrics.completed, 1);
    assert_eq!(metrics.reevaluations, 1);
}

#[test]
fn cap_defers_second_merge_until_completion() {
    let (engine, policy) = setup(option(), CompletionMode::Manual);
    engine.ingest(CF, 2, file("base.sst", 4000)).unwrap();
    for _ in 0..3 {
        engine.flush(CF, 1000).unwrap();
    }
    assert_eq!(engine.submitted().len(), 1);

    let mut second = Vec::new();
    for _ in 0..3 {
        second.push(engine.flush(CF, 1000).unwrap().name);
    }
    assert_eq!(engine.submitted().len(), 1);
    assert_eq!(policy.running_compactions(), 1);
    assert_eq!(policy.metrics().skipped_saturated, 1);

    engine.complete_next().unwrap().unwrap();
    policy.process_pending();

    let submitted = engine.submitted();
    assert_eq!(submitted.len(), 2);
    assert_eq!(policy.running_compactions(), 1);
    let job = &submitted[1];
    // three deferred flushes plus the first merge's output at physical level 1
    assert_eq!(job.input_files.len(), 4);
    assert!(second.iter().all(|name| job.input_files.contains(name)));
    // 6000 bytes overflow lazy level 0 and land in the deepest slot of lazy level 1
    assert_eq!(job.output_level, 4);
}

#[test]
fn crossing_merge_lands_in_deepest_empty_slot() {
    let (engine, policy) = setup(option(), CompletionMode::Manual);
    engine.ingest(CF, 5, file("deep.sst", 40_000)).unwrap();
    engine.ingest(CF, 4, file("p4.sst", 8000)).unwrap();
    engine.ingest(CF, 1, file("l1.sst", 3000)).unwrap();

    engine.flush(CF, 1000).unwrap();
    assert!(engine.submitted().is_empty());
    engine.flush(CF, 1000).unwrap();

    let submitted = engine.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].input_files.len(), 3);
    assert!(submitted[0].input_files.contains(&"l1.sst".to_string()));
    // physical 4 is taken, physical 3 is the deepest free slot of lazy level 1
    assert_eq!(submitted[0].output_level, 3);

    engine.complete_next().unwrap().unwrap();
    policy.process_pending();
    assert_eq!(engine.level_files(CF, 3).len(), 1);
    assert_eq!(engine.submitted().len(), 1);
    assert_converged(&policy.snapshot(CF).unwrap(), &option());
}

#[test]
fn direct_pick_reports_scheduled_merges() {
    let (engine, policy) = setup(option(), CompletionMode::Manual);
    for name in ["x.sst", "y.sst"] {
        engine.ingest(CF, 0, file(name, 700)).unwrap();
    }
    let scheduled = policy.pick_compaction(CF).unwrap();
    assert_eq!(scheduled.len(), 1);
    let merge = &scheduled[0];
    assert_eq!(merge.origin_level, 0);
    assert_eq!(merge.target_level, 0);
    assert_eq!(merge.output_level, 1);
    assert_eq!(merge.input_bytes, 1400);
    assert_eq!(engine.submitted()[0].job_id, merge.job_id);

    // files already handed out are not picked again
    assert!(policy.pick_compaction(CF).unwrap().is_empty());
}

#[test]
fn rebuild_is_idempotent() {
    let (engine, policy) = setup(option().debug(true), CompletionMode::Manual);
    engine.ingest(CF, 2, file("base.sst", 4000)).unwrap();
    for _ in 0..3 {
        engine.flush(CF, 1000).unwrap();
    }

    let first = policy.build_structure(CF).unwrap();
    let second = policy.build_structure(CF).unwrap();
    assert_eq!(first, second);
    assert_eq!(policy.snapshot(CF), Some(second));
    assert_eq!(first.to_string(), policy.build_structure(CF).unwrap().to_string());
    assert!(first.to_string().contains("being compacted"));
}

#[test]
fn immediate_completion_cascades_without_deadlock() {
    let (engine, policy) = setup(option(), CompletionMode::Immediate);
    for _ in 0..40 {
        engine.flush(CF, 1000).unwrap();
        policy.process_pending();
    }

    assert_eq!(policy.running_compactions(), 0);
    assert_eq!(policy.pending_triggers(), 0);
    let metrics = policy.metrics();
    assert_eq!(metrics.completed as usize, engine.submitted().len());
    assert_eq!(metrics.failed_io + metrics.failed_other, 0);
    assert_converged(&policy.build_structure(CF).unwrap(), &option());

    let total: u64 = (0..8)
        .flat_map(|level| engine.level_files(CF, level))
        .map(|file| file.size)
        .sum();
    assert_eq!(total, 40_000);
}

#[test]
fn concurrent_evaluations_never_share_inputs() {
    const THREADS: usize = 8;

    for round in 0..20 {
        let (engine, policy) = setup(option().concurrency_cap(THREADS), CompletionMode::Manual);
        for i in 0..6 {
            engine.ingest(CF, 0, file(&format!("{i}.sst"), 100)).unwrap();
        }

        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let policy = Arc::clone(&policy);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    policy.pick_compaction(CF).unwrap().len()
                })
            })
            .collect();
        let scheduled: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(scheduled, 1, "round {round}");
        let submitted = engine.submitted();
        assert_eq!(submitted.len(), 1, "round {round}");
        assert_eq!(submitted[0].input_files.len(), 6);
        let mut seen = HashSet::new();
        for job in &submitted {
            for name in &job.input_files {
                assert!(seen.insert(name.clone()), "{name} scheduled twice");
            }
        }
        assert_eq!(policy.running_compactions(), 1);
    }
}
