use std::{io, sync::Arc};

use crate::{
    compaction::{level::FileState, CompactionError},
    engine::{
        mem::{CompletionMode, InMemoryEngine},
        EngineError, SstFileMetadata,
    },
    fluid::FluidLsm,
    tests_internal::{live_runs, option, setup, CF},
};

fn prepare_first_merge(engine: &InMemoryEngine) -> Vec<String> {
    engine
        .ingest(CF, 2, SstFileMetadata::new("base.sst", 4000, "a", "z"))
        .unwrap();
    (0..3)
        .map(|_| engine.flush(CF, 1000).unwrap().name)
        .collect()
}

#[test]
fn io_failure_keeps_marks_and_stops_the_cascade() {
    let (engine, policy) = setup(option(), CompletionMode::Manual);
    let inputs = prepare_first_merge(&engine);
    assert_eq!(engine.submitted().len(), 1);

    assert!(engine.fail_next(EngineError::Io(io::Error::new(
        io::ErrorKind::Other,
        "disk full"
    ))));
    assert_eq!(policy.running_compactions(), 0);
    assert_eq!(policy.pending_triggers(), 0);
    assert_eq!(policy.metrics().failed_io, 1);
    assert_eq!(policy.stuck_files(CF).unwrap(), 3);

    // the engine has cleared its own flags, the policy still holds the files
    assert!(engine
        .level_files(CF, 0)
        .iter()
        .all(|file| !file.being_compacted));
    let levels = policy.build_structure(CF).unwrap();
    assert_eq!(live_runs(&levels, 0), 0);
    for name in &inputs {
        let file = levels.levels()[0]
            .runs()
            .iter()
            .flat_map(|run| run.files())
            .find(|file| file.name() == name)
            .unwrap();
        assert_eq!(file.state(), FileState::Compacting);
    }

    engine.flush(CF, 1000).unwrap();
    assert_eq!(engine.submitted().len(), 1);
}

#[test]
fn recovering_stuck_files_makes_them_eligible_again() {
    let (engine, policy) = setup(option(), CompletionMode::Manual);
    let inputs = prepare_first_merge(&engine);
    engine.fail_next(EngineError::Io(io::Error::new(io::ErrorKind::Other, "eio")));
    let late = engine.flush(CF, 1000).unwrap().name;

    assert_eq!(policy.recover_stuck_files(CF).unwrap(), 3);
    assert_eq!(policy.stuck_files(CF).unwrap(), 0);
    assert_eq!(policy.metrics().recovered_files, 3);

    let submitted = engine.submitted();
    assert_eq!(submitted.len(), 2);
    let retry = &submitted[1];
    assert!(inputs.iter().all(|name| retry.input_files.contains(name)));
    assert!(retry.input_files.contains(&late));
    // 4000 bytes overflow lazy level 0
    assert_eq!(retry.output_level, 4);

    assert_eq!(policy.recover_stuck_files(CF).unwrap(), 0);
    assert_eq!(policy.recover_stuck_files("unknown").unwrap_or_default(), 0);
}

#[test]
fn non_io_failure_releases_inputs_and_retries() {
    let (engine, policy) = setup(option(), CompletionMode::Manual);
    let inputs = prepare_first_merge(&engine);

    assert!(engine.fail_next(EngineError::Aborted("conflict".into())));
    assert_eq!(policy.metrics().failed_other, 1);
    assert_eq!(policy.pending_triggers(), 1);
    assert_eq!(policy.process_pending(), 1);

    let submitted = engine.submitted();
    assert_eq!(submitted.len(), 2);
    assert_eq!(submitted[1].input_files, inputs);
    assert_ne!(submitted[1].job_id, submitted[0].job_id);
    assert_eq!(policy.stuck_files(CF).unwrap(), 0);
}

#[test]
fn injected_failure_is_reported_through_the_callback() {
    let (engine, policy) = setup(option(), CompletionMode::Manual);
    prepare_first_merge(&engine);
    engine.inject_merge_failure(EngineError::Aborted("lost race".into()));
    assert!(engine.complete_next().unwrap().is_err());
    assert_eq!(policy.metrics().failed_other, 1);
    assert_eq!(policy.running_compactions(), 0);
}

#[test]
fn metadata_failure_keeps_published_structure() {
    let (engine, policy) = setup(option(), CompletionMode::Manual);
    prepare_first_merge(&engine);
    let before = policy.snapshot(CF).unwrap();

    engine.fail_metadata(Some(io::ErrorKind::TimedOut));
    let err = policy.pick_compaction(CF).unwrap_err();
    assert!(matches!(err, CompactionError::Metadata(ref inner) if inner.is_io()));
    assert!(policy.build_structure(CF).is_err());
    // flush evaluations log the error and carry on
    engine.flush(CF, 1000).unwrap();
    assert_eq!(policy.snapshot(CF), Some(before));

    engine.fail_metadata(None);
    assert!(policy.build_structure(CF).is_ok());
}

#[test]
fn unknown_column_family_is_an_error() {
    let (_engine, policy) = setup(option(), CompletionMode::Manual);
    assert!(matches!(
        policy.pick_compaction("missing"),
        Err(CompactionError::Metadata(EngineError::UnknownColumnFamily(_)))
    ));
    assert!(policy.snapshot("missing").is_none());
}

#[test]
fn metadata_beyond_configured_levels_is_rejected() {
    let engine = Arc::new(InMemoryEngine::new(8));
    engine.create_column_family(CF);
    // the policy only knows three of the engine's eight levels
    let policy = FluidLsm::new(Arc::clone(&engine), option().num_levels(3)).unwrap();
    assert!(policy.build_structure(CF).is_ok());
    engine
        .ingest(CF, 5, SstFileMetadata::new("far.sst", 1, "a", "z"))
        .unwrap();
    assert!(matches!(
        policy.build_structure(CF),
        Err(CompactionError::LevelOutOfRange { level: 5, num_levels: 3 })
    ));
}

#[test]
fn dropped_callback_releases_the_slot() {
    use std::sync::Weak;

    use crate::engine::{
        ColumnFamilyMetadata, FlushListener, LevelMetadata, MergeCallback, MergeJob, StorageEngine,
    };

    struct DroppingEngine;

    impl StorageEngine for DroppingEngine {
        fn column_family_metadata(&self, _: &str) -> Result<ColumnFamilyMetadata, EngineError> {
            let files = (0..2)
                .map(|i| SstFileMetadata::new(format!("{i}.sst"), 10, "a", "z"))
                .collect();
            let mut levels = vec![LevelMetadata { files }];
            levels.resize(8, LevelMetadata::default());
            Ok(ColumnFamilyMetadata { levels })
        }

        fn submit_merge(&self, _: MergeJob, on_complete: MergeCallback) {
            drop(on_complete);
        }

        fn register_flush_listener(&self, _: Weak<dyn FlushListener>) {}
    }

    let policy = FluidLsm::new(Arc::new(DroppingEngine), option()).unwrap();
    assert_eq!(policy.pick_compaction(CF).unwrap().len(), 1);
    assert_eq!(policy.running_compactions(), 0);
    assert_eq!(policy.metrics().failed_other, 1);
    assert_eq!(policy.pending_triggers(), 1);
}
