//! Multi-rank generation runs.
//!
//! Each simulated rank is a thread with its own `DistributedRuntime` over a
//! shared `LocalWorld`, so collectives block exactly as across processes.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use candle_core::Device;
use nngpt_core::distributed::{
    DistributedRuntime, InitOptions, LocalBackend, LocalWorld, NoAccelerator, ProcessGroup,
};
use nngpt_core::generation::{
    generate_worker, GenerationError, GenerationReport, GenerationTask, GeneratorConfig,
    ModelCompute, ModelShape, RankCoordinatedGenerator, WorkerOptions, HYPERPARAMETER_FILE,
    NEW_NN_FILE,
};
use nngpt_core::testing::{launch_env, CharTokenizer, PassthroughEngine, ScriptedModel};
use serde_json::{json, Map};

// ─── Helpers ─────────────────────────────────────────────────────────────────

const GOOD: &str = "```python\nclass Net: pass\n```\n{'lr': 0.01}";
const BAD: &str = "Sorry, I can only describe the model.";

struct RankOutcome {
    tasks: Vec<GenerationTask>,
    report: GenerationReport,
    model_calls: usize,
}

fn build_tasks() -> Vec<GenerationTask> {
    (0..3)
        .map(|i| {
            let mut record = Map::new();
            record.insert("nn".to_string(), json!(format!("Model{i}")));
            record.insert("nn_code".to_string(), json!(format!("class Model{i}: pass")));
            GenerationTask::new(format!("Improve model {i}.")).with_record(record)
        })
        .collect()
}

fn run_rank(
    rank: usize,
    world: Arc<LocalWorld>,
    out_dir: PathBuf,
    responses: Vec<&'static str>,
) -> RankOutcome {
    let world_size = world.world_size();
    let mut runtime =
        DistributedRuntime::new(Box::new(LocalBackend::new(world)), Arc::new(NoAccelerator))
            .with_env(launch_env(rank, world_size));
    runtime.init(&InitOptions::default()).unwrap();

    let config = GeneratorConfig {
        out_dir,
        max_new_tokens: 256,
        show_progress: false,
        ..Default::default()
    };
    let model = ScriptedModel::new(responses);
    let calls = model.calls();
    let mut compute =
        ModelCompute::from_config(Box::new(model), CharTokenizer::new(), Device::Cpu, &config);
    let (tasks, report) = {
        let mut generator = RankCoordinatedGenerator::new(&mut runtime, config);
        // Only the designated rank may build the list.
        let tasks = generator
            .distribute_tasks(|| {
                assert_eq!(rank, 0, "non-designated rank built tasks");
                Ok(build_tasks())
            })
            .unwrap();
        let report = generator.run(&tasks, &mut compute).unwrap();
        (tasks, report)
    };

    assert!(runtime.destroy().unwrap().is_completed());
    RankOutcome {
        tasks,
        report,
        model_calls: calls.load(Ordering::SeqCst),
    }
}

fn run_world(world_size: usize, out_dir: &Path, responses: Vec<&'static str>) -> Vec<RankOutcome> {
    let world = LocalWorld::new(world_size).unwrap();
    let handles: Vec<_> = (0..world_size)
        .map(|rank| {
            let world = world.clone();
            let out_dir = out_dir.to_path_buf();
            let responses = responses.clone();
            thread::spawn(move || run_rank(rank, world, out_dir, responses))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

/// Full per-rank job through `generate_worker` on every simulated rank.
fn run_workers(
    world_size: usize,
    out_dir: &Path,
    shape: ModelShape,
) -> Vec<(Result<GenerationReport, GenerationError>, bool)> {
    let world = LocalWorld::new(world_size).unwrap();
    let handles: Vec<_> = (0..world_size)
        .map(|rank| {
            let world = world.clone();
            let options = WorkerOptions {
                generator: GeneratorConfig {
                    out_dir: out_dir.to_path_buf(),
                    max_new_tokens: 256,
                    show_progress: false,
                    ..Default::default()
                },
                ..Default::default()
            };
            thread::spawn(move || {
                let mut runtime =
                    DistributedRuntime::new(Box::new(LocalBackend::new(world)), Arc::new(NoAccelerator))
                        .with_env(launch_env(rank, world_size));
                let model = ScriptedModel::new([GOOD]).with_shape(shape);
                let result = generate_worker(
                    &mut runtime,
                    &PassthroughEngine,
                    model,
                    CharTokenizer::new(),
                    &options,
                    || Ok(build_tasks()),
                );
                (result, runtime.is_initialized())
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[test]
fn task_list_identical_on_every_rank() {
    let tmp = tempfile::tempdir().unwrap();
    let outcomes = run_world(4, tmp.path(), vec![GOOD]);
    let expected = build_tasks();
    for outcome in &outcomes {
        assert_eq!(outcome.tasks, expected);
    }
}

#[test]
fn failed_parse_leaves_gap_at_its_index() {
    let tmp = tempfile::tempdir().unwrap();
    let outcomes = run_world(3, tmp.path(), vec![GOOD, BAD, GOOD]);

    let root = tmp.path().join("synth_nn");
    let mut dirs: Vec<String> = std::fs::read_dir(&root)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    dirs.sort();
    assert_eq!(dirs, vec!["B0", "B2"]);

    let b2 = root.join("B2");
    assert!(b2.join(NEW_NN_FILE).is_file());
    assert_eq!(
        std::fs::read_to_string(b2.join(HYPERPARAMETER_FILE)).unwrap(),
        r#"{"lr":0.01}"#
    );
    assert_eq!(
        std::fs::read_to_string(b2.join("original_Model2.py")).unwrap(),
        "class Model2: pass"
    );

    assert_eq!(outcomes[0].report.persisted, vec![0, 2]);
    assert_eq!(outcomes[0].report.skipped, vec![1]);
    for outcome in &outcomes[1..] {
        assert!(outcome.report.persisted.is_empty());
        assert!(outcome.report.skipped.is_empty());
    }
}

#[test]
fn every_rank_computes_every_task() {
    let tmp = tempfile::tempdir().unwrap();
    let outcomes = run_world(3, tmp.path(), vec![BAD]);
    for outcome in &outcomes {
        assert_eq!(outcome.model_calls, 3);
        assert_eq!(outcome.report.total, 3);
    }
    // Nothing parsed, so only the empty root exists.
    let root = tmp.path().join("synth_nn");
    assert!(root.is_dir());
    assert_eq!(std::fs::read_dir(&root).unwrap().count(), 0);
}

#[test]
fn single_process_generation() {
    let tmp = tempfile::tempdir().unwrap();
    let outcomes = run_world(1, tmp.path(), vec![GOOD]);
    assert_eq!(outcomes[0].report.persisted, vec![0, 1, 2]);
}

#[test]
fn designated_rank_is_rank_zero() {
    let world = LocalWorld::new(2).unwrap();
    let handles: Vec<_> = (0..2)
        .map(|rank| {
            let world = world.clone();
            thread::spawn(move || {
                let mut runtime =
                    DistributedRuntime::new(Box::new(LocalBackend::new(world)), Arc::new(NoAccelerator))
                        .with_env(launch_env(rank, 2));
                runtime
                    .init(&InitOptions {
                        seed: Some(5),
                        ..Default::default()
                    })
                    .unwrap();
                let designated = runtime.is_designated();
                let _ = runtime.destroy().unwrap();
                designated
            })
        })
        .collect();
    let flags: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(flags, vec![true, false]);
}

#[test]
fn worker_runs_the_whole_job() {
    let tmp = tempfile::tempdir().unwrap();
    let shape = ModelShape {
        num_attention_heads: Some(4),
        hidden_size: Some(64),
    };
    let outcomes = run_workers(2, tmp.path(), shape);

    let (designated, designated_up) = &outcomes[0];
    assert_eq!(designated.as_ref().unwrap().persisted, vec![0, 1, 2]);
    assert!(!designated_up);
    let (other, other_up) = &outcomes[1];
    assert!(other.as_ref().unwrap().persisted.is_empty());
    assert!(!other_up);

    let hp = tmp.path().join("synth_nn").join("B1").join(HYPERPARAMETER_FILE);
    assert_eq!(std::fs::read_to_string(hp).unwrap(), r#"{"lr":0.01}"#);
}

#[test]
fn worker_rejects_uneven_sharding_on_every_rank() {
    let tmp = tempfile::tempdir().unwrap();
    let shape = ModelShape {
        num_attention_heads: Some(3),
        hidden_size: None,
    };
    let outcomes = run_workers(2, tmp.path(), shape);
    for (result, _) in &outcomes {
        assert!(matches!(
            result,
            Err(GenerationError::IncompatibleSharding { shard_count: 2, .. })
        ));
    }
    assert!(!tmp.path().join("synth_nn").exists());
}
