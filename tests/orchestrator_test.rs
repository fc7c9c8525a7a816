use dl_harness::core::resolver::ModuleSource;
use dl_harness::core::seed::seeded_rng;
use dl_harness::domain::ports::ExperimentModule;
use dl_harness::experiments::linear::{data::LinearData, model::LinearExperiment};
use dl_harness::{HarnessError, ModuleRegistry, Orchestrator, RunArgs, RunState};
use rand::Rng;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const LINEAR_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/src/experiments/linear");

/// `<root>/expA/{data,model}.rs`, `<root>/lib/helpers.rs` and an empty `<root>/logs`.
fn experiment_layout(root: &Path) {
    fs::create_dir_all(root.join("expA")).unwrap();
    fs::write(root.join("expA").join("data.rs"), "// data for expA\n").unwrap();
    fs::write(root.join("expA").join("model.rs"), "// model for expA\n").unwrap();
    fs::create_dir_all(root.join("lib").join("nested")).unwrap();
    fs::write(root.join("lib").join("helpers.rs"), "pub fn help() {}\n").unwrap();
    fs::write(root.join("lib").join("nested").join("deep.rs"), "// deep\n").unwrap();
    fs::create_dir_all(root.join("logs")).unwrap();
}

fn registry_for(name: &str, model_is_data: bool) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register(format!("{}.data", name), |_: &ModuleSource| {
        Ok(Box::new(LinearData) as Box<dyn ExperimentModule>)
    });
    registry.register(format!("{}.model", name), move |_: &ModuleSource| {
        if model_is_data {
            Ok(Box::new(LinearData) as Box<dyn ExperimentModule>)
        } else {
            Ok(Box::new(LinearExperiment) as Box<dyn ExperimentModule>)
        }
    });
    registry
}

fn run_args(root: &Path) -> RunArgs {
    let mut args = RunArgs::new(format!("{}/", root.join("expA").display()));
    args.logdir = Some(root.join("logs").display().to_string());
    args.support_dir = Some(root.join("lib").display().to_string());
    args.seed = Some(7);
    args
}

#[test]
fn test_run_until_staged_snapshots_sources() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    experiment_layout(root);

    let mut orchestrator = Orchestrator::new(run_args(root), Vec::new(), registry_for("expA", false));
    let state = orchestrator.run_until(RunState::Staged).unwrap();
    assert_eq!(state, RunState::Staged);

    // Trailing separator is dropped before deriving the short name
    let model_dir = orchestrator.model_directory().unwrap();
    assert_eq!(model_dir.short_name(), "expA");
    assert!(orchestrator.registry().get("expA.data").is_some());
    assert!(orchestrator.registry().get("expA.model").is_some());

    let snapshot = orchestrator.snapshot().unwrap().clone();
    assert!(snapshot.root.starts_with(root.join("logs")));
    assert!(snapshot
        .root
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("src-"));
    assert_eq!(
        fs::read(snapshot.model_dir.join("data.rs")).unwrap(),
        fs::read(root.join("expA").join("data.rs")).unwrap()
    );
    assert_eq!(
        fs::read(snapshot.model_dir.join("model.rs")).unwrap(),
        fs::read(root.join("expA").join("model.rs")).unwrap()
    );
    assert!(snapshot.support_dir.join("helpers.rs").is_file());
    assert!(snapshot.support_dir.join("nested").join("deep.rs").is_file());

    // Nothing has drawn from the generator yet
    let drawn: u64 = orchestrator.rng_mut().unwrap().random();
    let expected: u64 = seeded_rng(7).random();
    assert_eq!(drawn, expected);

    // Snapshot is independent of later edits to the experiment
    fs::write(root.join("expA").join("data.rs"), "// edited\n").unwrap();
    assert_eq!(
        fs::read_to_string(snapshot.model_dir.join("data.rs")).unwrap(),
        "// data for expA\n"
    );
}

#[test]
fn test_missing_entry_point_fails_resolution() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    experiment_layout(root);

    let mut orchestrator = Orchestrator::new(run_args(root), Vec::new(), registry_for("expA", true));
    let err = orchestrator.run_until(RunState::Completed).unwrap_err();

    match err {
        HarnessError::MissingEntryPointError { module, .. } => assert_eq!(module, "expA.model"),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(orchestrator.state(), RunState::Failed);
    assert_eq!(orchestrator.failed_during(), Some(RunState::LogDirReady));
    assert!(orchestrator.snapshot().is_none());

    // Nothing was staged
    assert_eq!(fs::read_dir(root.join("logs")).unwrap().count(), 0);
}

#[test]
fn test_unregistered_experiment_fails_resolution() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    experiment_layout(root);

    let mut orchestrator = Orchestrator::new(run_args(root), Vec::new(), registry_for("other", false));
    let err = orchestrator.run_until(RunState::Staged).unwrap_err();
    assert!(matches!(err, HarnessError::ResolutionError { .. }));

    // Failed runs stay failed
    assert_eq!(orchestrator.advance().unwrap(), RunState::Failed);
}

#[test]
fn test_without_logdir_staging_is_skipped() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    experiment_layout(root);

    let mut args = run_args(root);
    args.logdir = None;
    let mut orchestrator = Orchestrator::new(args, Vec::new(), registry_for("expA", false));

    assert_eq!(
        orchestrator.run_until(RunState::ConfigMerged).unwrap(),
        RunState::ConfigMerged
    );
    assert!(orchestrator.snapshot().is_none());
    assert_eq!(fs::read_dir(root.join("logs")).unwrap().count(), 0);
}

#[test]
fn test_full_linear_run() -> anyhow::Result<()> {
    let temp_dir = TempDir::new()?;
    let logdir = temp_dir.path().join("run");
    let support = temp_dir.path().join("support");
    fs::create_dir_all(&support)?;
    fs::write(support.join("common.rs"), "// shared\n")?;

    let mut args = RunArgs::new(LINEAR_DIR);
    args.logdir = Some(logdir.display().to_string());
    args.support_dir = Some(support.display().to_string());
    let unknown = vec![
        "--epochs=5:int".to_string(),
        "--data_params/noise=0.0:float".to_string(),
        "--model_params/lr=0.2:float".to_string(),
    ];

    let report = Orchestrator::new(args, unknown, ModuleRegistry::with_builtins()).run()?;
    assert_eq!(report.model, "linear");
    assert_eq!(report.summary.epochs_run, 5);
    assert!(report.summary.final_metrics["valid"]["loss"].is_finite());

    let snapshot = Path::new(report.snapshot.as_deref().unwrap()).to_path_buf();
    assert!(snapshot.join("linear").join("data.rs").is_file());
    assert!(snapshot.join("linear").join("model.rs").is_file());
    assert!(snapshot.join("support").join("common.rs").is_file());

    let metrics = fs::read_to_string(logdir.join("train_log").join("metrics.csv"))?;
    assert!(metrics.starts_with("epoch,metric,value\n"));
    assert_eq!(metrics.lines().filter(|l| l.contains(",loss,")).count(), 5);
    assert!(logdir.join("valid_log").join("metrics.csv").is_file());
    assert!(logdir.join("checkpoints").join("best.json").is_file());

    let dumped: serde_json::Value = serde_json::from_str(&fs::read_to_string(logdir.join("config.json"))?)?;
    assert_eq!(dumped["data_params"]["noise"], serde_json::json!(0.0));
    assert_eq!(dumped["model_params"]["lr"], serde_json::json!(0.2));

    // Resume from the best checkpoint in a second run
    let mut resumed = RunArgs::new(LINEAR_DIR);
    resumed.support_dir = Some(support.display().to_string());
    resumed.resume = Some(logdir.join("checkpoints").join("best.json").display().to_string());
    let report = Orchestrator::new(resumed, Vec::new(), ModuleRegistry::with_builtins()).run()?;
    assert_eq!(report.summary.epochs_run, 1);
    assert!(report.snapshot.is_none());

    Ok(())
}

#[test]
fn test_same_seed_same_result() -> anyhow::Result<()> {
    let run = || -> anyhow::Result<f64> {
        let mut args = RunArgs::new(LINEAR_DIR);
        args.seed = Some(11);
        let unknown = vec!["--epochs=3:int".to_string()];
        let report = Orchestrator::new(args, unknown, ModuleRegistry::with_builtins()).run()?;
        Ok(report.summary.final_metrics["valid"]["loss"])
    };

    assert_eq!(run()?, run()?);
    Ok(())
}

#[test]
fn test_bad_resume_path_fails_model_build() {
    let mut args = RunArgs::new(LINEAR_DIR);
    args.resume = Some("/definitely/not/here.json".to_string());
    let mut orchestrator = Orchestrator::new(args, Vec::new(), ModuleRegistry::with_builtins());

    let err = orchestrator.run_until(RunState::Completed).unwrap_err();
    assert!(matches!(err, HarnessError::TrainingError { .. }));
    assert_eq!(orchestrator.failed_during(), Some(RunState::LoadersBuilt));
}

#[test]
fn test_training_failure_keeps_merged_config() {
    let args = RunArgs::new(LINEAR_DIR);
    let unknown = vec![
        "--epochs=3:int".to_string(),
        "--model_params/lr=1e308:float".to_string(),
    ];
    let mut orchestrator = Orchestrator::new(args, unknown, ModuleRegistry::with_builtins());

    let err = orchestrator.finish().unwrap_err();
    assert!(matches!(err, HarnessError::TrainingError { .. }));
    assert_eq!(orchestrator.state(), RunState::Failed);
    assert_eq!(orchestrator.failed_during(), Some(RunState::Training));

    // The merged configuration is still there to be printed
    let merged = orchestrator.merged().unwrap();
    assert_eq!(merged.config["model_params"]["lr"], serde_json::json!(1e308));
    assert!(orchestrator.describe_config().contains("model_params"));
}
