use crate::config::args::RunArgs;
use crate::config::merge::{parse_args_uargs, MergedConfig};
use crate::core::callbacks::{create_loggers, Loggers};
use crate::core::paths::ModelDirectory;
use crate::core::resolver::{ModuleRegistry, ResolvedModule};
use crate::core::seed::seeded_rng;
use crate::core::staging::{SnapshotDirectory, SnapshotStager, StageOutcome};
use crate::domain::model::{Callbacks, EntryPoint, Loaders, ModelParts, Mode, TrainSummary};
use crate::domain::ports::Runner;
use crate::utils::error::{HarnessError, Result};
use crate::utils::monitor::SystemMonitor;
use rand::rngs::StdRng;
use serde::Serialize;
use std::fmt;
use std::rc::Rc;

/// Support library copied into every snapshot unless `--support-dir` says otherwise.
pub const DEFAULT_SUPPORT_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/src");

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RunState {
    Init,
    Seeded,
    LogDirReady,
    ModulesResolved,
    Staged,
    ConfigMerged,
    LoadersBuilt,
    ModelBuilt,
    CallbacksBuilt,
    Training,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub model: String,
    pub snapshot: Option<String>,
    pub summary: TrainSummary,
}

#[derive(Serialize)]
struct PendingState<'a> {
    args: &'a RunArgs,
    unknown_args: &'a [String],
}

/// Drives one run through the state machine
/// `Init → Seeded → LogDirReady → ModulesResolved → Staged → ConfigMerged →
/// LoadersBuilt → ModelBuilt → CallbacksBuilt → Training → Completed`.
///
/// Any failure moves the run to `Failed` and is returned to the caller; there
/// are no retries and a failed orchestrator cannot be resumed.
pub struct Orchestrator {
    cli_args: RunArgs,
    unknown_args: Vec<String>,
    stager: SnapshotStager,
    monitor: SystemMonitor,
    state: RunState,
    failed_during: Option<RunState>,

    rng: Option<StdRng>,
    model_dir: Option<ModelDirectory>,
    staged: Option<StageOutcome>,
    merged: Option<MergedConfig>,
    summary: Option<TrainSummary>,

    // 模組產生的物件必須先於模組本身釋放：原生模組的共享函式庫
    // 在最後一個 ResolvedModule 釋放時卸載
    runner: Option<Box<dyn Runner>>,
    callbacks: Option<Callbacks>,
    parts: Option<ModelParts>,
    loggers: Option<Loggers>,
    loaders: Option<Loaders>,
    data_module: Option<Rc<ResolvedModule>>,
    model_module: Option<Rc<ResolvedModule>>,
    registry: ModuleRegistry,
}

impl Orchestrator {
    pub fn new(cli_args: RunArgs, unknown_args: Vec<String>, registry: ModuleRegistry) -> Self {
        let support_dir = cli_args
            .support_dir
            .clone()
            .unwrap_or_else(|| DEFAULT_SUPPORT_DIR.to_string());

        Self {
            cli_args,
            unknown_args,
            stager: SnapshotStager::new(support_dir),
            monitor: SystemMonitor::new(false),
            state: RunState::Init,
            failed_during: None,
            rng: None,
            model_dir: None,
            staged: None,
            merged: None,
            summary: None,
            runner: None,
            callbacks: None,
            parts: None,
            loggers: None,
            loaders: None,
            data_module: None,
            model_module: None,
            registry,
        }
    }

    pub fn with_stager(mut self, stager: SnapshotStager) -> Self {
        self.stager = stager;
        self
    }

    /// Also zip the snapshot next to its directory.
    pub fn with_archive(mut self, archive: bool) -> Self {
        self.stager = self.stager.clone().with_archive(archive);
        self
    }

    pub fn with_monitoring(mut self, enabled: bool) -> Self {
        self.monitor = SystemMonitor::new(enabled);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// The state that was being left when the run failed.
    pub fn failed_during(&self) -> Option<RunState> {
        self.failed_during
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn model_directory(&self) -> Option<&ModelDirectory> {
        self.model_dir.as_ref()
    }

    pub fn snapshot(&self) -> Option<&SnapshotDirectory> {
        self.staged.as_ref().and_then(StageOutcome::snapshot)
    }

    pub fn merged(&self) -> Option<&MergedConfig> {
        self.merged.as_ref()
    }

    pub fn rng_mut(&mut self) -> Option<&mut StdRng> {
        self.rng.as_mut()
    }

    pub fn summary(&self) -> Option<&TrainSummary> {
        self.summary.as_ref()
    }

    /// Pretty JSON of the configuration currently in effect: the merged
    /// args and config once available, the raw CLI input before that.
    pub fn describe_config(&self) -> String {
        let rendered = match &self.merged {
            Some(merged) => merged.to_pretty_json(),
            None => serde_json::to_string_pretty(&PendingState {
                args: &self.cli_args,
                unknown_args: &self.unknown_args,
            })
            .map_err(HarnessError::from),
        };
        rendered.unwrap_or_else(|e| format!("<unprintable configuration: {}>", e))
    }

    /// Advance until `target` (or a terminal state) is reached.
    pub fn run_until(&mut self, target: RunState) -> Result<RunState> {
        while self.state < target && !self.state.is_terminal() {
            self.advance()?;
        }
        Ok(self.state)
    }

    pub fn run(mut self) -> Result<RunReport> {
        self.finish()
    }

    /// Like [`Orchestrator::run`], keeping the orchestrator around so a
    /// failure can still be inspected through `describe_config`.
    pub fn finish(&mut self) -> Result<RunReport> {
        self.run_until(RunState::Completed)?;
        self.monitor.log_final_stats();

        Ok(RunReport {
            model: self
                .model_dir
                .as_ref()
                .map(|dir| dir.short_name().to_string())
                .unwrap_or_default(),
            snapshot: self.snapshot().map(|s| s.root.display().to_string()),
            summary: self.summary.clone().unwrap_or_default(),
        })
    }

    /// Perform exactly one transition.
    pub fn advance(&mut self) -> Result<RunState> {
        let from = self.state;
        if from.is_terminal() {
            return Ok(from);
        }

        match self.step(from) {
            Ok(next) => {
                self.state = next;
                tracing::debug!("Run state {} -> {}", from, next);
                self.monitor.log_stats(&next.to_string());
                Ok(next)
            }
            Err(e) => {
                tracing::error!("❌ Run failed during {}: {}", from, e);
                self.state = RunState::Failed;
                self.failed_during = Some(from);
                Err(e)
            }
        }
    }

    /// Drop everything the experiment modules built, newest first, while
    /// the modules (and any shared library behind them) are still loaded.
    fn release_module_objects(&mut self) {
        self.runner = None;
        self.callbacks = None;
        self.parts = None;
        self.loggers = None;
        self.loaders = None;
    }

    fn step(&mut self, from: RunState) -> Result<RunState> {
        match from {
            RunState::Init => self.seed(),
            RunState::Seeded => self.prepare_logdir(),
            RunState::LogDirReady => self.resolve_modules(),
            RunState::ModulesResolved => self.stage_sources(),
            RunState::Staged => self.merge_config(),
            RunState::ConfigMerged => self.build_loaders(),
            RunState::LoadersBuilt => self.build_model(),
            RunState::ModelBuilt => self.build_callbacks(),
            RunState::CallbacksBuilt => self.build_runner(),
            RunState::Training => self.train(),
            RunState::Completed | RunState::Failed => Ok(from),
        }
    }

    fn seed(&mut self) -> Result<RunState> {
        let seed = self.cli_args.seed();
        tracing::info!("🎲 Seeding run with {}", seed);
        self.rng = Some(seeded_rng(seed));
        Ok(RunState::Seeded)
    }

    fn prepare_logdir(&mut self) -> Result<RunState> {
        if let Some(logdir) = self.cli_args.logdir_path() {
            std::fs::create_dir_all(&logdir).map_err(|e| HarnessError::staging(&logdir, e))?;
            tracing::info!("📁 Log directory: {}", logdir.display());
        }
        Ok(RunState::LogDirReady)
    }

    fn resolve_modules(&mut self) -> Result<RunState> {
        let model_dir = ModelDirectory::new(self.cli_args.model_dir.clone());
        tracing::info!(
            "🔍 Resolving experiment '{}' from {}",
            model_dir.short_name(),
            model_dir.normalized()
        );

        let data = self
            .registry
            .resolve(&model_dir.module_name("data"), &model_dir.data_source())?;
        let model = self
            .registry
            .resolve(&model_dir.module_name("model"), &model_dir.model_source())?;

        data.require(EntryPoint::DATA)?;
        model.require(EntryPoint::MODEL)?;

        self.data_module = Some(data);
        self.model_module = Some(model);
        self.model_dir = Some(model_dir);
        Ok(RunState::ModulesResolved)
    }

    fn stage_sources(&mut self) -> Result<RunState> {
        let model_dir = expect_state(self.model_dir.as_ref(), "model directory")?;
        let logdir = self.cli_args.logdir_path();

        let outcome = self.stager.stage(
            logdir.as_deref(),
            model_dir.short_name(),
            &model_dir.data_source(),
            &model_dir.model_source(),
        )?;
        self.staged = Some(outcome);
        Ok(RunState::Staged)
    }

    fn merge_config(&mut self) -> Result<RunState> {
        let merged = parse_args_uargs(&self.cli_args, &self.unknown_args, true)?;
        tracing::info!("⚙️ Resolved configuration:\n{}", merged.to_pretty_json()?);
        self.merged = Some(merged);
        Ok(RunState::ConfigMerged)
    }

    fn build_loaders(&mut self) -> Result<RunState> {
        let merged = expect_state(self.merged.as_ref(), "merged configuration")?;
        let data = expect_state(self.data_module.as_ref(), "data module")?;
        let rng = expect_state(self.rng.as_mut(), "random source")?;

        let loaders = data
            .module()
            .prepare_data(&merged.args, &merged.data_params(), rng)
            .map_err(HarnessError::training)?;
        for (name, loader) in &loaders {
            tracing::info!("Loader '{}': {} batches", name, loader.len());
        }

        let loggers = create_loggers(merged.args.logdir_path().as_deref(), &loaders)?;
        self.loaders = Some(loaders);
        self.loggers = Some(loggers);
        Ok(RunState::LoadersBuilt)
    }

    fn build_model(&mut self) -> Result<RunState> {
        let merged = expect_state(self.merged.as_ref(), "merged configuration")?;
        let model = expect_state(self.model_module.as_ref(), "model module")?;
        let rng = expect_state(self.rng.as_mut(), "random source")?;

        let parts = model
            .module()
            .prepare_model(&merged.args, &merged.config, rng)
            .map_err(HarnessError::training)?;
        tracing::debug!("Model parts prepared: {:?}", parts);
        self.parts = Some(parts);
        Ok(RunState::ModelBuilt)
    }

    fn build_callbacks(&mut self) -> Result<RunState> {
        let merged = expect_state(self.merged.as_ref(), "merged configuration")?;
        let model = expect_state(self.model_module.as_ref(), "model module")?;
        let loggers = expect_state(self.loggers.take(), "loggers")?;

        let mode = Mode::from_debug_flag(merged.args.debug());
        let callbacks = model
            .module()
            .prepare_callbacks(&merged.args, &merged.config, mode, loggers)
            .map_err(HarnessError::training)?;
        tracing::info!("{} callbacks prepared in {} mode", callbacks.len(), mode);
        self.callbacks = Some(callbacks);
        Ok(RunState::CallbacksBuilt)
    }

    fn build_runner(&mut self) -> Result<RunState> {
        let model = expect_state(self.model_module.as_ref(), "model module")?;
        let parts = expect_state(self.parts.take(), "model parts")?;

        let runner = model
            .module()
            .create_runner(parts)
            .map_err(HarnessError::training)?;
        self.runner = Some(runner);
        Ok(RunState::Training)
    }

    fn train(&mut self) -> Result<RunState> {
        let epochs = expect_state(self.merged.as_ref(), "merged configuration")?
            .args
            .epochs();
        let loaders = expect_state(self.loaders.as_ref(), "loaders")?;
        let callbacks = expect_state(self.callbacks.as_mut(), "callbacks")?;
        let runner = expect_state(self.runner.as_mut(), "runner")?;

        tracing::info!("🚀 Training for {} epochs", epochs);
        let summary = runner
            .train(loaders, callbacks, epochs)
            .map_err(HarnessError::training)?;
        tracing::info!("✅ Training completed after {} epochs", summary.epochs_run);

        self.summary = Some(summary);
        Ok(RunState::Completed)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.release_module_objects();
    }
}

fn expect_state<T>(value: Option<T>, what: &str) -> Result<T> {
    value.ok_or_else(|| HarnessError::TrainingError {
        message: format!("{} is not available in the current run state", what),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::resolver::ModuleSource;
    use crate::domain::ports::{DataLoader, ExperimentModule};
    use std::any::Any;
    use std::cell::RefCell;

    type DropLog = Rc<RefCell<Vec<&'static str>>>;

    struct TrackedLoader(DropLog);

    impl DataLoader for TrackedLoader {
        fn len(&self) -> usize {
            1
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    impl Drop for TrackedLoader {
        fn drop(&mut self) {
            self.0.borrow_mut().push("loader");
        }
    }

    struct TrackedPart(DropLog);

    impl Drop for TrackedPart {
        fn drop(&mut self) {
            self.0.borrow_mut().push("parts");
        }
    }

    struct TrackedData(DropLog);

    impl ExperimentModule for TrackedData {
        fn entry_points(&self) -> crate::domain::model::SymbolTable {
            EntryPoint::DATA.iter().copied().collect()
        }

        fn prepare_data(
            &self,
            _args: &RunArgs,
            _data_params: &serde_json::Value,
            _rng: &mut StdRng,
        ) -> anyhow::Result<Loaders> {
            let mut loaders = Loaders::new();
            loaders.insert("train".to_string(), Box::new(TrackedLoader(Rc::clone(&self.0))));
            Ok(loaders)
        }
    }

    impl Drop for TrackedData {
        fn drop(&mut self) {
            self.0.borrow_mut().push("data module");
        }
    }

    struct TrackedModel(DropLog);

    impl ExperimentModule for TrackedModel {
        fn entry_points(&self) -> crate::domain::model::SymbolTable {
            EntryPoint::MODEL.iter().copied().collect()
        }

        fn prepare_model(
            &self,
            _args: &RunArgs,
            _config: &serde_json::Value,
            _rng: &mut StdRng,
        ) -> anyhow::Result<ModelParts> {
            Ok(ModelParts {
                model: Box::new(TrackedPart(Rc::clone(&self.0))),
                criterion: Box::new(()),
                optimizer: Box::new(()),
                scheduler: None,
            })
        }

        fn prepare_callbacks(
            &self,
            _args: &RunArgs,
            _config: &serde_json::Value,
            _mode: Mode,
            _loggers: Loggers,
        ) -> anyhow::Result<Callbacks> {
            Ok(Callbacks::new())
        }
    }

    impl Drop for TrackedModel {
        fn drop(&mut self) {
            self.0.borrow_mut().push("model module");
        }
    }

    #[test]
    fn test_state_order() {
        assert!(RunState::Init < RunState::Seeded);
        assert!(RunState::Staged < RunState::ConfigMerged);
        assert!(RunState::Training < RunState::Completed);
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::Training.is_terminal());
    }

    #[test]
    fn test_missing_model_dir_fails_at_resolution() {
        let dir = tempfile::TempDir::new().unwrap();
        let args = RunArgs::new(dir.path().join("nothing").display().to_string());
        let mut orchestrator = Orchestrator::new(args, Vec::new(), ModuleRegistry::new());

        let err = orchestrator.run_until(RunState::Completed).unwrap_err();
        assert!(matches!(err, HarnessError::ResolutionError { .. }));
        assert_eq!(orchestrator.state(), RunState::Failed);
        assert_eq!(orchestrator.failed_during(), Some(RunState::LogDirReady));
        assert!(orchestrator.describe_config().contains("nothing"));
    }

    #[test]
    fn test_module_objects_are_dropped_before_modules() {
        let dir = tempfile::TempDir::new().unwrap();
        let exp = dir.path().join("expT");
        std::fs::create_dir_all(&exp).unwrap();
        std::fs::write(exp.join("data.rs"), "// data\n").unwrap();
        std::fs::write(exp.join("model.rs"), "// model\n").unwrap();

        let log: DropLog = Rc::default();
        let mut registry = ModuleRegistry::new();
        let data_log = Rc::clone(&log);
        registry.register("expT.data", move |_: &ModuleSource| {
            Ok(Box::new(TrackedData(Rc::clone(&data_log))) as Box<dyn ExperimentModule>)
        });
        let model_log = Rc::clone(&log);
        registry.register("expT.model", move |_: &ModuleSource| {
            Ok(Box::new(TrackedModel(Rc::clone(&model_log))) as Box<dyn ExperimentModule>)
        });

        let args = RunArgs::new(exp.display().to_string());
        let mut orchestrator = Orchestrator::new(args, Vec::new(), registry);
        assert_eq!(
            orchestrator.run_until(RunState::CallbacksBuilt).unwrap(),
            RunState::CallbacksBuilt
        );
        assert!(log.borrow().is_empty());

        drop(orchestrator);

        let log = log.borrow();
        assert_eq!(log.len(), 4);
        assert_eq!(&log[..2], &["parts", "loader"]);
        assert!(log[2..].contains(&"data module"));
        assert!(log[2..].contains(&"model module"));
    }
}
