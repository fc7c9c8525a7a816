use crate::domain::model::{EpochState, Loaders, Metrics, TrainSummary};
use crate::domain::ports::Callback;
use crate::utils::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

pub const METRICS_FILE: &str = "metrics.csv";
pub const CHECKPOINT_DIR: &str = "checkpoints";

#[derive(Debug, Serialize)]
struct MetricRow<'a> {
    epoch: usize,
    metric: &'a str,
    value: f64,
}

/// Metric writer for one loader: `<logdir>/<loader>_log/metrics.csv`.
pub struct MetricLogger {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl MetricLogger {
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(METRICS_FILE);
        let writer = csv::Writer::from_path(&path)?;
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&mut self, epoch: usize, metrics: &Metrics) -> Result<()> {
        for (metric, value) in metrics {
            self.writer.serialize(MetricRow {
                epoch,
                metric,
                value: *value,
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Default)]
pub struct Loggers {
    loggers: BTreeMap<String, MetricLogger>,
}

impl Loggers {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }

    pub fn get_mut(&mut self, loader: &str) -> Option<&mut MetricLogger> {
        self.loggers.get_mut(loader)
    }
}

/// One metric logger per loader under the log directory; none without one.
pub fn create_loggers(logdir: Option<&Path>, loaders: &Loaders) -> Result<Loggers> {
    let Some(logdir) = logdir else {
        return Ok(Loggers::empty());
    };

    let mut loggers = BTreeMap::new();
    for name in loaders.keys() {
        let logger = MetricLogger::create(&logdir.join(format!("{}_log", name)))?;
        tracing::debug!("Metrics for loader '{}' -> {}", name, logger.path().display());
        loggers.insert(name.clone(), logger);
    }
    Ok(Loggers { loggers })
}

pub struct LoggerCallback {
    loggers: Loggers,
}

impl LoggerCallback {
    pub fn new(loggers: Loggers) -> Self {
        Self { loggers }
    }
}

impl Callback for LoggerCallback {
    fn on_epoch_end(&mut self, state: &EpochState) -> anyhow::Result<()> {
        for (loader, metrics) in &state.metrics {
            if let Some(logger) = self.loggers.get_mut(loader) {
                logger.log(state.epoch, metrics)?;
            }
        }
        Ok(())
    }
}

/// Logs every epoch's metrics through `tracing`.
pub struct ConsoleCallback;

impl Callback for ConsoleCallback {
    fn on_epoch_end(&mut self, state: &EpochState) -> anyhow::Result<()> {
        for (loader, metrics) in &state.metrics {
            let line = metrics
                .iter()
                .map(|(name, value)| format!("{}={:.6}", name, value))
                .collect::<Vec<_>>()
                .join(" ");
            tracing::info!("epoch {} [{}] {}", state.epoch, loader, line);
        }
        Ok(())
    }

    fn on_train_end(&mut self, summary: &TrainSummary) -> anyhow::Result<()> {
        tracing::info!("Training finished after {} epochs", summary.epochs_run);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: usize,
    pub metric: String,
    pub value: f64,
    pub model_state: serde_json::Value,
}

pub fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    let content = fs::read_to_string(path).map_err(|e| HarnessError::InvalidConfigValueError {
        field: "resume".to_string(),
        value: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(serde_json::from_str(&content)?)
}

/// Saves `last.json` every epoch and `best.json` whenever `metric` on
/// `loader` improves (lower is better).
pub struct CheckpointCallback {
    dir: PathBuf,
    loader: String,
    metric: String,
    best: Option<f64>,
}

impl CheckpointCallback {
    pub fn new(logdir: &Path, loader: impl Into<String>, metric: impl Into<String>) -> Self {
        Self {
            dir: logdir.join(CHECKPOINT_DIR),
            loader: loader.into(),
            metric: metric.into(),
            best: None,
        }
    }

    fn save(&self, name: &str, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(
            self.dir.join(name),
            serde_json::to_string_pretty(checkpoint)?,
        )?;
        Ok(())
    }
}

impl Callback for CheckpointCallback {
    fn on_epoch_end(&mut self, state: &EpochState) -> anyhow::Result<()> {
        let Some(value) = state
            .metrics
            .get(&self.loader)
            .and_then(|metrics| metrics.get(&self.metric))
            .copied()
        else {
            tracing::warn!(
                "Checkpoint metric {}/{} missing at epoch {}",
                self.loader,
                self.metric,
                state.epoch
            );
            return Ok(());
        };

        let checkpoint = Checkpoint {
            epoch: state.epoch,
            metric: format!("{}/{}", self.loader, self.metric),
            value,
            model_state: state.model_state.clone(),
        };
        self.save("last.json", &checkpoint)?;

        if self.best.map_or(true, |best| value < best) {
            self.best = Some(value);
            self.save("best.json", &checkpoint)?;
            tracing::debug!("New best checkpoint at epoch {}: {}", state.epoch, value);
        }
        Ok(())
    }
}
