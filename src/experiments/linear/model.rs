use super::data::SampleLoader;
use crate::config::args::RunArgs;
use crate::core::callbacks::{
    load_checkpoint, CheckpointCallback, ConsoleCallback, LoggerCallback, Loggers,
};
use crate::domain::model::{
    Callbacks, EntryPoint, EpochState, Loaders, Metrics, ModelParts, Mode, SymbolTable,
    TrainSummary,
};
use crate::domain::ports::{ExperimentModule, Runner};
use anyhow::{anyhow, bail, Context};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    pub lr: f64,
    pub gamma: f64,
    pub step_size: usize,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            lr: 0.1,
            gamma: 0.5,
            step_size: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub weight: f64,
    pub bias: f64,
}

impl LinearModel {
    pub fn predict(&self, x: f64) -> f64 {
        self.weight * x + self.bias
    }
}

pub struct MseLoss;

impl MseLoss {
    pub fn loss(&self, prediction: f64, target: f64) -> f64 {
        (prediction - target).powi(2)
    }

    pub fn grad(&self, prediction: f64, target: f64) -> f64 {
        2.0 * (prediction - target)
    }
}

pub struct Sgd {
    pub lr: f64,
}

impl Sgd {
    pub fn step(&self, model: &mut LinearModel, lr: f64, grad_weight: f64, grad_bias: f64) {
        model.weight -= lr * grad_weight;
        model.bias -= lr * grad_bias;
    }
}

/// Multiplies the learning rate by `gamma` every `step_size` epochs.
pub struct StepDecay {
    pub gamma: f64,
    pub step_size: usize,
}

impl StepDecay {
    pub fn lr_at(&self, base_lr: f64, epoch: usize) -> f64 {
        let steps = epoch / self.step_size.max(1);
        base_lr * self.gamma.powi(steps as i32)
    }
}

pub struct LinearExperiment;

impl ExperimentModule for LinearExperiment {
    fn entry_points(&self) -> SymbolTable {
        [
            EntryPoint::PrepareModel,
            EntryPoint::PrepareCallbacks,
            EntryPoint::Runner,
        ]
        .into_iter()
        .collect()
    }

    fn prepare_model(
        &self,
        args: &RunArgs,
        config: &serde_json::Value,
        rng: &mut StdRng,
    ) -> anyhow::Result<ModelParts> {
        let params: ModelParams = match config.get("model_params") {
            Some(value) => serde_json::from_value(value.clone()).context("invalid model_params")?,
            None => ModelParams::default(),
        };

        let model = match &args.resume {
            Some(path) => {
                let checkpoint = load_checkpoint(Path::new(path))?;
                tracing::info!("Resuming from {} (epoch {})", path, checkpoint.epoch);
                serde_json::from_value::<LinearModel>(checkpoint.model_state)
                    .context("checkpoint does not hold linear model weights")?
            }
            None => LinearModel {
                weight: rng.random_range(-0.1..0.1),
                bias: 0.0,
            },
        };

        Ok(ModelParts {
            model: Box::new(model),
            criterion: Box::new(MseLoss),
            optimizer: Box::new(Sgd { lr: params.lr }),
            scheduler: Some(Box::new(StepDecay {
                gamma: params.gamma,
                step_size: params.step_size,
            })),
        })
    }

    fn prepare_callbacks(
        &self,
        args: &RunArgs,
        _config: &serde_json::Value,
        mode: Mode,
        loggers: Loggers,
    ) -> anyhow::Result<Callbacks> {
        let mut callbacks: Callbacks = vec![Box::new(LoggerCallback::new(loggers))];
        if let Some(logdir) = args.logdir_path() {
            callbacks.push(Box::new(CheckpointCallback::new(&logdir, "valid", "loss")));
        }
        if mode == Mode::Debug {
            callbacks.push(Box::new(ConsoleCallback));
        }
        Ok(callbacks)
    }

    fn create_runner(&self, parts: ModelParts) -> anyhow::Result<Box<dyn Runner>> {
        let model = parts
            .model
            .downcast::<LinearModel>()
            .map_err(|_| anyhow!("model is not a LinearModel"))?;
        let criterion = parts
            .criterion
            .downcast::<MseLoss>()
            .map_err(|_| anyhow!("criterion is not MseLoss"))?;
        let optimizer = parts
            .optimizer
            .downcast::<Sgd>()
            .map_err(|_| anyhow!("optimizer is not Sgd"))?;
        let scheduler = parts
            .scheduler
            .map(|s| s.downcast::<StepDecay>())
            .transpose()
            .map_err(|_| anyhow!("scheduler is not StepDecay"))?;

        Ok(Box::new(LinearRunner {
            model: *model,
            criterion: *criterion,
            optimizer: *optimizer,
            scheduler: scheduler.map(|s| *s),
        }))
    }
}

pub struct LinearRunner {
    model: LinearModel,
    criterion: MseLoss,
    optimizer: Sgd,
    scheduler: Option<StepDecay>,
}

impl LinearRunner {
    pub fn model(&self) -> &LinearModel {
        &self.model
    }

    fn loader<'a>(loaders: &'a Loaders, name: &str) -> anyhow::Result<Option<&'a SampleLoader>> {
        match loaders.get(name) {
            Some(loader) => loader
                .as_any()
                .downcast_ref::<SampleLoader>()
                .map(Some)
                .ok_or_else(|| anyhow!("loader '{}' is not a SampleLoader", name)),
            None => Ok(None),
        }
    }

    fn train_epoch(&mut self, loader: &SampleLoader, lr: f64) -> f64 {
        let mut total = 0.0;
        for batch in loader.batches() {
            let n = batch.len() as f64;
            let (mut grad_w, mut grad_b) = (0.0, 0.0);
            for &(x, y) in batch {
                let prediction = self.model.predict(x);
                total += self.criterion.loss(prediction, y);
                let g = self.criterion.grad(prediction, y);
                grad_w += g * x / n;
                grad_b += g / n;
            }
            self.optimizer.step(&mut self.model, lr, grad_w, grad_b);
        }
        total / loader.samples().len().max(1) as f64
    }

    fn evaluate(&self, loader: &SampleLoader) -> f64 {
        let total: f64 = loader
            .samples()
            .iter()
            .map(|&(x, y)| self.criterion.loss(self.model.predict(x), y))
            .sum();
        total / loader.samples().len().max(1) as f64
    }
}

impl Runner for LinearRunner {
    fn train(
        &mut self,
        loaders: &Loaders,
        callbacks: &mut Callbacks,
        epochs: usize,
    ) -> anyhow::Result<TrainSummary> {
        let train = Self::loader(loaders, "train")?.ok_or_else(|| anyhow!("no 'train' loader"))?;
        let valid = Self::loader(loaders, "valid")?;

        for callback in callbacks.iter_mut() {
            callback.on_train_start(loaders)?;
        }

        let mut summary = TrainSummary::default();
        for epoch in 0..epochs {
            let lr = match &self.scheduler {
                Some(scheduler) => scheduler.lr_at(self.optimizer.lr, epoch),
                None => self.optimizer.lr,
            };

            let mut metrics = BTreeMap::new();
            let train_loss = self.train_epoch(train, lr);
            if !train_loss.is_finite() {
                bail!("loss diverged at epoch {} (lr {})", epoch, lr);
            }
            metrics.insert(
                "train".to_string(),
                Metrics::from([("loss".to_string(), train_loss), ("lr".to_string(), lr)]),
            );
            if let Some(valid) = valid {
                metrics.insert(
                    "valid".to_string(),
                    Metrics::from([("loss".to_string(), self.evaluate(valid))]),
                );
            }

            let state = EpochState {
                epoch,
                metrics,
                model_state: serde_json::to_value(self.model)?,
            };
            for callback in callbacks.iter_mut() {
                callback.on_epoch_end(&state)?;
            }

            summary.epochs_run = epoch + 1;
            summary.final_metrics = state.metrics;
        }

        for callback in callbacks.iter_mut() {
            callback.on_train_end(&summary)?;
        }
        Ok(summary)
    }
}
