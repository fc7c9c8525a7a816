use crate::config::args::RunArgs;
use crate::core::callbacks::Loggers;
use crate::domain::model::{
    Callbacks, EntryPoint, EpochState, Loaders, ModelParts, Mode, SymbolTable, TrainSummary,
};
use anyhow::bail;
use rand::rngs::StdRng;
use std::any::Any;

/// A loaded experiment unit (`data.rs` or `model.rs`).
///
/// Modules declare which entry points they expose through `entry_points`;
/// the orchestrator checks the required set before building anything, so the
/// default bodies below only run when a module lies about its symbol table.
pub trait ExperimentModule {
    fn entry_points(&self) -> SymbolTable;

    fn prepare_data(
        &self,
        _args: &RunArgs,
        _data_params: &serde_json::Value,
        _rng: &mut StdRng,
    ) -> anyhow::Result<Loaders> {
        bail!("{} is not implemented", EntryPoint::PrepareData.as_str())
    }

    fn prepare_model(
        &self,
        _args: &RunArgs,
        _config: &serde_json::Value,
        _rng: &mut StdRng,
    ) -> anyhow::Result<ModelParts> {
        bail!("{} is not implemented", EntryPoint::PrepareModel.as_str())
    }

    fn prepare_callbacks(
        &self,
        _args: &RunArgs,
        _config: &serde_json::Value,
        _mode: Mode,
        _loggers: Loggers,
    ) -> anyhow::Result<Callbacks> {
        bail!("{} is not implemented", EntryPoint::PrepareCallbacks.as_str())
    }

    fn create_runner(&self, _parts: ModelParts) -> anyhow::Result<Box<dyn Runner>> {
        bail!("{} is not implemented", EntryPoint::Runner.as_str())
    }
}

pub trait DataLoader {
    /// Number of batches per epoch.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn as_any(&self) -> &dyn Any;
}

pub trait Runner {
    fn train(
        &mut self,
        loaders: &Loaders,
        callbacks: &mut Callbacks,
        epochs: usize,
    ) -> anyhow::Result<TrainSummary>;
}

pub trait Callback {
    fn on_train_start(&mut self, _loaders: &Loaders) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_epoch_end(&mut self, state: &EpochState) -> anyhow::Result<()>;

    fn on_train_end(&mut self, _summary: &TrainSummary) -> anyhow::Result<()> {
        Ok(())
    }
}
