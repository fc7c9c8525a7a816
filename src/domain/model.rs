use crate::domain::ports::{Callback, DataLoader};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Named data loaders produced by `prepare_data` (e.g. `train`, `valid`).
pub type Loaders = BTreeMap<String, Box<dyn DataLoader>>;

pub type Callbacks = Vec<Box<dyn Callback>>;

/// Per-loader metrics for one epoch, keyed by metric name.
pub type Metrics = BTreeMap<String, f64>;

/// The four objects `prepare_model` hands to the runner. Their concrete types
/// belong to the experiment; the harness only moves them around.
pub struct ModelParts {
    pub model: Box<dyn Any>,
    pub criterion: Box<dyn Any>,
    pub optimizer: Box<dyn Any>,
    pub scheduler: Option<Box<dyn Any>>,
}

impl fmt::Debug for ModelParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelParts")
            .field("scheduler", &self.scheduler.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Train,
    Debug,
}

impl Mode {
    pub fn from_debug_flag(debug: bool) -> Self {
        if debug {
            Mode::Debug
        } else {
            Mode::Train
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Train => write!(f, "train"),
            Mode::Debug => write!(f, "debug"),
        }
    }
}

/// Entry points a resolved module may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryPoint {
    PrepareData,
    PrepareModel,
    PrepareCallbacks,
    Runner,
}

impl EntryPoint {
    pub const DATA: &'static [EntryPoint] = &[EntryPoint::PrepareData];
    pub const MODEL: &'static [EntryPoint] = &[
        EntryPoint::PrepareModel,
        EntryPoint::PrepareCallbacks,
        EntryPoint::Runner,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryPoint::PrepareData => "prepare_data",
            EntryPoint::PrepareModel => "prepare_model",
            EntryPoint::PrepareCallbacks => "prepare_callbacks",
            EntryPoint::Runner => "runner",
        }
    }
}

pub type SymbolTable = BTreeSet<EntryPoint>;

/// What callbacks see at the end of every epoch.
#[derive(Debug, Clone, Serialize)]
pub struct EpochState {
    pub epoch: usize,
    pub metrics: BTreeMap<String, Metrics>,
    /// Serializable model weights, used for checkpointing.
    pub model_state: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainSummary {
    pub epochs_run: usize,
    pub final_metrics: BTreeMap<String, Metrics>,
}
