//! One-feature linear regression on synthetic data.
//!
//! Run with `--model-dir src/experiments/linear`.

pub mod data;
pub mod model;

use crate::core::resolver::{ModuleRegistry, ModuleSource};
use crate::domain::ports::ExperimentModule;

pub const NAME: &str = "linear";

const DATA_SOURCE: &str = include_str!("data.rs");
const MODEL_SOURCE: &str = include_str!("model.rs");

pub fn register(registry: &mut ModuleRegistry) {
    registry.register(format!("{}.data", NAME), |source: &ModuleSource| {
        warn_if_modified(source, DATA_SOURCE);
        Ok(Box::new(data::LinearData) as Box<dyn ExperimentModule>)
    });
    registry.register(format!("{}.model", NAME), |source: &ModuleSource| {
        warn_if_modified(source, MODEL_SOURCE);
        Ok(Box::new(model::LinearExperiment) as Box<dyn ExperimentModule>)
    });
}

/// The snapshot copies the file on disk, the run executes the compiled copy.
fn warn_if_modified(source: &ModuleSource, compiled: &str) {
    if source.text != compiled {
        tracing::warn!(
            "⚠️ {} differs from the compiled {}; the snapshot will not match the code that runs",
            source.path.display(),
            source.logical_name
        );
    }
}
