pub mod callbacks;
#[cfg(feature = "native")]
pub mod native;
pub mod orchestrator;
pub mod paths;
pub mod resolver;
pub mod seed;
pub mod staging;

pub use crate::domain::model::{EntryPoint, Mode, TrainSummary};
pub use crate::domain::ports::{Callback, DataLoader, ExperimentModule, Runner};
pub use crate::utils::error::Result;
