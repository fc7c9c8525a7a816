pub mod config;
pub mod core;
pub mod domain;
pub mod experiments;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliArgs;
pub use config::{parse_args_uargs, MergedConfig, RunArgs};

pub use core::orchestrator::{Orchestrator, RunReport, RunState};
pub use core::paths::{normalize, ModelDirectory};
pub use core::resolver::ModuleRegistry;
pub use core::staging::{SnapshotStager, StageOutcome};
pub use utils::error::{HarnessError, Result};
