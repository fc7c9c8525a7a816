pub mod args;
#[cfg(feature = "cli")]
pub mod cli;
pub mod file;
pub mod merge;

pub use args::RunArgs;
#[cfg(feature = "cli")]
pub use cli::CliArgs;
pub use merge::{parse_args_uargs, MergedConfig};
