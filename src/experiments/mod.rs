//! Experiments compiled into the harness. Each one lives in a directory that
//! is also a valid `--model-dir`, so its `data.rs` and `model.rs` are what
//! gets snapshotted.

pub mod linear;

use crate::core::resolver::ModuleRegistry;

pub fn register_builtins(registry: &mut ModuleRegistry) {
    linear::register(registry);
}
