//! Native module backend — loads an experiment unit from a shared library
//! built from the unit's source file.
//!
//! For `<dir>/model.rs` the loader looks for `<dir>/libmodel.so` (or the
//! platform equivalent). The library must export `dl_harness_module_create`,
//! returning a boxed `ExperimentModule` trait object.

use crate::core::resolver::{resolution, ModuleSource};
use crate::domain::ports::ExperimentModule;
use crate::utils::error::Result;
use std::path::{Path, PathBuf};

pub const CREATE_SYMBOL: &[u8] = b"dl_harness_module_create";

#[allow(improper_ctypes_definitions)]
pub type CreateModuleFn = unsafe extern "C" fn() -> *mut dyn ExperimentModule;

/// Shared library that would provide the unit at `source`, if one exists.
pub fn library_for(source: &Path) -> Option<PathBuf> {
    let stem = source.file_stem()?;
    let candidate = source
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(libloading::library_filename(stem));
    candidate.is_file().then_some(candidate)
}

/// Load the library and create the module.
///
/// Loading a native library executes arbitrary code; only trusted experiment
/// directories should be resolved.
pub fn load(
    source: &ModuleSource,
    library_path: &Path,
) -> Result<(libloading::Library, Box<dyn ExperimentModule>)> {
    tracing::debug!(
        "Loading native module {} from {}",
        source.logical_name,
        library_path.display()
    );

    // SAFETY: the library is trusted by the user who pointed --model-dir at it,
    // and the returned Library is kept alive alongside the module it created.
    unsafe {
        let library = libloading::Library::new(library_path)
            .map_err(|e| resolution(&source.logical_name, library_path, e))?;

        let create: libloading::Symbol<CreateModuleFn> =
            library.get(CREATE_SYMBOL).map_err(|e| {
                resolution(
                    &source.logical_name,
                    library_path,
                    format!("symbol 'dl_harness_module_create' not found: {}", e),
                )
            })?;

        let raw = create();
        if raw.is_null() {
            return Err(resolution(
                &source.logical_name,
                library_path,
                "module creation function returned null",
            ));
        }
        let module = Box::from_raw(raw);
        drop(create);

        Ok((library, module))
    }
}
