//! Loading of experiment units by path.
//!
//! A unit is identified by a logical name (`<short>.data`, `<short>.model`)
//! and a source file. Resolution reads and digests the source, then builds
//! the module through the first backend that knows it:
//!
//! 1. a factory registered under the logical name (built-in experiments);
//! 2. a shared library next to the source file (`native` feature).
//!
//! Every successful resolution is recorded in the registry, replacing any
//! earlier entry with the same name.

use crate::domain::model::{EntryPoint, SymbolTable};
use crate::domain::ports::ExperimentModule;
use crate::utils::error::{HarnessError, Result};
use crate::utils::validation::is_dotted_identifier;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// What a factory gets to see when it "executes" a unit.
#[derive(Debug, Clone)]
pub struct ModuleSource {
    pub logical_name: String,
    pub path: PathBuf,
    pub text: String,
    pub digest: String,
}

impl ModuleSource {
    pub fn read(logical_name: &str, path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| resolution(logical_name, path, e))?;
        let digest = format!("{:x}", Sha256::digest(&bytes));
        let text = String::from_utf8(bytes)
            .map_err(|e| resolution(logical_name, path, format!("source is not UTF-8: {}", e)))?;

        Ok(Self {
            logical_name: logical_name.to_string(),
            path: path.to_path_buf(),
            text,
            digest,
        })
    }
}

pub type ModuleFactory = Box<dyn Fn(&ModuleSource) -> anyhow::Result<Box<dyn ExperimentModule>>>;

pub struct ResolvedModule {
    name: String,
    source: PathBuf,
    digest: String,
    symbols: SymbolTable,
    // 欄位依宣告順序釋放：模組必須先於其共享函式庫釋放
    module: Box<dyn ExperimentModule>,
    #[cfg(feature = "native")]
    _library: Option<libloading::Library>,
}

impl ResolvedModule {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn module(&self) -> &dyn ExperimentModule {
        self.module.as_ref()
    }

    /// Fail unless every entry point in `required` is exposed.
    pub fn require(&self, required: &[EntryPoint]) -> Result<()> {
        match required.iter().find(|ep| !self.symbols.contains(ep)) {
            Some(missing) => Err(HarnessError::MissingEntryPointError {
                module: self.name.clone(),
                entry_point: missing.as_str().to_string(),
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ResolvedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedModule")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("digest", &self.digest)
            .field("symbols", &self.symbols)
            .finish()
    }
}

#[derive(Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
    loaded: HashMap<String, Rc<ResolvedModule>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the experiments compiled into this crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::experiments::register_builtins(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, logical_name: impl Into<String>, factory: F)
    where
        F: Fn(&ModuleSource) -> anyhow::Result<Box<dyn ExperimentModule>> + 'static,
    {
        self.factories.insert(logical_name.into(), Box::new(factory));
    }

    pub fn is_registered(&self, logical_name: &str) -> bool {
        self.factories.contains_key(logical_name)
    }

    /// The module last resolved under `logical_name`.
    pub fn get(&self, logical_name: &str) -> Option<Rc<ResolvedModule>> {
        self.loaded.get(logical_name).cloned()
    }

    pub fn resolve(&mut self, logical_name: &str, source_path: &Path) -> Result<Rc<ResolvedModule>> {
        if !is_dotted_identifier(logical_name) {
            return Err(resolution(
                logical_name,
                source_path,
                "module name is not a valid dotted identifier",
            ));
        }
        if !source_path.is_file() {
            return Err(resolution(logical_name, source_path, "source file does not exist"));
        }

        let source = ModuleSource::read(logical_name, source_path)?;
        let resolved = self.load(source)?;

        tracing::debug!(
            "Resolved {} from {} (sha256 {}, entry points {:?})",
            resolved.name,
            resolved.source.display(),
            &resolved.digest[..12],
            resolved.symbols
        );

        let resolved = Rc::new(resolved);
        if self
            .loaded
            .insert(logical_name.to_string(), Rc::clone(&resolved))
            .is_some()
        {
            tracing::debug!("Replaced previously resolved module {}", logical_name);
        }
        Ok(resolved)
    }

    fn load(&self, source: ModuleSource) -> Result<ResolvedModule> {
        if let Some(factory) = self.factories.get(&source.logical_name) {
            let module = factory(&source)
                .map_err(|e| resolution(&source.logical_name, &source.path, format!("{:#}", e)))?;
            return Ok(ResolvedModule {
                symbols: module.entry_points(),
                name: source.logical_name,
                source: source.path,
                digest: source.digest,
                module,
                #[cfg(feature = "native")]
                _library: None,
            });
        }

        #[cfg(feature = "native")]
        {
            if let Some(library_path) = crate::core::native::library_for(&source.path) {
                let (library, module) = crate::core::native::load(&source, &library_path)?;
                return Ok(ResolvedModule {
                    symbols: module.entry_points(),
                    name: source.logical_name,
                    source: source.path,
                    digest: source.digest,
                    module,
                    _library: Some(library),
                });
            }
        }

        Err(resolution(
            &source.logical_name,
            &source.path,
            "no registered experiment or native library provides this module",
        ))
    }
}

pub(crate) fn resolution(
    logical_name: &str,
    path: &Path,
    reason: impl fmt::Display,
) -> HarnessError {
    HarnessError::ResolutionError {
        name: logical_name.to_string(),
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::args::RunArgs;
    use crate::domain::model::Loaders;
    use rand::rngs::StdRng;
    use std::cell::Cell;
    use tempfile::TempDir;

    struct EchoData;

    impl ExperimentModule for EchoData {
        fn entry_points(&self) -> SymbolTable {
            [EntryPoint::PrepareData].into_iter().collect()
        }

        fn prepare_data(
            &self,
            _args: &RunArgs,
            _data_params: &serde_json::Value,
            _rng: &mut StdRng,
        ) -> anyhow::Result<Loaders> {
            Ok(Loaders::new())
        }
    }

    fn registry_with_echo() -> ModuleRegistry {
        let mut registry = ModuleRegistry::new();
        registry.register("expA.data", |_source: &ModuleSource| {
            Ok(Box::new(EchoData) as Box<dyn ExperimentModule>)
        });
        registry
    }

    fn write_source(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("data.rs");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_resolve_registered_module() {
        let dir = TempDir::new().unwrap();
        let path = write_source(&dir, "pub fn prepare_data() {}\n");
        let mut registry = registry_with_echo();

        let module = registry.resolve("expA.data", &path).unwrap();
        assert_eq!(module.name(), "expA.data");
        assert_eq!(module.source(), path.as_path());
        assert!(module.symbols().contains(&EntryPoint::PrepareData));
        assert!(module.require(EntryPoint::DATA).is_ok());
        assert!(registry.get("expA.data").is_some());
    }

    #[test]
    fn test_resolve_twice_is_equivalent() {
        let dir = TempDir::new().unwrap();
        let path = write_source(&dir, "pub fn prepare_data() {}\n");
        let mut registry = registry_with_echo();

        let first = registry.resolve("expA.data", &path).unwrap();
        let second = registry.resolve("expA.data", &path).unwrap();
        assert_eq!(first.symbols(), second.symbols());
        assert_eq!(first.digest(), second.digest());
        assert!(Rc::ptr_eq(&registry.get("expA.data").unwrap(), &second));
    }

    #[test]
    fn test_factory_runs_again_on_re_resolve() {
        let dir = TempDir::new().unwrap();
        let path = write_source(&dir, "// data\n");
        let calls = Rc::new(Cell::new(0));

        let mut registry = ModuleRegistry::new();
        let counter = Rc::clone(&calls);
        registry.register("expA.data", move |_source: &ModuleSource| {
            counter.set(counter.get() + 1);
            Ok(Box::new(EchoData) as Box<dyn ExperimentModule>)
        });

        registry.resolve("expA.data", &path).unwrap();
        registry.resolve("expA.data", &path).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_missing_file_is_resolution_error() {
        let dir = TempDir::new().unwrap();
        let mut registry = registry_with_echo();

        let err = registry
            .resolve("expA.data", &dir.path().join("data.rs"))
            .unwrap_err();
        assert!(matches!(err, HarnessError::ResolutionError { .. }));
        assert!(registry.get("expA.data").is_none());
    }

    #[test]
    fn test_invalid_name_is_resolution_error() {
        let dir = TempDir::new().unwrap();
        let path = write_source(&dir, "// data\n");
        let mut registry = registry_with_echo();

        let err = registry.resolve("exp-A.data", &path).unwrap_err();
        assert!(matches!(err, HarnessError::ResolutionError { .. }));
    }

    #[test]
    fn test_unknown_module_is_resolution_error() {
        let dir = TempDir::new().unwrap();
        let path = write_source(&dir, "// data\n");
        let mut registry = ModuleRegistry::new();

        let err = registry.resolve("expB.data", &path).unwrap_err();
        assert!(matches!(err, HarnessError::ResolutionError { .. }));
    }

    #[test]
    fn test_failing_factory_wraps_cause() {
        let dir = TempDir::new().unwrap();
        let path = write_source(&dir, "// broken\n");
        let mut registry = ModuleRegistry::new();
        registry.register("expA.data", |_source: &ModuleSource| {
            Err(anyhow::anyhow!("unexpected token at line 1"))
        });

        match registry.resolve("expA.data", &path) {
            Err(HarnessError::ResolutionError { reason, .. }) => {
                assert!(reason.contains("unexpected token"));
            }
            other => panic!("expected ResolutionError, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_entry_point() {
        let dir = TempDir::new().unwrap();
        let path = write_source(&dir, "// data\n");
        let mut registry = registry_with_echo();

        let module = registry.resolve("expA.data", &path).unwrap();
        let err = module.require(EntryPoint::MODEL).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::MissingEntryPointError { ref entry_point, .. } if entry_point == "prepare_model"
        ));
    }

    #[test]
    fn test_digest_tracks_content() {
        let dir = TempDir::new().unwrap();
        let path = write_source(&dir, "// v1\n");
        let mut registry = registry_with_echo();
        let before = registry.resolve("expA.data", &path).unwrap().digest().to_string();

        std::fs::write(&path, "// v2\n").unwrap();
        let after = registry.resolve("expA.data", &path).unwrap().digest().to_string();
        assert_ne!(before, after);
    }
}
