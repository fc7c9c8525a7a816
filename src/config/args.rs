use crate::utils::error::Result;
use crate::utils::validation::{
    validate_file_extensions, validate_path, validate_positive_number, Validate,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_WORKERS: usize = 0;
pub const DEFAULT_BATCH_SIZE: usize = 32;
pub const DEFAULT_EPOCHS: usize = 1;

pub const CONFIG_EXTENSIONS: &[&str] = &["json", "yml", "yaml", "toml"];

/// The resolved argument namespace.
///
/// Scalar fields stay `None` until something sets them, so the merge step can
/// tell an explicit CLI value apart from "not given". Anything the harness
/// does not know about lands in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunArgs {
    pub model_dir: String,
    #[serde(default)]
    pub config: Option<String>,
    #[serde(default)]
    pub logdir: Option<String>,
    #[serde(default)]
    pub resume: Option<String>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub debug: Option<bool>,
    #[serde(default)]
    pub epochs: Option<usize>,
    #[serde(default)]
    pub support_dir: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl RunArgs {
    pub fn new(model_dir: impl Into<String>) -> Self {
        Self {
            model_dir: model_dir.into(),
            ..Default::default()
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed.unwrap_or(DEFAULT_SEED)
    }

    pub fn workers(&self) -> usize {
        self.workers.unwrap_or(DEFAULT_WORKERS)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE)
    }

    pub fn epochs(&self) -> usize {
        self.epochs.unwrap_or(DEFAULT_EPOCHS)
    }

    pub fn debug(&self) -> bool {
        self.debug.unwrap_or(false)
    }

    pub fn logdir_path(&self) -> Option<PathBuf> {
        self.logdir.as_ref().map(PathBuf::from)
    }

    /// Config file paths from the comma-separated `--config` value.
    pub fn config_paths(&self) -> Vec<String> {
        self.config
            .as_deref()
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 以預設值補齊仍未設定的欄位
    pub fn apply_defaults(&mut self) {
        self.seed.get_or_insert(DEFAULT_SEED);
        self.workers.get_or_insert(DEFAULT_WORKERS);
        self.batch_size.get_or_insert(DEFAULT_BATCH_SIZE);
        self.epochs.get_or_insert(DEFAULT_EPOCHS);
        self.debug.get_or_insert(false);
    }
}

impl Validate for RunArgs {
    fn validate(&self) -> Result<()> {
        validate_path("model_dir", &self.model_dir)?;

        let configs = self.config_paths();
        if !configs.is_empty() {
            validate_file_extensions("config", &configs, CONFIG_EXTENSIONS)?;
        }
        if let Some(logdir) = &self.logdir {
            validate_path("logdir", logdir)?;
        }
        if let Some(support_dir) = &self.support_dir {
            validate_path("support_dir", support_dir)?;
        }
        if let Some(batch_size) = self.batch_size {
            validate_positive_number("batch_size", batch_size, 1)?;
        }
        if let Some(epochs) = self.epochs {
            validate_positive_number("epochs", epochs, 1)?;
        }

        Ok(())
    }
}
