use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Failed to resolve module '{name}' from {path}: {reason}")]
    ResolutionError {
        name: String,
        path: String,
        reason: String,
    },

    #[error("Module '{module}' does not expose required entry point '{entry_point}'")]
    MissingEntryPointError { module: String, entry_point: String },

    #[error("Snapshot staging failed at {path}: {message}")]
    StagingError { path: String, message: String },

    #[error("Snapshot destination already exists: {path}")]
    SnapshotCollisionError { path: String },

    #[error("Configuration merge error: {message}")]
    ConfigMergeError { message: String },

    #[error("Invalid override '{token}': {reason}")]
    InvalidOverrideError { token: String, reason: String },

    #[error("Invalid configuration value for '{field}': '{value}' ({reason})")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Training failed: {message}")]
    TrainingError { message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Zip operation failed: {0}")]
    ZipError(#[from] zip::result::ZipError),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Resolution,
    Staging,
    Configuration,
    Training,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    /// 程序結束碼
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorSeverity::Medium => 2,
            ErrorSeverity::High => 1,
            ErrorSeverity::Critical => 3,
        }
    }
}

impl HarnessError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            HarnessError::ResolutionError { .. } | HarnessError::MissingEntryPointError { .. } => {
                ErrorCategory::Resolution
            }
            HarnessError::StagingError { .. } | HarnessError::SnapshotCollisionError { .. } => {
                ErrorCategory::Staging
            }
            HarnessError::ConfigMergeError { .. }
            | HarnessError::InvalidOverrideError { .. }
            | HarnessError::InvalidConfigValueError { .. } => ErrorCategory::Configuration,
            HarnessError::TrainingError { .. } => ErrorCategory::Training,
            HarnessError::IoError(_)
            | HarnessError::SerializationError(_)
            | HarnessError::YamlError(_)
            | HarnessError::TomlError(_)
            | HarnessError::ZipError(_)
            | HarnessError::CsvError(_) => ErrorCategory::System,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Configuration => ErrorSeverity::Medium,
            ErrorCategory::Resolution | ErrorCategory::Staging | ErrorCategory::Training => {
                ErrorSeverity::High
            }
            ErrorCategory::System => ErrorSeverity::Critical,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            HarnessError::ResolutionError { .. } => {
                "Check that --model-dir contains data.rs and model.rs and that the experiment is registered or built as a shared library"
            }
            HarnessError::MissingEntryPointError { .. } => {
                "Implement the missing entry point in the experiment module and list it in entry_points()"
            }
            HarnessError::SnapshotCollisionError { .. } => {
                "Another run staged into the same log directory at the same moment; retry or use a separate --logdir"
            }
            HarnessError::StagingError { .. } => {
                "Make sure --logdir exists and is writable and that --support-dir points to a readable directory"
            }
            HarnessError::ConfigMergeError { .. } | HarnessError::InvalidOverrideError { .. } => {
                "Check the config files and overrides; overrides look like --section/key=value:type"
            }
            HarnessError::InvalidConfigValueError { .. } => {
                "Fix the reported value on the command line or in the config file"
            }
            HarnessError::TrainingError { .. } => {
                "Inspect the experiment code and the merged configuration printed above"
            }
            _ => "Check file permissions, disk space and input file formats",
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self.category() {
            ErrorCategory::Resolution => format!("Could not load the experiment: {}", self),
            ErrorCategory::Staging => format!("Could not snapshot the run sources: {}", self),
            ErrorCategory::Configuration => format!("Invalid configuration: {}", self),
            ErrorCategory::Training => format!("Training stopped: {}", self),
            ErrorCategory::System => format!("System error: {}", self),
        }
    }

    pub(crate) fn staging(path: impl AsRef<std::path::Path>, err: impl std::fmt::Display) -> Self {
        HarnessError::StagingError {
            path: path.as_ref().display().to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn training(err: anyhow::Error) -> Self {
        HarnessError::TrainingError {
            message: format!("{:#}", err),
        }
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
