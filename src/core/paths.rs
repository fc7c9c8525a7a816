use std::path::{Path, PathBuf};

fn is_separator(c: char) -> bool {
    c == '/' || c == std::path::MAIN_SEPARATOR
}

/// Strip trailing separators and derive the short name (final segment).
///
/// A path made only of separators collapses to a single separator, which is
/// also its short name, so neither result is ever empty for non-empty input.
pub fn normalize(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches(is_separator);
    if trimmed.is_empty() {
        let root = path.chars().next().map(String::from).unwrap_or_default();
        return (root.clone(), root);
    }

    let short_name = trimmed
        .rsplit(is_separator)
        .next()
        .unwrap_or(trimmed)
        .to_string();

    (trimmed.to_string(), short_name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDirectory {
    raw: String,
    normalized: String,
    short_name: String,
}

impl ModelDirectory {
    pub const DATA_FILE: &'static str = "data.rs";
    pub const MODEL_FILE: &'static str = "model.rs";

    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let (normalized, short_name) = normalize(&raw);
        Self {
            raw,
            normalized,
            short_name,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn path(&self) -> &Path {
        Path::new(&self.normalized)
    }

    pub fn data_source(&self) -> PathBuf {
        self.path().join(Self::DATA_FILE)
    }

    pub fn model_source(&self) -> PathBuf {
        self.path().join(Self::MODEL_FILE)
    }

    /// Logical module name, e.g. `linear.data`.
    pub fn module_name(&self, unit: &str) -> String {
        format!("{}.{}", self.short_name, unit)
    }
}
