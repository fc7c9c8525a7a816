use crate::utils::error::{HarnessError, Result};
use regex::Regex;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Ok(ConfigFormat::Json),
            Some("yml") | Some("yaml") => Ok(ConfigFormat::Yaml),
            Some("toml") => Ok(ConfigFormat::Toml),
            other => Err(HarnessError::ConfigMergeError {
                message: format!(
                    "unsupported config format '{}' for {}",
                    other.unwrap_or(""),
                    path.display()
                ),
            }),
        }
    }
}

/// 從檔案載入配置
pub fn load_config_file<P: AsRef<Path>>(path: P) -> Result<Value> {
    let path = path.as_ref();
    let format = ConfigFormat::from_path(path)?;
    let content = std::fs::read_to_string(path).map_err(|e| HarnessError::ConfigMergeError {
        message: format!("cannot read config file {}: {}", path.display(), e),
    })?;
    parse_config_str(&content, format)
}

/// 從字串解析配置
pub fn parse_config_str(content: &str, format: ConfigFormat) -> Result<Value> {
    let processed = substitute_env_vars(content);

    let value = match format {
        ConfigFormat::Json => serde_json::from_str(&processed)?,
        ConfigFormat::Yaml => serde_yaml::from_str(&processed)?,
        ConfigFormat::Toml => toml::from_str(&processed)?,
    };

    match value {
        Value::Object(_) => Ok(value),
        // 空的 YAML 檔案
        Value::Null => Ok(Value::Object(Map::new())),
        other => Err(HarnessError::ConfigMergeError {
            message: format!("config root must be a mapping, got {}", type_name(&other)),
        }),
    }
}

/// Load every file left to right, later files overriding earlier ones.
pub fn load_config_files(paths: &[String]) -> Result<Value> {
    let mut config = Value::Object(Map::new());
    for path in paths {
        tracing::debug!("Loading config file: {}", path);
        let layer = load_config_file(path)?;
        merge_values(&mut config, layer);
    }
    Ok(config)
}

/// Deep merge: maps merge key by key, anything else is replaced.
pub fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// 替換環境變數 (例如 ${DATA_ROOT})，未設定的變數保留原樣
fn substitute_env_vars(content: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("env pattern is valid"));

    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
    })
    .into_owned()
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "mapping",
    }
}
