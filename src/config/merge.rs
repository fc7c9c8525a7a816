//! Merging of CLI arguments, unknown CLI tokens and config files into one
//! resolved argument set plus one nested configuration mapping.
//!
//! Precedence, highest first:
//!
//! 1. unknown CLI tokens without a `/` (`--epochs=5:int`)
//! 2. explicit CLI flags (`--batch-size 32`)
//! 3. the config file's `args` section
//! 4. built-in defaults
//!
//! Tokens with a `/` (`--data_params/n_train=100:int`) write into the config
//! mapping instead of the argument set.

use crate::config::args::RunArgs;
use crate::config::file::{load_config_files, type_name};
use crate::utils::error::{HarnessError, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;

/// Name of the config section that supplies argument values.
pub const ARGS_SECTION: &str = "args";

pub const CONFIG_DUMP_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedConfig {
    pub args: RunArgs,
    pub config: Value,
}

impl MergedConfig {
    /// `config["data_params"]`, or an empty mapping when the section is absent.
    pub fn data_params(&self) -> Value {
        self.config
            .get("data_params")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    pub fn to_pretty_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// A parsed unknown CLI token.
#[derive(Debug, Clone, PartialEq)]
pub struct Override {
    pub path: Vec<String>,
    pub value: Value,
}

impl Override {
    /// Parse `--name=value[:type]`.
    pub fn parse(token: &str) -> Result<Self> {
        let invalid = |reason: &str| HarnessError::InvalidOverrideError {
            token: token.to_string(),
            reason: reason.to_string(),
        };

        let body = token.trim_start_matches('-');
        let (name, raw_value) = body
            .split_once('=')
            .ok_or_else(|| invalid("expected --name=value[:type]"))?;

        let path: Vec<String> = name
            .trim_matches('/')
            .split('/')
            .map(str::to_string)
            .collect();
        if path.iter().any(|segment| segment.is_empty()) {
            return Err(invalid("empty name segment"));
        }

        let value = parse_typed_value(raw_value).map_err(|reason| invalid(&reason))?;
        Ok(Self { path, value })
    }

    pub fn is_config_path(&self) -> bool {
        self.path.len() > 1
    }
}

fn parse_typed_value(raw: &str) -> std::result::Result<Value, String> {
    if let Some((content, value_type)) = raw.rsplit_once(':') {
        let typed = match value_type {
            "int" => Some(
                content
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|e| format!("'{}' is not an int: {}", content, e)),
            ),
            "float" => Some(
                content
                    .parse::<f64>()
                    .map_err(|e| format!("'{}' is not a float: {}", content, e))
                    .and_then(|f| {
                        serde_json::Number::from_f64(f)
                            .map(Value::Number)
                            .ok_or_else(|| format!("'{}' is not a finite float", content))
                    }),
            ),
            "bool" => Some(parse_bool(content).map(Value::Bool)),
            "str" => Some(Ok(if content.eq_ignore_ascii_case("none") {
                Value::Null
            } else {
                Value::String(content.to_string())
            })),
            "json" => Some(
                serde_json::from_str(content)
                    .map_err(|e| format!("'{}' is not valid JSON: {}", content, e)),
            ),
            _ => None,
        };
        if let Some(result) = typed {
            return result;
        }
    }

    // 沒有型別標記時自動推斷
    Ok(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
}

fn parse_bool(raw: &str) -> std::result::Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(format!("'{}' is not a bool", raw)),
    }
}

/// Set `value` at `path`, creating intermediate mappings.
fn set_config_path(config: &mut Value, path: &[String], value: Value) -> Result<()> {
    let (last, parents) = path.split_last().ok_or_else(|| HarnessError::ConfigMergeError {
        message: "empty override path".to_string(),
    })?;

    let mut node = config;
    for (depth, key) in parents.iter().enumerate() {
        node = match node {
            Value::Object(map) => map
                .entry(key.clone())
                .or_insert_with(|| Value::Object(Map::new())),
            other => return Err(conflict(&path[..depth], type_name(other))),
        };
    }

    match node {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        other => Err(conflict(parents, type_name(other))),
    }
}

fn conflict(path: &[String], found: &str) -> HarnessError {
    HarnessError::ConfigMergeError {
        message: format!(
            "cannot set nested key under '{}': existing value is a {}",
            path.join("/"),
            found
        ),
    }
}

fn args_to_map(args: &RunArgs) -> Result<Map<String, Value>> {
    match serde_json::to_value(args)? {
        Value::Object(map) => Ok(map),
        _ => Err(HarnessError::ConfigMergeError {
            message: "argument namespace did not serialize to a mapping".to_string(),
        }),
    }
}

fn map_to_args(map: Map<String, Value>) -> Result<RunArgs> {
    serde_json::from_value(Value::Object(map)).map_err(|e| HarnessError::ConfigMergeError {
        message: format!("invalid argument value: {}", e),
    })
}

/// Merge CLI arguments, unknown tokens and already-loaded file config.
pub fn merge_with_config(
    cli_args: &RunArgs,
    unknown_args: &[String],
    mut config: Value,
) -> Result<MergedConfig> {
    if !config.is_object() {
        return Err(HarnessError::ConfigMergeError {
            message: format!("config root must be a mapping, got {}", type_name(&config)),
        });
    }

    let mut args = args_to_map(cli_args)?;

    for token in unknown_args {
        let over = Override::parse(token)?;
        if over.is_config_path() {
            tracing::debug!("Config override {} = {}", over.path.join("/"), over.value);
            set_config_path(&mut config, &over.path, over.value)?;
        } else {
            tracing::debug!("Argument override {} = {}", over.path[0], over.value);
            args.insert(over.path[0].replace('-', "_"), over.value);
        }
    }

    if let Some(section) = config.get(ARGS_SECTION) {
        let section = section
            .as_object()
            .ok_or_else(|| HarnessError::ConfigMergeError {
                message: format!(
                    "'{}' section must be a mapping, got {}",
                    ARGS_SECTION,
                    type_name(section)
                ),
            })?;
        for (key, value) in section {
            let slot = args.entry(key.clone()).or_insert(Value::Null);
            if slot.is_null() {
                *slot = value.clone();
            }
        }
    }

    let mut args = map_to_args(args)?;
    args.apply_defaults();

    Ok(MergedConfig { args, config })
}

/// Load `--config` files, merge everything and dump the result to
/// `<logdir>/config.json` when a log directory is set.
pub fn parse_args_uargs(
    cli_args: &RunArgs,
    unknown_args: &[String],
    dump_config: bool,
) -> Result<MergedConfig> {
    let config = load_config_files(&cli_args.config_paths())?;
    let merged = merge_with_config(cli_args, unknown_args, config)?;

    if dump_config {
        if let Some(logdir) = &merged.args.logdir {
            save_config(&merged.config, Path::new(logdir))?;
        }
    }

    Ok(merged)
}

pub fn save_config(config: &Value, logdir: &Path) -> Result<()> {
    let path = logdir.join(CONFIG_DUMP_FILE);
    std::fs::create_dir_all(logdir)?;
    std::fs::write(&path, serde_json::to_string_pretty(config)?)?;
    tracing::debug!("Config saved to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cli(model_dir: &str) -> RunArgs {
        RunArgs::new(model_dir)
    }

    #[test]
    fn test_override_parsing() {
        let over = Override::parse("--data_params/n_train=100:int").unwrap();
        assert_eq!(over.path, vec!["data_params", "n_train"]);
        assert_eq!(over.value, json!(100));

        let over = Override::parse("--lr=0.5:float").unwrap();
        assert_eq!(over.path, vec!["lr"]);
        assert_eq!(over.value, json!(0.5));

        let over = Override::parse("--resume=none:str").unwrap();
        assert_eq!(over.value, Value::Null);

        let over = Override::parse("--stages=[1,2]:json").unwrap();
        assert_eq!(over.value, json!([1, 2]));

        let over = Override::parse("--debug=off:bool").unwrap();
        assert_eq!(over.value, json!(false));
    }

    #[test]
    fn test_override_type_inference() {
        assert_eq!(Override::parse("--epochs=5").unwrap().value, json!(5));
        assert_eq!(Override::parse("--name=resnet").unwrap().value, json!("resnet"));
        // a colon that is not a type suffix stays part of the value
        assert_eq!(
            Override::parse("--url=http://host:8080").unwrap().value,
            json!("http://host:8080")
        );
    }

    #[test]
    fn test_malformed_overrides() {
        assert!(matches!(
            Override::parse("--epochs"),
            Err(HarnessError::InvalidOverrideError { .. })
        ));
        assert!(Override::parse("--epochs=five:int").is_err());
        assert!(Override::parse("--flag=maybe:bool").is_err());
        assert!(Override::parse("--a//b=1:int").is_err());
    }

    #[test]
    fn test_cli_value_beats_config_value() {
        let mut args = cli("exp");
        args.batch_size = Some(32);
        let config = json!({"args": {"batch_size": 64, "epochs": 7}});

        let merged = merge_with_config(&args, &[], config).unwrap();
        assert_eq!(merged.args.batch_size, Some(32));
        assert_eq!(merged.args.epochs, Some(7));
    }

    #[test]
    fn test_defaults_fill_missing_values() {
        let merged = merge_with_config(&cli("exp"), &[], json!({})).unwrap();
        assert_eq!(merged.args.seed(), 42);
        assert_eq!(merged.args.batch_size, Some(32));
        assert_eq!(merged.args.workers, Some(0));
        assert_eq!(merged.args.debug, Some(false));
        assert_eq!(merged.data_params(), json!({}));
    }

    #[test]
    fn test_unknown_tokens_write_config_and_args() {
        let unknown = vec![
            "--data_params/n_train=100:int".to_string(),
            "--model_params/optim/lr=0.1:float".to_string(),
            "--epochs=3:int".to_string(),
            "--warmup=2:int".to_string(),
        ];
        let config = json!({"data_params": {"n_train": 10, "noise": 0.1}});

        let merged = merge_with_config(&cli("exp"), &unknown, config).unwrap();
        assert_eq!(merged.config["data_params"], json!({"n_train": 100, "noise": 0.1}));
        assert_eq!(merged.config["model_params"]["optim"]["lr"], json!(0.1));
        assert_eq!(merged.args.epochs, Some(3));
        assert_eq!(merged.args.extra.get("warmup"), Some(&json!(2)));
    }

    #[test]
    fn test_unknown_token_beats_config_args_section() {
        let unknown = vec!["--epochs=3:int".to_string()];
        let config = json!({"args": {"epochs": 9}});
        let merged = merge_with_config(&cli("exp"), &unknown, config).unwrap();
        assert_eq!(merged.args.epochs, Some(3));
    }

    #[test]
    fn test_nested_override_through_scalar_conflicts() {
        let unknown = vec!["--data_params/n_train/x=1:int".to_string()];
        let config = json!({"data_params": {"n_train": 10}});

        let err = merge_with_config(&cli("exp"), &unknown, config).unwrap_err();
        assert!(matches!(err, HarnessError::ConfigMergeError { .. }));
    }

    #[test]
    fn test_bad_args_section() {
        let err = merge_with_config(&cli("exp"), &[], json!({"args": [1, 2]})).unwrap_err();
        assert!(matches!(err, HarnessError::ConfigMergeError { .. }));

        let err =
            merge_with_config(&cli("exp"), &[], json!({"args": {"batch_size": "big"}}))
                .unwrap_err();
        assert!(matches!(err, HarnessError::ConfigMergeError { .. }));
    }
}
