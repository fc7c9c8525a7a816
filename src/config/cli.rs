use crate::config::args::RunArgs;
use crate::utils::error::{HarnessError, Result};
use clap::{CommandFactory, Parser};
use std::collections::HashMap;
use std::ffi::OsString;

#[derive(Debug, Clone, Parser)]
#[command(name = "dl-harness")]
#[command(about = "Resolve an experiment directory, snapshot its sources and train it")]
#[command(
    after_help = "Unrecognized flags are forwarded as overrides: --section/key=value[:type] sets a config value, --name=value[:type] sets an argument."
)]
pub struct CliArgs {
    /// Experiment directory containing data.rs and model.rs
    #[arg(long)]
    pub model_dir: String,

    /// Comma-separated config files (json, yml, yaml, toml)
    #[arg(long)]
    pub config: Option<String>,

    /// Run log directory; the source snapshot is staged here
    #[arg(long)]
    pub logdir: Option<String>,

    /// Path to latest checkpoint
    #[arg(long, value_name = "PATH")]
    pub resume: Option<String>,

    /// Random seed (default 42)
    #[arg(long)]
    pub seed: Option<u64>,

    /// Number of data loading workers
    #[arg(short = 'j', long, value_name = "N")]
    pub workers: Option<usize>,

    /// Mini-batch size
    #[arg(short = 'b', long, value_name = "N")]
    pub batch_size: Option<usize>,

    /// Run callbacks in debug mode
    #[arg(long, overrides_with = "no_debug")]
    pub debug: bool,

    #[arg(long, overrides_with = "debug", hide = true)]
    pub no_debug: bool,

    /// Support library copied into every snapshot
    #[arg(long, value_name = "DIR")]
    pub support_dir: Option<String>,

    /// Also write the snapshot as a zip archive next to it
    #[arg(long)]
    pub archive_snapshot: bool,

    /// Stop after the configuration has been merged
    #[arg(long)]
    pub dry_run: bool,

    /// Log CPU and memory usage per stage
    #[arg(long)]
    pub monitor: bool,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,
}

impl CliArgs {
    /// `Some(true)` for `--debug`, `Some(false)` for `--no-debug`, else `None`.
    pub fn explicit_debug(&self) -> Option<bool> {
        match (self.debug, self.no_debug) {
            (true, _) => Some(true),
            (false, true) => Some(false),
            (false, false) => None,
        }
    }

    pub fn to_run_args(&self) -> RunArgs {
        RunArgs {
            model_dir: self.model_dir.clone(),
            config: self.config.clone(),
            logdir: self.logdir.clone(),
            resume: self.resume.clone(),
            seed: self.seed,
            workers: self.workers,
            batch_size: self.batch_size,
            debug: self.explicit_debug(),
            epochs: None,
            support_dir: self.support_dir.clone(),
            extra: Default::default(),
        }
    }

    /// Parse the process arguments, separating flags this command does not
    /// know about so they can be handed to the config merger.
    pub fn parse_known_args() -> (Self, Vec<String>) {
        let (known, unknown) = split_known_args(std::env::args_os());
        (Self::parse_from(known), unknown)
    }

    pub fn try_parse_known_args<I, T>(args: I) -> Result<(Self, Vec<String>)>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let (known, unknown) = split_known_args(args);
        let parsed = Self::try_parse_from(known).map_err(|e| HarnessError::ConfigMergeError {
            message: e.to_string(),
        })?;
        Ok((parsed, unknown))
    }
}

/// Split argv into (program + known flags, unknown flags).
///
/// Any `-`/`--` token clap does not know is forwarded, normalized to
/// `--name=value`. A separate value is taken from the next token unless that
/// token is itself flag-shaped; negative numbers (`-1`, `-0.5:float`) count
/// as values. A flag with no value becomes `--name=true:bool`.
pub fn split_known_args<I, T>(args: I) -> (Vec<OsString>, Vec<String>)
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let command = CliArgs::command();
    let mut longs: HashMap<String, bool> = HashMap::new();
    let mut shorts: HashMap<char, bool> = HashMap::new();
    for arg in command.get_arguments() {
        let takes_value = arg.get_action().takes_values();
        if let Some(long) = arg.get_long() {
            longs.insert(long.to_string(), takes_value);
        }
        if let Some(short) = arg.get_short() {
            shorts.insert(short, takes_value);
        }
    }
    longs.insert("help".to_string(), false);
    shorts.insert('h', false);

    let mut known = Vec::new();
    let mut unknown = Vec::new();
    let mut iter = args.into_iter().map(Into::into).peekable();

    if let Some(program) = iter.next() {
        known.push(program);
    }

    while let Some(token) = iter.next() {
        let Some(text) = token.to_str().map(str::to_string) else {
            known.push(token);
            continue;
        };
        if text == "--" {
            known.push(token);
            known.extend(iter.by_ref());
            break;
        }
        if !is_flag_shaped(&text) {
            known.push(token);
            continue;
        }

        let body = text.trim_start_matches('-');
        let (name, inline_value) = match body.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (body, None),
        };

        let known_flag = if text.starts_with("--") {
            longs.get(name).copied()
        } else {
            // 短旗標只看第一個字元 (-b16, -vj 4)
            name.chars()
                .next()
                .and_then(|c| shorts.get(&c).copied())
                .map(|takes_value| takes_value && name.chars().count() == 1)
        };

        if let Some(takes_value) = known_flag {
            known.push(token);
            if takes_value && inline_value.is_none() {
                if let Some(value) = iter.next() {
                    known.push(value);
                }
            }
            continue;
        }

        match inline_value {
            Some(_) => unknown.push(format!("--{}", body)),
            None => {
                let value = iter
                    .next_if(|next| !next.to_str().is_some_and(is_flag_shaped))
                    .map(|next| next.to_string_lossy().into_owned());
                match value {
                    Some(value) => unknown.push(format!("--{}={}", name, value)),
                    None => unknown.push(format!("--{}=true:bool", name)),
                }
            }
        }
    }

    (known, unknown)
}

/// `-x`, `--name`; but not `-`, and not a negative number such as `-1:int`.
fn is_flag_shaped(token: &str) -> bool {
    let Some(rest) = token.strip_prefix('-') else {
        return false;
    };
    if rest.is_empty() {
        return false;
    }
    let number = token.rsplit_once(':').map_or(token, |(number, _)| number);
    number.parse::<f64>().is_err()
}
