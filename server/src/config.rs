//! Server configuration.
//!
//! Values merge from three layers: built-in defaults, then the JSON
//! config file, then command line flags. A flag overrides the file value;
//! a file value overrides the default.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

use cache_core::EXTRA_SIZE_PER_NODE;
use protocol_memcache::{MAX_ITEM_SIZE, MAX_KEY_SIZE};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {path}: {err}")]
    Read { path: PathBuf, err: std::io::Error },
    #[error("config file parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Command line flags.
#[derive(Debug, Default, Parser)]
#[command(
    name = "ember-server",
    about = "In-memory cache server speaking the memcache text protocol",
    after_help = "Config values merge rules:\n\
                  1) config file value overrides default\n\
                  2) command line value overrides any"
)]
pub struct Args {
    /// Path to a JSON config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Interface to listen on; empty means all interfaces
    #[arg(long)]
    pub host: Option<String>,

    /// TCP port to listen on
    #[arg(long)]
    pub port: Option<u16>,

    /// Where logs go: stderr, stdout, or a file path
    #[arg(long)]
    pub log_destination: Option<String>,

    /// Log level: trace, debug, info, warn, or error
    #[arg(long)]
    pub log_level: Option<String>,

    /// Total cache size, e.g. "64m"
    #[arg(long)]
    pub cache_size: Option<String>,

    /// Largest accepted item payload, e.g. "1m"
    #[arg(long)]
    pub max_item_size: Option<String>,

    /// Append-only log path; unset or empty disables persistence
    #[arg(long)]
    pub aof_name: Option<String>,

    /// Append log sync period, e.g. "1s"; below 100ms every transaction
    /// syncs
    #[arg(long)]
    pub sync: Option<String>,

    /// Append log write buffer size; "0" disables buffering
    #[arg(long)]
    pub buf_size: Option<String>,

    /// Append log size that triggers rotation, e.g. "16m"
    #[arg(long)]
    pub rotate_size: Option<String>,

    /// Truncate a corrupted append log to its valid prefix instead of
    /// refusing to start
    #[arg(long)]
    pub fix_corrupted: bool,
}

/// The JSON config file. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_destination: Option<String>,
    pub log_level: Option<String>,
    pub cache_size: Option<String>,
    pub max_item_size: Option<String>,
    pub aof_name: Option<String>,
    pub sync: Option<String>,
    pub buf_size: Option<String>,
    pub rotate_size: Option<String>,
    pub fix_corrupted: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogDestination {
    Stderr,
    Stdout,
    File(PathBuf),
}

/// Append log settings; present only when persistence is enabled.
#[derive(Debug, Clone)]
pub struct AofOptions {
    pub name: PathBuf,
    pub sync_period: Duration,
    pub buf_size: usize,
    pub rotate_size: u64,
}

/// Fully resolved configuration.
#[derive(Debug)]
pub struct Config {
    pub addr: String,
    pub log_level: String,
    pub log_destination: LogDestination,
    pub cache_size: i64,
    pub max_item_size: usize,
    pub fix_corrupted: bool,
    pub aof: Option<AofOptions>,
}

impl Config {
    /// Resolve flags, file, and defaults into a validated configuration.
    pub fn load(args: Args) -> Result<Config, ConfigError> {
        let file = match &args.config {
            Some(path) => {
                let data = std::fs::read(path).map_err(|err| ConfigError::Read {
                    path: path.clone(),
                    err,
                })?;
                serde_json::from_slice(&data)?
            }
            None => FileConfig::default(),
        };
        Self::merge(args, file)
    }

    fn merge(args: Args, file: FileConfig) -> Result<Config, ConfigError> {
        let host = args.host.or(file.host).unwrap_or_default();
        let port = args.port.or(file.port).unwrap_or(11211);
        let log_level = args
            .log_level
            .or(file.log_level)
            .unwrap_or_else(|| "info".to_string());
        check_log_level(&log_level)?;
        let log_destination = parse_log_destination(
            &args
                .log_destination
                .or(file.log_destination)
                .unwrap_or_else(|| "stderr".to_string()),
        );

        let cache_size = parse_size(&args.cache_size.or(file.cache_size).unwrap_or_else(|| "64m".into()))
            .map_err(ConfigError::Invalid)? as i64;
        let max_item_size =
            parse_size(&args.max_item_size.or(file.max_item_size).unwrap_or_else(|| "1m".into()))
                .map_err(ConfigError::Invalid)?;

        if max_item_size > MAX_ITEM_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max-item-size {max_item_size} exceeds the {MAX_ITEM_SIZE} byte ceiling"
            )));
        }
        // The engine treats an item above the hot queue cap as a bug, so
        // reject configurations that could produce one.
        let hot_cap = cache_core::Config { size: cache_size }.hot_cap();
        let max_node_size = max_item_size as i64 + MAX_KEY_SIZE as i64 + EXTRA_SIZE_PER_NODE;
        if max_node_size > hot_cap {
            return Err(ConfigError::Invalid(format!(
                "max-item-size {max_item_size} does not fit the hot queue: \
                 a full node takes up to {max_node_size} bytes, the hot cap is {hot_cap}; \
                 raise cache-size or lower max-item-size"
            )));
        }

        let aof_name = args.aof_name.or(file.aof_name).unwrap_or_default();
        let aof = if aof_name.is_empty() {
            None
        } else {
            Some(AofOptions {
                name: PathBuf::from(aof_name),
                sync_period: parse_duration(&args.sync.or(file.sync).unwrap_or_else(|| "1s".into()))
                    .map_err(ConfigError::Invalid)?,
                buf_size: parse_size(&args.buf_size.or(file.buf_size).unwrap_or_else(|| "16k".into()))
                    .map_err(ConfigError::Invalid)?,
                rotate_size: parse_size(
                    &args.rotate_size.or(file.rotate_size).unwrap_or_else(|| "16m".into()),
                )
                .map_err(ConfigError::Invalid)? as u64,
            })
        };

        let host = if host.is_empty() {
            "0.0.0.0".to_string()
        } else {
            host
        };
        Ok(Config {
            addr: format!("{host}:{port}"),
            log_level,
            log_destination,
            cache_size,
            max_item_size,
            fix_corrupted: args.fix_corrupted || file.fix_corrupted.unwrap_or(false),
            aof,
        })
    }
}

fn check_log_level(level: &str) -> Result<(), ConfigError> {
    match level {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        other => Err(ConfigError::Invalid(format!("unknown log level {other:?}"))),
    }
}

fn parse_log_destination(value: &str) -> LogDestination {
    match value {
        "stderr" => LogDestination::Stderr,
        "stdout" => LogDestination::Stdout,
        path => LogDestination::File(PathBuf::from(path)),
    }
}

/// Parse a size string like "64m", "16K", or "1048576" into bytes.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size".to_string());
    }
    let (num_str, suffix) = match s.find(|c: char| c.is_alphabetic()) {
        Some(idx) => (&s[..idx], s[idx..].to_uppercase()),
        None => (s, String::new()),
    };
    let num: usize = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid size number {num_str:?}"))?;
    let multiplier: usize = match suffix.as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1 << 10,
        "M" | "MB" => 1 << 20,
        "G" | "GB" => 1 << 30,
        _ => return Err(format!("unknown size suffix {suffix:?}")),
    };
    num.checked_mul(multiplier)
        .ok_or_else(|| "size overflow".to_string())
}

/// Parse a duration string like "100ms", "1s", or "5m".
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    let split = s
        .find(|c: char| c.is_alphabetic())
        .ok_or_else(|| format!("duration {s:?} needs a unit (ms, s, m)"))?;
    let (num_str, unit) = s.split_at(split);
    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid duration number {num_str:?}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(num)),
        "s" => Ok(Duration::from_secs(num)),
        "m" => Ok(Duration::from_secs(num * 60)),
        other => Err(format!("unknown duration unit {other:?}")),
    }
}
