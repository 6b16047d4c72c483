//! Configuration for the coropool binary.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::{PoolOptions, DEFAULT_BLOCKER_THREADS, MAX_THREADS};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the coropool demo
#[derive(Parser, Debug)]
#[command(name = "coropool")]
#[command(author = "coropool authors")]
#[command(version = "0.1.0")]
#[command(about = "Pass a token around a ring of event-loop threads", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of event-loop threads (defaults to number of CPU cores)
    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    /// Number of threads serving blocking calls
    #[arg(short = 'b', long)]
    pub blocker_threads: Option<usize>,

    /// Seconds between per-thread stats lines (0 = off)
    #[arg(short = 's', long)]
    pub stats_interval: Option<u64>,

    /// Hops before the token stops and the pool shuts down (0 = until Ctrl-C)
    #[arg(long)]
    pub hops: Option<u64>,

    /// Blocking sleep performed at every hop, in milliseconds
    #[arg(long)]
    pub hop_delay_ms: Option<u64>,

    /// Leave SIGINT/SIGTERM/SIGSEGV at their default dispositions
    #[arg(long)]
    pub no_signals: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub demo: DemoConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Thread pool configuration
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    /// Number of event-loop threads
    pub threads: Option<usize>,
    #[serde(default = "default_blocker_threads")]
    pub blocker_threads: usize,
    /// Seconds between stats lines, 0 disables them
    #[serde(default)]
    pub stats_interval_secs: u64,
    #[serde(default = "default_handle_signals")]
    pub handle_signals: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            threads: None,
            blocker_threads: default_blocker_threads(),
            stats_interval_secs: 0,
            handle_signals: default_handle_signals(),
        }
    }
}

/// Token-ring demo configuration
#[derive(Debug, Deserialize)]
pub struct DemoConfig {
    #[serde(default)]
    pub hops: u64,
    #[serde(default = "default_hop_delay_ms")]
    pub hop_delay_ms: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            hops: 0,
            hop_delay_ms: default_hop_delay_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_blocker_threads() -> usize {
    DEFAULT_BLOCKER_THREADS
}

fn default_handle_signals() -> bool {
    true
}

fn default_hop_delay_ms() -> u64 {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_THREADS)
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub threads: usize,
    pub blocker_threads: usize,
    pub stats_interval: Option<Duration>,
    pub handle_signals: bool,
    pub hops: u64,
    pub hop_delay: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Self::resolve(cli, toml_config))
    }

    /// Merge CLI args over TOML values.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let stats_secs = cli
            .stats_interval
            .unwrap_or(toml_config.pool.stats_interval_secs);

        Config {
            threads: cli
                .threads
                .or(toml_config.pool.threads)
                .unwrap_or_else(default_threads),
            blocker_threads: cli
                .blocker_threads
                .unwrap_or(toml_config.pool.blocker_threads),
            stats_interval: (stats_secs > 0).then(|| Duration::from_secs(stats_secs)),
            handle_signals: !cli.no_signals && toml_config.pool.handle_signals,
            hops: cli.hops.unwrap_or(toml_config.demo.hops),
            hop_delay: Duration::from_millis(
                cli.hop_delay_ms.unwrap_or(toml_config.demo.hop_delay_ms),
            ),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            n_threads: self.threads,
            blocker_threads: self.blocker_threads,
            stats_interval: self.stats_interval,
            handle_signals: self.handle_signals,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.pool.threads, None);
        assert_eq!(config.pool.blocker_threads, DEFAULT_BLOCKER_THREADS);
        assert_eq!(config.pool.stats_interval_secs, 0);
        assert!(config.pool.handle_signals);
        assert_eq!(config.demo.hops, 0);
        assert_eq!(config.demo.hop_delay_ms, 100);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [pool]
            threads = 4
            blocker_threads = 3
            stats_interval_secs = 10
            handle_signals = false

            [demo]
            hops = 20
            hop_delay_ms = 5

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.pool.threads, Some(4));
        assert_eq!(config.pool.blocker_threads, 3);
        assert_eq!(config.pool.stats_interval_secs, 10);
        assert!(!config.pool.handle_signals);
        assert_eq!(config.demo.hops, 20);
        assert_eq!(config.demo.hop_delay_ms, 5);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [pool]
            threads = 4
            stats_interval_secs = 10

            [demo]
            hops = 20
            "#,
        )
        .unwrap();
        let cli = CliArgs::parse_from(["coropool", "-t", "2", "--hops", "7", "-s", "0"]);

        let config = Config::resolve(cli, toml_config);
        assert_eq!(config.threads, 2);
        assert_eq!(config.hops, 7);
        assert_eq!(config.stats_interval, None);
        assert_eq!(config.blocker_threads, DEFAULT_BLOCKER_THREADS);
        assert_eq!(config.hop_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_resolved_defaults() {
        let cli = CliArgs::parse_from(["coropool", "--no-signals"]);
        let config = Config::resolve(cli, TomlConfig::default());

        assert!(config.threads >= 1 && config.threads <= MAX_THREADS);
        assert!(!config.handle_signals);
        assert_eq!(config.log_level, "info");

        let options = config.pool_options();
        assert_eq!(options.n_threads, config.threads);
        assert!(!options.handle_signals);
    }
}
