//! Configuration module for the examination server.
//!
//! Configuration lives in a TOML file; a few fields can be overridden from
//! the command line. CLI arguments take precedence over file values.

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

/// Command-line arguments for the examination server
#[derive(Parser, Debug)]
#[command(name = "examd")]
#[command(version = "0.1.0")]
#[command(about = "A socket server that delivers timed multiple-choice examinations", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Address to bind to (e.g., 127.0.0.1:65431)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Resolved server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory containing the test-definition files
    #[serde(default = "default_test_path")]
    pub test_path: PathBuf,

    /// Directory for exported results (reserved, unused by the core)
    #[serde(default = "default_result_path")]
    pub result_path: PathBuf,

    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Seconds a terminal session survives before the sweep evicts it
    #[serde(default = "default_session_retention")]
    pub session_retention: u64,

    /// Seconds between housekeeping sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,

    /// One entry per test
    #[serde(default, rename = "test")]
    pub tests: Vec<TestConfig>,
}

/// Per-test policy as declared in the configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct TestConfig {
    /// Test name, also the definition file name under `test_path`
    pub name: String,

    /// Static description returned by `get_banner`
    #[serde(default)]
    pub description: String,

    /// Users allowed to take this test
    #[serde(default)]
    pub valid_users: Vec<String>,

    /// Maximum attempt duration in seconds
    pub duration: u64,

    /// Whether the numeric score is disclosed at completion
    #[serde(default = "default_show_results")]
    pub show_results: bool,

    /// Maximum number of attempts
    #[serde(default = "default_number_of_attempts")]
    pub number_of_attempts: u32,
}

fn default_test_path() -> PathBuf {
    PathBuf::from("tests")
}

fn default_result_path() -> PathBuf {
    PathBuf::from("results")
}

fn default_listen() -> String {
    "127.0.0.1:65431".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_session_retention() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_show_results() -> bool {
    true
}

fn default_number_of_attempts() -> u32 {
    1
}

impl Config {
    /// Load configuration from CLI args and the TOML file.
    /// CLI arguments take precedence over file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::from_cli(cli)
    }

    fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(&cli.config)
            .map_err(|e| ConfigError::FileRead(cli.config.clone(), e))?;
        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| ConfigError::TomlParse(cli.config.clone(), e))?;

        if let Some(listen) = cli.listen {
            config.listen = listen;
        }
        if let Some(log_level) = cli.log_level {
            config.log_level = log_level;
        }

        Ok(config)
    }
}

/// Configuration loading errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{0}': {1}")]
    FileRead(PathBuf, std::io::Error),

    #[error("failed to parse config file '{0}': {1}")]
    TomlParse(PathBuf, toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            test_path = "exams"
            result_path = "out"
            listen = "0.0.0.0:65431"
            log_level = "debug"
            session_retention = 600
            sweep_interval = 30

            [[test]]
            name = "linux"
            description = "Basics of GNU/Linux"
            valid_users = ["alice", "bob"]
            duration = 300
            show_results = true
            number_of_attempts = 3

            [[test]]
            name = "python"
            valid_users = ["alice"]
            duration = 120
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.test_path, PathBuf::from("exams"));
        assert_eq!(config.listen, "0.0.0.0:65431");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.session_retention, 600);
        assert_eq!(config.sweep_interval, 30);
        assert_eq!(config.tests.len(), 2);

        let linux = &config.tests[0];
        assert_eq!(linux.name, "linux");
        assert_eq!(linux.valid_users, vec!["alice", "bob"]);
        assert_eq!(linux.duration, 300);
        assert_eq!(linux.number_of_attempts, 3);

        // Omitted fields fall back to defaults.
        let python = &config.tests[1];
        assert_eq!(python.description, "");
        assert!(python.show_results);
        assert_eq!(python.number_of_attempts, 1);
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.test_path, PathBuf::from("tests"));
        assert_eq!(config.listen, "127.0.0.1:65431");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.session_retention, 3600);
        assert_eq!(config.sweep_interval, 60);
        assert!(config.tests.is_empty());
    }

    #[test]
    fn test_malformed_toml_is_rejected() {
        let err = toml::from_str::<Config>("test_path = [").unwrap_err();
        assert!(!err.to_string().is_empty());
    }
}
