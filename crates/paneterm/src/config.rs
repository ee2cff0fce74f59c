//! Configuration management for Paneterm.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/paneterm/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::console::ConsoleOptions;
use crate::pty::{PtyTiming, ShellPseudoterminalArguments};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("shell executable not found: {0}")]
    InvalidShellPath(String),

    #[error("python interpreter not found: {0}")]
    InvalidPython(String),

    #[error("{0} must be greater than 0")]
    ZeroValue(&'static str),

    #[error("console depth must be at most 64, got {0}")]
    InvalidDepth(u32),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Deepest inspection the console accepts from configuration.
const MAX_DEPTH: u32 = 64;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging.
    pub general: GeneralConfig,

    /// Shell sessions.
    pub shell: ShellConfig,

    /// Developer console.
    pub console: ConsoleConfig,

    /// Timers and bounds shared by the backends.
    pub timing: TimingConfig,
}

/// General configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log file used while a session owns the terminal.
    pub log_file: PathBuf,
}

/// Shell session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShellConfig {
    /// Program to run.
    pub executable: String,

    /// Arguments passed to the program.
    pub args: Vec<String>,

    /// Working directory. Inherited when unset.
    pub cwd: Option<PathBuf>,

    /// Interpreter for the pty and resizer helpers. Without one, Unix
    /// sessions run over plain pipes and cannot be resized.
    pub python: Option<String>,

    /// Value for `TERM`.
    pub terminal: Option<String>,

    /// Run Windows sessions under the console host.
    pub use_win32_conhost: bool,
}

/// Developer console configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Nesting shown when printing objects.
    pub depth: u32,

    /// Longest a single evaluation may run, in milliseconds.
    pub eval_timeout_ms: u64,

    /// Log events kept for displays that attach later.
    pub history_limit: usize,
}

/// Timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimingConfig {
    /// Interval between resizer keep-alives, in milliseconds.
    pub resizer_watchdog_ms: u64,

    /// Delay before exit-code files are removed, in milliseconds.
    pub exit_cleanup_wait_ms: u64,

    /// Removal attempts after the first one fails.
    pub exit_cleanup_retries: u32,

    /// Operations allowed to queue behind a session lock.
    pub max_pending: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: default_log_file(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            executable: default_shell(),
            args: Vec::new(),
            cwd: None,
            python: None,
            terminal: Some("xterm-256color".to_string()),
            use_win32_conhost: false,
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            depth: crate::console::DEFAULT_INSPECT_DEPTH,
            eval_timeout_ms: 10_000,
            history_limit: crate::logging::DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            resizer_watchdog_ms: 500,
            exit_cleanup_wait_ms: 10_000,
            exit_cleanup_retries: 3,
            max_pending: crate::sync::DEFAULT_MAX_PENDING,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("paneterm")
        .join("config.toml")
}

/// Returns the default log file path.
fn default_log_file() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("paneterm")
        .join("paneterm.log")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    if cfg!(windows) {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

/// Whether `program` names an existing file or something on `PATH`.
fn resolvable(program: &str) -> bool {
    let path = Path::new(program);
    if path.is_absolute() {
        path.exists()
    } else {
        which::which(program).is_ok()
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PANETERM_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - PANETERM_SHELL: Override the shell executable
    /// - PANETERM_PYTHON: Override the helper interpreter
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("PANETERM_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.general.log_level = level;
            }
        }

        if let Ok(shell) = std::env::var("PANETERM_SHELL") {
            if !shell.is_empty() {
                tracing::info!("Overriding shell executable from environment: {}", shell);
                self.shell.executable = shell;
            }
        }

        if let Ok(python) = std::env::var("PANETERM_PYTHON") {
            if !python.is_empty() {
                tracing::info!("Overriding python from environment: {}", python);
                self.shell.python = Some(python);
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let level = self.general.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.general.log_level.clone()));
        }

        if !resolvable(&self.shell.executable) {
            return Err(ConfigError::InvalidShellPath(self.shell.executable.clone()));
        }

        if let Some(python) = &self.shell.python {
            if !resolvable(python) {
                return Err(ConfigError::InvalidPython(python.clone()));
            }
        }

        if self.console.depth > MAX_DEPTH {
            return Err(ConfigError::InvalidDepth(self.console.depth));
        }
        if self.console.eval_timeout_ms == 0 {
            return Err(ConfigError::ZeroValue("console.eval_timeout_ms"));
        }
        if self.console.history_limit == 0 {
            return Err(ConfigError::ZeroValue("console.history_limit"));
        }
        if self.timing.resizer_watchdog_ms == 0 {
            return Err(ConfigError::ZeroValue("timing.resizer_watchdog_ms"));
        }
        if self.timing.max_pending == 0 {
            return Err(ConfigError::ZeroValue("timing.max_pending"));
        }

        Ok(())
    }

    /// Shell session parameters from the `[shell]` section.
    pub fn shell_arguments(&self) -> ShellPseudoterminalArguments {
        ShellPseudoterminalArguments {
            executable: self.shell.executable.clone(),
            args: self.shell.args.clone(),
            cwd: self.shell.cwd.clone(),
            python_executable: self.shell.python.clone(),
            use_win32_conhost: self.shell.use_win32_conhost,
            terminal: self.shell.terminal.clone(),
        }
    }

    /// Backend timings from the `[timing]` section.
    pub fn pty_timing(&self) -> PtyTiming {
        PtyTiming {
            resizer_watchdog_interval: Duration::from_millis(self.timing.resizer_watchdog_ms),
            exit_cleanup_wait: Duration::from_millis(self.timing.exit_cleanup_wait_ms),
            exit_cleanup_retries: self.timing.exit_cleanup_retries,
        }
    }

    /// Console settings from the `[console]` and `[timing]` sections.
    pub fn console_options(&self) -> ConsoleOptions {
        ConsoleOptions {
            depth: self.console.depth,
            eval_timeout: Duration::from_millis(self.console.eval_timeout_ms),
            max_pending: self.timing.max_pending,
        }
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Save configuration to the default path.
    pub fn save_default(&self) -> Result<()> {
        self.save(default_config_path())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.general.log_level, "info");
        assert!(config.general.log_file.ends_with("paneterm/paneterm.log"));
        assert!(!config.shell.executable.is_empty());
        assert_eq!(config.shell.python, None);
        assert_eq!(config.shell.terminal.as_deref(), Some("xterm-256color"));
        assert_eq!(config.console.depth, 2);
        assert_eq!(config.console.eval_timeout_ms, 10_000);
        assert_eq!(config.timing.resizer_watchdog_ms, 500);
        assert_eq!(config.timing.exit_cleanup_wait_ms, 10_000);
        assert_eq!(config.timing.exit_cleanup_retries, 3);
        assert_eq!(config.timing.max_pending, 1000);
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[general]
log_level = "debug"

[shell]
executable = "/bin/zsh"
args = ["-l"]
python = "python3"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.shell.executable, "/bin/zsh");
        assert_eq!(config.shell.args, vec!["-l"]);
        assert_eq!(config.shell.python.as_deref(), Some("python3"));
        assert_eq!(config.console, ConsoleConfig::default());
        assert_eq!(config.timing, TimingConfig::default());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[general
log_level = "debug"
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[console]
depth = "deep"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
[general]
log_level = "warn"
colour = "blue"

[extras]
anything = true
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.general.log_level, "warn");
    }

    #[test]
    fn test_to_toml_has_all_sections() {
        let toml = Config::default().to_toml().unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[shell]"));
        assert!(toml.contains("[console]"));
        assert!(toml.contains("[timing]"));
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.general.log_level = "debug".to_string();
        original.shell.cwd = Some(PathBuf::from("/tmp"));
        original.console.depth = 4;

        original.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "not [valid").unwrap();

        let err = Config::load(&config_path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("paneterm/config.toml"));
    }

    #[test]
    fn test_conversions() {
        let mut config = Config::default();
        config.shell.executable = "/bin/bash".to_string();
        config.shell.args = vec!["-i".to_string()];
        config.shell.python = Some("python3".to_string());
        config.timing.resizer_watchdog_ms = 250;
        config.console.eval_timeout_ms = 1500;

        let args = config.shell_arguments();
        assert_eq!(args.executable, "/bin/bash");
        assert_eq!(args.args, vec!["-i"]);
        assert_eq!(args.python_executable.as_deref(), Some("python3"));
        assert_eq!(args.terminal.as_deref(), Some("xterm-256color"));

        let timing = config.pty_timing();
        assert_eq!(timing.resizer_watchdog_interval, Duration::from_millis(250));
        assert_eq!(timing.exit_cleanup_retries, 3);

        let options = config.console_options();
        assert_eq!(options.eval_timeout, Duration::from_millis(1500));
        assert_eq!(options.depth, 2);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("PANETERM_LOG_LEVEL", "trace");
        std::env::set_var("PANETERM_PYTHON", "/usr/bin/python3");
        std::env::set_var("PANETERM_SHELL", "");

        let mut config = Config::default();
        let shell = config.shell.executable.clone();
        config.apply_env_overrides();

        std::env::remove_var("PANETERM_LOG_LEVEL");
        std::env::remove_var("PANETERM_PYTHON");
        std::env::remove_var("PANETERM_SHELL");

        assert_eq!(config.general.log_level, "trace");
        assert_eq!(config.shell.python.as_deref(), Some("/usr/bin/python3"));
        assert_eq!(config.shell.executable, shell);
    }

    #[test]
    #[serial]
    fn test_env_overrides_unset() {
        std::env::remove_var("PANETERM_LOG_LEVEL");
        std::env::remove_var("PANETERM_PYTHON");
        std::env::remove_var("PANETERM_SHELL");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());
    }

    #[cfg(unix)]
    fn valid() -> Config {
        let mut config = Config::default();
        config.shell.executable = "/bin/sh".to_string();
        config
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_default_shell() {
        assert_eq!(valid().validate(), Ok(()));
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_log_level() {
        let mut config = valid();
        config.general.log_level = "WARN".to_string();
        assert_eq!(config.validate(), Ok(()));

        config.general.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_shell_path() {
        let mut config = valid();
        config.shell.executable = "/nonexistent/shell".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidShellPath("/nonexistent/shell".to_string()))
        );

        config.shell.executable = "sh".to_string();
        assert_eq!(config.validate(), Ok(()));

        config.shell.executable = "definitely-not-a-shell-xyz".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidShellPath(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_python() {
        let mut config = valid();
        config.shell.python = Some("/nonexistent/python".to_string());
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidPython("/nonexistent/python".to_string()))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_bounds() {
        let mut config = valid();
        config.console.depth = 65;
        assert_eq!(config.validate(), Err(ConfigError::InvalidDepth(65)));

        let mut config = valid();
        config.console.eval_timeout_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroValue("console.eval_timeout_ms"))
        );

        let mut config = valid();
        config.timing.resizer_watchdog_ms = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroValue("timing.resizer_watchdog_ms"))
        );

        let mut config = valid();
        config.timing.max_pending = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroValue("timing.max_pending"))
        );
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ConfigError::ZeroValue("timing.max_pending").to_string(),
            "timing.max_pending must be greater than 0"
        );
        assert_eq!(
            ConfigError::InvalidDepth(99).to_string(),
            "console depth must be at most 64, got 99"
        );
    }
}
