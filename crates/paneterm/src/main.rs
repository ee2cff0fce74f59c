//! Paneterm
//!
//! Runs a pseudoterminal session in the current terminal.

use std::future::IntoFuture;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use paneterm::config::{default_config_path, Config};
use paneterm::host::{HostDisplay, InputEnd, InputPump, RawTerminal};
use paneterm::logging::{self, LogOutput};
use paneterm::pty::{platform_backend, Platform};
use paneterm::{
    AnyPseudoterminal, DeveloperConsolePseudoterminal, DisplayEvent, ExitStatus, LogStream,
    Pseudoterminal, PseudoterminalError, TerminalDisplay, TextPseudoterminal, TokioSpawner,
};
use tokio::sync::broadcast;

/// Paneterm - pseudoterminal sessions in your terminal.
#[derive(Parser, Debug)]
#[command(name = "paneterm")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a shell (or any program) in a pseudoterminal
    Shell {
        /// Interpreter for the pty helper; enables resizing
        #[arg(long, value_name = "PYTHON")]
        python: Option<String>,

        /// Run under the Windows console host
        #[arg(long)]
        conhost: bool,

        /// Working directory for the program
        #[arg(long, value_name = "DIR")]
        cwd: Option<PathBuf>,

        /// Program and arguments (defaults to the configured shell)
        #[arg(last = true, value_name = "COMMAND")]
        command: Vec<String>,
    },

    /// Open the developer console
    Console,

    /// Show static text until detached
    Text {
        /// Text to show
        message: String,
    },

    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the configuration file path
    Path,

    /// Print the effective configuration
    Show,

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;

    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.general.log_level.to_lowercase()
    };

    let command = match cli.command {
        Commands::Config(cmd) => {
            logging::init(&filter, LogOutput::Stderr, None)?;
            config.apply_env_overrides();
            return run_config_command(cmd, &config, &config_path);
        }
        other => other,
    };

    // The session owns the terminal, so logs go to a file.
    let log = LogStream::new(config.console.history_limit);
    let console_feed = matches!(command, Commands::Console).then(|| log.clone());
    let guard = logging::init(&filter, LogOutput::File(&config.general.log_file), console_feed)?;
    tracing::info!("Paneterm starting...");

    config.apply_env_overrides();

    let pty = open_session(command, &mut config, log)?;
    let status = run_session(&pty).await?;
    tracing::info!(status = %status, "Session ended");
    drop(guard);

    match status.code() {
        Some(code) => std::process::exit(code),
        None if status.is_clean() => Ok(()),
        None => std::process::exit(1),
    }
}

/// Build the session a command asks for.
fn open_session(
    command: Commands,
    config: &mut Config,
    log: LogStream,
) -> anyhow::Result<AnyPseudoterminal> {
    let pty = match command {
        Commands::Shell {
            python,
            conhost,
            cwd,
            mut command,
        } => {
            if !command.is_empty() {
                config.shell.executable = command.remove(0);
                config.shell.args = command;
            }
            if python.is_some() {
                config.shell.python = python;
            }
            if cwd.is_some() {
                config.shell.cwd = cwd;
            }
            config.shell.use_win32_conhost |= conhost;
            config.validate()?;

            let platform = Platform::current();
            let backend = platform_backend(platform)
                .ok_or_else(|| anyhow::anyhow!("Shells are not supported on {}", platform))?;
            tracing::info!(
                executable = %config.shell.executable,
                platform = %platform,
                "Starting shell session"
            );
            backend.open(
                config.shell_arguments(),
                Arc::new(TokioSpawner),
                config.pty_timing(),
            )
        }
        Commands::Console => {
            config.validate()?;
            DeveloperConsolePseudoterminal::with_options(log, config.console_options()).into()
        }
        Commands::Text { message } => TextPseudoterminal::new(message).into(),
        Commands::Config(_) => anyhow::bail!("Config commands do not open a session"),
    };
    Ok(pty)
}

/// Attach the host terminal to a session until it exits or the user
/// detaches with Ctrl+].
async fn run_session(pty: &AnyPseudoterminal) -> anyhow::Result<ExitStatus> {
    let display = Arc::new(HostDisplay::stdout()?);
    let mut raw = RawTerminal::enter()?;

    let size = display.size();
    resize(pty, size.cols, size.rows).await;

    let attached: Arc<dyn TerminalDisplay> = display.clone();
    pty.pipe(attached).await?;

    let mut events = display.subscribe();
    let mut events_open = true;
    let mut input = InputPump::spawn(Arc::clone(&display));
    let mut exit = pty.on_exit().into_future();

    let status = loop {
        tokio::select! {
            status = &mut exit => break status?,
            end = input.finished() => {
                if end == InputEnd::Detached {
                    tracing::info!("Detached, stopping session");
                }
                if let Err(e) = pty.kill().await {
                    tracing::warn!(error = %e, "Failed to kill session");
                }
                break exit.await?;
            }
            event = events.recv(), if events_open => match event {
                Ok(DisplayEvent::Resize(size)) => resize(pty, size.cols, size.rows).await,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => events_open = false,
            },
        }
    };

    input.stop();
    display.dispose();
    raw.restore()?;
    Ok(status)
}

async fn resize(pty: &AnyPseudoterminal, cols: u16, rows: u16) {
    match pty.resize(cols, rows).await {
        Ok(()) => {}
        Err(PseudoterminalError::ResizeUnsupported | PseudoterminalError::ResizerDisabled) => {}
        Err(e) => tracing::warn!(error = %e, "Failed to resize session"),
    }
}

fn run_config_command(
    cmd: ConfigCommands,
    config: &Config,
    path: &Path,
) -> anyhow::Result<()> {
    match cmd {
        ConfigCommands::Path => println!("{}", path.display()),
        ConfigCommands::Show => print!("{}", config.to_toml()?),
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists: {} (use --force to overwrite)",
                    path.display()
                );
            }
            Config::default().save(path)?;
            println!("Wrote default configuration to {}", path.display());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_shell_command_defaults() {
        let cli = Cli::try_parse_from(["paneterm", "shell"]).unwrap();
        match cli.command {
            Commands::Shell {
                python,
                conhost,
                cwd,
                command,
            } => {
                assert!(python.is_none());
                assert!(!conhost);
                assert!(cwd.is_none());
                assert!(command.is_empty());
            }
            _ => panic!("Expected Shell command"),
        }
    }

    #[test]
    fn test_shell_command_with_program() {
        let cli = Cli::try_parse_from([
            "paneterm", "shell", "--python", "python3", "--", "/bin/ls", "-la",
        ])
        .unwrap();
        match cli.command {
            Commands::Shell {
                python, command, ..
            } => {
                assert_eq!(python.as_deref(), Some("python3"));
                assert_eq!(command, vec!["/bin/ls", "-la"]);
            }
            _ => panic!("Expected Shell command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["paneterm", "console", "-v", "-c", "/tmp/p.toml"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/p.toml")));
        assert!(matches!(cli.command, Commands::Console));
    }

    #[test]
    fn test_config_subcommands() {
        let cli = Cli::try_parse_from(["paneterm", "config", "init", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigCommands::Init { force: true })
        ));

        let cli = Cli::try_parse_from(["paneterm", "config", "path"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Path)));
    }

    #[test]
    fn test_config_init_refuses_overwrite() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let config = Config::default();

        run_config_command(ConfigCommands::Init { force: false }, &config, &path).unwrap();
        assert!(path.exists());
        assert!(run_config_command(ConfigCommands::Init { force: false }, &config, &path).is_err());
        run_config_command(ConfigCommands::Init { force: true }, &config, &path).unwrap();
    }

    #[test]
    fn test_text_command() {
        let cli = Cli::try_parse_from(["paneterm", "text", "hello"]).unwrap();
        match cli.command {
            Commands::Text { message } => assert_eq!(message, "hello"),
            _ => panic!("Expected Text command"),
        }
    }
}
