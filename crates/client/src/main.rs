//! alloc-exec
//!
//! Opens interactive terminal sessions inside running allocations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use exec_client::command::{CommandStore, FileCommandStore};
use exec_client::config::{default_config_path, Config};
use exec_client::logging;
use exec_client::session::{session_header, ExecSession, SELECT_TASK_NOTICE};
use exec_client::sockets::SocketFactory;
use exec_client::target::{running_groups, TargetResolver};
use exec_client::terminal::{LocalTerminal, TerminalSurface};
use exec_client::transport::WebSocketDialer;
use exec_client::ApiClient;

/// alloc-exec - interactive sessions inside running allocations.
#[derive(Parser, Debug)]
#[command(name = "alloc-exec")]
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
    /// Start an interactive session in a task of a job
    Run {
        /// Job ID
        job: String,

        /// Task to exec into; lists running tasks when omitted
        #[arg(long, short)]
        task: Option<String>,

        /// Task group, when the task name exists in several groups
        #[arg(long, short)]
        group: Option<String>,

        /// Allocation ID prefix to pin instead of a random draw
        #[arg(long, short)]
        allocation: Option<String>,

        /// Command to offer instead of the last used one
        #[arg(long)]
        command: Option<String>,
    },

    /// List task groups and tasks with a running instance
    Tasks {
        /// Job ID
        job: String,
    },

    /// Inspect or change the remembered command
    #[command(subcommand)]
    Command(CommandCommands),

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for the configuration file.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration, token masked
    Show,

    /// Write a configuration file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Subcommands for the remembered command.
#[derive(Subcommand, Debug, Clone)]
pub enum CommandCommands {
    /// Print the command the next session will offer
    Show,

    /// Remember a command
    Set {
        /// Command line
        command: String,
    },

    /// Forget the remembered command
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config(ConfigCommands::Init { force }) = &cli.command {
        let path = cli.config.clone().unwrap_or_else(default_config_path);
        return init_config(&path, *force);
    }

    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };
    let overrides = config.apply_env_overrides();
    config.validate()?;

    let _log_guard = logging::init(&config.log, cli.verbose)?;
    tracing::info!("alloc-exec starting");
    if let Some(config_path) = &cli.config {
        tracing::info!("Using config file: {:?}", config_path);
    }
    for variable in overrides {
        tracing::info!(variable, "Applied environment override");
    }

    let store = Arc::new(
        FileCommandStore::open(&config.exec.command_store)
            .context("Failed to open command store")?,
    );

    match cli.command {
        Commands::Run {
            job,
            task,
            group,
            allocation,
            command,
        } => {
            let api = ApiClient::new(config.api.clone())?;
            let allocations = api
                .job_allocations(&job)
                .await
                .with_context(|| format!("Failed to list allocations of job {}", job))?;

            let header = session_header(
                &job,
                config.api.namespace.as_deref(),
                config.api.region.as_deref(),
            );

            let Some(task) = task else {
                println!("{}", header);
                println!("{}", SELECT_TASK_NOTICE);
                print_running_tasks(&allocations);
                return Ok(());
            };

            let factory = SocketFactory::new(
                Arc::new(WebSocketDialer::new(config.api.clone())),
                config.exec.dial_timeout(),
            );
            let mut session = ExecSession::new(TargetResolver::default(), store, factory)
                .with_default_command(&config.exec.default_command);
            if let Some(command) = command {
                session = session.with_initial_command(command);
            }

            let mut term = LocalTerminal::enter().context("Failed to enter raw mode")?;
            let mut input = term.spawn_input();

            session.show_intro(
                &job,
                config.api.namespace.as_deref(),
                config.api.region.as_deref(),
                &mut term,
            );
            let result = match session.select_task(
                &allocations,
                group.as_deref(),
                &task,
                allocation.as_deref(),
                &mut term,
            ) {
                Ok(_) => session.run(&mut input, &mut term).await,
                Err(e) => Err(e),
            };
            term.write(b"\r\n");
            drop(term);

            result?;
        }
        Commands::Tasks { job } => {
            let api = ApiClient::new(config.api.clone())?;
            let allocations = api
                .job_allocations(&job)
                .await
                .with_context(|| format!("Failed to list allocations of job {}", job))?;
            println!(
                "{}",
                session_header(
                    &job,
                    config.api.namespace.as_deref(),
                    config.api.region.as_deref(),
                )
            );
            print_running_tasks(&allocations);
        }
        Commands::Command(cmd) => match cmd {
            CommandCommands::Show => {
                println!("{}", store.get_or(&config.exec.default_command));
            }
            CommandCommands::Set { command } => {
                if command.trim().is_empty() {
                    anyhow::bail!("Command must not be empty");
                }
                store.set(&command)?;
                println!("Remembered: {}", command);
            }
            CommandCommands::Reset => {
                store.clear()?;
                println!("Reset to: {}", config.exec.default_command);
            }
        },
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.redacted().to_toml()?);
        }
        // Handled before the configuration is loaded.
        Commands::Config(ConfigCommands::Init { .. }) => {}
    }

    Ok(())
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {}; pass --force to overwrite",
            path.display()
        );
    }
    Config::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn print_running_tasks(allocations: &[exec_client::Allocation]) {
    let groups = running_groups(allocations);
    if groups.is_empty() {
        println!("No running tasks.");
        return;
    }
    for group in groups {
        println!("{}", group.name);
        for task in group.tasks {
            println!("  {}", task);
        }
    }
}
