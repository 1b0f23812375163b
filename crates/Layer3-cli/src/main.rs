//! Conduit CLI - Main entry point

mod args;
mod run;

use clap::{Parser, Subcommand};
use conduit_foundation::{ConduitConfig, JsonStore, CONDUIT_CONFIG_FILE};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Conduit - run tool commands with caching, progress tracking and monitoring
#[derive(Parser, Debug)]
#[command(name = "conduit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Tool program to invoke (overrides config and CONDUIT_TOOL)
    #[arg(long, global = true)]
    tool: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a tool command
    Run {
        /// Command name
        name: String,

        /// Argument as key=value (value parsed as JSON when possible); repeatable
        #[arg(short = 'a', long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,

        /// Arguments as a JSON object, merged under --arg values
        #[arg(long, value_name = "JSON")]
        json: Option<String>,

        /// Positional arguments passed through to the tool
        #[arg(last = true)]
        positional: Vec<String>,

        /// Bypass the result cache lookup
        #[arg(long)]
        no_cache: bool,

        /// Timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Print progress events to stderr
        #[arg(short, long)]
        events: bool,

        /// Run the command this many times (shows caching at work)
        #[arg(long, default_value = "1")]
        repeat: u32,

        /// Print performance statistics and recommendations afterwards
        #[arg(long)]
        stats: bool,
    },
    /// Show or initialize configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file locations
    Path,
    /// Write the default configuration
    Init {
        /// Write to the project directory instead of the global one
        #[arg(long)]
        project: bool,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let mut config = ConduitConfig::load()?;
    if let Some(tool) = cli.tool {
        config.tool.program = tool;
    }

    match cli.command {
        Command::Run {
            name,
            args,
            json,
            positional,
            no_cache,
            timeout,
            events,
            repeat,
            stats,
        } => {
            let arguments = args::build_arguments(json.as_deref(), &args, &positional)?;
            let request = run::RunRequest {
                command: name,
                arguments,
                skip_cache: no_cache,
                timeout: timeout.map(Duration::from_secs),
                show_events: events,
                repeat: repeat.max(1),
                show_stats: stats,
            };
            run::run(&config, request).await
        }
        Command::Config { action } => config_cmd(&config, action),
    }
}

fn config_cmd(config: &ConduitConfig, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        ConfigAction::Path => {
            match JsonStore::global() {
                Ok(store) => {
                    println!("global:  {}", store.file_path(CONDUIT_CONFIG_FILE).display())
                }
                Err(e) => println!("global:  unavailable ({})", e),
            }
            let project = JsonStore::current_project()?;
            println!("project: {}", project.file_path(CONDUIT_CONFIG_FILE).display());
        }
        ConfigAction::Init { project, force } => {
            let store = if project {
                JsonStore::current_project()?
            } else {
                JsonStore::global()?
            };
            if store.exists(CONDUIT_CONFIG_FILE) && !force {
                println!(
                    "{} already exists (use --force to overwrite)",
                    store.file_path(CONDUIT_CONFIG_FILE).display()
                );
                return Ok(());
            }
            let path = ConduitConfig::default().save_to(&store)?;
            println!("Wrote {}", path.display());
        }
    }
    Ok(())
}
