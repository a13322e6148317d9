use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crewline::config::Config;
use crewline::orchestration::{CommandExecutor, TaskScheduler};
use crewline::workflow::{self, WorkflowFile};
use crewline::{log_error, log_info, Result};

/// Crewline - dependency-aware task orchestration
#[derive(Parser, Debug)]
#[command(name = "crewline")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CREWLINE_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.crewline/crewline.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a workflow file and print a JSON summary
    Run {
        /// Path to the workflow TOML file
        workflow: PathBuf,

        /// Maximum tasks running at once (overrides config)
        #[arg(long, short = 'c')]
        concurrency: Option<usize>,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 3600)]
        timeout: u64,
    },

    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write the default configuration to ~/.crewline/crewline.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = Config::load();
    let log_settings = config
        .as_ref()
        .map(|c| c.log.clone())
        .unwrap_or_default();
    crewline::log::init(&log_settings, cli.debug);

    // `config init` must work even when the existing file does not parse.
    let outcome = match cli.command {
        Command::Config {
            action: ConfigAction::Init { force },
        } => init_config(force).map(|()| true),
        command => config.and_then(|config| dispatch(command, config)),
    };
    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log_error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the command succeeded.
fn dispatch(command: Command, config: Config) -> Result<bool> {
    match command {
        Command::Run {
            workflow,
            concurrency,
            timeout,
        } => run_workflow(&config, workflow, concurrency, Duration::from_secs(timeout)),
        Command::Config { action } => {
            run_config(&config, action)?;
            Ok(true)
        }
    }
}

fn run_workflow(
    config: &Config,
    path: PathBuf,
    concurrency: Option<usize>,
    timeout: Duration,
) -> Result<bool> {
    let workflow = WorkflowFile::load(&path)?;

    let mut scheduler_config = config.scheduler_config();
    if let Some(n) = concurrency {
        scheduler_config = scheduler_config.with_max_concurrent(n);
    }
    log_info!(
        "Running workflow {} with max_concurrent={}",
        path.display(),
        scheduler_config.max_concurrent
    );

    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(async {
        let scheduler = TaskScheduler::new(Arc::new(CommandExecutor::new()), scheduler_config);
        workflow::run(&scheduler, &workflow, timeout).await
    })?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(summary.succeeded())
}

fn run_config(config: &Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            print!("{}", toml::to_string_pretty(config)?);
        }
        ConfigAction::Init { force } => init_config(force)?,
    }
    Ok(())
}

fn init_config(force: bool) -> Result<()> {
    let path = Config::config_path()?;
    if path.exists() && !force {
        println!(
            "Config already exists at {} (use --force to overwrite)",
            path.display()
        );
        return Ok(());
    }
    Config::default().save()?;
    println!("Wrote {}", path.display());
    Ok(())
}
