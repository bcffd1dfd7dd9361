use std::path::PathBuf;

use clap::{Parser, Subcommand};
use nngpt_core::training::TrainingArgs;

use nngpt_cli::commands;
use nngpt_cli::config::DriverConfig;
use nngpt_cli::logging::{self, LogFormat};

#[derive(Parser)]
#[command(name = "nngpt", about = "Distributed LLM generation and training driver")]
struct Cli {
    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bring up the process group on every rank, synchronize and tear down
    Check {
        /// Communication backend (tcp, gloo)
        #[arg(long)]
        backend: Option<String>,

        /// Group-formation timeout in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Base seed (rank 0 picks one when omitted)
        #[arg(long)]
        seed: Option<u64>,

        /// Processes to spawn when no launcher set RANK/WORLD_SIZE
        /// (default: one per visible GPU, at least one)
        #[arg(long)]
        nprocs: Option<usize>,
    },

    /// Print the training-engine config merged with per-run overrides
    EngineConfig {
        /// Static engine config (JSON)
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        per_device_batch_size: Option<usize>,

        #[arg(long)]
        gradient_accumulation_steps: Option<usize>,

        /// Enable fp16 mixed precision (wins over --bf16)
        #[arg(long)]
        fp16: bool,

        /// Enable bf16 mixed precision
        #[arg(long)]
        bf16: bool,
    },

    /// Manage the persisted driver configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration file
    Show,

    /// Persist values to the configuration file
    Save {
        #[arg(long)]
        backend: Option<String>,

        #[arg(long)]
        timeout_secs: Option<u64>,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long)]
        nprocs: Option<usize>,

        #[arg(long)]
        log_level: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    // Load config from file first
    let mut config = DriverConfig::load();
    let cli = Cli::parse();
    config.merge(&DriverConfig {
        log_level: cli.log_level.clone(),
        ..Default::default()
    });

    logging::init(config.log_level(), LogFormat::from_env())?;
    if let Some(path) = DriverConfig::default_path() {
        if path.exists() {
            tracing::debug!(path = %path.display(), "loaded driver config");
        }
    }

    match cli.command {
        Command::Check {
            backend,
            timeout_secs,
            seed,
            nprocs,
        } => {
            config.merge(&DriverConfig {
                backend,
                timeout_secs,
                seed,
                nprocs,
                log_level: None,
            });
            commands::check(&config)
        }
        Command::EngineConfig {
            config: path,
            per_device_batch_size,
            gradient_accumulation_steps,
            fp16,
            bf16,
        } => {
            let args = TrainingArgs {
                per_device_train_batch_size: per_device_batch_size,
                gradient_accumulation_steps,
                fp16,
                bf16,
            };
            println!("{}", commands::engine_config(&path, &args)?);
            Ok(())
        }
        Command::Config { action } => match action {
            ConfigAction::Show => {
                match DriverConfig::default_path() {
                    Some(path) => println!("# {}", path.display()),
                    None => println!("# no config directory available"),
                }
                print!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
            ConfigAction::Save {
                backend,
                timeout_secs,
                seed,
                nprocs,
                log_level,
            } => {
                let mut stored = DriverConfig::load();
                stored.merge(&DriverConfig {
                    backend,
                    timeout_secs,
                    seed,
                    nprocs,
                    log_level,
                });
                let path = stored.save()?;
                println!("Saved config to {}", path.display());
                Ok(())
            }
        },
    }
}
