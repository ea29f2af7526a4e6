//! CLI subcommands: init, validate, run, params, defaults.

use crate::core::config::{self, Config};
use crate::core::executor::FleetExecutor;
use crate::core::handler::DeliveryHandler;
use crate::core::state::BuildStateStore;
use crate::core::types::{Command, StatusKind, StatusUpdate};
use crate::protocols;
use crate::queue::consumer::Consumer;
use crate::queue::memory::MemoryBroker;
use crate::queue::Broker;
use crate::transport::ShellConnector;
use clap::Subcommand;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a default genesis.yaml and state directory
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate genesis.yaml
    Validate {
        /// Path to genesis.yaml
        #[arg(short, long, default_value = "genesis.yaml")]
        file: PathBuf,
    },

    /// Process a file of commands locally through the in-memory broker
    Run {
        /// JSON file with one command or an array of commands
        commands: PathBuf,

        /// Path to genesis.yaml (defaults apply when absent)
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 600)]
        timeout: u64,
    },

    /// Print the parameter schema of a protocol
    Params {
        blockchain: String,
    },

    /// Print the default parameters of a protocol
    Defaults {
        blockchain: String,
    },
}

/// Install the global subscriber. `RUST_LOG` wins over the configured verbosity.
pub fn init_tracing(verbosity: &str) {
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(verbosity));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .try_init()
            .ok();
    });
}

/// Dispatch a CLI command.
pub async fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Run {
            commands,
            file,
            timeout,
        } => cmd_run(file.as_deref(), &commands, Duration::from_secs(timeout)).await,
        Commands::Params { blockchain } => cmd_params(&blockchain),
        Commands::Defaults { blockchain } => cmd_defaults(&blockchain),
    }
}

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join("genesis.yaml");
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }

    let state_dir = path.join("state");
    std::fs::create_dir_all(&state_dir).map_err(|e| format!("cannot create state dir: {}", e))?;

    let config = Config {
        state_dir: Some(PathBuf::from("state")),
        ..Config::default()
    };
    let yaml = serde_yaml_ng::to_string(&config)
        .map_err(|e| format!("cannot render config: {}", e))?;
    std::fs::write(&config_path, yaml)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;

    println!("Initialized genesis at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}/", state_dir.display());
    Ok(())
}

fn load_and_validate(file: Option<&Path>) -> Result<Config, String> {
    let config = config::load(file)?;
    let errors = config::validate_config(&config);
    if errors.is_empty() {
        return Ok(config);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err(format!("{} validation error(s)", errors.len()))
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let config = load_and_validate(Some(file))?;
    println!(
        "OK: queue '{}' ({} concurrent, {} retries)",
        config.command_queue_name, config.queue_max_concurrency, config.max_message_retries
    );
    Ok(())
}

/// A commands file holds one command or an array of them.
#[derive(serde::Deserialize)]
#[serde(untagged)]
enum CommandFile {
    Many(Vec<Command>),
    One(Box<Command>),
}

fn read_commands(path: &Path) -> Result<Vec<Command>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    let parsed: CommandFile =
        serde_json::from_str(&content).map_err(|e| format!("{}: {}", path.display(), e))?;
    let commands = match parsed {
        CommandFile::Many(commands) => commands,
        CommandFile::One(command) => vec![*command],
    };
    for command in &commands {
        command
            .validate()
            .map_err(|e| format!("{}: command {}: {}", path.display(), command.id, e))?;
    }
    Ok(commands)
}

async fn cmd_run(file: Option<&Path>, commands: &Path, timeout: Duration) -> Result<(), String> {
    let config = load_and_validate(file)?;
    init_tracing(&config.verbosity);
    let commands = read_commands(commands)?;

    let broker = MemoryBroker::new();
    let store = Arc::new(BuildStateStore::new(config.state_dir.clone()));
    let executor = Arc::new(FleetExecutor::new(Arc::new(ShellConnector)));
    let registry = protocols::registry(
        Arc::new(protocols::protocols()?),
        store,
        executor,
        &config,
    )?;
    let handler = Arc::new(DeliveryHandler::new(
        config.clone(),
        registry,
        Arc::new(broker.clone()),
    ));

    let ids: Vec<String> = commands.iter().map(|c| c.id.clone()).collect();
    for command in &commands {
        let body = serde_json::to_vec(command)
            .map_err(|e| format!("cannot encode command {}: {}", command.id, e))?;
        broker
            .publish(&config.command_queue_name, body, Duration::ZERO)
            .await?;
    }

    let consumer = Consumer::new(Arc::clone(&handler), Arc::new(broker.clone()));
    let running = tokio::spawn(async move { consumer.run().await });
    let settled = tokio::time::timeout(timeout, async {
        loop {
            let done = ids.iter().all(|id| {
                handler
                    .ledger()
                    .outcome(id)
                    .is_some_and(|o| o.is_terminal())
            });
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    running.abort();

    let mut failed = 0;
    for publication in broker.published_to(&config.status_queue_name) {
        let status: StatusUpdate = serde_json::from_slice(&publication.body)
            .map_err(|e| format!("bad status message: {}", e))?;
        if status.status == StatusKind::Failure {
            failed += 1;
        }
        println!(
            "{} {:?} retry={}{}",
            status.id,
            status.status,
            status.retry,
            status
                .message
                .map(|m| format!(" ({})", m))
                .unwrap_or_default()
        );
    }

    if settled.is_err() {
        return Err(format!("gave up after {}s", timeout.as_secs()));
    }
    if failed > 0 {
        return Err(format!("{} command(s) failed", failed));
    }
    Ok(())
}

fn plugin(blockchain: &str) -> Result<Arc<dyn crate::core::registry::Protocol>, String> {
    let table = protocols::protocols()?;
    table.get(blockchain).ok_or_else(|| {
        format!(
            "unknown blockchain {} (known: {})",
            blockchain,
            table.names().join(", ")
        )
    })
}

fn cmd_params(blockchain: &str) -> Result<(), String> {
    let schema = plugin(blockchain)?.params();
    println!(
        "{}",
        serde_json::to_string_pretty(&schema).map_err(|e| e.to_string())?
    );
    Ok(())
}

fn cmd_defaults(blockchain: &str) -> Result<(), String> {
    let defaults = plugin(blockchain)?.defaults();
    println!(
        "{}",
        serde_json::to_string_pretty(&defaults).map_err(|e| e.to_string())?
    );
    Ok(())
}
