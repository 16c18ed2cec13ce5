use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rustyline::{error::ReadlineError, DefaultEditor};
use tessera::shell::{parse_key, Command, Shell};
use tessera::{demo, Cluster, TesseraConfig};
use tokio::runtime::Runtime;
use tracing::Level;

/// Tessera command-line interface.
#[derive(Parser)]
#[command(name = "tessera", author, version, about = "Sharding router with key migration", long_about = None)]
struct Cli {
    /// Path to configuration file (default: $HOME/.tessera.yaml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level.
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    /// Write JSON logs to rolling files in this directory instead of stdout.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run health check and exit.
    HealthCheck,

    /// Print the shard owning a key.
    Resolve {
        #[arg(long)]
        key: String,
    },

    /// Seed the health tables, move one record and audit placement.
    Demo,

    /// Interactive shell over in-memory shards.
    Shell,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let log = match &cli.log_dir {
        Some(dir) => tessera_log::init(dir, cli.log_level)?,
        None => tessera_log::init_stdout(cli.log_level)?,
    };

    let config_path = TesseraConfig::locate(cli.config);
    let config = TesseraConfig::load(config_path.as_deref())?;
    if let Some(path) = &config_path {
        tracing::info!(path = %path.display(), "loaded config");
    }
    let cluster = Cluster::from_config(&config).context("invalid configuration")?;

    match cli.command {
        Some(Commands::HealthCheck) => {
            if tessera::health_check() {
                println!("OK");
            } else {
                println!("FAILED");
            }
        }
        Some(Commands::Resolve { key }) => {
            let key = parse_key(&key);
            let shard = cluster.directory().resolve(&key)?;
            println!("{key} -> {shard} ({})", cluster.directory().rule_name());
        }
        Some(Commands::Demo) => {
            let rt = Runtime::new()?;
            let summary = rt.block_on(demo::run(&cluster))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            print!("{}", tessera_router::metrics::render()?);
        }
        Some(Commands::Shell) | None => interactive_shell(Shell::new(cluster, Some(log)))?,
    }
    Ok(())
}

/// Interactive readline shell.
fn interactive_shell(shell: Shell) -> Result<()> {
    let rt = Runtime::new()?;
    let mut rl = DefaultEditor::new()?;
    let prompt = "tessera> ";

    loop {
        match rl.readline(prompt) {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.eq_ignore_ascii_case("exit") || trimmed.eq("\\q") {
                    break;
                }
                if trimmed.is_empty() {
                    continue;
                }
                rl.add_history_entry(trimmed)?;
                let result = match trimmed.parse::<Command>() {
                    Ok(cmd) => rt.block_on(shell.execute(cmd)),
                    Err(e) => Err(e),
                };
                match result {
                    Ok(out) => println!("{out}"),
                    Err(e) => eprintln!("Error: {e}"),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Readline error: {err}");
                break;
            }
        }
    }
    Ok(())
}
