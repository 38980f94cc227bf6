use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use phasegate::config::PhasegateConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "phasegate")]
#[command(version, about = "Human-gated multi-phase workflow orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the config file. Defaults to ./phasegate.toml when present.
    #[arg(long, global = true, env = "PHASEGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database path. Overrides config and PHASEGATE_DB_PATH.
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API with the expiry sweeper
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Enable dev mode (permissive CORS)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and its tables, then exit
    InitDb,
    /// Expire stale tasks and approvals once
    Sweep,
    /// List tasks, newest first
    Tasks {
        /// Only tasks in this status (e.g. awaiting_approval)
        #[arg(short, long)]
        status: Option<String>,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show the status projection of one task as JSON
    Status { task_id: String },
    /// Show or override circuit breakers
    Breakers {
        #[command(subcommand)]
        command: Option<BreakerCommands>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum BreakerCommands {
    /// Force a breaker open
    Open { name: String },
    /// Force a breaker closed and reset its counters
    Close { name: String },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Validate configuration and list any problems
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let mut config = PhasegateConfig::resolve(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.database.path = db.clone();
    }
    if let Commands::Serve { port, host, dev } = &cli.command {
        if let Some(port) = port {
            config.server.port = *port;
        }
        if let Some(host) = host {
            config.server.host = host.clone();
        }
        if *dev {
            config.server.dev = true;
        }
    }

    let _logging = phasegate::logging::init(&config.logging, cli.verbose)?;

    match &cli.command {
        Commands::Serve { .. } => cmd::cmd_serve(config).await?,
        Commands::InitDb => cmd::cmd_init_db(&config)?,
        Commands::Sweep => cmd::cmd_sweep(config).await?,
        Commands::Tasks { status, limit } => {
            cmd::cmd_tasks(config, status.as_deref(), *limit).await?
        }
        Commands::Status { task_id } => cmd::cmd_status(config, task_id).await?,
        Commands::Breakers { command } => cmd::cmd_breakers(config, command.clone()).await?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
