use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use vigil::config::VigilConfig;
use vigil::db::{DbHandle, VigilDb};
use vigil::server;

#[derive(Parser)]
#[command(name = "vigil")]
#[command(version, about = "AI-assisted security scan orchestrator")]
pub struct Cli {
    /// Path to the vigil.toml config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the orchestration server
    Serve {
        /// Port to serve on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind on all interfaces and allow cross-origin requests
        #[arg(long)]
        dev: bool,
    },
    /// Initialize the database and seed catalog records, then exit
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Optional .env for local development; absence is fine.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vigil=info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("vigil.toml"));
    let mut config = VigilConfig::load(Some(&config_path))?;

    match cli.command {
        Commands::Serve { port, dev } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if dev {
                config.server.dev_mode = true;
            }
            server::start_server(config).await
        }
        Commands::InitDb => {
            if let Some(parent) = config.server.db_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let db = DbHandle::new(VigilDb::new(&config.server.db_path)?);
            server::seed_catalog(&db, &config)?;
            println!(
                "Initialized database at {}",
                config.server.db_path.display()
            );
            Ok(())
        }
    }
}
