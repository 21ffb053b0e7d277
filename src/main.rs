use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pureza_api::{cli, config, Core};

#[derive(Parser)]
#[command(name = "pureza-api")]
#[command(version, about = "Versioned catalog API with pooled storage and health checks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (YAML); environment variables are used otherwise
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Address to listen on (overrides configuration)
        #[arg(long)]
        listen: Option<String>,
    },

    /// Run every health check once and print the result
    Health,

    /// Create the catalog schema
    InitDb {
        /// Insert sample products into an empty catalog
        #[arg(long)]
        sample: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Server mode handles concurrent requests; one-shot commands do not
    let is_server = matches!(cli.command, Commands::Serve { .. });

    let runtime = if is_server {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
    } else {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
    };

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config = config::load_config(cli.config.as_deref())?;
    let core = Core::new(config).await?;

    match cli.command {
        Commands::Serve { listen } => {
            cli::commands::cmd_serve(core, listen).await?;
        }
        Commands::Health => {
            cli::commands::cmd_health(&core).await?;
        }
        Commands::InitDb { sample } => {
            cli::commands::cmd_init_db(&core, sample).await?;
        }
    }

    Ok(())
}
