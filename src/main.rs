use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "tunnelforge", version, about = "Single-user HTTP/WebSocket reverse tunnel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tunnel server
    Serve {
        /// Path to a server config TOML file
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Connect a local app through a tunnel server
    Connect {
        /// Tunnel server base URL, e.g. https://tunnel.example.com
        #[arg(long, env = "TUNNELFORGE_SERVER_URL")]
        server_url: Option<String>,

        /// Pre-shared API key
        #[arg(long, env = "TUNNELFORGE_API_KEY")]
        api_key: Option<String>,

        /// Local port to expose
        #[arg(long)]
        port: u16,

        /// Request a specific subdomain instead of the remembered/allocated one
        #[arg(long)]
        subdomain: Option<String>,

        /// Path to the client config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => {
            tunnelforge_server::init_tracing();
            let server_config = tunnelforge_server::config::ServerConfig::load(config.as_deref())?;
            let shutdown = CancellationToken::new();
            tunnelforge_server::spawn_signal_handler(shutdown.clone());
            tunnelforge_server::serve(server_config, shutdown).await?;
        }
        Commands::Connect { server_url, api_key, port, subdomain, config } => {
            tunnelforge_client::init_tracing();

            let config_path = config.unwrap_or_else(tunnelforge_client::config::ClientConfig::default_path);
            let existing = tunnelforge_client::config::ClientConfig::load(&config_path).await.unwrap_or_default();

            let server_url = server_url
                .or_else(|| (!existing.server_url.is_empty()).then_some(existing.server_url.clone()))
                .ok_or_else(|| color_eyre::eyre::eyre!("--server-url is required (no saved config found)"))?;
            let api_key = api_key
                .or_else(|| (!existing.api_key.is_empty()).then_some(existing.api_key.clone()))
                .ok_or_else(|| color_eyre::eyre::eyre!("--api-key is required (no saved config found)"))?;

            let shutdown = CancellationToken::new();
            tunnelforge_client::spawn_signal_handler(shutdown.clone());
            tunnelforge_client::run(server_url, api_key, port, subdomain, config_path, shutdown).await?;
        }
    }

    Ok(())
}
