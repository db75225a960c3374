//! proxyrelay - OpenAI-compatible relay over a rotating proxy pool
//!
//! Forwards chat completion and transcription requests to the inference
//! upstream, each call routed through a verified public HTTP proxy.

use std::path::Path;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use proxyrelay::config::{Config, KeySource};
use proxyrelay::pool::{Probe, ProxyAddress, ProxyHealthProbe};

#[derive(Parser)]
#[command(name = "proxyrelay")]
#[command(about = "OpenAI-compatible relay over a rotating proxy pool")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Probe a single proxy against the upstream and report the result
    Probe {
        /// Proxy address, host:port
        address: String,

        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
}

/// Load the config file, or defaults plus environment when `allow_missing`
/// and the file does not exist.
fn load_config(path: &str, allow_missing: bool) -> anyhow::Result<(Config, KeySource)> {
    if allow_missing && !Path::new(path).exists() {
        return Config::from_env().context("Invalid configuration from environment");
    }
    Config::from_file_with_env(path).with_context(|| format!("Failed to load config '{}'", path))
}

fn init_tracing(level: &str) {
    let default_filter = format!("proxyrelay={},tower_http=info", level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => {
            let file_exists = Path::new(&config).exists();
            let (mut cfg, key_source) = load_config(&config, true)?;
            init_tracing(&cfg.logging.level);

            if file_exists {
                tracing::info!(config = %config, "Loaded configuration");
            } else {
                tracing::info!(config = %config, "Config file not found, using defaults");
            }

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                cfg.server.listen = addr;
            }

            match key_source {
                KeySource::None => tracing::warn!("No API key configured, the API is open"),
                source => tracing::info!(source = %source, "API key authentication enabled"),
            }

            proxyrelay::api::run_server(cfg).await
        }

        Commands::Check { config } => {
            let (cfg, key_source) = load_config(&config, false)?;

            println!("Configuration OK: {}", config);
            println!("  listen:           {}", cfg.server.listen);
            println!("  api key:          {}", key_source);
            println!("  upstream:         {}", cfg.upstream.base_url);
            println!("  proxy source:     {}", cfg.pool.source_url);
            println!(
                "  pool refresh:     every {}s, {} probes in flight",
                cfg.pool.refresh_interval_secs, cfg.pool.probe_concurrency
            );
            println!(
                "  chat dispatch:    {} attempts, {}s deadline",
                cfg.dispatch.chat.max_attempts, cfg.dispatch.chat.deadline_secs
            );
            println!(
                "  model catalog:    {}",
                if cfg.models.enabled { "enabled" } else { "disabled" }
            );
            Ok(())
        }

        Commands::Probe { address, config } => {
            let (cfg, _) = load_config(&config, true)?;
            init_tracing(&cfg.logging.level);

            let probe = ProxyHealthProbe::new(
                cfg.upstream.models_url(),
                cfg.pool.probe_timeout(),
                cfg.pool.probe_connect_timeout(),
            );
            let address = ProxyAddress::from(address);
            let started = std::time::Instant::now();
            let healthy = probe.check(&address).await;

            println!(
                "{} {} ({} ms, target {})",
                address,
                if healthy { "healthy" } else { "unusable" },
                started.elapsed().as_millis(),
                probe.target()
            );
            if healthy {
                Ok(())
            } else {
                anyhow::bail!("proxy {} failed the health probe", address)
            }
        }
    }
}
