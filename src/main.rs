use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use a3s_serve::config::{ExecutorKind, ServeConfig};
use a3s_serve::{HttpRuntime, LocalRuntime, ReplicaRuntime, ServeCluster};

/// A3S Serve — model serving control plane
#[derive(Parser)]
#[command(name = "a3s-serve", version, about)]
struct Cli {
    /// Path to configuration file (.hcl)
    #[arg(short, long, default_value = "serve.hcl")]
    config: String,

    /// Override the HTTP listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file without starting the controller
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long, default_value = "serve.hcl")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> a3s_serve::Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Validate { config: config_path }) = &cli.command {
        return validate_config(config_path).await;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    tracing::info!("A3S Serve v{}", env!("CARGO_PKG_VERSION"));

    let mut config = if std::path::Path::new(&cli.config).exists() {
        tracing::info!(config = cli.config, "Loading configuration");
        ServeConfig::from_file(&cli.config).await?
    } else {
        tracing::warn!("Config file not found, using defaults");
        ServeConfig::default()
    };
    if let Some(port) = cli.port {
        config.http.enabled = true;
        config.http.port = port;
    }
    config.validate()?;

    let runtime: Arc<dyn ReplicaRuntime> = match config.runtime.executor {
        ExecutorKind::Http => {
            let base_url = config.runtime.base_url.clone().unwrap_or_default();
            tracing::info!(base_url = %base_url, "Using cluster manager runtime");
            Arc::new(HttpRuntime::new(base_url))
        }
        ExecutorKind::Local => {
            let local = LocalRuntime::new();
            local.register_function("echo", |req| Ok(req.args));
            Arc::new(local)
        }
    };

    let name = config.controller.name.clone();
    let cluster = ServeCluster::new(config, runtime);
    let session = cluster.init(&name).await?;
    match session.http_url() {
        Some(url) => tracing::info!(controller = %name, url = %url, "Serving — press Ctrl+C to stop"),
        None => tracing::info!(controller = %name, "Serving — press Ctrl+C to stop"),
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
    session.shutdown().await
}

/// Validate a configuration file and print diagnostics
async fn validate_config(path: &str) -> a3s_serve::Result<()> {
    use std::path::Path;

    if !Path::new(path).exists() {
        eprintln!("✗ Config file not found: {}", path);
        std::process::exit(1);
    }

    let config = match ServeConfig::from_file(path).await {
        Ok(c) => {
            println!("✓ Config parsed successfully ({})", path);
            c
        }
        Err(e) => {
            eprintln!("✗ Parse error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("✗ Validation error: {}", e);
        std::process::exit(1);
    }

    println!("✓ Configuration is valid");
    println!();
    println!("  Controller:  {}", config.controller.name);
    match config.controller.checkpoint_path() {
        Some(p) => println!("  Checkpoint:  {}", p.display()),
        None => println!("  Checkpoint:  in-memory"),
    }
    println!("  Runtime:     {:?}", config.runtime.executor);
    if config.http.enabled {
        println!("  HTTP:        {}", config.http.address());
        for url in &config.http.probe_urls {
            println!("    probe → {}", url);
        }
    } else {
        println!("  HTTP:        disabled");
    }

    Ok(())
}
