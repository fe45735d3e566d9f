use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;

use voxly_stream::config::Config;
use voxly_stream::routes;

#[derive(Debug, Parser)]
#[command(name = "voxly-stream", version, about = "Serve uploaded audio with HTTP range support")]
struct Cli {
    /// Path to a JSON config file
    #[arg(short, long, env = "VOXLY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind, overrides `server.host`
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on, overrides `server.port`
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Directory of uploaded files, overrides `media.root`
    #[arg(long)]
    media_root: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "voxly_stream=trace,info".to_string()
        } else {
            "voxly_stream=info,warn".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    let mut config = Config::load_or_default(cli.config.as_deref());
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(root) = cli.media_root {
        config.media.root = root;
    }

    for warning in config.validate() {
        tracing::warn!("{warning}");
    }

    let library = config.media.library();
    let listener = TcpListener::bind(config.server.bind_addr()).await?;
    tracing::info!(
        "Serving {} on {}",
        library.root().display(),
        listener.local_addr()?
    );

    axum::serve(listener, routes::router(library))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down...");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}
