use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wayback_fanout::archiver::group_by_src;
use wayback_fanout::config::{Config, LogFormat};
use wayback_fanout::service::Service;
use wayback_fanout::{urls, web};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    init_tracing(LogFormat::from_env())?;

    info!("Starting wayback-fanout");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let root = CancellationToken::new();
    let service = Service::from_config(&root, &config)?;
    service.start();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if !args.is_empty() {
        return once(&root, &service, &args.join(" ")).await;
    }

    if !config.web_enabled {
        anyhow::bail!("Nothing to do: pass URLs as arguments or set WEB_ENABLED=true");
    }

    let shutdown = root.child_token();
    let state = web::AppState::new(service.clone(), Arc::new(config));
    let server = tokio::spawn(web::serve(state, shutdown.clone()));

    shutdown_signal().await;
    info!("Shutdown signal received");
    shutdown.cancel();

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Web server failed: {e:#}"),
        Err(e) => error!("Web server task panicked: {e}"),
    }

    // Let in-flight jobs finish; a second signal aborts them
    tokio::select! {
        () = service.close() => info!("All jobs finished"),
        () = shutdown_signal() => {
            warn!("Second signal received, cancelling in-flight jobs");
            root.cancel();
            service.close().await;
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Archive the URLs found in `text`, print the results and wait for the
/// publishes to finish.
async fn once(root: &CancellationToken, service: &Service, text: &str) -> Result<()> {
    let urls = urls::extract(text);
    if urls.is_empty() {
        anyhow::bail!("No URL found in arguments");
    }

    let archived = service.wayback(root, &urls).await?;
    for (src, cols) in group_by_src(&archived.collects) {
        println!("{src}");
        for col in cols {
            println!("  {:<16} {}", col.slot.name(), col.dst);
        }
    }

    service.close().await;
    Ok(())
}

fn init_tracing(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,wayback_fanout=debug"));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
