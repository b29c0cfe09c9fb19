use anyhow::Context;
use clap::Parser;
use continuity::api::ApiServer;
use continuity::auth::RequestVerifier;
use continuity::config;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "continuity", version, about = "HTTP reverse proxy and load balancer")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Write a sample configuration file and exit
    #[arg(long)]
    sample_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("continuity=debug".parse().expect("valid log directive")),
        )
        .init();

    let args = Args::parse();

    if args.sample_config {
        config::write_sample(&args.config).await?;
        info!(path = %args.config.display(), "sample configuration written");
        return Ok(());
    }

    let (configuration, registry) = config::load(&args.config).await.map_err(|e| {
        error!(path = %args.config.display(), error = %e, "failed to load configuration");
        e
    })?;
    info!(
        path = %args.config.display(),
        pools = configuration.pools.len(),
        "configuration loaded"
    );

    let verifier = configuration
        .management_authorized_keys
        .as_ref()
        .map(RequestVerifier::from_file)
        .transpose()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let save = config::spawn_autosave(
        args.config.clone(),
        Arc::clone(&registry),
        configuration.clone(),
        shutdown_rx.clone(),
    );

    tokio::spawn(Arc::clone(&registry).health_check_loop(shutdown_rx.clone()));

    let api = Arc::new(ApiServer::new(
        configuration.management_addr()?,
        Arc::clone(&registry),
        save,
        verifier,
    ));

    let mut data_plane = tokio::spawn(Arc::clone(&registry).run(shutdown_rx.clone()));
    let mut control_plane = tokio::spawn(api.run(shutdown_rx.clone()));

    tokio::select! {
        result = &mut data_plane => {
            result.context("load balancer task failed")??;
        }
        result = &mut control_plane => {
            result.context("management API task failed")??;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            let _ = data_plane.await;
            let _ = control_plane.await;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
