use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "mesh-gateway starting");

    let path_override = std::env::args().nth(1);
    let config = match gateway::config::load_config(path_override.as_deref()) {
        Ok(cfg) => {
            info!(
                local_node = format!("{:#x}", cfg.local_node),
                radio = %format!("{}:{}", cfg.radio.host, cfg.radio.port),
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    gateway::run(config, shutdown_rx).await?;
    Ok(())
}
