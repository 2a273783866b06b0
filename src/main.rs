use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;
use trainforge_conductor::{config::Config, prelude::*, routes::router, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::load_from_env()?;
    let addr = bind_addr(&config);

    let provider_count = config.providers.len();
    let key_count = config.keys.len();
    let state = Arc::new(AppState::new(config));
    let app = router(state);

    info!(%addr, providers = provider_count, keys = key_count, "starting trainforge-conductor");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// `CONDUCTOR_HOST`/`CONDUCTOR_PORT` win over the config file's `server`
/// block, which in turn wins over `0.0.0.0:8080`.
fn bind_addr(config: &Config) -> SocketAddr {
    let host = std::env::var("CONDUCTOR_HOST")
        .ok()
        .or_else(|| config.server.host.clone())
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let port = std::env::var("CONDUCTOR_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .or(config.server.port)
        .unwrap_or(8080);
    format!("{host}:{port}")
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("CONDUCTOR_LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining connections");
}
