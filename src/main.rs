use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use easilogin::cache::TieredCache;
use easilogin::error::AppResult;
use easilogin::gateway::{build_router, token_renew_job, AppState};
use easilogin::models::AppConfig;
use easilogin::store::UserStore;

fn data_dir() -> PathBuf {
    std::env::var_os("EASILOGIN_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data"))
}

#[tokio::main]
async fn main() -> AppResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let dir = data_dir();
    let config = AppConfig::load(&dir);
    let cache = Arc::new(TieredCache::open(&dir.join("cache.db"))?);
    let users = UserStore::new(&dir);
    let state = AppState::new(config, cache, users)?;

    let cancel = CancellationToken::new();
    let renew = tokio::spawn(token_renew_job(state.clone(), cancel.clone()));

    let addr = format!("127.0.0.1:{}", state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
            shutdown_cancel.cancel();
        })
        .await?;

    cancel.cancel();
    let _ = renew.await;
    Ok(())
}
