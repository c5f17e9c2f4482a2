use std::net::SocketAddr;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use voucher_store::{AppState, Config, Store, init_pool, init_router, run_migrations};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    let pool = init_pool(&config).await?;
    run_migrations(&pool).await?;

    let state = AppState {
        store: Store::new(pool),
        config: config.clone(),
    };

    let addr: SocketAddr = ([0, 0, 0, 0], config.server_port).into();
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on {addr}");
    axum::serve(listener, init_router(state)).await?;
    Ok(())
}
