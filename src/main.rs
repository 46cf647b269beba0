use std::net::SocketAddr;

use dotenvy::dotenv;
use tracing::info;

use entitlement_sync::infra::{
    app::create_app,
    config::AppConfig,
    error::InfraError,
    lapse_sweeper::run_lapse_sweep_loop,
    setup::{init_app_state, init_tracing},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let config = AppConfig::from_env()?;
    init_tracing(config.log_file.as_deref());

    let app_state = init_app_state(&config).await?;

    let app = create_app(app_state.clone(), config.cors_origin.clone());

    // Lapse sweeper runs after tracing is initialized
    let reconciliation = app_state.reconciliation.clone();
    let every = config.lapse_sweep_interval;
    let lookahead = config.lapse_lookahead;
    tokio::spawn(async move {
        run_lapse_sweep_loop(reconciliation, every, lookahead).await;
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .map_err(InfraError::TcpBind)?;

    info!("Backend listening at {}", &listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(InfraError::Server)?;

    Ok(())
}
