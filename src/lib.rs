pub(crate) mod api;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod schemas;
pub(crate) mod services;
pub(crate) mod store;
pub(crate) mod tasks;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use crate::core::{config::Settings, redis::RedisHandle, state::AppState, telemetry};
use crate::services::notifier::{JobEventSink, RedisNotifier};
use crate::store::postgres::PgStore;
use crate::store::Store;

pub async fn run() -> anyhow::Result<()> {
    let state = init_state().await?;

    core::bootstrap::ensure_admin_user(&state).await?;

    let app = api::router::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.settings().server_addr()).await?;

    tracing::info!(
        host = %state.settings().server_host(),
        port = state.settings().server_port(),
        environment = %state.settings().runtime().environment.as_str(),
        "Rubrica API listening"
    );

    let result =
        axum::serve(listener, app).with_graceful_shutdown(core::shutdown::shutdown_signal()).await;

    state.redis().disconnect().await;
    tracing::info!("Redis disconnected");

    result?;

    Ok(())
}

pub async fn run_worker() -> anyhow::Result<()> {
    let state = init_state().await?;

    tracing::info!(
        concurrency = state.settings().worker().concurrency,
        "Rubrica correction worker starting"
    );

    let result = tasks::scheduler::run(state.clone()).await;

    state.redis().disconnect().await;
    tracing::info!("Redis disconnected");

    result?;

    Ok(())
}

async fn init_state() -> anyhow::Result<AppState> {
    dotenvy::dotenv().ok();

    let settings = Settings::load()?;
    telemetry::init_tracing(&settings)?;
    core::metrics::init(&settings)?;

    let db_pool = db::init_pool(&settings).await?;
    db::run_migrations(&db_pool).await?;

    let redis = RedisHandle::new(settings.redis().redis_url());
    if let Err(err) = redis.connect().await {
        tracing::error!(error = %err, "Failed to connect to Redis; job events will be dropped");
    } else {
        tracing::info!("Redis connected successfully");
    }

    let store: Arc<dyn Store> = Arc::new(PgStore::new(db_pool));
    let events: Arc<dyn JobEventSink> = Arc::new(RedisNotifier::new(
        redis.clone(),
        settings.redis().events_channel.clone(),
    ));

    Ok(AppState::new(settings, store, redis, events))
}
