#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    config::Config,
    scheduler::Scheduler,
    server::{AppState, build_router},
};

pub mod auth;
pub mod callback;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod leader;
pub mod market;
pub mod metrics;
pub mod queue;
pub mod quota;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod types;

pub fn build_app(scheduler: Arc<Scheduler>) -> Result<axum::Router> {
    Ok(build_router(AppState::new(scheduler)?))
}

pub async fn serve(config: Config) -> Result<()> {
    let bind_addr = config.bind_addr;
    let service_name = config.service_name.clone();
    let scheduler = Scheduler::connect(config).await?;
    scheduler.boot().await;
    let background = scheduler.start();

    let listener = TcpListener::bind(bind_addr).await?;
    info!(
        service = %service_name,
        bind_addr = %bind_addr,
        instance_id = %scheduler.config().instance_id,
        shared = scheduler.is_shared(),
        "agent cycle scheduler listening"
    );
    axum::serve(listener, build_app(scheduler.clone())?)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await;
    for handle in background {
        if let Err(error) = handle.await {
            warn!(error = %error, "background task ended abnormally");
        }
    }
    info!(service = %service_name, "agent cycle scheduler stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
}
