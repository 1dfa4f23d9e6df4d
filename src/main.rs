// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use activity_consumer::{
    activity::{ActivityLoggingHandler, ActivityService, PgActivityRepository},
    configs::Configs,
    connection::ConnectionManager,
    dispatcher::HandlerRegistry,
    errors::ConfigError,
    handler::EventKey,
    observability,
    topology::{TopologyNames, Worker},
    worker::QueueWorker,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = Configs::from_env()?;
    observability::init_logging();

    let database_url = cfg
        .database
        .url
        .clone()
        .ok_or_else(|| ConfigError::Missing("DATABASE_URL".to_owned()))?;

    let pool = PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .connect(&database_url)
        .await
        .inspect_err(|err| error!(error = err.to_string(), "failure to connect to postgres"))?;
    info!(max_connections = cfg.database.max_connections, "postgres pool ready");

    let repository = Arc::new(PgActivityRepository::new(pool));
    let service = Arc::new(ActivityService::new(repository.clone(), repository));

    let registry = HandlerRegistry::new()
        .register(EventKey::log_activity(), ActivityLoggingHandler::new(service));

    let names = TopologyNames::new(&cfg.rabbitmq.queue_prefix, Worker::Activity);
    let worker = QueueWorker::new(names, registry, cfg.worker.clone(), &cfg.app.name);

    info!(
        queue = worker.names().queue(),
        max_retries = cfg.worker.max_retries,
        policy = ?cfg.worker.exhaustion_policy,
        "starting activity worker"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    ConnectionManager::new(cfg.rabbitmq.clone(), &cfg.app.name)
        .run(&worker, shutdown_rx)
        .await?;

    info!("activity worker stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = term.recv() => {},
            }
        }
        Err(err) => {
            error!(error = err.to_string(), "failure to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
