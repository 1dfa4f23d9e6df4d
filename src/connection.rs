// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! [`new_amqp_channel`] opens one connection and a channel on it, and
//! [`AmqpConnector`] wraps that as a [`Connector`].
//! [`ConnectionManager`] keeps the worker attached to the broker: it connects,
//! hands the session to a [`ChannelSetup`], and when the setup ends (channel or
//! connection lost, declaration mismatch, consumer cancelled) it reconnects
//! after an exponential backoff. Only the shutdown signal stops it.

use crate::{configs::RabbitMQConfigs, errors::AmqpError};
use async_trait::async_trait;
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Creates a connection named `app_name` and a channel on it.
pub async fn new_amqp_channel(
    cfg: &RabbitMQConfigs,
    app_name: &str,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!("creating amqp connection...");
    let options =
        ConnectionProperties::default().with_connection_name(LongString::from(app_name.to_owned()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), host = cfg.host.as_str(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}

/// An open connection and the channel the worker runs on.
pub struct AmqpSession {
    connection: Arc<Connection>,
    channel: Arc<Channel>,
}

impl AmqpSession {
    pub fn channel(&self) -> Arc<Channel> {
        self.channel.clone()
    }
}

/// Opens broker sessions for the [`ConnectionManager`].
#[cfg_attr(test, mockall::automock(type Session = ();))]
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: Send + Sync + 'static;

    /// Opens a connection and a channel on it.
    async fn connect(&self) -> Result<Arc<Self::Session>, AmqpError>;

    /// Closes the connection behind `session` if it is still open.
    async fn disconnect(&self, session: &Self::Session, reason: &str);
}

/// [`Connector`] backed by a lapin connection to the configured broker.
pub struct AmqpConnector {
    cfg: RabbitMQConfigs,
    app_name: String,
}

impl AmqpConnector {
    pub fn new(cfg: RabbitMQConfigs, app_name: &str) -> AmqpConnector {
        AmqpConnector {
            cfg,
            app_name: app_name.to_owned(),
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Session = AmqpSession;

    async fn connect(&self) -> Result<Arc<AmqpSession>, AmqpError> {
        let (connection, channel) = new_amqp_channel(&self.cfg, &self.app_name).await?;

        info!(
            host = self.cfg.host.as_str(),
            connection = self.app_name.as_str(),
            "connected to rabbitmq"
        );
        connection.on_error(|err| {
            error!(error = err.to_string(), "rabbitmq connection lost");
        });

        Ok(Arc::new(AmqpSession {
            connection,
            channel,
        }))
    }

    async fn disconnect(&self, session: &AmqpSession, reason: &str) {
        close(&session.connection, reason).await;
    }
}

/// Work attached to every freshly opened session.
#[async_trait]
pub trait ChannelSetup<S: Send + Sync + 'static>: Send + Sync {
    /// Declares what the worker needs and consumes until the channel goes away.
    ///
    /// Returning, with or without an error, makes the manager reconnect.
    async fn setup(&self, session: Arc<S>) -> Result<(), AmqpError>;
}

/// Delay before the n-th consecutive reconnect attempt: `initial * 2^n`,
/// never more than `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> ReconnectBackoff {
        ReconnectBackoff {
            initial,
            max: max.max(initial),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

pub struct ConnectionManager<K> {
    connector: K,
    backoff: ReconnectBackoff,
}

enum Attempt<S> {
    Connected(Arc<S>),
    Failed,
    Shutdown,
}

impl ConnectionManager<AmqpConnector> {
    /// Manager for the broker in `cfg`, using its reconnect delays.
    pub fn new(cfg: RabbitMQConfigs, app_name: &str) -> ConnectionManager<AmqpConnector> {
        let backoff = ReconnectBackoff::new(cfg.reconnect_initial, cfg.reconnect_max);
        ConnectionManager::with_connector(AmqpConnector::new(cfg, app_name), backoff)
    }
}

impl<K: Connector> ConnectionManager<K> {
    pub fn with_connector(connector: K, backoff: ReconnectBackoff) -> ConnectionManager<K> {
        ConnectionManager { connector, backoff }
    }

    /// Runs `setup` on a session until `shutdown` flips to `true` (or its
    /// sender is dropped).
    ///
    /// Connection failures are never returned: they are logged and retried
    /// forever. The backoff starts over after every successful connect. On
    /// shutdown the connection is closed, which ends consumption, and the
    /// running setup is awaited so the in-flight delivery finishes.
    pub async fn run<T>(&self, setup: &T, mut shutdown: watch::Receiver<bool>) -> Result<(), AmqpError>
    where
        T: ChannelSetup<K::Session> + ?Sized,
    {
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                info!("shutdown requested before connecting");
                return Ok(());
            }

            let attempt = tokio::select! {
                result = self.connector.connect() => match result {
                    Ok(session) => Attempt::Connected(session),
                    Err(_) => Attempt::Failed,
                },
                _ = shutdown_requested(&mut shutdown) => Attempt::Shutdown,
            };

            let session = match attempt {
                Attempt::Connected(session) => session,
                Attempt::Shutdown => return Ok(()),
                Attempt::Failed => {
                    if self.pause(failures, &mut shutdown).await {
                        return Ok(());
                    }
                    failures = failures.saturating_add(1);
                    continue;
                }
            };

            failures = 0;

            let mut running = setup.setup(session.clone());
            let stopping = tokio::select! {
                result = &mut running => {
                    match result {
                        Ok(()) => warn!("consumer stream ended"),
                        Err(err) => error!(error = err.to_string(), "channel setup failed"),
                    }
                    false
                },
                _ = shutdown_requested(&mut shutdown) => true,
            };

            if stopping {
                info!("shutting down, closing rabbitmq connection");
                self.connector.disconnect(&session, "shutdown").await;
                if let Err(err) = running.await {
                    debug!(error = err.to_string(), "consumer drained with error");
                }
                info!("rabbitmq connection closed");
                return Ok(());
            }

            drop(running);
            self.connector.disconnect(&session, "reconnecting").await;
            warn!("disconnected from rabbitmq");

            if self.pause(failures, &mut shutdown).await {
                return Ok(());
            }
            failures = failures.saturating_add(1);
        }
    }

    /// Waits out the backoff delay; `true` when shutdown came first.
    async fn pause(&self, attempt: u32, shutdown: &mut watch::Receiver<bool>) -> bool {
        let delay = self.backoff.delay(attempt);
        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = attempt + 1,
            "reconnecting to rabbitmq"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = shutdown_requested(shutdown) => true,
        }
    }
}

async fn close(conn: &Connection, reason: &str) {
    if !conn.status().connected() {
        return;
    }

    if let Err(err) = conn.close(200, reason).await {
        debug!(error = err.to_string(), "failure to close connection");
    }
}

/// Resolves once shutdown is signalled; a dropped sender counts as a signal.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        debug!("shutdown sender dropped");
    }
}
