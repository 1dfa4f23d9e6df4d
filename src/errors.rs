// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Activity Consumer
//!
//! `AmqpError` covers every broker-side failure (connection, topology, publish,
//! acknowledgement). `HandlerError` is what a message handler returns when it
//! could not process a message; any `HandlerError` sends the delivery into the
//! retry pipeline. `ConfigError` is raised while reading the environment.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error reading a delivery from the consumer stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// A publish call carried no messages
    #[error("nothing to publish, please provide job description")]
    NothingToPublish,

    /// A publish call targeted a worker without a topology
    #[error("invalid worker `{0}`")]
    UnknownWorker(String),
}

/// Failure reported by a message handler.
///
/// Every variant is recoverable from the dispatcher's point of view: the
/// delivery is rejected and handed to the retry orchestrator.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HandlerError {
    /// The envelope `data` did not match what the handler expects
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A referenced entity does not exist (yet)
    #[error("{0} not found")]
    NotFound(String),

    /// The persistence layer failed
    #[error("repository failure: {0}")]
    Repository(String),
}

/// Errors raised while loading configuration from the environment.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set
    #[error("missing environment variable `{0}`")]
    Missing(String),

    /// A variable is set to a value that cannot be parsed
    #[error("invalid value `{1}` for environment variable `{0}`")]
    Invalid(String, String),
}
