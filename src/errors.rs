// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! The error type shared by every component of the crate.

use thiserror::Error;

/// Failures of broker operations.
///
/// `ConnectionError` is retried by the connection manager and never surfaces
/// during startup. Declaration failures are broker protocol errors, such as a
/// queue redeclared with different flags, and always reach the caller.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    #[error("internal error")]
    InternalError,

    #[error("failure to connect")]
    ConnectionError,

    #[error("failure to create a channel")]
    ChannelError,

    #[error("invalid configuration `{0}`")]
    ConfigurationError(String),

    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    #[error("failure to cancel consumer `{0}`")]
    ConsumerCancelError(String),

    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The broker ended a delivery stream without a stop being requested
    #[error("consumer of `{0}` closed by the broker")]
    ConsumerClosed(String),

    #[error("failure to publish")]
    PublishingError,

    #[error("failure to serialize payload `{0}`")]
    SerializationError(String),

    #[error("failure to parse payload `{0}`")]
    InvalidPayload(String),

    #[error("failure to ack message")]
    AckMessageError,

    #[error("failure to nack message")]
    NackMessageError,

    #[error("failure to reject message")]
    RejectMessageError,

    /// Channel or connection accessed before setup or after teardown
    #[error("rabbitmq is not initialized")]
    NotInitialized,

    #[error("rabbitmq already initialized")]
    AlreadyInitialized,

    /// Work submitted to a task counter after draining began
    #[error("task counter is stopped")]
    StoppedCounter,

    #[error("no exchange `{0}`")]
    MissingExchange(String),

    /// A reply arrived for an unknown or expired correlation id
    #[error("no pending call for correlation id `{0}`")]
    MissingCorrelation(String),

    #[error("response timeout")]
    Timeout,
}

impl AmqpError {
    /// Whether the error is a transport-level failure worth retrying.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, AmqpError::ConnectionError)
    }
}

impl From<config::ConfigError> for AmqpError {
    fn from(err: config::ConfigError) -> Self {
        AmqpError::ConfigurationError(err.to_string())
    }
}

impl From<serde_json::Error> for AmqpError {
    fn from(err: serde_json::Error) -> Self {
        AmqpError::SerializationError(err.to_string())
    }
}
