// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Redelivery Subsystem
//!
//! This module provides the error type shared by every broker-facing operation.
//! The `AmqpError` enum covers connection bootstrap, topology declaration,
//! message publishing, delivery acknowledgment and consumption failures.
//!
//! Errors fall into two classes:
//! - fatal: surfaced synchronously to the caller at subscribe time
//!   (`TopologyConflict`, `TopologySetupFailed`, connection, uri and channel
//!   errors)
//! - transient: logged by the delivery loop, which keeps running and leaves
//!   redelivery to the broker (every other variant)

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// The connection settings do not form a valid AMQP URI
    #[error("invalid connection uri for host `{0}`")]
    InvalidUriError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// A resource already exists on the broker with different parameters
    #[error("conflicting declaration for `{0}`")]
    TopologyConflict(String),

    /// The retry topology could not be fully established
    #[error("failure to set up topology: {0}")]
    TopologySetupFailed(String),

    /// Error publishing a message
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl AmqpError {
    /// Whether the error must abort a subscription instead of being logged
    /// and left to broker redelivery.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AmqpError::TopologyConflict(_)
                | AmqpError::TopologySetupFailed(_)
                | AmqpError::ConnectionError
                | AmqpError::InvalidUriError(_)
                | AmqpError::ChannelError
        )
    }
}
