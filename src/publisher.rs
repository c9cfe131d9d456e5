// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module publishes messages straight into named queues through the
//! default exchange. The same path is used by producers and by the delivery
//! loop when it republishes a failed message to a retry queue.

use crate::{
    errors::AmqpError,
    message::{to_amqp_headers, Message},
    otel,
};
use async_trait::async_trait;
use lapin::{
    options::BasicPublishOptions,
    types::{FieldTable, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::Context;
use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode of messages that survive a broker restart
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Fire-and-forget publication to a named destination.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `message` to the queue named `to`, propagating `ctx`.
    async fn publish(&self, ctx: &Context, to: &str, message: &Message) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Publisher trait.
pub struct RabbitMQPublisher {
    channel: Arc<Channel>,
    timeout: Duration,
}

impl RabbitMQPublisher {
    /// Creates a new RabbitMQ publisher.
    ///
    /// # Parameters
    /// * `channel` - A channel to the RabbitMQ server, not shared with a consumer
    /// * `timeout` - Upper bound on a single publication
    pub fn new(channel: Arc<Channel>, timeout: Duration) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { channel, timeout })
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish(&self, ctx: &Context, to: &str, message: &Message) -> Result<(), AmqpError> {
        let mut outbound = message.clone();
        otel::inject(ctx, &mut outbound);

        let publishing = self.channel.basic_publish(
            "",
            to,
            BasicPublishOptions {
                immediate: false,
                mandatory: false,
            },
            &outbound.payload,
            properties(&outbound),
        );

        match tokio::time::timeout(self.timeout, publishing).await {
            Err(_) => {
                error!(to, timeout_ms = self.timeout.as_millis() as u64, "publish timed out");
                Err(AmqpError::PublishingError(to.to_owned()))
            }
            Ok(Err(err)) => {
                error!(error = err.to_string(), to, "error publishing message");
                Err(AmqpError::PublishingError(to.to_owned()))
            }
            Ok(Ok(_)) => {
                debug!(to, "message published");
                Ok(())
            }
        }
    }
}

/// AMQP properties of an outbound message.
pub(crate) fn properties(message: &Message) -> BasicProperties {
    let id = message
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let timestamp = message.timestamp.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default()
    });

    BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_message_id(ShortString::from(id))
        .with_timestamp(timestamp)
        .with_headers(FieldTable::from(to_amqp_headers(&message.headers)))
}
