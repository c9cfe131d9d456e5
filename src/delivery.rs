// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Inbound Deliveries
//!
//! A [`Delivery`] is one broker-provided instance of a message together with
//! its completion actions. A [`DeliverySource`] turns a queue into a lazy
//! stream of deliveries; the lapin implementation is [`AmqpSource`].

use crate::{
    errors::AmqpError,
    message::{from_amqp_headers, Message},
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    acker::Acker,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
    BasicProperties, Channel,
};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Completion actions of a delivery. Exactly one of them should be invoked.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Positive acknowledgment of this delivery only.
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Rejects the delivery and puts it back on its queue.
    async fn nack_requeue(&self) -> Result<(), AmqpError>;

    /// Rejects the delivery without requeue; the queue dead-letters it.
    async fn nack_discard(&self) -> Result<(), AmqpError>;
}

/// One inbound delivery.
pub struct Delivery {
    pub message: Message,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(message: Message, acker: Box<dyn Acknowledger>) -> Self {
        Delivery {
            message,
            redelivered: false,
            acker,
        }
    }

    pub fn acker(&self) -> &dyn Acknowledger {
        self.acker.as_ref()
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

/// Lazy, potentially infinite sequence of deliveries. Errors are per item and
/// do not end the stream.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliverySource: Send + Sync {
    /// Starts consuming `queue`. Calling it again after the stream ended
    /// resubscribes.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, AmqpError>;
}

/// Acknowledger backed by a lapin delivery.
pub struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        match self.acker.ack(BasicAckOptions { multiple: false }).await {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            Ok(_) => Ok(()),
        }
    }

    async fn nack_requeue(&self) -> Result<(), AmqpError> {
        self.nack(true).await
    }

    async fn nack_discard(&self) -> Result<(), AmqpError> {
        self.nack(false).await
    }
}

impl AmqpAcker {
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        match self
            .acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), requeue, "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            Ok(_) => Ok(()),
        }
    }
}

/// Builds a message out of the body and properties of a lapin delivery.
pub(crate) fn message_from_parts(data: Vec<u8>, props: &BasicProperties) -> Message {
    Message {
        id: props.message_id().as_ref().map(|id| id.to_string()),
        payload: data,
        headers: props
            .headers()
            .as_ref()
            .map(|table| from_amqp_headers(table.inner()))
            .unwrap_or_default(),
        timestamp: *props.timestamp(),
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        let message = message_from_parts(delivery.data, &delivery.properties);

        Delivery {
            message,
            redelivered: delivery.redelivered,
            acker: Box::new(AmqpAcker {
                acker: delivery.acker,
            }),
        }
    }
}

/// Consumes queues over a lapin channel.
pub struct AmqpSource {
    channel: Arc<Channel>,
    prefetch_count: u16,
}

impl AmqpSource {
    /// # Parameters
    /// * `channel` - channel owned by the subscription
    /// * `prefetch_count` - unacknowledged deliveries the broker may push ahead
    pub fn new(channel: Arc<Channel>, prefetch_count: u16) -> Self {
        AmqpSource {
            channel,
            prefetch_count,
        }
    }
}

#[async_trait]
impl DeliverySource for AmqpSource {
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, AmqpError> {
        if let Err(err) = self
            .channel
            .basic_qos(self.prefetch_count, BasicQosOptions { global: false })
            .await
        {
            error!(error = err.to_string(), "failure to configure qos");
            return Err(AmqpError::QoSDeclarationError(err.to_string()));
        }

        let consumer_tag = format!("{queue}-{}", Uuid::new_v4());

        let consumer = match self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        debug!(queue, consumer_tag = consumer_tag.as_str(), "consumer created");

        Ok(consumer
            .map(|result| {
                result
                    .map(Delivery::from)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }
}
