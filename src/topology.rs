// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module establishes the broker objects delayed redelivery relies on.
//!
//! The main components are:
//! - `Topology` trait: idempotent declare/bind primitives
//! - `AmqpTopology`: implementation of the primitives over a lapin channel
//! - `TopologyManager`: declares the retry topology of a topic, in order:
//!   dead-letter exchange, dead-letter queue and its binding, retry queue,
//!   main queue
//!
//! Re-declaring a resource with identical parameters is a no-op on the
//! broker. Re-declaring it with different parameters is a conflict, which is
//! fatal and never retried.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{dlq_name, dlx_name, retry_queue_name, QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    Channel,
};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{debug, error};

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Idempotent topology primitives.
///
/// Implementations return `AmqpError::TopologyConflict` when a resource of
/// the same name exists with different parameters.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Topology: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
pub struct AmqpTopology {
    channel: Arc<Channel>,
}

impl AmqpTopology {
    pub fn new(channel: Arc<Channel>) -> AmqpTopology {
        AmqpTopology { channel }
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                lapin::ExchangeKind::from(&def.kind),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) if is_precondition_failed(&err) => {
                error!(error = err.to_string(), name = def.name.as_str(), "conflicting exchange");
                Err(AmqpError::TopologyConflict(def.name.clone()))
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            Ok(_) => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                queue_arguments(def),
            )
            .await
        {
            Err(err) if is_precondition_failed(&err) => {
                error!(error = err.to_string(), name = def.name.as_str(), "conflicting queue");
                Err(AmqpError::TopologyConflict(def.name.clone()))
            }
            Err(err) => {
                error!(error = err.to_string(), name = def.name.as_str(), "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(_) => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            Ok(_) => Ok(()),
        }
    }
}

/// The broker answers a mismatching re-declaration with 406 PRECONDITION_FAILED.
fn is_precondition_failed(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(amqp) => matches!(
            amqp.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
        ),
        _ => false,
    }
}

/// Builds the `x-` arguments of a queue declaration.
pub(crate) fn queue_arguments(def: &QueueDefinition) -> FieldTable {
    let mut args = BTreeMap::new();

    if let Some(ttl) = def.ttl {
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(ttl.as_millis().min(i32::MAX as u128) as LongInt),
        );
    }

    if let Some(target) = &def.dead_letter {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(target.exchange.clone())),
        );

        if let Some(key) = &target.routing_key {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.clone())),
            );
        }
    }

    FieldTable::from(args)
}

/// Declares the retry topology of topics.
///
/// The retry delay is fixed per manager and becomes the TTL of every retry
/// queue it declares.
#[derive(Clone)]
pub struct TopologyManager {
    topology: Arc<dyn Topology>,
    retry_delay: Duration,
}

impl TopologyManager {
    pub fn new(topology: Arc<dyn Topology>, retry_delay: Duration) -> TopologyManager {
        TopologyManager {
            topology,
            retry_delay,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// `T.dlx`: durable direct exchange receiving rejected messages.
    pub fn dead_letter_exchange(&self, topic: &str) -> ExchangeDefinition {
        ExchangeDefinition::new(&dlx_name(topic))
            .kind(ExchangeKind::Direct)
            .durable()
    }

    /// `T.dlq`: terminal queue for messages that exhausted their retries.
    pub fn dead_letter_queue(&self, topic: &str) -> QueueDefinition {
        QueueDefinition::new(&dlq_name(topic)).durable()
    }

    /// Binds `T.dlq` to `T.dlx` with the routing key the main queue
    /// dead-letters with.
    pub fn dead_letter_binding(&self, topic: &str) -> QueueBinding {
        QueueBinding::new(&dlq_name(topic))
            .exchange(&dlx_name(topic))
            .routing_key(topic)
    }

    /// `T.retry`: expires messages after the retry delay into the default
    /// exchange with routing key `T`, i.e. back into the main queue.
    pub fn retry_queue(&self, topic: &str) -> QueueDefinition {
        QueueDefinition::new(&retry_queue_name(topic))
            .durable()
            .ttl(self.retry_delay)
            .dead_letter("", topic)
    }

    /// `T`: dead-letters explicitly rejected messages into `T.dlx`.
    pub fn main_queue(&self, topic: &str) -> QueueDefinition {
        QueueDefinition::new(topic)
            .durable()
            .dead_letter(&dlx_name(topic), topic)
    }

    /// Declares the full retry topology of `topic`.
    ///
    /// # Returns
    /// * `Ok(())` - every resource exists with the expected parameters
    /// * `Err(AmqpError::TopologyConflict)` - a resource exists with different parameters
    /// * `Err(AmqpError::TopologySetupFailed)` - any other declaration failed; the
    ///   topology is partial and must not be consumed from
    pub async fn ensure(&self, topic: &str) -> Result<(), AmqpError> {
        debug!(topic, "ensuring retry topology");

        self.topology
            .declare_exchange(&self.dead_letter_exchange(topic))
            .await
            .map_err(|err| setup_failure(topic, err))?;

        self.topology
            .declare_queue(&self.dead_letter_queue(topic))
            .await
            .map_err(|err| setup_failure(topic, err))?;

        self.topology
            .bind_queue(&self.dead_letter_binding(topic))
            .await
            .map_err(|err| setup_failure(topic, err))?;

        self.topology
            .declare_queue(&self.retry_queue(topic))
            .await
            .map_err(|err| setup_failure(topic, err))?;

        self.topology
            .declare_queue(&self.main_queue(topic))
            .await
            .map_err(|err| setup_failure(topic, err))?;

        debug!(topic, "retry topology ready");
        Ok(())
    }
}

fn setup_failure(topic: &str, err: AmqpError) -> AmqpError {
    error!(error = err.to_string(), topic, "failure to set up retry topology");

    match err {
        AmqpError::TopologyConflict(name) => AmqpError::TopologyConflict(name),
        other => AmqpError::TopologySetupFailed(other.to_string()),
    }
}
