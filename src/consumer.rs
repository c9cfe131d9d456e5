// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Per-Delivery Processing
//!
//! Drives one delivery from receipt to its terminal broker action:
//! 1. Reads the retry count from the message headers
//! 2. Opens a consumer span under the propagated trace context
//! 3. Runs the handler
//! 4. Classifies the result
//! 5. Acks, republishes to the retry queue then acks, or rejects into the
//!    dead-letter queue

use crate::{
    delivery::Delivery,
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage},
    otel,
    outcome::DeliveryOutcome,
    publisher::Publisher,
    queue::retry_queue_name,
    shutdown::ShutdownSignal,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, warn};

/// Everything a subscription needs to process its deliveries.
#[derive(Clone)]
pub(crate) struct ConsumerRoute {
    pub(crate) topic: String,
    pub(crate) retry_queue: String,
    pub(crate) max_retries: u32,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
    pub(crate) publisher: Arc<dyn Publisher>,
}

impl ConsumerRoute {
    pub(crate) fn new(
        topic: &str,
        max_retries: u32,
        handler: Arc<dyn ConsumerHandler>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        ConsumerRoute {
            topic: topic.to_owned(),
            retry_queue: retry_queue_name(topic),
            max_retries,
            handler,
            publisher,
        }
    }
}

/// Processes one delivery and performs the broker action its outcome calls
/// for.
///
/// # Returns
/// The outcome acted upon, or the broker error that prevented the action. A
/// failed republish requeues the delivery so the broker redelivers it.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    route: &ConsumerRoute,
    shutdown: &ShutdownSignal,
) -> Result<DeliveryOutcome, AmqpError> {
    let retry_count = delivery.message.retry_count();
    let (ctx, mut span) = otel::new_span(&delivery.message, tracer, &route.topic);

    debug!(
        topic = route.topic.as_str(),
        retry_count,
        redelivered = delivery.redelivered,
        "received"
    );

    let msg = ConsumerMessage {
        topic: &route.topic,
        retry_count,
        message: &delivery.message,
        shutdown,
    };

    let result = route.handler.exec(&ctx, &msg).await;
    if let Err(err) = &result {
        span.record_error(err);
    }

    let outcome = DeliveryOutcome::classify(&result, retry_count, route.max_retries);

    let acted = match outcome {
        DeliveryOutcome::Ack => {
            debug!("message successfully processed");
            delivery.acker().ack().await
        }
        DeliveryOutcome::RetryDelayed => {
            warn!(
                topic = route.topic.as_str(),
                retry_count,
                max_retries = route.max_retries,
                "error whiling handling msg, sending to retry queue"
            );

            let next = delivery.message.with_retry_count(retry_count + 1);
            match route
                .publisher
                .publish(&ctx, &route.retry_queue, &next)
                .await
            {
                Err(err) => {
                    // back onto the main queue with the unchanged retry count
                    if let Err(nack) = delivery.acker().nack_requeue().await {
                        error!(error = nack.to_string(), "failure to requeue msg");
                    }
                    Err(err)
                }
                Ok(()) => delivery.acker().ack().await,
            }
        }
        DeliveryOutcome::DeadLetter => {
            error!(
                topic = route.topic.as_str(),
                retry_count,
                max_retries = route.max_retries,
                "too many attempts, sending to dlq"
            );
            delivery.acker().nack_discard().await
        }
    };

    match acted {
        Err(err) => {
            error!(error = err.to_string(), ?outcome, "failure to complete delivery");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("failure to complete delivery"),
            });
            Err(err)
        }
        Ok(()) => {
            match outcome {
                DeliveryOutcome::Ack => span.set_status(Status::Ok),
                _ => span.set_status(Status::Error {
                    description: Cow::from("handler failure"),
                }),
            }
            Ok(outcome)
        }
    }
}
