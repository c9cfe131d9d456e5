// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! User code plugged into a subscription. A handler either succeeds, and the
//! delivery is acknowledged, or returns a [`HandlerError`], which sends the
//! message down the retry path.

use crate::{message::Message, shutdown::ShutdownSignal};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{future::Future, marker::PhantomData};
use thiserror::Error;

/// Failure reported by a handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(reason: impl std::fmt::Display) -> Self {
        HandlerError(reason.to_string())
    }

    pub fn reason(&self) -> &str {
        &self.0
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::new(err)
    }
}

/// What a handler receives for each delivery.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerMessage<'m> {
    pub topic: &'m str,
    pub retry_count: u32,
    pub message: &'m Message,
    /// Fires when the subscription is cancelled; pass it to
    /// [`crate::retry::execute`] so in-process retries stop waiting.
    pub shutdown: &'m ShutdownSignal,
}

#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage<'_>) -> Result<(), HandlerError>;
}

/// Handler built from an async closure over an owned [`Message`].
pub struct HandlerFn<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wraps an async closure as a [`ConsumerHandler`].
///
/// ```ignore
/// let handler = handler_fn(|msg: Message| async move {
///     let order: Order = msg.decode_json()?;
///     store(order).await.map_err(HandlerError::new)
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    HandlerFn {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> ConsumerHandler for HandlerFn<F, Fut>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage<'_>) -> Result<(), HandlerError> {
        (self.f)(msg.message.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closure_handlers_see_the_message() {
        let handler = handler_fn(|msg: Message| async move {
            if msg.payload == b"ok" {
                Ok(())
            } else {
                Err(HandlerError::new(format!("bad payload of {} bytes", msg.payload.len())))
            }
        });

        let signal = ShutdownSignal::never();
        let good = Message::new("ok");
        let bad = Message::new("nope");

        let ok = ConsumerMessage {
            topic: "orders",
            retry_count: 0,
            message: &good,
            shutdown: &signal,
        };
        assert!(handler.exec(&Context::new(), &ok).await.is_ok());

        let failing = ConsumerMessage { message: &bad, ..ok };
        let err = handler.exec(&Context::new(), &failing).await.unwrap_err();
        assert_eq!(err.reason(), "bad payload of 4 bytes");
    }

    #[test]
    fn json_errors_become_handler_errors() {
        let err = Message::new("{").decode_json::<u32>().unwrap_err();
        let err: HandlerError = err.into();
        assert!(!err.reason().is_empty());
    }
}
