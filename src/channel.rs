// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels. The
//! dial is retried a few times with a fixed delay before giving up.

use crate::{
    backoff::BackoffConfig,
    configs::AmqpConfigs,
    errors::AmqpError,
    retry::{self, RetryError},
    shutdown::ShutdownSignal,
};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};

/// Dial attempts before the connection is reported as failed
pub const CONNECT_ATTEMPTS: u32 = 3;
/// Pause between dial attempts
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Creates a new AMQP connection and a channel on it.
///
/// Fails with `InvalidUriError` without dialing when the settings do not form
/// a URI.
///
/// # Parameters
/// * `cfg` - RabbitMQ connection details
/// * `shutdown` - aborts the wait between dial attempts
///
/// # Returns
/// * `Result<(Arc<Connection>, Arc<Channel>), AmqpError>` -
///   the connection and channel on success, or an error on failure.
///
/// # Example
/// ```ignore
/// let (conn, channel) = new_amqp_channel(&AmqpConfigs::from_env(), &ShutdownSignal::never()).await?;
/// ```
pub async fn new_amqp_channel(
    cfg: &AmqpConfigs,
    shutdown: &ShutdownSignal,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    let conn = connect(cfg, shutdown).await?;

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

/// Opens one more channel on an existing connection, e.g. to keep publishing
/// and consuming on separate channels.
pub async fn new_channel(conn: &Connection) -> Result<Arc<Channel>, AmqpError> {
    match conn.create_channel().await {
        Ok(c) => Ok(Arc::new(c)),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}

async fn connect(cfg: &AmqpConfigs, shutdown: &ShutdownSignal) -> Result<Connection, AmqpError> {
    debug!("creating amqp connection...");
    let uri = match cfg.uri() {
        Ok(uri) => uri,
        Err(err) => {
            error!(error = err.to_string(), "invalid connection settings");
            return Err(err);
        }
    };
    let policy = BackoffConfig::fixed(CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY);

    let dialed = retry::execute(shutdown, &policy, || {
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.app_name.clone()));
        Connection::connect(&uri, options)
    })
    .await;

    match dialed {
        Ok(conn) => {
            debug!("amqp connected");
            Ok(conn)
        }
        Err(RetryError::Cancelled) => {
            error!("connection attempt cancelled");
            Err(AmqpError::ConnectionError)
        }
        Err(RetryError::Operation(err)) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }
}
