// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! Entry point of the redelivery subsystem. `subscribe` opens a broker
//! session of its own, establishes the retry topology of a topic, starts
//! consuming its main queue and hands the stream to a delivery loop running as
//! one background task per subscription.
//!
//! Each subscription owns its channel: a declaration conflict closes only the
//! channel of the subscription that caused it, and the consumer of another
//! topic keeps running.
//!
//! The loop processes one delivery at a time, so handling order follows
//! queue order on a best-effort basis; messages coming back from the retry
//! queue re-enter at the tail. Per-message failures are logged and never end
//! the subscription. Cancelling the subscription lets the in-flight delivery
//! finish its broker action before the loop stops pulling.

use crate::{
    backoff::BackoffConfig,
    channel::new_channel,
    configs::SubscriptionConfigs,
    consumer::{consume, ConsumerRoute},
    delivery::{AmqpSource, DeliverySource, DeliveryStream},
    errors::AmqpError,
    handler::ConsumerHandler,
    otel,
    publisher::{Publisher, RabbitMQPublisher},
    retry::{self, RetryError},
    shutdown::{Shutdown, ShutdownSignal},
    topology::{AmqpTopology, Topology, TopologyManager},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::Connection;
use opentelemetry::global;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Broker primitives bound to one channel.
#[derive(Clone)]
pub struct BrokerSession {
    pub topology: Arc<dyn Topology>,
    pub publisher: Arc<dyn Publisher>,
    pub source: Arc<dyn DeliverySource>,
}

/// Opens broker sessions. Every subscription gets a fresh one, and the
/// delivery loop opens another when its stream cannot be resumed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<BrokerSession, AmqpError>;
}

/// Opens one lapin channel per session on a shared connection.
pub struct AmqpSessionFactory {
    conn: Arc<Connection>,
    configs: SubscriptionConfigs,
}

impl AmqpSessionFactory {
    pub fn new(conn: Arc<Connection>, configs: SubscriptionConfigs) -> Self {
        AmqpSessionFactory { conn, configs }
    }
}

#[async_trait]
impl SessionFactory for AmqpSessionFactory {
    async fn open(&self) -> Result<BrokerSession, AmqpError> {
        let channel = new_channel(&self.conn).await?;
        debug!(channel_id = channel.id(), "session channel opened");

        Ok(BrokerSession {
            topology: Arc::new(AmqpTopology::new(channel.clone())),
            publisher: RabbitMQPublisher::new(channel.clone(), self.configs.publish_timeout),
            source: Arc::new(AmqpSource::new(channel, self.configs.prefetch_count)),
        })
    }
}

/// Hands out the same primitives to every subscription.
struct SharedSession(BrokerSession);

#[async_trait]
impl SessionFactory for SharedSession {
    async fn open(&self) -> Result<BrokerSession, AmqpError> {
        Ok(self.0.clone())
    }
}

/// Subscribes handlers to topics.
pub struct RabbitMQDispatcher {
    sessions: Arc<dyn SessionFactory>,
    configs: SubscriptionConfigs,
}

impl RabbitMQDispatcher {
    /// Creates a dispatcher opening a channel of its own for every
    /// subscription on `conn`. Producers should use yet another channel.
    pub fn new(conn: Arc<Connection>, configs: SubscriptionConfigs) -> Self {
        let sessions = Arc::new(AmqpSessionFactory::new(conn, configs.clone()));
        Self::with_sessions(sessions, configs)
    }

    pub fn with_sessions(sessions: Arc<dyn SessionFactory>, configs: SubscriptionConfigs) -> Self {
        RabbitMQDispatcher { sessions, configs }
    }

    /// Creates a dispatcher whose subscriptions all share the given
    /// primitives, e.g. an in-memory broker.
    pub fn with_broker(
        topology: Arc<dyn Topology>,
        publisher: Arc<dyn Publisher>,
        source: Arc<dyn DeliverySource>,
        configs: SubscriptionConfigs,
    ) -> Self {
        let session = BrokerSession {
            topology,
            publisher,
            source,
        };
        Self::with_sessions(Arc::new(SharedSession(session)), configs)
    }

    /// Starts delivering messages of `topic` to `handler`.
    ///
    /// A failed message is redelivered through the retry queue up to
    /// `max_retries` times, then dead-lettered.
    ///
    /// # Returns
    /// Once the topology is in place and the consumer is registered, a handle
    /// on the running subscription; otherwise the setup error, in which case
    /// nothing is consumed.
    pub async fn subscribe(
        &self,
        topic: &str,
        max_retries: u32,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<Subscription, AmqpError> {
        let session = match self.sessions.open().await {
            Err(err) => {
                error!(error = err.to_string(), topic, "failure to open session");
                Err(err)
            }
            Ok(s) => Ok(s),
        }?;

        TopologyManager::new(session.topology.clone(), self.configs.retry_delay)
            .ensure(topic)
            .await?;

        let stream = match session.source.consume(topic).await {
            Err(err) => {
                error!(error = err.to_string(), topic, "failure to subscribe");
                Err(err)
            }
            Ok(s) => Ok(s),
        }?;

        let shutdown = Shutdown::new();
        let delivery_loop = DeliveryLoop {
            route: ConsumerRoute::new(topic, max_retries, handler, session.publisher.clone()),
            source: session.source,
            sessions: self.sessions.clone(),
            resubscribe: self.configs.resubscribe.clone(),
            shutdown: shutdown.signal(),
        };

        debug!(topic, max_retries, "subscribed");

        Ok(Subscription {
            topic: topic.to_owned(),
            handle: tokio::spawn(delivery_loop.run(stream)),
            shutdown,
        })
    }
}

/// Handle on a running subscription.
///
/// Dropping the handle detaches the delivery loop, which then runs until its
/// delivery stream can no longer be resubscribed.
pub struct Subscription {
    topic: String,
    shutdown: Shutdown,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The subscription's cancellation signal, as handed to its handler.
    pub fn signal(&self) -> ShutdownSignal {
        self.shutdown.signal()
    }

    /// Asks the delivery loop to stop after the in-flight delivery.
    pub fn cancel(&self) {
        debug!(topic = self.topic.as_str(), "cancelling subscription");
        self.shutdown.trigger();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the delivery loop to end.
    pub async fn closed(self) -> Result<(), AmqpError> {
        let Subscription {
            topic,
            shutdown,
            handle,
        } = self;

        let joined = handle.await;
        drop(shutdown);

        joined.map_err(|err| {
            error!(error = err.to_string(), topic = topic.as_str(), "delivery loop failure");
            AmqpError::InternalError
        })
    }

    /// Cancels the subscription and waits for the delivery loop to end.
    pub async fn close(self) -> Result<(), AmqpError> {
        self.cancel();
        self.closed().await
    }
}

struct DeliveryLoop {
    route: ConsumerRoute,
    source: Arc<dyn DeliverySource>,
    sessions: Arc<dyn SessionFactory>,
    resubscribe: BackoffConfig,
    shutdown: ShutdownSignal,
}

impl DeliveryLoop {
    async fn run(mut self, mut stream: DeliveryStream) {
        let tracer = global::tracer(otel::CONSUMER_TRACER);

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    if let Err(err) = consume(&tracer, &delivery, &self.route, &self.shutdown).await {
                        error!(error = err.to_string(), "error consume msg");
                    }
                }
                Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),
                None => match self.resubscribe().await {
                    Some(resumed) => stream = resumed,
                    None => break,
                },
            }
        }

        debug!(topic = self.route.topic.as_str(), "delivery loop stopped");
    }

    /// Consumes again, first on the current session and then on fresh ones,
    /// since the stream usually ends because its channel was closed.
    async fn resubscribe(&mut self) -> Option<DeliveryStream> {
        if self.shutdown.is_triggered() {
            return None;
        }

        let topic = self.route.topic.clone();
        warn!(topic = topic.as_str(), "delivery stream ended, resubscribing");

        if let Ok(stream) = self.source.consume(&topic).await {
            return Some(stream);
        }

        let sessions = &self.sessions;
        let queue = topic.as_str();
        let resumed = retry::execute(&self.shutdown, &self.resubscribe, move || async move {
            let session = sessions.open().await?;
            let stream = session.source.consume(queue).await?;
            Ok::<_, AmqpError>((session, stream))
        })
        .await;

        match resumed {
            Ok((session, stream)) => {
                self.source = session.source;
                self.route.publisher = session.publisher;
                Some(stream)
            }
            Err(RetryError::Cancelled) => None,
            Err(RetryError::Operation(err)) => {
                error!(
                    error = err.to_string(),
                    topic = topic.as_str(),
                    "failure to resubscribe, subscription stopped"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        delivery::{Delivery, MockAcknowledger, MockDeliverySource},
        handler::{handler_fn, HandlerError},
        message::Message,
        publisher::MockPublisher,
        topology::MockTopology,
    };
    use futures_util::stream;
    use mockall::Sequence;
    use std::{
        sync::{
            atomic::{AtomicU32, Ordering},
            Mutex,
        },
        time::Duration,
    };
    use tokio::sync::mpsc;

    fn ready_topology() -> MockTopology {
        let mut topology = MockTopology::new();
        topology.expect_declare_exchange().returning(|_| Ok(()));
        topology.expect_declare_queue().returning(|_| Ok(()));
        topology.expect_bind_queue().returning(|_| Ok(()));
        topology
    }

    fn conflicting_topology(resource: &'static str) -> MockTopology {
        let mut topology = MockTopology::new();
        topology
            .expect_declare_exchange()
            .returning(move |_| Err(AmqpError::TopologyConflict(resource.to_owned())));
        topology
    }

    fn pending_source() -> MockDeliverySource {
        let mut source = MockDeliverySource::new();
        source.expect_consume().returning(|_| {
            let pending: DeliveryStream = stream::pending().boxed();
            Ok(pending)
        });
        source
    }

    fn session(topology: MockTopology, source: MockDeliverySource) -> BrokerSession {
        BrokerSession {
            topology: Arc::new(topology),
            publisher: Arc::new(MockPublisher::new()),
            source: Arc::new(source),
        }
    }

    fn noop_handler() -> Arc<dyn ConsumerHandler> {
        Arc::new(handler_fn(|_msg: Message| async { Ok::<(), HandlerError>(()) }))
    }

    fn configs() -> SubscriptionConfigs {
        SubscriptionConfigs::default()
            .with_resubscribe(BackoffConfig::fixed(2, Duration::from_millis(10)))
    }

    fn dispatcher(topology: MockTopology, source: MockDeliverySource) -> RabbitMQDispatcher {
        RabbitMQDispatcher::with_broker(
            Arc::new(topology),
            Arc::new(MockPublisher::new()),
            Arc::new(source),
            configs(),
        )
    }

    #[tokio::test]
    async fn setup_failure_prevents_consuming() {
        let mut topology = MockTopology::new();
        topology
            .expect_declare_exchange()
            .returning(|def| Err(AmqpError::DeclareExchangeError(def.name().to_owned())));
        let mut source = MockDeliverySource::new();
        source.expect_consume().times(0);

        let result = dispatcher(topology, source)
            .subscribe("orders", 3, noop_handler())
            .await;

        assert!(matches!(result, Err(AmqpError::TopologySetupFailed(_))));
    }

    #[tokio::test]
    async fn consumer_registration_failure_is_returned() {
        let mut source = MockDeliverySource::new();
        source
            .expect_consume()
            .times(1)
            .returning(|queue| Err(AmqpError::ConsumerDeclarationError(queue.to_owned())));

        let result = dispatcher(ready_topology(), source)
            .subscribe("orders", 3, noop_handler())
            .await;

        assert!(matches!(result, Err(AmqpError::ConsumerDeclarationError(q)) if q == "orders"));
    }

    #[tokio::test]
    async fn session_failure_is_returned() {
        let mut sessions = MockSessionFactory::new();
        sessions
            .expect_open()
            .times(1)
            .returning(|| Err(AmqpError::ChannelError));

        let result = RabbitMQDispatcher::with_sessions(Arc::new(sessions), configs())
            .subscribe("orders", 3, noop_handler())
            .await;

        assert!(matches!(result, Err(AmqpError::ChannelError)));
    }

    #[tokio::test]
    async fn conflict_on_one_topic_leaves_other_subscriptions_running() {
        let mut seq = Sequence::new();
        let mut sessions = MockSessionFactory::new();
        sessions
            .expect_open()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(session(ready_topology(), pending_source())));
        sessions
            .expect_open()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| {
                let mut source = MockDeliverySource::new();
                source.expect_consume().times(0);
                Ok(session(conflicting_topology("payments.dlx"), source))
            });

        let dispatcher = RabbitMQDispatcher::with_sessions(Arc::new(sessions), configs());
        let orders = dispatcher.subscribe("orders", 3, noop_handler()).await.unwrap();
        let payments = dispatcher.subscribe("payments", 3, noop_handler()).await;

        assert!(matches!(payments, Err(AmqpError::TopologyConflict(r)) if r == "payments.dlx"));

        tokio::task::yield_now().await;
        assert!(!orders.is_finished());
        assert_eq!(orders.close().await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn ended_stream_is_resubscribed_until_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut source = MockDeliverySource::new();
        source.expect_consume().returning(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                let empty: DeliveryStream = stream::empty().boxed();
                Ok(empty)
            } else {
                Err(AmqpError::ConsumerDeclarationError("orders".into()))
            }
        });

        let subscription = dispatcher(ready_topology(), source)
            .subscribe("orders", 3, noop_handler())
            .await
            .unwrap();

        assert_eq!(subscription.closed().await, Ok(()));
        // initial consume, one successful resubscribe, one failed consume on
        // the current session, then two failed attempts on fresh sessions
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_channel_is_replaced_by_a_fresh_session() {
        let (reconsumed_tx, mut reconsumed) = mpsc::unbounded_channel();

        let mut first = MockDeliverySource::new();
        let mut seq = Sequence::new();
        first
            .expect_consume()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                let empty: DeliveryStream = stream::empty().boxed();
                Ok(empty)
            });
        first
            .expect_consume()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(AmqpError::ChannelError));

        let mut second = MockDeliverySource::new();
        second.expect_consume().times(1).returning(move |queue| {
            let _ = reconsumed_tx.send(queue.to_owned());
            let pending: DeliveryStream = stream::pending().boxed();
            Ok(pending)
        });

        let mut sessions = MockSessionFactory::new();
        let mut opens = Sequence::new();
        let first = Mutex::new(Some(first));
        sessions
            .expect_open()
            .times(1)
            .in_sequence(&mut opens)
            .returning(move || {
                let source = first.lock().unwrap().take().unwrap();
                Ok(session(ready_topology(), source))
            });
        let second = Mutex::new(Some(second));
        sessions
            .expect_open()
            .times(1)
            .in_sequence(&mut opens)
            .returning(move || {
                let source = second.lock().unwrap().take().unwrap();
                Ok(session(MockTopology::new(), source))
            });

        let subscription = RabbitMQDispatcher::with_sessions(Arc::new(sessions), configs())
            .subscribe("orders", 3, noop_handler())
            .await
            .unwrap();

        assert_eq!(reconsumed.recv().await.as_deref(), Some("orders"));
        assert!(!subscription.is_finished());
        assert_eq!(subscription.close().await, Ok(()));
    }

    #[tokio::test]
    async fn receive_errors_are_skipped_and_later_deliveries_handled() {
        let (acked_tx, mut acked) = mpsc::unbounded_channel();
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().times(1).returning(move || {
            let _ = acked_tx.send(());
            Ok(())
        });

        let items: DeliveryStream = stream::iter(vec![
            Err(AmqpError::ConsumerError("frame lost".into())),
            Err(AmqpError::ConsumerError("frame lost again".into())),
            Ok(Delivery::new(Message::new("after errors"), Box::new(acker))),
        ])
        .chain(stream::pending())
        .boxed();
        let items = Mutex::new(Some(items));

        let mut source = MockDeliverySource::new();
        source
            .expect_consume()
            .times(1)
            .returning(move |_| Ok(items.lock().unwrap().take().unwrap()));

        let subscription = dispatcher(ready_topology(), source)
            .subscribe("orders", 3, noop_handler())
            .await
            .unwrap();

        let ack = tokio::time::timeout(Duration::from_secs(5), acked.recv()).await;
        assert_eq!(ack, Ok(Some(())));
        assert!(!subscription.is_finished());
        assert_eq!(subscription.topic(), "orders");
        assert_eq!(subscription.close().await, Ok(()));
    }
}
