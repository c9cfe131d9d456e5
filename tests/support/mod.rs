// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker honouring queue TTLs, dead-letter targets and direct
//! exchange bindings, enough to run the retry topology end to end.

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use opentelemetry::Context;
use rabbitmq_redelivery::{
    configs::SubscriptionConfigs,
    delivery::{Acknowledger, Delivery, DeliverySource, DeliveryStream},
    dispatcher::RabbitMQDispatcher,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::Message,
    publisher::Publisher,
    queue::{QueueBinding, QueueDefinition},
    topology::Topology,
};
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Enqueued { queue: String, message: Message },
    Acked { queue: String, message: Message },
    Rejected { queue: String, message: Message },
}

struct QueueState {
    def: QueueDefinition,
    backlog: VecDeque<Message>,
    consumer: Option<mpsc::UnboundedSender<Result<Delivery, AmqpError>>>,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBinding>,
    events: Vec<Event>,
    failing: Option<String>,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn dispatcher(&self, retry_delay: Duration) -> RabbitMQDispatcher {
        RabbitMQDispatcher::with_broker(
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            SubscriptionConfigs::default().with_retry_delay(retry_delay),
        )
    }

    /// Makes every declaration of `name` fail.
    pub fn fail_declaring(&self, name: &str) {
        self.shared.lock().unwrap().failing = Some(name.to_owned());
    }

    pub fn events(&self) -> Vec<Event> {
        self.shared.lock().unwrap().events.clone()
    }

    pub fn enqueued(&self, queue: &str) -> Vec<Message> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Enqueued { queue: q, message } if q == queue => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn acked(&self, queue: &str) -> Vec<Message> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Acked { queue: q, message } if q == queue => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn rejected(&self, queue: &str) -> Vec<Message> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Rejected { queue: q, message } if q == queue => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn backlog(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.backlog.len())
            .unwrap_or_default()
    }

    pub fn has_consumer(&self, queue: &str) -> bool {
        self.shared
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .is_some_and(|q| q.consumer.is_some())
    }

    /// (exchanges, queues, bindings)
    pub fn resources(&self) -> (usize, usize, usize) {
        let state = self.shared.lock().unwrap();
        (state.exchanges.len(), state.queues.len(), state.bindings.len())
    }

    pub async fn wait_until(&self, what: &str, condition: impl Fn(&MemoryBroker) -> bool) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while !condition(self) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;

        assert!(waited.is_ok(), "timed out waiting for {what}: {:#?}", self.events());
    }
}

fn route(shared: &Arc<Mutex<State>>, exchange: &str, key: &str, message: Message) {
    let targets: Vec<String> = if exchange.is_empty() {
        vec![key.to_owned()]
    } else {
        shared
            .lock()
            .unwrap()
            .bindings
            .iter()
            .filter(|b| b.exchange_name() == exchange && b.key() == key)
            .map(|b| b.queue_name().to_owned())
            .collect()
    };

    for queue in targets {
        enqueue(shared, &queue, message.clone());
    }
}

fn enqueue(shared: &Arc<Mutex<State>>, queue: &str, message: Message) {
    let mut state = shared.lock().unwrap();
    state.events.push(Event::Enqueued {
        queue: queue.to_owned(),
        message: message.clone(),
    });

    let Some(q) = state.queues.get_mut(queue) else {
        return;
    };

    if let Some(ttl) = q.def.message_ttl() {
        if let Some(target) = q.def.dead_letter_target().cloned() {
            let key = target.routing_key.unwrap_or_else(|| queue.to_owned());
            let shared = shared.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                route(&shared, &target.exchange, &key, message);
            });
        }
        return;
    }

    let delivery = Delivery::new(
        message.clone(),
        Box::new(MemoryAcker {
            shared: shared.clone(),
            queue: queue.to_owned(),
            message: message.clone(),
        }),
    );

    let sent = match &q.consumer {
        Some(tx) => tx.send(Ok(delivery)).is_ok(),
        None => false,
    };

    if !sent {
        q.consumer = None;
        q.backlog.push_back(message);
    }
}

struct MemoryAcker {
    shared: Arc<Mutex<State>>,
    queue: String,
    message: Message,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.shared.lock().unwrap().events.push(Event::Acked {
            queue: self.queue.clone(),
            message: self.message.clone(),
        });
        Ok(())
    }

    async fn nack_requeue(&self) -> Result<(), AmqpError> {
        enqueue(&self.shared, &self.queue, self.message.clone());
        Ok(())
    }

    async fn nack_discard(&self) -> Result<(), AmqpError> {
        let target = {
            let mut state = self.shared.lock().unwrap();
            state.events.push(Event::Rejected {
                queue: self.queue.clone(),
                message: self.message.clone(),
            });
            state
                .queues
                .get(&self.queue)
                .and_then(|q| q.def.dead_letter_target().cloned())
        };

        if let Some(target) = target {
            let key = target.routing_key.unwrap_or_else(|| self.queue.clone());
            route(&self.shared, &target.exchange, &key, self.message.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl Topology for MemoryBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.shared.lock().unwrap();
        if state.failing.as_deref() == Some(def.name()) {
            return Err(AmqpError::DeclareExchangeError(def.name().to_owned()));
        }

        match state.exchanges.get(def.name()) {
            Some(existing) if existing != def => {
                Err(AmqpError::TopologyConflict(def.name().to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name().to_owned(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.shared.lock().unwrap();
        if state.failing.as_deref() == Some(def.name()) {
            return Err(AmqpError::DeclareQueueError(def.name().to_owned()));
        }

        match state.queues.get(def.name()) {
            Some(existing) if &existing.def != def => {
                Err(AmqpError::TopologyConflict(def.name().to_owned()))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    def.name().to_owned(),
                    QueueState {
                        def: def.clone(),
                        backlog: VecDeque::new(),
                        consumer: None,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.shared.lock().unwrap();
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, _ctx: &Context, to: &str, message: &Message) -> Result<(), AmqpError> {
        route(&self.shared, "", to, message.clone());
        Ok(())
    }
}

#[async_trait]
impl DeliverySource for MemoryBroker {
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, AmqpError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let backlog: Vec<Message> = {
            let mut state = self.shared.lock().unwrap();
            let Some(q) = state.queues.get_mut(queue) else {
                return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
            };
            q.consumer = Some(tx);
            q.backlog.drain(..).collect()
        };

        for message in backlog {
            enqueue(&self.shared, queue, message);
        }

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}
