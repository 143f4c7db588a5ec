// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker and connector doubles for unit tests.
//!
//! The broker keeps queues, exchanges and bindings with RabbitMQ's declaration
//! rules: redeclaring with the same flags is a no-op, different flags fail, an
//! empty queue name is replaced by a generated one. Publishing to the default
//! exchange routes by queue name; named exchanges route through bindings whose
//! key equals the routing key. Requeued messages wait for the next consumer.

use crate::{
    channel::AmqpChannel,
    config::{ConnectionOptions, ConsumerConfig, ExchangeOptions, PublisherConfig, QueueOptions, RabbitMQConfig},
    connection::{CloseCallback, CloseCause, Connector},
    errors::AmqpError,
    exchange::{ExchangeDefinition, DEFAULT_EXCHANGE},
    message::{Acker, Delivery, DeliveryStream, IncomingMessage, OutgoingMessage},
    queue::{DeclaredQueue, QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::mpsc;

pub(crate) fn connection_options() -> ConnectionOptions {
    ConnectionOptions {
        host: "localhost".to_owned(),
        login: "guest".to_owned(),
        password: "guest".to_owned(),
        port: 5672,
        vhost: "/".to_owned(),
        tls: false,
        tls_options: None,
    }
}

pub(crate) fn rabbitmq_config(queues: &[&str], exchange: Option<&str>) -> RabbitMQConfig {
    RabbitMQConfig {
        consumer: ConsumerConfig {
            connection: connection_options(),
            queues: queues
                .iter()
                .map(|name| (name.to_string(), QueueOptions::default()))
                .collect::<BTreeMap<_, _>>(),
            prefetch_count: 1,
            callback_queue: None,
        },
        publisher: PublisherConfig {
            connection: connection_options(),
            exchange: exchange.map(ExchangeOptions::new),
            routing_key: None,
        },
        reconnect_interval_ms: 2000,
        message_expiration_ms: None,
        call_timeout_ms: None,
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settlement {
    Acked,
    Nacked { requeue: bool },
    Rejected { requeue: bool },
}

struct FakeQueue {
    def: QueueDefinition,
    ready: VecDeque<IncomingMessage>,
    consumer: Option<String>,
}

struct FakeConsumer {
    queue: String,
    sender: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, FakeQueue>,
    exchanges: HashMap<String, ExchangeDefinition>,
    bindings: Vec<(String, String, String)>,
    consumers: HashMap<String, FakeConsumer>,
    settlements: Vec<(String, Settlement)>,
    published: Vec<(String, String, OutgoingMessage)>,
    prefetch: Option<u16>,
    operations: Vec<String>,
    generated: usize,
    closed_channels: usize,
}

pub(crate) struct FakeBroker {
    state: Mutex<BrokerState>,
}

impl FakeBroker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(FakeBroker {
            state: Mutex::new(BrokerState::default()),
        })
    }

    pub(crate) fn channel(self: &Arc<Self>) -> Arc<dyn AmqpChannel> {
        Arc::new(FakeChannel {
            broker: self.clone(),
        })
    }

    /// Puts `message` straight into `queue`, as if routed by the broker.
    pub(crate) fn deliver(self: &Arc<Self>, queue: &str, message: IncomingMessage) {
        let mut state = self.lock();
        self.enqueue(&mut state, queue, message);
    }

    pub(crate) fn settlements(&self) -> Vec<Settlement> {
        self.lock().settlements.iter().map(|(_, s)| *s).collect()
    }

    pub(crate) fn published(&self) -> Vec<(String, String, OutgoingMessage)> {
        self.lock().published.clone()
    }

    pub(crate) fn prefetch(&self) -> Option<u16> {
        self.lock().prefetch
    }

    /// Declarations in the order the broker received them.
    pub(crate) fn operations(&self) -> Vec<String> {
        self.lock().operations.clone()
    }

    pub(crate) fn ready(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map(|q| q.ready.len()).unwrap_or(0)
    }

    pub(crate) fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub(crate) fn has_exchange(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains_key(exchange)
    }

    pub(crate) fn has_consumer(&self, queue: &str) -> bool {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumer.is_some())
            .unwrap_or(false)
    }

    /// `(exchange, routing key)` pairs bound to `queue`.
    pub(crate) fn bindings(&self, queue: &str) -> Vec<(String, String)> {
        self.lock()
            .bindings
            .iter()
            .filter(|(_, _, q)| q == queue)
            .map(|(ex, key, _)| (ex.clone(), key.clone()))
            .collect()
    }

    /// Drops the consumers of `queue`, ending their delivery streams the way
    /// a lost connection does.
    pub(crate) fn drop_consumers(&self, queue: &str) {
        let mut state = self.lock();
        state.consumers.retain(|_, consumer| consumer.queue != queue);
        if let Some(q) = state.queues.get_mut(queue) {
            q.consumer = None;
        }
    }

    pub(crate) fn closed_channels(&self) -> usize {
        self.lock().closed_channels
    }

    fn enqueue(self: &Arc<Self>, state: &mut BrokerState, queue: &str, message: IncomingMessage) {
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };

        let consumer = q
            .consumer
            .as_ref()
            .and_then(|tag| state.consumers.get(tag));

        match consumer {
            Some(consumer) => {
                let acker = FakeAcker {
                    queue: queue.to_owned(),
                    message: message.clone(),
                    broker: self.clone(),
                };
                let _ = consumer
                    .sender
                    .send(Ok(Delivery::new(message, Box::new(acker))));
            }
            None => q.ready.push_back(message),
        }
    }

    fn settle(&self, queue: &str, message: &IncomingMessage, settlement: Settlement) {
        let mut state = self.lock();
        state.settlements.push((queue.to_owned(), settlement));

        let requeue = matches!(
            settlement,
            Settlement::Nacked { requeue: true } | Settlement::Rejected { requeue: true }
        );
        if requeue {
            if let Some(q) = state.queues.get_mut(queue) {
                let mut message = message.clone();
                message.redelivered = true;
                q.ready.push_back(message);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }
}

struct FakeAcker {
    queue: String,
    message: IncomingMessage,
    broker: Arc<FakeBroker>,
}

#[async_trait]
impl Acker for FakeAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.broker.settle(&self.queue, &self.message, Settlement::Acked);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.broker
            .settle(&self.queue, &self.message, Settlement::Nacked { requeue });
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.broker
            .settle(&self.queue, &self.message, Settlement::Rejected { requeue });
        Ok(())
    }
}

pub(crate) struct FakeChannel {
    broker: Arc<FakeBroker>,
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.prefetch = Some(prefetch_count);
        state.operations.push(format!("qos:{}", prefetch_count));
        Ok(())
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.operations.push(format!("exchange:{}", def.name));
        match state.exchanges.get(&def.name) {
            Some(existing) if def.passive || existing.same_flags(def) => Ok(()),
            Some(_) => Err(AmqpError::DeclareExchangeError(def.name.clone())),
            None if def.passive => Err(AmqpError::DeclareExchangeError(def.name.clone())),
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<DeclaredQueue, AmqpError> {
        let mut state = self.broker.lock();

        let name = if def.name.is_empty() {
            state.generated += 1;
            format!("amq.gen-{}", state.generated)
        } else {
            def.name.clone()
        };
        state.operations.push(format!("queue:{}", name));

        match state.queues.get(&name) {
            Some(existing) if def.passive || existing.def.same_flags(def) => {}
            Some(_) => return Err(AmqpError::DeclareQueueError(name)),
            None if def.passive => return Err(AmqpError::DeclareQueueError(name)),
            None => {
                let mut def = def.clone();
                def.name = name.clone();
                state.queues.insert(
                    name.clone(),
                    FakeQueue {
                        def,
                        ready: VecDeque::new(),
                        consumer: None,
                    },
                );
            }
        }

        let q = &state.queues[&name];
        Ok(DeclaredQueue::new(
            &name,
            q.ready.len() as u32,
            q.consumer.iter().count() as u32,
        ))
    }

    async fn queue_bind(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        let exchange_known = binding.exchange == DEFAULT_EXCHANGE
            || state.exchanges.contains_key(binding.exchange);
        if !exchange_known || !state.queues.contains_key(binding.queue) {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange.to_owned(),
                binding.queue.to_owned(),
            ));
        }

        state.operations.push(format!("bind:{}", binding.queue));
        let entry = (
            binding.exchange.to_owned(),
            binding.routing_key.to_owned(),
            binding.queue.to_owned(),
        );
        if !state.bindings.contains(&entry) {
            state.bindings.push(entry);
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutgoingMessage,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        if exchange != DEFAULT_EXCHANGE && !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::PublishingError);
        }
        state
            .published
            .push((exchange.to_owned(), routing_key.to_owned(), message.clone()));

        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            vec![routing_key.to_owned()]
        } else {
            state
                .bindings
                .iter()
                .filter(|(ex, key, _)| ex == exchange && key == routing_key)
                .map(|(_, _, queue)| queue.clone())
                .collect()
        };

        let incoming = IncomingMessage {
            body: message.body.clone(),
            content_type: message.content_type.clone(),
            correlation_id: message.correlation_id.clone(),
            reply_to: message.reply_to.clone(),
            app_id: message.app_id.clone(),
            message_id: message.message_id.clone(),
            headers: message.headers.clone(),
            delivery_mode: Some(message.delivery_mode),
            expiration: message.expiration.clone(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
        };
        for queue in targets {
            self.broker.enqueue(&mut state, &queue, incoming.clone());
        }
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.lock();
            let Some(q) = state.queues.get_mut(queue) else {
                return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
            };
            q.consumer = Some(consumer_tag.to_owned());
            let backlog: Vec<IncomingMessage> = q.ready.drain(..).collect();

            state.consumers.insert(
                consumer_tag.to_owned(),
                FakeConsumer {
                    queue: queue.to_owned(),
                    sender,
                },
            );
            for message in backlog {
                self.broker.enqueue(&mut state, queue, message);
            }
        }

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        let Some(consumer) = state.consumers.remove(consumer_tag) else {
            return Err(AmqpError::ConsumerCancelError(consumer_tag.to_owned()));
        };
        if let Some(q) = state.queues.get_mut(&consumer.queue) {
            q.consumer = None;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.broker.lock().closed_channels += 1;
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct FakeConnection {
    pub(crate) name: String,
}

/// Connector handing out channels on one [`FakeBroker`].
pub(crate) struct FakeConnector {
    broker: Arc<FakeBroker>,
    failures: AtomicUsize,
    fatal: Mutex<Option<String>>,
    callbacks: Mutex<Vec<(String, CloseCallback)>>,
    closed: AtomicUsize,
}

impl FakeConnector {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_broker(FakeBroker::new())
    }

    pub(crate) fn with_broker(broker: Arc<FakeBroker>) -> Arc<Self> {
        Arc::new(FakeConnector {
            broker,
            failures: AtomicUsize::new(0),
            fatal: Mutex::new(None),
            callbacks: Mutex::new(vec![]),
            closed: AtomicUsize::new(0),
        })
    }

    pub(crate) fn broker(&self) -> Arc<FakeBroker> {
        self.broker.clone()
    }

    /// Makes the next `n` connection attempts fail with a connectivity error.
    pub(crate) fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Makes every attempt for connection `name` fail irrecoverably.
    pub(crate) fn fail_permanently(&self, name: &str) {
        *self.fatal.lock().unwrap() = Some(name.to_owned());
    }

    /// Closes the latest connection named `name` with `cause`.
    pub(crate) fn fire_close(&self, name: &str, cause: CloseCause) -> bool {
        let callback = {
            let mut callbacks = self.callbacks.lock().unwrap();
            callbacks
                .iter()
                .rposition(|(n, _)| n == name)
                .map(|idx| callbacks.remove(idx).1)
        };

        match callback {
            Some(callback) => {
                callback(cause);
                true
            }
            None => false,
        }
    }

    pub(crate) fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Connection = Arc<FakeConnection>;

    async fn connect(&self, _options: &ConnectionOptions, name: &str) -> Result<Self::Connection, AmqpError> {
        if self.fatal.lock().unwrap().as_deref() == Some(name) {
            return Err(AmqpError::ConfigurationError("refused".to_owned()));
        }

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AmqpError::ConnectionError);
        }

        Ok(Arc::new(FakeConnection {
            name: name.to_owned(),
        }))
    }

    fn on_close(&self, connection: &Self::Connection, callback: CloseCallback) {
        self.callbacks
            .lock()
            .unwrap()
            .push((connection.name.clone(), callback));
    }

    async fn create_channel(&self, _connection: &Self::Connection) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        Ok(self.broker.channel())
    }

    async fn close(&self, _connection: &Self::Connection) -> Result<(), AmqpError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
