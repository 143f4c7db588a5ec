// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lifecycle Coordination
//!
//! [`RabbitMQ`] owns the process-wide broker session: the consume and publish
//! connections and the read and write channels opened on them. Components get
//! the channels through accessors that fail with
//! [`AmqpError::NotInitialized`] outside an initialized session.
//!
//! [`RabbitMQ::run`] wires everything together for a consuming service:
//! connections, topology, publisher, application handler, consumers, then
//! teardown in reverse order once the stop signal fired.

use crate::{
    channel::AmqpChannel,
    config::RabbitMQConfig,
    connection::{connect_pair, ConnectionManager, Connector, LapinConnector},
    consumer::MessageHandler,
    dispatcher::RabbitMQDispatcher,
    errors::AmqpError,
    exchange::{DeclaredExchange, ExchangeDefinition},
    publisher::Publisher,
    queue::{DeclaredQueue, QueueDefinition},
    requester::RequestReplyClient,
    rpc::{Call, RpcResult},
    signal::{on_termination, StopListener},
    topology::{AmqpTopology, Topology},
};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

struct Session<C: Connector> {
    consume: Arc<ConnectionManager<C>>,
    publish: Arc<ConnectionManager<C>>,
    read: Arc<dyn AmqpChannel>,
    write: Arc<dyn AmqpChannel>,
}

/// The broker session of the process.
pub struct RabbitMQ<C: Connector = LapinConnector> {
    config: RabbitMQConfig,
    connector: Arc<C>,
    session: Mutex<Option<Session<C>>>,
}

impl RabbitMQ<LapinConnector> {
    pub fn new(config: RabbitMQConfig) -> Self {
        RabbitMQ::with_connector(config, Arc::new(LapinConnector))
    }
}

impl<C: Connector> RabbitMQ<C> {
    pub fn with_connector(config: RabbitMQConfig, connector: Arc<C>) -> Self {
        RabbitMQ {
            config,
            connector,
            session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RabbitMQConfig {
        &self.config
    }

    pub async fn is_initialized(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Opens both connections concurrently, then one channel on each.
    ///
    /// Each connection is retried until the broker accepts it, so this only
    /// returns once the broker is reachable or a connection failed
    /// irrecoverably.
    ///
    /// # Returns
    /// `Ok(())` once the read and write channels are open. Fails with
    /// [`AmqpError::AlreadyInitialized`] while a session is open; if a channel
    /// cannot be opened both connections are closed again.
    pub async fn init(&self) -> Result<(), AmqpError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Err(AmqpError::AlreadyInitialized);
        }

        let (consume, publish) = connect_pair(
            self.connector.clone(),
            self.config.consumer.connection.clone(),
            self.config.publisher.connection.clone(),
            self.config.reconnect_interval(),
        )
        .await?;

        let channels = async {
            let read_conn = consume.connection()?;
            let write_conn = publish.connection()?;
            tokio::try_join!(
                self.connector.create_channel(&read_conn),
                self.connector.create_channel(&write_conn)
            )
        }
        .await;

        let (read, write) = match channels {
            Ok(channels) => channels,
            Err(err) => {
                error!(error = err.to_string(), "failure to open channels");
                let _ = tokio::join!(consume.close(), publish.close());
                return Err(err);
            }
        };

        *session = Some(Session {
            consume,
            publish,
            read,
            write,
        });
        info!("rabbitmq initialized");

        Ok(())
    }

    /// The channel consumers and topology declarations run on.
    pub async fn read_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.read.clone())
            .ok_or(AmqpError::NotInitialized)
    }

    /// The channel messages are published on.
    pub async fn write_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.write.clone())
            .ok_or(AmqpError::NotInitialized)
    }

    fn exchange_definition(&self) -> Option<ExchangeDefinition> {
        self.config
            .publisher
            .exchange
            .as_ref()
            .map(ExchangeDefinition::from)
    }

    /// Declares the configured exchange on the write channel.
    pub async fn declare_exchanges(&self) -> Result<Vec<DeclaredExchange>, AmqpError> {
        let topology = AmqpTopology::new(self.write_channel().await?);
        topology
            .declare_exchanges(self.exchange_definition().as_ref())
            .await
    }

    /// Declares the configured queues on the read channel, bound to the
    /// configured exchange.
    ///
    /// # Returns
    /// The declared queues, in configuration order. The prefetch limit is
    /// applied to the read channel before the first declaration. Fails with
    /// [`AmqpError::NotInitialized`] outside a session, and with the broker's
    /// declaration error when a queue exists with different flags.
    pub async fn declare_queues(&self) -> Result<Vec<DeclaredQueue>, AmqpError> {
        let topology = AmqpTopology::new(self.read_channel().await?);
        let queues: Vec<QueueDefinition> = self
            .config
            .consumer
            .queues
            .iter()
            .map(|(name, opts)| QueueDefinition::from_options(name, opts))
            .collect();

        topology
            .declare_queues(
                &queues,
                self.exchange_definition().as_ref(),
                self.config.consumer.prefetch_count,
            )
            .await
    }

    /// A publisher on the write channel targeting `exchanges`.
    ///
    /// # Parameters
    /// * `app_id` - Application id stamped on every message
    /// * `exchanges` - The exchanges returned by [`RabbitMQ::declare_exchanges`]
    ///
    /// The configured message expiration and default routing key apply to
    /// every message published through it.
    pub async fn publisher(
        &self,
        app_id: &str,
        exchanges: Vec<DeclaredExchange>,
    ) -> Result<Publisher, AmqpError> {
        Ok(Publisher::new(self.write_channel().await?, exchanges)
            .with_app_id(app_id)
            .with_expiration(self.config.message_expiration())
            .with_routing_key(self.config.publisher.routing_key.clone()))
    }

    /// A request/reply client receiving replies on the read channel.
    pub async fn requester(&self, publisher: Arc<Publisher>) -> Result<RequestReplyClient, AmqpError> {
        Ok(RequestReplyClient::new(
            self.read_channel().await?,
            publisher,
            self.config.consumer.callback_queue.clone(),
            self.config.call_timeout(),
        ))
    }

    /// Closes the channels, then the connections. Does nothing without a
    /// session.
    pub async fn shutdown(&self) -> Result<(), AmqpError> {
        let Some(session) = self.session.lock().await.take() else {
            debug!("rabbitmq not initialized, nothing to shut down");
            return Ok(());
        };

        for channel in [&session.read, &session.write] {
            if let Err(err) = channel.close().await {
                error!(error = err.to_string(), "failure to close channel");
            }
        }

        let (read, write) = tokio::join!(session.consume.close(), session.publish.close());
        info!("rabbitmq shut down");
        read.and(write)
    }

    /// Runs a consuming service until `stop` fires.
    ///
    /// # Parameters
    /// * `app_id` - Application id stamped on published messages
    /// * `stop` - Listener of the process-wide stop signal
    /// * `handler` - Receives the publisher and builds the application
    ///   handler every queue message is passed to
    ///
    /// # Returns
    /// `Ok(())` after a requested stop once every queue drained. A failed
    /// startup step, or a delivery stream the broker closed on its own, is
    /// returned as an error. The session is torn down on every exit path once
    /// initialization succeeded.
    pub async fn run<F, H>(&self, app_id: &str, stop: StopListener, handler: F) -> Result<(), AmqpError>
    where
        F: FnOnce(Arc<Publisher>) -> H,
        H: MessageHandler + 'static,
    {
        self.init().await?;

        let served = self.serve(app_id, stop, handler).await;
        if let Err(err) = &served {
            error!(error = err.to_string(), "service failed, shutting down");
        }

        let closed = self.shutdown().await;
        served.and(closed)
    }

    async fn serve<F, H>(&self, app_id: &str, stop: StopListener, handler: F) -> Result<(), AmqpError>
    where
        F: FnOnce(Arc<Publisher>) -> H,
        H: MessageHandler + 'static,
    {
        let exchanges = self.declare_exchanges().await?;
        let publisher = Arc::new(self.publisher(app_id, exchanges).await?);
        let handler: Arc<dyn MessageHandler> = Arc::new(handler(publisher));

        let queues = self.declare_queues().await?;
        let names: Vec<&str> = queues.iter().map(DeclaredQueue::name).collect();

        info!("consumer started");
        let dispatcher = RabbitMQDispatcher::new(self.read_channel().await?, &names, handler);
        dispatcher.consume_blocking(stop).await?;
        info!("consumer stopped");

        Ok(())
    }

    /// [`RabbitMQ::run`], stopped by SIGINT or SIGTERM.
    pub async fn run_until_signal<F, H>(&self, app_id: &str, handler: F) -> Result<(), AmqpError>
    where
        F: FnOnce(Arc<Publisher>) -> H,
        H: MessageHandler + 'static,
    {
        let stop = on_termination()?;
        self.run(app_id, stop.listener(), handler).await
    }

    /// Opens a session, issues a single call, and tears the session down.
    ///
    /// # Parameters
    /// * `app_id` - Application id of the caller
    /// * `call` - The method invocation
    /// * `routing_key` - Routing key of the request
    /// * `exchange` - Exchange the request is published to, `""` for the
    ///   default one
    ///
    /// # Returns
    /// The decoded reply, or the first error of the session. The session is
    /// closed in both cases.
    pub async fn call_once<T: DeserializeOwned>(
        &self,
        app_id: &str,
        call: &Call,
        routing_key: &str,
        exchange: &str,
    ) -> Result<RpcResult<T>, AmqpError> {
        self.init().await?;

        let called = async {
            let exchanges = self.declare_exchanges().await?;
            let publisher = Arc::new(self.publisher(app_id, exchanges).await?);
            let requester = self.requester(publisher).await?;
            requester.call(call, routing_key, exchange).await
        }
        .await;

        let closed = self.shutdown().await;
        let result = called?;
        closed?;
        Ok(result)
    }
}
