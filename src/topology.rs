// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declares the configured queues and exchange against an open channel and
//! binds each queue to the exchange. Declarations are idempotent on the broker
//! side: redeclaring with identical flags succeeds, while conflicting flags are
//! a protocol error that is returned to the caller.
//!
//! The main components are:
//! - `Topology` trait: Interface for topology provisioning
//! - `AmqpTopology`: Implementation of the Topology trait over an [`AmqpChannel`]

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::{DeclaredExchange, ExchangeDefinition},
    queue::{DeclaredQueue, QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, error};

/// Trait defining the interface for topology provisioning.
#[async_trait]
pub trait Topology: Send + Sync {
    /// Applies `prefetch_count` to the channel, then declares every queue
    /// concurrently.
    ///
    /// When `exchange` is given each queue is bound to it, using the queue's
    /// own name as routing key.
    async fn declare_queues(
        &self,
        queues: &[QueueDefinition],
        exchange: Option<&ExchangeDefinition>,
        prefetch_count: u16,
    ) -> Result<Vec<DeclaredQueue>, AmqpError>;

    /// Declares the application exchange, if any.
    ///
    /// The channel's default exchange is always part of the result, after the
    /// declared one.
    async fn declare_exchanges(
        &self,
        exchange: Option<&ExchangeDefinition>,
    ) -> Result<Vec<DeclaredExchange>, AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
pub struct AmqpTopology {
    channel: Arc<dyn AmqpChannel>,
}

impl AmqpTopology {
    pub fn new(channel: Arc<dyn AmqpChannel>) -> AmqpTopology {
        AmqpTopology { channel }
    }

    async fn declare_queue(
        &self,
        def: &QueueDefinition,
        exchange: Option<&ExchangeDefinition>,
    ) -> Result<DeclaredQueue, AmqpError> {
        debug!("creating queue: {}", def.name);
        let mut declared = self.channel.queue_declare(def).await?;

        if let Some(exchange) = exchange {
            debug!(
                "binding queue: {} to the exchange: {}",
                declared.name, exchange.name
            );

            let binding = QueueBinding::new(&declared.name, &exchange.name, &declared.name);
            self.channel.queue_bind(&binding).await?;

            declared.exchange = Some(exchange.name.clone());
        }

        debug!("queue: {} was created", declared.name);
        Ok(declared)
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    async fn declare_queues(
        &self,
        queues: &[QueueDefinition],
        exchange: Option<&ExchangeDefinition>,
        prefetch_count: u16,
    ) -> Result<Vec<DeclaredQueue>, AmqpError> {
        self.channel.basic_qos(prefetch_count).await?;

        let declared = try_join_all(queues.iter().map(|def| self.declare_queue(def, exchange)))
            .await
            .inspect_err(|err| error!(error = err.to_string(), "failure to declare queues"))?;

        debug!("{} queue(s) declared", declared.len());
        Ok(declared)
    }

    async fn declare_exchanges(
        &self,
        exchange: Option<&ExchangeDefinition>,
    ) -> Result<Vec<DeclaredExchange>, AmqpError> {
        let mut declared = vec![];

        if let Some(def) = exchange {
            debug!("creating exchange: {}", def.name);
            self.channel.exchange_declare(def).await?;
            debug!("exchange: {} was created", def.name);
            declared.push(DeclaredExchange::new(&def.name));
        }

        declared.push(DeclaredExchange::default_exchange());
        Ok(declared)
    }
}
