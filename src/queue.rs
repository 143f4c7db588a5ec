// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Queue definitions, declared queues and bindings.

use crate::config::QueueOptions;

/// What to declare for a queue.
///
/// An empty name asks the broker to generate one; the generated name comes
/// back through [`DeclaredQueue`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
}

impl QueueDefinition {
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    pub fn from_options(name: &str, opts: &QueueOptions) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: opts.durable,
            auto_delete: opts.auto_delete,
            exclusive: opts.exclusive,
            passive: opts.passive,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Ties the queue to the declaring connection; the broker drops it when
    /// that connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub(crate) fn same_flags(&self, other: &QueueDefinition) -> bool {
        self.durable == other.durable
            && self.auto_delete == other.auto_delete
            && self.exclusive == other.exclusive
    }
}

/// A queue that exists on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredQueue {
    pub(crate) name: String,
    pub(crate) message_count: u32,
    pub(crate) consumer_count: u32,
    pub(crate) exchange: Option<String>,
}

impl DeclaredQueue {
    pub fn new(name: &str, message_count: u32, consumer_count: u32) -> Self {
        DeclaredQueue {
            name: name.to_owned(),
            message_count,
            consumer_count,
            exchange: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message_count(&self) -> u32 {
        self.message_count
    }

    pub fn consumer_count(&self) -> u32 {
        self.consumer_count
    }

    /// Exchange the queue was bound to during provisioning, if any.
    pub fn exchange(&self) -> Option<&str> {
        self.exchange.as_deref()
    }
}

/// Routes messages published to `exchange` with `routing_key` into `queue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueBinding<'a> {
    pub(crate) queue: &'a str,
    pub(crate) exchange: &'a str,
    pub(crate) routing_key: &'a str,
}

impl<'a> QueueBinding<'a> {
    pub fn new(queue: &'a str, exchange: &'a str, routing_key: &'a str) -> Self {
        QueueBinding {
            queue,
            exchange,
            routing_key,
        }
    }
}
