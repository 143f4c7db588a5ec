// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! Supervises every configured queue concurrently. A single stop signal makes
//! all supervisors drain together, and [`RabbitMQDispatcher::consume_blocking`]
//! only returns once each of them has stopped. One failing supervisor stops
//! the rest.

use crate::{
    channel::AmqpChannel,
    consumer::{MessageHandler, QueueSupervisor},
    errors::AmqpError,
    signal::{StopListener, StopSignal},
};
use futures_util::future::join_all;
use std::sync::Arc;
use tracing::{error, warn};

/// Routes the deliveries of a set of queues to one message handler.
pub struct RabbitMQDispatcher {
    supervisors: Vec<Arc<QueueSupervisor>>,
}

impl RabbitMQDispatcher {
    /// Creates a new RabbitMQ dispatcher.
    ///
    /// # Parameters
    /// * `channel` - The consume channel
    /// * `queues` - Names of the queues to consume
    /// * `handler` - Handler invoked for every message of every queue
    pub fn new<S: AsRef<str>>(
        channel: Arc<dyn AmqpChannel>,
        queues: &[S],
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let supervisors = queues
            .iter()
            .map(|queue| {
                Arc::new(QueueSupervisor::new(
                    queue.as_ref(),
                    channel.clone(),
                    handler.clone(),
                ))
            })
            .collect();

        RabbitMQDispatcher { supervisors }
    }

    pub fn supervisors(&self) -> &[Arc<QueueSupervisor>] {
        &self.supervisors
    }

    /// Consumes every queue until `stop` fires, then waits for all of them to
    /// drain.
    ///
    /// # Parameters
    /// * `stop` - Listener of the process-wide stop signal
    ///
    /// # Returns
    /// `Ok(())` once every queue stopped on request. When a supervisor fails,
    /// for instance because the broker closed its delivery stream, the other
    /// queues are stopped and drained too and the first failure is returned.
    pub async fn consume_blocking(&self, mut stop: StopListener) -> Result<(), AmqpError> {
        let local = StopSignal::new();
        let forward = {
            let local = local.clone();
            tokio::spawn(async move {
                stop.wait().await;
                local.trigger();
            })
        };

        let mut spawns = vec![];
        for supervisor in &self.supervisors {
            let supervisor = supervisor.clone();
            let listener = local.listener();
            let local = local.clone();
            spawns.push(tokio::spawn(async move {
                let outcome = supervisor.run(listener).await;
                if outcome.is_err() && !local.is_triggered() {
                    warn!(queue = supervisor.queue(), "queue supervisor failed, stopping the others");
                    local.trigger();
                }
                outcome
            }));
        }

        let mut result = Ok(());
        for spawned in join_all(spawns).await {
            let outcome = match spawned {
                Ok(outcome) => outcome,
                Err(err) => {
                    error!(error = err.to_string(), "tokio process error");
                    Err(AmqpError::InternalError)
                }
            };

            if let Err(err) = outcome {
                error!(error = err.to_string(), "queue supervisor failed");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        forward.abort();

        result
    }
}
