// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request/Reply Client
//!
//! Correlation based RPC over one-way messaging. On first use the client
//! declares a private reply queue and consumes it; every call registers a
//! pending entry under its correlation id before publishing, and the reply
//! consumer resolves that entry when the matching answer arrives. Replies
//! carrying an unknown correlation id are rejected.
//!
//! Pending entries are removed on every exit path of a call, including
//! cancellation of the calling task. When the broker ends the reply stream
//! the calls still waiting fail, and the next call declares the reply queue
//! again.

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    message::{Delivery, DeliveryStream, IncomingMessage, OutgoingMessage, REQUEST_ID_HEADER},
    publisher::Publisher,
    queue::QueueDefinition,
    rpc::{Call, RpcResult},
};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Default)]
struct PendingState {
    calls: HashMap<String, oneshot::Sender<IncomingMessage>>,
    closed: bool,
}

/// Calls awaiting their reply on one reply consumer, by correlation id.
#[derive(Default)]
pub(crate) struct PendingCalls {
    state: Mutex<PendingState>,
}

impl PendingCalls {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(PendingCalls::default())
    }

    /// Registers `correlation_id`; the entry lives as long as the guard.
    /// Returns `None` once the reply consumer stopped.
    pub(crate) fn register(
        self: &Arc<Self>,
        correlation_id: &str,
    ) -> Option<(oneshot::Receiver<IncomingMessage>, PendingGuard)> {
        let (sender, receiver) = oneshot::channel();
        {
            let mut state = self.lock();
            if state.closed {
                return None;
            }
            state.calls.insert(correlation_id.to_owned(), sender);
        }

        let guard = PendingGuard {
            calls: self.clone(),
            correlation_id: correlation_id.to_owned(),
        };
        Some((receiver, guard))
    }

    /// Hands `reply` to the call registered under `correlation_id`.
    pub(crate) fn resolve(&self, correlation_id: &str, reply: IncomingMessage) -> Result<(), AmqpError> {
        let sender = self
            .lock()
            .calls
            .remove(correlation_id)
            .ok_or_else(|| AmqpError::MissingCorrelation(correlation_id.to_owned()))?;

        sender
            .send(reply)
            .map_err(|_| AmqpError::MissingCorrelation(correlation_id.to_owned()))
    }

    /// Refuses new calls and fails the waiting ones. Returns how many failed.
    pub(crate) fn close(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        let failed = state.calls.len();
        state.calls.clear();
        failed
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().calls.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes its pending entry when dropped.
pub(crate) struct PendingGuard {
    calls: Arc<PendingCalls>,
    correlation_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.calls.lock().calls.remove(&self.correlation_id);
    }
}

struct ReplyConsumer {
    queue: String,
    pending: Arc<PendingCalls>,
    listener: JoinHandle<()>,
}

/// Issues calls and awaits their correlated replies.
pub struct RequestReplyClient {
    channel: Arc<dyn AmqpChannel>,
    publisher: Arc<Publisher>,
    callback_queue: Option<String>,
    timeout: Option<Duration>,
    reply: tokio::sync::Mutex<Option<ReplyConsumer>>,
}

impl RequestReplyClient {
    /// Creates a client consuming replies on `channel` and publishing calls
    /// through `publisher`.
    ///
    /// # Parameters
    /// * `channel` - Channel the reply queue is declared and consumed on
    /// * `publisher` - Publisher the requests go through
    /// * `callback_queue` - Name of the reply queue, or `None` to let the
    ///   broker name it
    /// * `timeout` - How long a call waits for its reply; `None` waits
    ///   indefinitely
    pub fn new(
        channel: Arc<dyn AmqpChannel>,
        publisher: Arc<Publisher>,
        callback_queue: Option<String>,
        timeout: Option<Duration>,
    ) -> Self {
        RequestReplyClient {
            channel,
            publisher,
            callback_queue,
            timeout,
            reply: tokio::sync::Mutex::new(None),
        }
    }

    /// Name of the reply queue, declaring and consuming it on first use and
    /// again after the broker ended the previous reply stream.
    pub async fn reply_queue(&self) -> Result<String, AmqpError> {
        let (queue, _) = self.reply_consumer().await?;
        Ok(queue)
    }

    async fn reply_consumer(&self) -> Result<(String, Arc<PendingCalls>), AmqpError> {
        let mut reply = self.reply.lock().await;

        if let Some(current) = reply.as_ref() {
            if !current.listener.is_finished() && !current.pending.is_closed() {
                return Ok((current.queue.clone(), current.pending.clone()));
            }
            warn!(queue = current.queue.as_str(), "reply consumer stopped, declaring a new one");
        }

        let started = self.start_reply_consumer().await?;
        let current = (started.queue.clone(), started.pending.clone());
        *reply = Some(started);
        Ok(current)
    }

    async fn start_reply_consumer(&self) -> Result<ReplyConsumer, AmqpError> {
        let def = QueueDefinition::new(self.callback_queue.as_deref().unwrap_or_default())
            .durable()
            .exclusive();
        let declared = self.channel.queue_declare(&def).await?;
        let queue = declared.name().to_owned();

        let tag = format!("{}.{}", queue, Uuid::new_v4());
        let replies = self.channel.basic_consume(&queue, &tag).await?;

        let pending = PendingCalls::new();
        let listener = tokio::spawn(consume_replies(replies, pending.clone(), queue.clone()));

        debug!(queue = queue.as_str(), "reply queue ready");
        Ok(ReplyConsumer {
            queue,
            pending,
            listener,
        })
    }

    /// Sends `call` and waits for its result.
    ///
    /// # Parameters
    /// * `call` - The method invocation; its `id` becomes the correlation id,
    ///   or a fresh one is generated when absent
    /// * `routing_key` - Routing key of the request
    /// * `exchange` - A declared exchange, `""` for the default one
    ///
    /// # Returns
    /// The decoded reply. Fails with [`AmqpError::Timeout`] when a configured
    /// timeout expires, and with [`AmqpError::ConsumerClosed`] when the reply
    /// consumer stops before the answer arrives.
    ///
    /// The request also carries a fresh `request_id` header.
    pub async fn call<T: DeserializeOwned>(
        &self,
        call: &Call,
        routing_key: &str,
        exchange: &str,
    ) -> Result<RpcResult<T>, AmqpError> {
        let (reply_to, pending) = self.reply_consumer().await?;
        let correlation_id = call
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let body = call.body(Some(correlation_id.clone()));
        let message = OutgoingMessage::json(&body)?
            .with_correlation_id(&correlation_id)
            .with_reply_to(&reply_to)
            .with_header(REQUEST_ID_HEADER, Uuid::new_v4().to_string());

        let (receiver, _pending) = pending
            .register(&correlation_id)
            .ok_or_else(|| AmqpError::ConsumerClosed(reply_to.clone()))?;

        info!(
            method = call.method.as_str(),
            params = serde_json::to_string(&call.params).unwrap_or_default(),
            "message to send"
        );
        self.publisher
            .publish_message(exchange, routing_key, message)
            .await?;

        let reply = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, receiver).await.map_err(|_| {
                warn!(
                    correlation_id = correlation_id.as_str(),
                    "no reply before the call timeout"
                );
                AmqpError::Timeout
            })?,
            None => receiver.await,
        }
        .map_err(|_| AmqpError::ConsumerClosed(reply_to.clone()))?;

        info!(
            correlation_id = correlation_id.as_str(),
            response = %String::from_utf8_lossy(&reply.body),
            "response"
        );
        RpcResult::from_slice(&reply.body)
    }

    /// Number of calls awaiting their reply.
    pub async fn pending(&self) -> usize {
        self.reply
            .lock()
            .await
            .as_ref()
            .map(|current| current.pending.len())
            .unwrap_or(0)
    }
}

impl Drop for RequestReplyClient {
    fn drop(&mut self) {
        if let Some(current) = self.reply.get_mut().take() {
            current.listener.abort();
        }
    }
}

async fn consume_replies(mut replies: DeliveryStream, pending: Arc<PendingCalls>, queue: String) {
    while let Some(next) = replies.next().await {
        let Delivery { message, acker } = match next {
            Ok(delivery) => delivery,
            Err(err) => {
                error!(error = err.to_string(), "error receiving reply");
                continue;
            }
        };

        let correlation_id = message.correlation_id.clone().unwrap_or_default();
        let settled = match pending.resolve(&correlation_id, message) {
            Ok(()) => acker.ack().await,
            Err(err) => {
                warn!(error = err.to_string(), "rejecting reply");
                acker.reject(false).await
            }
        };

        if let Err(err) = settled {
            error!(error = err.to_string(), "failure to settle reply");
        }
    }

    let failed = pending.close();
    warn!(queue = queue.as_str(), failed = failed, "reply stream closed by the broker");
}
