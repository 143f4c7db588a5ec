// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module provides functionality for publishing messages to the exchanges
//! declared at startup. Every outgoing message carries the application id, a
//! fresh message id, the current request id and the OpenTelemetry context of
//! the caller.

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::{DeclaredExchange, DEFAULT_EXCHANGE},
    message::{current_request_id, DeliveryMode, Headers, IncomingMessage, OutgoingMessage, REQUEST_ID_HEADER},
    otel,
    rpc::RpcResult,
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Optional transport properties of a published message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub headers: Headers,
    pub expiration: Option<String>,
}

/// Publishes to the exchanges declared on the publish channel.
pub struct Publisher {
    channel: Arc<dyn AmqpChannel>,
    exchanges: HashMap<String, DeclaredExchange>,
    app_id: Option<String>,
    expiration: Option<String>,
    routing_key: Option<String>,
}

impl Publisher {
    /// Creates a new publisher.
    ///
    /// # Parameters
    /// * `channel` - The publish channel
    /// * `exchanges` - The exchanges messages may be published to
    pub fn new(channel: Arc<dyn AmqpChannel>, exchanges: Vec<DeclaredExchange>) -> Publisher {
        Publisher {
            channel,
            exchanges: exchanges
                .into_iter()
                .map(|exchange| (exchange.name().to_owned(), exchange))
                .collect(),
            app_id: None,
            expiration: None,
            routing_key: None,
        }
    }

    /// Sets the application id stamped on every message.
    pub fn with_app_id(mut self, app_id: &str) -> Self {
        self.app_id = Some(app_id.to_owned());
        self
    }

    /// Sets the expiration applied to messages published without one.
    pub fn with_expiration(mut self, expiration: Option<String>) -> Self {
        self.expiration = expiration;
        self
    }

    /// Sets the routing key used when a message is published with an empty
    /// one.
    pub fn with_routing_key(mut self, routing_key: Option<String>) -> Self {
        self.routing_key = routing_key;
        self
    }

    pub fn app_id(&self) -> Option<&str> {
        self.app_id.as_deref()
    }

    /// Looks `name` up among the declared exchanges; `""` is the default
    /// exchange.
    pub fn resolve(&self, name: &str) -> Result<&DeclaredExchange, AmqpError> {
        self.exchanges.get(name).ok_or_else(|| {
            error!(exchange = name, "publishing to an undeclared exchange");
            AmqpError::MissingExchange(name.to_owned())
        })
    }

    /// Serializes `body` as JSON and publishes it.
    ///
    /// # Parameters
    /// * `exchange` - A declared exchange, `""` for the default one
    /// * `routing_key` - Routing key of the message
    /// * `body` - The payload
    /// * `delivery_mode` - Transient or persistent
    /// * `properties` - Correlation id, reply-to, headers and expiration
    ///
    /// An unknown exchange fails with [`AmqpError::MissingExchange`]. A body
    /// that cannot be serialized is logged and dropped: the call still
    /// returns `Ok(())`.
    pub async fn publish<T: Serialize + ?Sized + Sync>(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &T,
        delivery_mode: DeliveryMode,
        properties: PublishProperties,
    ) -> Result<(), AmqpError> {
        self.resolve(exchange)?;

        let message = match OutgoingMessage::json(body) {
            Ok(message) => message,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = exchange,
                    routing_key = routing_key,
                    "failure to serialize message, dropping it"
                );
                return Ok(());
            }
        };

        let PublishProperties {
            correlation_id,
            reply_to,
            headers,
            expiration,
        } = properties;

        let mut message = message.with_delivery_mode(delivery_mode);
        message.correlation_id = correlation_id;
        message.reply_to = reply_to;
        message.expiration = expiration;
        message.headers.extend(headers);

        self.publish_message(exchange, routing_key, message).await
    }

    /// Publishes an already encoded message; every failure is returned.
    ///
    /// An empty `routing_key` falls back to the configured one, if any.
    pub async fn publish_message(
        &self,
        exchange: &str,
        routing_key: &str,
        mut message: OutgoingMessage,
    ) -> Result<(), AmqpError> {
        let target = self.resolve(exchange)?;
        let routing_key = match self.routing_key.as_deref() {
            Some(fallback) if routing_key.is_empty() => fallback,
            _ => routing_key,
        };

        if message.app_id.is_none() {
            message.app_id = self.app_id.clone();
        }
        if message.message_id.is_none() {
            message.message_id = Some(Uuid::new_v4().to_string());
        }
        if message.expiration.is_none() {
            message.expiration = self.expiration.clone();
        }
        if !message.headers.contains_key(REQUEST_ID_HEADER) {
            if let Some(request_id) = current_request_id() {
                message
                    .headers
                    .insert(REQUEST_ID_HEADER.to_owned(), request_id.into());
            }
        }
        otel::inject_current(&mut message.headers);

        debug!(
            exchange = target.name(),
            routing_key = routing_key,
            "publishing message"
        );
        self.channel
            .basic_publish(target.name(), routing_key, &message)
            .await
    }

    /// Answers `request` with `result`, routed to its reply-to queue through
    /// the default exchange and tagged with its correlation id.
    ///
    /// Requests without reply-to expect no answer; nothing is published.
    pub async fn reply<T: Serialize + Sync>(
        &self,
        request: &IncomingMessage,
        result: &T,
    ) -> Result<(), AmqpError> {
        let Some(reply_to) = request.reply_to.as_deref() else {
            debug!("request without reply-to, not replying");
            return Ok(());
        };

        let body = RpcResult {
            id: request.correlation_id.clone(),
            result,
        };
        let properties = PublishProperties {
            correlation_id: request.correlation_id.clone(),
            ..PublishProperties::default()
        };

        self.publish(
            DEFAULT_EXCHANGE,
            reply_to,
            &body,
            DeliveryMode::Persistent,
            properties,
        )
        .await
    }
}
