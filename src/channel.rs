// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module defines [`AmqpChannel`], the set of channel operations the
//! substrate relies on, and implements it for `lapin::Channel`. It also
//! converts between lapin deliveries/properties and the crate's message types.
//!
//! One read channel (consume role) and one write channel (publish role) exist
//! per process once the lifecycle coordinator is initialized.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{
        Acker, Delivery, DeliveryMode, DeliveryStream, HeaderValue, Headers, IncomingMessage,
        OutgoingMessage,
    },
    queue::{DeclaredQueue, QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker as LapinAcker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
    },
    BasicProperties, Channel, Connection,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Channel operations used by the substrate.
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Limits the number of unacknowledged deliveries held by consumers of this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue, returning its (possibly broker generated) name.
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<DeclaredQueue, AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutgoingMessage,
    ) -> Result<(), AmqpError>;

    /// Registers a consumer and returns its deliveries.
    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    /// Cancels a consumer registration; the broker stops delivering to it.
    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Creates a new AMQP channel on an open connection.
///
/// # Parameters
/// * `conn` - An established RabbitMQ connection
///
/// # Returns
/// * `Result<Arc<Channel>, AmqpError>` - The channel on success, or an error on failure.
pub async fn new_amqp_channel(conn: &Connection) -> Result<Arc<Channel>, AmqpError> {
    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok(Arc::new(c))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError {})
        }
    }
}

#[async_trait]
impl AmqpChannel for Channel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        match Channel::basic_qos(self, prefetch_count, BasicQosOptions { global: false }).await {
            Err(err) => {
                error!(error = err.to_string(), "error to configure qos");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        match Channel::exchange_declare(
            self,
            &def.name,
            def.kind.clone().into(),
            ExchangeDeclareOptions {
                passive: def.passive,
                durable: def.durable,
                auto_delete: def.auto_delete,
                internal: def.internal,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<DeclaredQueue, AmqpError> {
        match Channel::queue_declare(
            self,
            &def.name,
            QueueDeclareOptions {
                passive: def.passive,
                durable: def.durable,
                exclusive: def.exclusive,
                auto_delete: def.auto_delete,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name.as_str(), "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => Ok(DeclaredQueue::new(
                queue.name().as_str(),
                queue.message_count(),
                queue.consumer_count(),
            )),
        }
    }

    async fn queue_bind(&self, binding: &QueueBinding<'_>) -> Result<(), AmqpError> {
        match Channel::queue_bind(
            self,
            binding.queue,
            binding.exchange,
            binding.routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange.to_owned(),
                    binding.queue.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutgoingMessage,
    ) -> Result<(), AmqpError> {
        match Channel::basic_publish(
            self,
            exchange,
            routing_key,
            BasicPublishOptions {
                immediate: false,
                mandatory: false,
            },
            &message.body,
            to_properties(message),
        )
        .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match Channel::basic_consume(
            self,
            queue,
            consumer_tag,
            BasicConsumeOptions {
                no_local: false,
                no_ack: false,
                exclusive: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
        {
            Err(err) => {
                error!(error = err.to_string(), "failure to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery::new(
                    from_delivery(&delivery),
                    Box::new(delivery.acker),
                )),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        match Channel::basic_cancel(self, consumer_tag, BasicCancelOptions { nowait: false }).await {
            Err(err) => {
                error!(error = err.to_string(), "failure to cancel the consumer");
                Err(AmqpError::ConsumerCancelError(consumer_tag.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        match Channel::close(self, 200, "OK").await {
            Err(err) => {
                error!(error = err.to_string(), "failure to close the channel");
                Err(AmqpError::ChannelError)
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Acker for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        LapinAcker::ack(self, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        LapinAcker::nack(
            self,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error whiling nack msg");
            AmqpError::NackMessageError
        })
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        LapinAcker::reject(self, BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                AmqpError::RejectMessageError
            })
    }
}

fn from_delivery(delivery: &lapin::message::Delivery) -> IncomingMessage {
    let props = &delivery.properties;
    let text = |value: &Option<ShortString>| value.as_ref().map(|v| v.to_string());

    IncomingMessage {
        body: delivery.data.clone(),
        content_type: text(props.content_type()),
        correlation_id: text(props.correlation_id()),
        reply_to: text(props.reply_to()),
        app_id: text(props.app_id()),
        message_id: text(props.message_id()),
        headers: props
            .headers()
            .as_ref()
            .map(|table| from_field_table(table.inner()))
            .unwrap_or_default(),
        delivery_mode: (*props.delivery_mode()).and_then(DeliveryMode::from_u8),
        expiration: text(props.expiration()),
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
    }
}

fn to_properties(message: &OutgoingMessage) -> BasicProperties {
    let mut props = BasicProperties::default()
        .with_delivery_mode(message.delivery_mode.as_u8())
        .with_headers(to_field_table(&message.headers));

    if let Some(v) = &message.content_type {
        props = props.with_content_type(ShortString::from(v.as_str()));
    }
    if let Some(v) = &message.correlation_id {
        props = props.with_correlation_id(ShortString::from(v.as_str()));
    }
    if let Some(v) = &message.reply_to {
        props = props.with_reply_to(ShortString::from(v.as_str()));
    }
    if let Some(v) = &message.app_id {
        props = props.with_app_id(ShortString::from(v.as_str()));
    }
    if let Some(v) = &message.message_id {
        props = props.with_message_id(ShortString::from(v.as_str()));
    }
    if let Some(v) = &message.expiration {
        props = props.with_expiration(ShortString::from(v.as_str()));
    }

    props
}

/// Converts crate headers into an AMQP field table.
fn to_field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in headers {
        let amqp_value = match value.clone() {
            HeaderValue::Bool(v) => AMQPValue::Boolean(v),
            HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValue::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValue::Uint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
        };

        btree.insert(ShortString::from(key.as_str()), amqp_value);
    }

    FieldTable::from(btree)
}

/// Converts an AMQP field table into crate headers, skipping nested values.
fn from_field_table(table: &BTreeMap<ShortString, AMQPValue>) -> Headers {
    table
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
                AMQPValue::ShortString(v) => HeaderValue::ShortString(v.to_string()),
                AMQPValue::LongString(v) => {
                    HeaderValue::LongString(String::from_utf8_lossy(v.as_bytes()).into_owned())
                }
                AMQPValue::ShortInt(v) => HeaderValue::Int(*v),
                AMQPValue::LongInt(v) => HeaderValue::LongInt(*v),
                AMQPValue::LongLongInt(v) => HeaderValue::LongLongInt(*v),
                AMQPValue::LongUInt(v) => HeaderValue::Uint(*v),
                _ => return None,
            };
            Some((key.to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_conversion_keeps_supported_values() {
        let mut headers = Headers::new();
        headers.insert("request_id".to_owned(), HeaderValue::from("r-1"));
        headers.insert("attempt".to_owned(), HeaderValue::LongInt(3));
        headers.insert("flag".to_owned(), HeaderValue::Bool(true));

        let table = to_field_table(&headers);

        assert_eq!(from_field_table(table.inner()), headers);
    }

    #[test]
    fn unsupported_header_values_are_skipped() {
        let mut table = BTreeMap::new();
        table.insert(ShortString::from("nested"), AMQPValue::FieldTable(FieldTable::default()));
        table.insert(ShortString::from("n"), AMQPValue::LongLongInt(5));

        let headers = from_field_table(&table);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("n"), Some(&HeaderValue::LongLongInt(5)));
    }

    #[test]
    fn properties_carry_message_metadata() {
        let message = OutgoingMessage::new(b"{}".to_vec())
            .with_content_type("application/json")
            .with_correlation_id("c-1")
            .with_reply_to("amq.gen-1")
            .with_app_id("trade")
            .with_expiration("1000")
            .with_delivery_mode(DeliveryMode::Transient);

        let props = to_properties(&message);

        assert_eq!(props.correlation_id().as_ref().map(|v| v.as_str()), Some("c-1"));
        assert_eq!(props.reply_to().as_ref().map(|v| v.as_str()), Some("amq.gen-1"));
        assert_eq!(props.app_id().as_ref().map(|v| v.as_str()), Some("trade"));
        assert_eq!(props.expiration().as_ref().map(|v| v.as_str()), Some("1000"));
        assert_eq!(*props.delivery_mode(), Some(1));
        assert_eq!(props.message_id(), &None);
    }
}
