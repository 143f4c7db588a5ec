// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! Transport-independent representation of the messages flowing through the
//! substrate, the acknowledgement seam used by consumers, and the task-local
//! request id carried from an incoming message to everything published while
//! handling it.

use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Header carrying the id of the request that caused a message.
pub const REQUEST_ID_HEADER: &str = "request_id";

tokio::task_local! {
    static REQUEST_ID: String;
}

/// Runs `fut` with `request_id` as the current request id.
pub async fn with_request_id<F: std::future::Future>(request_id: String, fut: F) -> F::Output {
    REQUEST_ID.scope(request_id, fut).await
}

/// The request id of the message being handled by the current task, if any.
pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(|id| id.clone()).ok()
}

/// AMQP delivery mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient,
    #[default]
    Persistent,
}

impl DeliveryMode {
    pub fn as_u8(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(DeliveryMode::Transient),
            2 => Some(DeliveryMode::Persistent),
            _ => None,
        }
    }
}

/// A header value supported by the substrate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Bool(bool),
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u32),
}

impl HeaderValue {
    /// The value as text, for string headers.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::ShortString(v) | HeaderValue::LongString(v) => Some(v),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::LongString(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::LongString(value)
    }
}

pub type Headers = BTreeMap<String, HeaderValue>;

/// A message received from a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingMessage {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub app_id: Option<String>,
    pub message_id: Option<String>,
    pub headers: Headers,
    pub delivery_mode: Option<DeliveryMode>,
    pub expiration: Option<String>,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
}

impl IncomingMessage {
    /// Decodes the JSON body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.body).map_err(|err| AmqpError::InvalidPayload(err.to_string()))
    }

    /// Value of the `request_id` header.
    pub fn request_id(&self) -> Option<&str> {
        self.headers
            .get(REQUEST_ID_HEADER)
            .and_then(HeaderValue::as_str)
    }
}

/// A message about to be published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub app_id: Option<String>,
    pub message_id: Option<String>,
    pub headers: Headers,
    pub delivery_mode: DeliveryMode,
    pub expiration: Option<String>,
}

impl OutgoingMessage {
    pub fn new(body: Vec<u8>) -> Self {
        OutgoingMessage {
            body,
            ..Default::default()
        }
    }

    /// Serializes `body` as JSON and sets the JSON content type.
    pub fn json<T: Serialize + ?Sized>(body: &T) -> Result<Self, AmqpError> {
        let body = serde_json::to_vec(body)?;
        Ok(OutgoingMessage::new(body).with_content_type(JSON_CONTENT_TYPE))
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_owned());
        self
    }

    pub fn with_reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_owned());
        self
    }

    pub fn with_app_id(mut self, app_id: &str) -> Self {
        self.app_id = Some(app_id.to_owned());
        self
    }

    pub fn with_message_id(mut self, message_id: &str) -> Self {
        self.message_id = Some(message_id.to_owned());
        self
    }

    pub fn with_header<V: Into<HeaderValue>>(mut self, key: &str, value: V) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn with_expiration(mut self, expiration: &str) -> Self {
        self.expiration = Some(expiration.to_owned());
        self
    }
}

/// Settles a delivered message with the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acker: Send + Sync {
    /// Acknowledges the message, removing it from the queue.
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Negatively acknowledges the message.
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;

    /// Rejects the message.
    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message handed over by the broker together with the means to settle it.
pub struct Delivery {
    pub message: IncomingMessage,
    pub acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(message: IncomingMessage, acker: Box<dyn Acker>) -> Self {
        Delivery { message, acker }
    }
}

/// Deliveries of one consumer registration, in broker order.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;
