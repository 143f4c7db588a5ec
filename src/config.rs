// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Substrate Configuration
//!
//! Connection parameters, queue and exchange flags, prefetch and timing knobs.
//! Values are read once at startup and never change afterwards.
//!
//! Configuration is layered with the `config` crate: a file source first, then
//! environment variables prefixed with `RABBITMQ` using `__` as the nesting
//! separator (for example `RABBITMQ_CONSUMER__PREFETCH_COUNT=10`).

use crate::{errors::AmqpError, exchange::ExchangeKind};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::{collections::BTreeMap, path::Path, path::PathBuf, time::Duration};

/// Prefix of the environment variables overriding file values.
pub const ENV_PREFIX: &str = "RABBITMQ";

const DEFAULT_PORT: u16 = 5672;
const DEFAULT_VHOST: &str = "/";
const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 2000;

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_vhost() -> String {
    DEFAULT_VHOST.to_owned()
}

fn default_prefetch() -> u16 {
    1
}

fn default_reconnect_interval() -> u64 {
    DEFAULT_RECONNECT_INTERVAL_MS
}

/// Parameters needed to open one broker connection.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub host: String,
    pub login: String,
    pub password: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub tls_options: Option<TlsOptions>,
}

/// TLS material used when `tls` is enabled.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct TlsOptions {
    /// PEM encoded CA chain used to verify the broker certificate.
    pub cert_chain: Option<PathBuf>,
    /// PKCS#12 client identity.
    pub identity: Option<PathBuf>,
    #[serde(default)]
    pub identity_password: String,
}

/// Flags of a consumed queue.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct QueueOptions {
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub passive: bool,
    #[serde(default)]
    pub auto_delete: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            durable: true,
            exclusive: false,
            passive: false,
            auto_delete: false,
        }
    }
}

/// The application exchange.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub name: String,
    #[serde(default)]
    pub kind: ExchangeKind,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub passive: bool,
}

impl ExchangeOptions {
    pub fn new(name: &str) -> Self {
        ExchangeOptions {
            name: name.to_owned(),
            kind: ExchangeKind::default(),
            durable: true,
            auto_delete: false,
            internal: false,
            passive: false,
        }
    }
}

/// Settings of the consume-role connection.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ConsumerConfig {
    #[serde(flatten)]
    pub connection: ConnectionOptions,
    #[serde(default)]
    pub queues: BTreeMap<String, QueueOptions>,
    #[serde(default = "default_prefetch")]
    pub prefetch_count: u16,
    /// Name of the reply queue used by the request/reply client. The broker
    /// generates one when absent.
    #[serde(default)]
    pub callback_queue: Option<String>,
}

/// Settings of the publish-role connection.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PublisherConfig {
    #[serde(flatten)]
    pub connection: ConnectionOptions,
    #[serde(default)]
    pub exchange: Option<ExchangeOptions>,
    /// Used by the publisher for messages published with an empty routing key.
    #[serde(default)]
    pub routing_key: Option<String>,
}

/// Root configuration of the substrate.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RabbitMQConfig {
    pub consumer: ConsumerConfig,
    pub publisher: PublisherConfig,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,
    #[serde(default)]
    pub message_expiration_ms: Option<u64>,
    /// Upper bound on a request/reply call. Calls wait forever when absent.
    #[serde(default)]
    pub call_timeout_ms: Option<u64>,
}

impl RabbitMQConfig {
    /// Loads the configuration from a file, overridden by `RABBITMQ_*`
    /// environment variables.
    ///
    /// The file format is inferred from the extension.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, AmqpError> {
        let cfg = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(env_source())
            .build()?;

        Ok(cfg.try_deserialize()?)
    }

    /// Loads the configuration from an in-memory TOML document, overridden by
    /// `RABBITMQ_*` environment variables.
    pub fn from_toml(content: &str) -> Result<Self, AmqpError> {
        let cfg = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .add_source(env_source())
            .build()?;

        Ok(cfg.try_deserialize()?)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    /// Per-message expiration in the string form AMQP expects.
    pub fn message_expiration(&self) -> Option<String> {
        self.message_expiration_ms.map(|ms| ms.to_string())
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
