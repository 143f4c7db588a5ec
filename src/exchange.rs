// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Exchange definitions.
//!
//! Besides the application exchange read from configuration, every channel
//! exposes the unnamed default exchange, which routes a message to the queue
//! whose name equals the routing key.

use crate::config::ExchangeOptions;
use serde::Deserialize;

/// Name of the broker's default exchange.
pub const DEFAULT_EXCHANGE: &str = "";

/// Routing algorithm of an exchange. Configuration spells it in lowercase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// What to declare for an exchange.
///
/// `passive` only checks that the exchange exists, so it takes no part in
/// flag comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) internal: bool,
    pub(crate) passive: bool,
}

impl ExchangeDefinition {
    /// A transient direct exchange called `name`.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: false,
            auto_delete: false,
            internal: false,
            passive: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub(crate) fn same_flags(&self, other: &ExchangeDefinition) -> bool {
        self.kind == other.kind
            && self.durable == other.durable
            && self.auto_delete == other.auto_delete
            && self.internal == other.internal
    }
}

impl From<&ExchangeOptions> for ExchangeDefinition {
    fn from(opts: &ExchangeOptions) -> Self {
        ExchangeDefinition {
            name: opts.name.clone(),
            kind: opts.kind.clone(),
            durable: opts.durable,
            auto_delete: opts.auto_delete,
            internal: opts.internal,
            passive: opts.passive,
        }
    }
}

/// An exchange known to exist, usable as a publish target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeclaredExchange {
    name: String,
}

impl DeclaredExchange {
    pub fn new(name: &str) -> Self {
        DeclaredExchange {
            name: name.to_owned(),
        }
    }

    pub fn default_exchange() -> Self {
        DeclaredExchange::new(DEFAULT_EXCHANGE)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_EXCHANGE
    }
}
