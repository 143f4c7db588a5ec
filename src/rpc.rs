// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! JSON-RPC 2.0 shaped payloads exchanged by request/reply.
//!
//! A request travels as `{"method", "params", "id", "jsonrpc": "2.0"}`, its
//! answer as an object holding exactly `id` and `result`.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

/// Positional or named call parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    Positional(Vec<Value>),
    Named(Map<String, Value>),
}

impl Default for Params {
    fn default() -> Self {
        Params::Positional(vec![])
    }
}

/// A remote method invocation.
///
/// `id` doubles as the correlation id of the request; a fresh one is
/// generated when it is `None`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Call {
    pub method: String,
    pub params: Params,
    pub id: Option<String>,
}

impl Call {
    pub fn positional(method: &str, params: Vec<Value>) -> Self {
        Call {
            method: method.to_owned(),
            params: Params::Positional(params),
            id: None,
        }
    }

    pub fn named(method: &str, params: Map<String, Value>) -> Self {
        Call {
            method: method.to_owned(),
            params: Params::Named(params),
            id: None,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_owned());
        self
    }

    /// The wire envelope of this call.
    pub fn body(&self, id: Option<String>) -> CallBody {
        CallBody {
            method: self.method.clone(),
            params: self.params.clone(),
            id,
            jsonrpc: JSONRPC_VERSION.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCallBody")]
pub struct CallBody {
    pub method: String,
    pub params: Params,
    pub id: Option<String>,
    pub jsonrpc: String,
}

#[derive(Deserialize)]
struct RawCallBody {
    method: String,
    params: Params,
    #[serde(default)]
    id: Option<String>,
    jsonrpc: String,
}

impl TryFrom<RawCallBody> for CallBody {
    type Error = String;

    fn try_from(raw: RawCallBody) -> Result<Self, Self::Error> {
        if raw.jsonrpc != JSONRPC_VERSION {
            return Err(format!("unsupported jsonrpc version: {}", raw.jsonrpc));
        }

        Ok(CallBody {
            method: raw.method,
            params: raw.params,
            id: raw.id,
            jsonrpc: raw.jsonrpc,
        })
    }
}

/// The answer to a [`Call`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpcResult<T> {
    pub id: Option<String>,
    pub result: T,
}

impl<T: DeserializeOwned> RpcResult<T> {
    /// Decodes a result, requiring exactly the `id` and `result` members.
    pub fn from_slice(body: &[u8]) -> Result<Self, AmqpError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|err| AmqpError::InvalidPayload(err.to_string()))?;

        match value.as_object() {
            Some(members) if members.len() == 2 => {}
            _ => {
                return Err(AmqpError::InvalidPayload(
                    "a result holds exactly the id and result members".to_owned(),
                ))
            }
        }

        serde_json::from_value(value).map_err(|err| AmqpError::InvalidPayload(err.to_string()))
    }
}
