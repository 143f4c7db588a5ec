// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Request/Reply Substrate
//!
//! Durable broker connections, topology provisioning, supervised consumers
//! with drain-on-stop, a publisher, and correlation based request/reply on
//! top of RabbitMQ.
//!
//! A consuming service is usually started through [`lifecycle::RabbitMQ::run`]
//! or [`lifecycle::RabbitMQ::run_until_signal`]; one-off callers use
//! [`lifecycle::RabbitMQ::call_once`].

mod otel;

pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod counter;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod lifecycle;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod requester;
pub mod rpc;
pub mod signal;
pub mod topology;

#[cfg(test)]
mod testing;
