// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Process-wide stop event.
//!
//! A [`StopSignal`] fires once; every [`StopListener`] handed out by it, before
//! or after the trigger, observes the stop.

use crate::errors::AmqpError;
use std::sync::Arc;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::watch,
};
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct StopSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        StopSignal {
            sender: Arc::new(sender),
        }
    }

    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    pub fn listener(&self) -> StopListener {
        StopListener {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct StopListener {
    receiver: watch::Receiver<bool>,
}

impl StopListener {
    /// Resolves once the stop fired. A dropped [`StopSignal`] counts as a stop.
    pub async fn wait(&mut self) {
        let _ = self.receiver.wait_for(|stopped| *stopped).await;
    }

    pub fn is_stopped(&self) -> bool {
        *self.receiver.borrow()
    }
}

/// Returns a [`StopSignal`] triggered by SIGINT or SIGTERM.
pub fn on_termination() -> Result<StopSignal, AmqpError> {
    let stop = StopSignal::new();

    let mut interrupt = signal(SignalKind::interrupt()).map_err(|err| {
        error!(error = err.to_string(), "failure to install SIGINT handler");
        AmqpError::InternalError
    })?;
    let mut terminate = signal(SignalKind::terminate()).map_err(|err| {
        error!(error = err.to_string(), "failure to install SIGTERM handler");
        AmqpError::InternalError
    })?;

    let trigger = stop.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
        };
        info!(signal = name, "termination signal received, stopping");
        trigger.trigger();
    });

    Ok(stop)
}
