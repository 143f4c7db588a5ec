// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-flight Task Counter
//!
//! Counts handler invocations running for one queue and implements the
//! stop-and-drain protocol used at shutdown: once stopped, new work is
//! rejected with [`AmqpError::StoppedCounter`] and [`TaskCounter::stop`]
//! resolves when the last running invocation exits.

use crate::errors::AmqpError;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Default)]
struct CounterState {
    count: usize,
    stopped: bool,
}

/// Concurrency-safe count of in-flight work.
#[derive(Debug)]
pub struct TaskCounter {
    state: Mutex<CounterState>,
    drained: watch::Sender<bool>,
}

impl TaskCounter {
    pub fn new() -> Arc<Self> {
        let (drained, _) = watch::channel(false);
        Arc::new(TaskCounter {
            state: Mutex::new(CounterState::default()),
            drained,
        })
    }

    /// Registers one unit of work.
    ///
    /// The returned guard exits the counter when dropped, whatever the outcome
    /// of the work it tracks.
    pub fn enter(self: &Arc<Self>) -> Result<TaskGuard, AmqpError> {
        let mut state = self.lock();
        if state.stopped {
            return Err(AmqpError::StoppedCounter);
        }
        state.count += 1;

        Ok(TaskGuard {
            counter: Arc::clone(self),
        })
    }

    /// Rejects new work from now on, without waiting for running work.
    pub fn close(&self) {
        let mut state = self.lock();
        state.stopped = true;
        if state.count == 0 {
            self.signal_drained();
        }
    }

    /// Rejects new work and waits until every running unit has exited.
    ///
    /// Calling it again after the counter drained returns immediately.
    pub async fn stop(&self) {
        self.close();

        let mut drained = self.drained.subscribe();
        if drained.wait_for(|done| *done).await.is_err() {
            debug!("task counter dropped while draining");
        }
    }

    pub fn count(&self) -> usize {
        self.lock().count
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    pub fn is_drained(&self) -> bool {
        *self.drained.borrow()
    }

    fn exit(&self) {
        let mut state = self.lock();
        state.count = state.count.saturating_sub(1);
        if state.stopped && state.count == 0 {
            self.signal_drained();
        }
    }

    fn signal_drained(&self) {
        self.drained.send_if_modified(|done| {
            if *done {
                return false;
            }
            *done = true;
            true
        });
    }

    fn lock(&self) -> MutexGuard<'_, CounterState> {
        // every update leaves CounterState consistent, poisoning carries no meaning here
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Keeps one unit of work registered on a [`TaskCounter`].
#[derive(Debug)]
pub struct TaskGuard {
    counter: Arc<TaskCounter>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.counter.exit();
    }
}
