// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module runs the receive loop of one queue. Every delivery is handed to
//! the application [`MessageHandler`] on its own task, tracked by the queue's
//! [`TaskCounter`], and settled according to the returned [`Outcome`]:
//!
//! - `Ok(Outcome::Ack)`: acknowledged, removed from the queue
//! - `Ok(Outcome::Requeue)`: negatively acknowledged with requeue
//! - `Ok(Outcome::Discard)`: rejected without requeue
//! - `Err(_)` or a panic: logged, then rejected without requeue
//!
//! On stop the supervisor cancels its broker registration, requeues whatever
//! was already buffered, and waits for in-flight handlers before returning.
//! A delivery stream ended by the broker drains the same way but is reported
//! as an error.

use crate::{
    channel::AmqpChannel,
    counter::TaskCounter,
    errors::AmqpError,
    message::{with_request_id, Acker, Delivery, IncomingMessage},
    otel,
    signal::StopListener,
};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
use std::{borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Error type application handlers may fail with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What to do with a message once its handler returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Requeue,
    Discard,
}

/// Application code invoked once per delivered message.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, queue: &str, message: &IncomingMessage) -> Result<Outcome, HandlerError>;
}

/// Lifecycle of a [`QueueSupervisor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Consuming,
    Draining,
    Stopped,
}

/// Consumes one queue until stopped.
pub struct QueueSupervisor {
    queue: String,
    channel: Arc<dyn AmqpChannel>,
    handler: Arc<dyn MessageHandler>,
    counter: Arc<TaskCounter>,
    state: watch::Sender<SupervisorState>,
}

impl QueueSupervisor {
    pub fn new(queue: &str, channel: Arc<dyn AmqpChannel>, handler: Arc<dyn MessageHandler>) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        QueueSupervisor {
            queue: queue.to_owned(),
            channel,
            handler,
            counter: TaskCounter::new(),
            state,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// The counter tracking this queue's in-flight handlers.
    pub fn counter(&self) -> Arc<TaskCounter> {
        self.counter.clone()
    }

    /// Consumes until `stop` fires or the broker ends the delivery stream,
    /// then drains. Returns once every handler started here has exited.
    ///
    /// # Returns
    /// `Ok(())` after a requested stop. A stream the broker ended on its own,
    /// for instance because the connection was lost, is drained the same way
    /// and then reported as [`AmqpError::ConsumerClosed`].
    pub async fn run(&self, mut stop: StopListener) -> Result<(), AmqpError> {
        let tag = format!("{}.{}", self.queue, Uuid::new_v4());
        let mut deliveries = self.channel.basic_consume(&self.queue, &tag).await?.fuse();

        self.state.send_replace(SupervisorState::Consuming);
        info!(queue = self.queue.as_str(), "consuming queue");

        let mut closed_by_broker = false;
        loop {
            tokio::select! {
                biased;

                _ = stop.wait() => {
                    debug!(queue = self.queue.as_str(), "stop requested");
                    break;
                }

                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => self.dispatch(delivery).await,
                    Some(Err(err)) => error!(error = err.to_string(), "errors consume msg"),
                    None => {
                        warn!(queue = self.queue.as_str(), "delivery stream closed by the broker");
                        closed_by_broker = true;
                        break;
                    }
                },
            }
        }

        if !closed_by_broker {
            if let Err(err) = self.channel.basic_cancel(&tag).await {
                warn!(error = err.to_string(), tag = tag.as_str(), "failure to cancel the consumer");
            }
        }
        self.state.send_replace(SupervisorState::Draining);

        self.counter.close();
        while let Some(Some(next)) = deliveries.next().now_or_never() {
            if let Ok(delivery) = next {
                self.dispatch(delivery).await;
            }
        }

        self.counter.stop().await;
        self.state.send_replace(SupervisorState::Stopped);
        info!(queue = self.queue.as_str(), "consumer stopped");

        if closed_by_broker {
            return Err(AmqpError::ConsumerClosed(self.queue.clone()));
        }
        Ok(())
    }

    async fn dispatch(&self, delivery: Delivery) {
        match self.counter.enter() {
            Ok(guard) => {
                let queue = self.queue.clone();
                let handler = self.handler.clone();

                tokio::spawn(async move {
                    let _guard = guard;
                    let tracer = global::tracer("amqp consumer");
                    if let Err(err) = consume(&tracer, &queue, delivery, handler.as_ref()).await {
                        error!(error = err.to_string(), "error consume msg");
                    }
                });
            }
            Err(err) => {
                debug!(error = err.to_string(), "consumer draining, requeuing message");
                if let Err(err) = delivery.acker.nack(true).await {
                    error!(error = err.to_string(), "error whiling requeuing");
                }
            }
        }
    }
}

/// Runs `handler` on one delivery and settles it.
///
/// The handler executes inside a request-id scope taken from the message's
/// `request_id` header, or a fresh one when the header is missing.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    queue: &str,
    delivery: Delivery,
    handler: &dyn MessageHandler,
) -> Result<(), AmqpError> {
    let Delivery { message, acker } = delivery;
    let (_ctx, mut span) = otel::new_span(&message.headers, tracer, queue);

    let request_id = message
        .request_id()
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    debug!(
        queue = queue,
        request_id = request_id.as_str(),
        "received: {} - exchange: {}",
        message.routing_key,
        message.exchange
    );

    let handled = with_request_id(
        request_id,
        AssertUnwindSafe(async { handler.handle(queue, &message).await }).catch_unwind(),
    )
    .await;

    let outcome = match handled {
        Ok(Ok(outcome)) => {
            span.set_status(Status::Ok);
            outcome
        }
        Ok(Err(err)) => {
            error!(error = err.to_string(), queue = queue, "handler failed, discarding message");
            span.record_error(&*err);
            span.set_status(Status::Error {
                description: Cow::from("handler failure"),
            });
            Outcome::Discard
        }
        Err(_) => {
            error!(queue = queue, "handler panicked, discarding message");
            span.set_status(Status::Error {
                description: Cow::from("handler panicked"),
            });
            Outcome::Discard
        }
    };

    settle(acker.as_ref(), outcome).await.inspect_err(|err| {
        span.record_error(err);
        span.set_status(Status::Error {
            description: Cow::from("error to settle msg"),
        });
    })
}

async fn settle(acker: &dyn Acker, outcome: Outcome) -> Result<(), AmqpError> {
    match outcome {
        Outcome::Ack => {
            debug!("message successfully processed");
            acker.ack().await
        }
        Outcome::Requeue => {
            warn!("handler asked for a retry, requeuing for latter");
            acker.nack(true).await
        }
        Outcome::Discard => acker.reject(false).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::{current_request_id, MockAcker, REQUEST_ID_HEADER},
        signal::StopSignal,
        testing::{FakeBroker, Settlement},
    };
    use mockall::predicate::eq;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::sync::Notify;

    fn tracer() -> BoxedTracer {
        global::tracer("test")
    }

    fn message(body: &str) -> IncomingMessage {
        IncomingMessage {
            body: body.as_bytes().to_vec(),
            routing_key: "orders".to_owned(),
            ..IncomingMessage::default()
        }
    }

    fn handler_returning(result: fn() -> Result<Outcome, HandlerError>) -> MockMessageHandler {
        let mut handler = MockMessageHandler::new();
        handler
            .expect_handle()
            .with(eq("orders"), mockall::predicate::always())
            .times(1)
            .returning(move |_, _| result());
        handler
    }

    async fn run_once(handler: &dyn MessageHandler, acker: MockAcker) -> Result<(), AmqpError> {
        let delivery = Delivery::new(message("{}"), Box::new(acker));
        consume(&tracer(), "orders", delivery, handler).await
    }

    #[tokio::test]
    async fn success_acknowledges() {
        let mut acker = MockAcker::new();
        acker.expect_ack().times(1).returning(|| Ok(()));

        run_once(&handler_returning(|| Ok(Outcome::Ack)), acker)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn retry_requeues() {
        let mut acker = MockAcker::new();
        acker
            .expect_nack()
            .with(eq(true))
            .times(1)
            .returning(|_| Ok(()));

        run_once(&handler_returning(|| Ok(Outcome::Requeue)), acker)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn discard_rejects_without_requeue() {
        let mut acker = MockAcker::new();
        acker
            .expect_reject()
            .with(eq(false))
            .times(1)
            .returning(|_| Ok(()));

        run_once(&handler_returning(|| Ok(Outcome::Discard)), acker)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unclassified_failure_rejects_without_requeue() {
        let mut acker = MockAcker::new();
        acker
            .expect_reject()
            .with(eq(false))
            .times(1)
            .returning(|_| Ok(()));

        run_once(&handler_returning(|| Err("boom".into())), acker)
            .await
            .unwrap();
    }

    struct Panicking;

    #[async_trait]
    impl MessageHandler for Panicking {
        async fn handle(&self, _: &str, _: &IncomingMessage) -> Result<Outcome, HandlerError> {
            panic!("handler blew up")
        }
    }

    #[tokio::test]
    async fn panicking_handler_rejects_without_requeue() {
        let mut acker = MockAcker::new();
        acker
            .expect_reject()
            .with(eq(false))
            .times(1)
            .returning(|_| Ok(()));

        run_once(&Panicking, acker).await.unwrap();
    }

    #[tokio::test]
    async fn settle_failure_is_returned() {
        let mut acker = MockAcker::new();
        acker
            .expect_ack()
            .times(1)
            .returning(|| Err(AmqpError::AckMessageError));

        let err = run_once(&handler_returning(|| Ok(Outcome::Ack)), acker)
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::AckMessageError);
    }

    struct RequestIdProbe;

    #[async_trait]
    impl MessageHandler for RequestIdProbe {
        async fn handle(&self, _: &str, message: &IncomingMessage) -> Result<Outcome, HandlerError> {
            let expected = message.request_id().map(str::to_owned);
            let current = current_request_id();
            match (expected, current) {
                (Some(expected), Some(current)) if expected == current => Ok(Outcome::Ack),
                (None, Some(_)) => Ok(Outcome::Ack),
                _ => Ok(Outcome::Discard),
            }
        }
    }

    #[tokio::test]
    async fn handler_runs_in_request_id_scope() {
        for request_id in [Some("req-1"), None] {
            let mut message = message("{}");
            if let Some(id) = request_id {
                message
                    .headers
                    .insert(REQUEST_ID_HEADER.to_owned(), id.into());
            }

            let mut acker = MockAcker::new();
            acker.expect_ack().times(1).returning(|| Ok(()));

            consume(&tracer(), "orders", Delivery::new(message, Box::new(acker)), &RequestIdProbe)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn draining_supervisor_requeues_new_deliveries() {
        let broker = FakeBroker::new();
        let supervisor = QueueSupervisor::new(
            "orders",
            broker.channel(),
            Arc::new(MockMessageHandler::new()),
        );
        supervisor.counter.close();

        let mut acker = MockAcker::new();
        acker
            .expect_nack()
            .with(eq(true))
            .times(1)
            .returning(|_| Ok(()));

        supervisor
            .dispatch(Delivery::new(message("{}"), Box::new(acker)))
            .await;
        assert_eq!(supervisor.counter.count(), 0);
    }

    struct Gated {
        started: AtomicUsize,
        release: Notify,
    }

    #[async_trait]
    impl MessageHandler for Gated {
        async fn handle(&self, _: &str, _: &IncomingMessage) -> Result<Outcome, HandlerError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(Outcome::Ack)
        }
    }

    async fn wait_until(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn stop_drains_in_flight_handlers() {
        let broker = FakeBroker::new();
        let channel = broker.channel();
        channel
            .queue_declare(&crate::queue::QueueDefinition::new("orders"))
            .await
            .unwrap();
        for i in 0..3 {
            broker.deliver("orders", message(&i.to_string()));
        }

        let handler = Arc::new(Gated {
            started: AtomicUsize::new(0),
            release: Notify::new(),
        });
        let supervisor = Arc::new(QueueSupervisor::new("orders", channel, handler.clone()));
        let stop = StopSignal::new();

        let running = {
            let supervisor = supervisor.clone();
            let listener = stop.listener();
            tokio::spawn(async move { supervisor.run(listener).await })
        };

        wait_until(|| handler.started.load(Ordering::SeqCst) == 3).await;
        assert_eq!(supervisor.state(), SupervisorState::Consuming);
        assert_eq!(supervisor.counter().count(), 3);

        stop.trigger();
        let mut states = supervisor.subscribe();
        states
            .wait_for(|s| *s == SupervisorState::Draining)
            .await
            .unwrap();
        assert!(!running.is_finished());
        assert!(!broker.has_consumer("orders"));

        handler.release.notify_waiters();
        running.await.unwrap().unwrap();

        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert_eq!(supervisor.counter().count(), 0);
        assert_eq!(broker.settlements(), vec![Settlement::Acked; 3]);
    }

    #[tokio::test]
    async fn broker_closed_stream_drains_then_fails() {
        let broker = FakeBroker::new();
        let channel = broker.channel();
        channel
            .queue_declare(&crate::queue::QueueDefinition::new("orders"))
            .await
            .unwrap();
        broker.deliver("orders", message("1"));

        let handler = Arc::new(Gated {
            started: AtomicUsize::new(0),
            release: Notify::new(),
        });
        let supervisor = Arc::new(QueueSupervisor::new("orders", channel, handler.clone()));
        let stop = StopSignal::new();

        let running = {
            let supervisor = supervisor.clone();
            let listener = stop.listener();
            tokio::spawn(async move { supervisor.run(listener).await })
        };

        wait_until(|| handler.started.load(Ordering::SeqCst) == 1).await;
        broker.drop_consumers("orders");

        supervisor
            .subscribe()
            .wait_for(|s| *s == SupervisorState::Draining)
            .await
            .unwrap();
        assert!(!running.is_finished());

        handler.release.notify_waiters();
        let err = running.await.unwrap().unwrap_err();

        assert_eq!(err, AmqpError::ConsumerClosed("orders".to_owned()));
        assert!(!stop.is_triggered());
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert_eq!(broker.settlements(), vec![Settlement::Acked]);
    }

    #[tokio::test]
    async fn consuming_unknown_queue_fails() {
        let broker = FakeBroker::new();
        let supervisor = QueueSupervisor::new(
            "missing",
            broker.channel(),
            Arc::new(MockMessageHandler::new()),
        );

        let err = supervisor.run(StopSignal::new().listener()).await.unwrap_err();

        assert_eq!(err, AmqpError::ConsumerDeclarationError("missing".to_owned()));
        assert_eq!(supervisor.state(), SupervisorState::Idle);
    }
}
