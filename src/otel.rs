// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Trace context propagation through AMQP headers.

use crate::message::{HeaderValue, Headers};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;

/// Reads and writes propagator fields as string headers. Keys are stored in
/// lowercase.
pub(crate) struct HeadersPropagator<'a> {
    headers: &'a mut Headers,
}

impl<'a> HeadersPropagator<'a> {
    pub(crate) fn new(headers: &'a mut Headers) -> Self {
        Self { headers }
    }
}

impl Injector for HeadersPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers
            .insert(key.to_lowercase(), HeaderValue::LongString(value));
    }
}

impl Extractor for HeadersPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(HeaderValue::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes the current trace context into `headers`.
pub(crate) fn inject_current(headers: &mut Headers) {
    let ctx = Context::current();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut HeadersPropagator::new(headers))
    });
}

/// Starts a consumer span named `name`, parented on the context carried by
/// `headers`.
pub(crate) fn new_span(headers: &Headers, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let mut headers = headers.clone();
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeadersPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
