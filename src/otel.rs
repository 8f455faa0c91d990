// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels in the message headers. Publishing injects the current
//! context with the global text map propagator; the consume loop extracts it and opens
//! a consumer span around each handler call.

use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::collections::BTreeMap;
use tracing::warn;

/// Writes propagation fields into a header table. Keys are lowercased.
pub(crate) struct HeadersInjector<'a>(pub(crate) &'a mut BTreeMap<ShortString, AMQPValue>);

impl Injector for HeadersInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(
            ShortString::from(key.to_lowercase()),
            AMQPValue::LongString(value.into()),
        );
    }
}

/// Reads propagation fields from a header table. Only long string values are seen.
pub(crate) struct HeadersExtractor<'a>(pub(crate) Option<&'a FieldTable>);

impl Extractor for HeadersExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.0?.inner().get(key)? {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes())
                .map_err(|err| warn!(key, error = err.to_string(), "undecodable trace header"))
                .ok(),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.0
            .map(|headers| headers.inner().keys().map(|key| key.as_str()).collect())
            .unwrap_or_default()
    }
}

/// Returns the application headers with the given context injected.
///
/// `None` when there were no headers and the propagator added nothing.
pub(crate) fn inject_context(ctx: &Context, headers: Option<&FieldTable>) -> Option<FieldTable> {
    let mut table = headers.map(|h| h.inner().clone()).unwrap_or_default();

    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeadersInjector(&mut table))
    });

    if table.is_empty() && headers.is_none() {
        return None;
    }

    Some(FieldTable::from(table))
}

/// Creates a consumer span for a delivered message.
///
/// # Parameters
/// * `props` - Properties of the delivery, carrying the publisher headers
/// * `tracer` - Tracer starting the span
/// * `name` - Span name
///
/// # Returns
/// The publisher context and the span started as its child
pub(crate) fn new_span(
    props: &BasicProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeadersExtractor(props.headers().as_ref()))
    });

    let span = tracer
        .span_builder(name.to_owned())
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::LongString;

    #[test]
    fn injector_lowercases_keys() {
        let mut headers = BTreeMap::new();
        HeadersInjector(&mut headers).set("TraceParent", "00-abc".to_owned());

        assert_eq!(
            headers.get(&ShortString::from("traceparent")),
            Some(&AMQPValue::LongString(LongString::from("00-abc")))
        );
    }

    #[test]
    fn extractor_reads_only_long_strings() {
        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from("traceparent"),
            AMQPValue::LongString(LongString::from("00-abc")),
        );
        headers.insert(ShortString::from("count"), AMQPValue::LongInt(3));
        let table = FieldTable::from(headers);

        let extractor = HeadersExtractor(Some(&table));
        assert_eq!(extractor.get("traceparent"), Some("00-abc"));
        assert_eq!(extractor.get("count"), None);
        assert_eq!(extractor.get("missing"), None);
        assert_eq!(extractor.keys().len(), 2);

        assert!(HeadersExtractor(None).keys().is_empty());
    }

    #[test]
    fn keeps_existing_headers() {
        let mut headers = BTreeMap::new();
        headers.insert(ShortString::from("app"), AMQPValue::LongInt(1));
        let headers = FieldTable::from(headers);

        let injected = inject_context(&Context::new(), Some(&headers)).unwrap();
        assert!(injected.inner().contains_key(&ShortString::from("app")));
    }
}
